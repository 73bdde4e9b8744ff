//! Per-variant compute pipeline cache.
//!
//! Each [`GemmVariant`] shares one descriptor set layout (three storage
//! buffers: A, B, C) and one pipeline layout (a 24-byte push-constant range),
//! but gets its own lazily-compiled `VkPipeline` backed by a precompiled SPIR-V
//! blob loaded from the configured shader directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ash::vk;

use crate::rt::backend::Backend;
use crate::utils::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmVariant {
    TiledF16Acc32,
    TiledVec2,
    TiledVec2_32x8,
    TiledVec2Db,
    Subgroup32,
    /// The single F32 kernel (`tiled`), used by [`GemmPrecision::F32`].
    TiledF32,
}

impl GemmVariant {
    pub fn name(self) -> &'static str {
        match self {
            GemmVariant::TiledF16Acc32 => "tiled_f16acc32",
            GemmVariant::TiledVec2 => "tiled_vec2",
            GemmVariant::TiledVec2_32x8 => "tiled_vec2_32x8",
            GemmVariant::TiledVec2Db => "tiled_vec2_db",
            GemmVariant::Subgroup32 => "subgroup",
            GemmVariant::TiledF32 => "tiled",
        }
    }

    fn shader_file_name(self) -> &'static str {
        match self {
            GemmVariant::TiledF16Acc32 => "gemm_f16acc32_tiled.comp.spv",
            GemmVariant::TiledVec2 => "gemm_f16acc32_tiled_vec2.comp.spv",
            GemmVariant::TiledVec2_32x8 => "gemm_f16acc32_tiled_vec2_32x8.comp.spv",
            GemmVariant::TiledVec2Db => "gemm_f16acc32_tiled_vec2_db.comp.spv",
            GemmVariant::Subgroup32 => "gemm_f16acc32_subgroup.comp.spv",
            GemmVariant::TiledF32 => "gemm_f32_tiled.comp.spv",
        }
    }

    /// `subgroup` requires a required-subgroup-size specialization of 32.
    pub fn requires_subgroup_control(self) -> bool {
        matches!(self, GemmVariant::Subgroup32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmPrecision {
    F16Acc32,
    F32,
}

/// `{M, N, K, lda, ldb, ldc}` as u32s, matching the reference layout exactly.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PushConstants {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
}

struct CachedPipeline {
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
}

/// Shader-directory resolution: explicit override, else `VK_SHADER_DIR`
/// (`spec.md` §6.4), else `./build`.
pub fn resolve_shader_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("VK_SHADER_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("./build")
}

pub(crate) fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = fs::read(path)
        .map_err(|e| CoreError::Resource(format!("failed to read {}: {e}", path.display())))?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(CoreError::InvalidParameters(format!(
            "{} is not a nonzero multiple of 4 bytes ({})",
            path.display(),
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Holds the shared descriptor/pipeline layouts and lazily-created pipelines
/// for every [`GemmVariant`] on one backend.
pub struct PipelineCache<'a> {
    backend: &'a Backend,
    shader_dir: PathBuf,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipelines: HashMap<GemmVariant, CachedPipeline>,
}

impl<'a> PipelineCache<'a> {
    /// # Safety
    /// Issues raw Vulkan object-creation calls against `backend`'s device.
    pub unsafe fn new(backend: &'a Backend, shader_dir: Option<&Path>) -> Result<Self> {
        let device = backend.device();
        let bindings = [0u32, 1, 2].map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        });
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let descriptor_set_layout = device
            .create_descriptor_set_layout(&layout_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateDescriptorSetLayout failed: {e}")))?;

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32)
            .build();
        let set_layouts = [descriptor_set_layout];
        let push_constants = [push_constant_range];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        let pipeline_layout = device
            .create_pipeline_layout(&pipeline_layout_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreatePipelineLayout failed: {e}")))?;

        Ok(Self {
            backend,
            shader_dir: resolve_shader_dir(shader_dir),
            descriptor_set_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
        })
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Load (if needed) and return the compute pipeline for `variant`.
    ///
    /// # Safety
    /// Issues raw Vulkan object-creation calls; `variant` must be creatable
    /// on this backend (subgroup variants require subgroup-size control).
    pub unsafe fn get_or_create(&mut self, variant: GemmVariant) -> Result<vk::Pipeline> {
        if let Some(cached) = self.pipelines.get(&variant) {
            return Ok(cached.pipeline);
        }
        if variant.requires_subgroup_control() && !self.backend.subgroup_control_allowed() {
            return Err(CoreError::Device(format!(
                "{} requires subgroup-size control, which this backend does not allow",
                variant.name()
            )));
        }

        let path = self.shader_dir.join(variant.shader_file_name());
        let code = load_spirv(&path)?;
        let device = self.backend.device();
        let module_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = device
            .create_shader_module(&module_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateShaderModule failed: {e}")))?;

        let entry_point = std::ffi::CString::new("main").unwrap();
        let mut stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();

        let mut required_subgroup_size = vk::PipelineShaderStageRequiredSubgroupSizeCreateInfo::builder()
            .required_subgroup_size(32)
            .build();
        if variant.requires_subgroup_control() {
            stage_info.p_next = &mut required_subgroup_size as *mut _ as *mut std::ffi::c_void;
        }

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info)
            .layout(self.pipeline_layout)
            .build();
        let pipelines = device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| CoreError::Device(format!("vkCreateComputePipelines failed: {e}")))?;
        let pipeline = pipelines[0];

        self.pipelines.insert(variant, CachedPipeline { module, pipeline });
        Ok(pipeline)
    }
}

impl Drop for PipelineCache<'_> {
    fn drop(&mut self) {
        unsafe {
            let device = self.backend.device();
            for cached in self.pipelines.values() {
                device.destroy_pipeline(cached.pipeline, None);
                device.destroy_shader_module(cached.module, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_match_reference() {
        assert_eq!(GemmVariant::TiledF16Acc32.name(), "tiled_f16acc32");
        assert_eq!(GemmVariant::TiledVec2_32x8.name(), "tiled_vec2_32x8");
        assert_eq!(GemmVariant::Subgroup32.name(), "subgroup");
        assert_eq!(GemmVariant::TiledF32.name(), "tiled");
    }

    #[test]
    fn only_subgroup_variant_requires_control() {
        assert!(GemmVariant::Subgroup32.requires_subgroup_control());
        assert!(!GemmVariant::TiledVec2_32x8.requires_subgroup_control());
    }

    #[test]
    fn load_spirv_rejects_non_multiple_of_4() {
        let dir = std::env::temp_dir().join("exsa_core_gemm_test_bad.spv");
        std::fs::write(&dir, [1u8, 2, 3]).unwrap();
        assert!(load_spirv(&dir).is_err());
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn load_spirv_rejects_empty_file() {
        let dir = std::env::temp_dir().join("exsa_core_gemm_test_empty.spv");
        std::fs::write(&dir, []).unwrap();
        assert!(load_spirv(&dir).is_err());
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn shader_dir_resolution_prefers_explicit_override() {
        let explicit = PathBuf::from("/tmp/shaders");
        assert_eq!(resolve_shader_dir(Some(&explicit)), explicit);
    }
}
