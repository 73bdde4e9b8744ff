//! RMSNorm, attention-decode and elementwise compute pipelines — the
//! non-GEMM half of the compute façade (`spec.md` §4.7, §4.9 steps 1, 5, 9).
//!
//! Structured the same way as [`crate::gemm::pipeline_cache::PipelineCache`]:
//! a shared descriptor/pipeline layout built once, a lazily-compiled
//! `VkPipeline` loaded from the configured shader directory, and a one-shot
//! descriptor pool per dispatch (`spec.md` §9 "Descriptor pool per dispatch").
//! Unlike the GEMM cache there is exactly one shader per kernel here, so
//! each pipeline holds a single `Option<CachedPipeline>` rather than a
//! `HashMap` keyed by variant.

use std::path::{Path, PathBuf};

use ash::vk;

use crate::gemm::pipeline_cache::{load_spirv, resolve_shader_dir};
use crate::rt::backend::Backend;
use crate::utils::{CoreError, Result};

fn div_round_up(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

struct CachedPipeline {
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
}

/// Binds `buffers` to sequential storage-buffer bindings, pushes
/// `push_constants`, and records a dispatch — the shared tail of every
/// kernel's `record_dispatch`, mirroring
/// `crate::gemm::dispatch::GemmDispatcher::record_dispatch`'s descriptor-set
/// handling.
unsafe fn record_buffer_dispatch(
    backend: &Backend,
    cmd: vk::CommandBuffer,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    buffers: &[vk::Buffer],
    push_constants: &[u8],
    group_counts: (u32, u32, u32),
) -> Result<()> {
    let device = backend.device();

    let pool_sizes = [vk::DescriptorPoolSize::builder()
        .ty(vk::DescriptorType::STORAGE_BUFFER)
        .descriptor_count(buffers.len() as u32)
        .build()];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(1);
    let descriptor_pool = device
        .create_descriptor_pool(&pool_info, None)
        .map_err(|e| CoreError::Device(format!("vkCreateDescriptorPool failed: {e}")))?;

    let set_layouts = [descriptor_set_layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(descriptor_pool)
        .set_layouts(&set_layouts);
    let descriptor_sets = device.allocate_descriptor_sets(&alloc_info).map_err(|e| {
        device.destroy_descriptor_pool(descriptor_pool, None);
        CoreError::Device(format!("vkAllocateDescriptorSets failed: {e}"))
    })?;
    let descriptor_set = descriptor_sets[0];

    let buffer_infos: Vec<_> = buffers
        .iter()
        .map(|&buffer| {
            vk::DescriptorBufferInfo::builder()
                .buffer(buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)
                .build()
        })
        .collect();
    let writes: Vec<_> = (0u32..buffers.len() as u32)
        .map(|binding| {
            vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_infos[binding as usize]))
                .build()
        })
        .collect();
    device.update_descriptor_sets(&writes, &[]);

    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
    device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::COMPUTE,
        pipeline_layout,
        0,
        &[descriptor_set],
        &[],
    );
    device.cmd_push_constants(cmd, pipeline_layout, vk::ShaderStageFlags::COMPUTE, 0, push_constants);
    device.cmd_dispatch(cmd, group_counts.0, group_counts.1, group_counts.2);

    // Transient: this pool only ever backs one dispatch's descriptor set.
    device.destroy_descriptor_pool(descriptor_pool, None);
    Ok(())
}

unsafe fn create_descriptor_and_pipeline_layout(
    backend: &Backend,
    binding_count: u32,
    push_constant_bytes: u32,
) -> Result<(vk::DescriptorSetLayout, vk::PipelineLayout)> {
    let device = backend.device();
    let bindings: Vec<_> = (0..binding_count)
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        })
        .collect();
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    let descriptor_set_layout = device
        .create_descriptor_set_layout(&layout_info, None)
        .map_err(|e| CoreError::Device(format!("vkCreateDescriptorSetLayout failed: {e}")))?;

    let push_constant_range = vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(push_constant_bytes)
        .build();
    let set_layouts = [descriptor_set_layout];
    let push_constants = [push_constant_range];
    let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constants);
    let pipeline_layout = device
        .create_pipeline_layout(&pipeline_layout_info, None)
        .map_err(|e| CoreError::Device(format!("vkCreatePipelineLayout failed: {e}")))?;

    Ok((descriptor_set_layout, pipeline_layout))
}

unsafe fn compile_pipeline(
    backend: &Backend,
    shader_path: &Path,
    pipeline_layout: vk::PipelineLayout,
) -> Result<CachedPipeline> {
    let code = load_spirv(shader_path)?;
    let device = backend.device();
    let module_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    let module = device
        .create_shader_module(&module_info, None)
        .map_err(|e| CoreError::Device(format!("vkCreateShaderModule failed: {e}")))?;

    let entry_point = std::ffi::CString::new("main").unwrap();
    let stage_info = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry_point)
        .build();
    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage_info)
        .layout(pipeline_layout)
        .build();
    let pipelines = device
        .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_, e)| CoreError::Device(format!("vkCreateComputePipelines failed: {e}")))?;
    Ok(CachedPipeline { module, pipeline: pipelines[0] })
}

/// `{rows, dim, eps}`: one workgroup per row.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RmsNormPushConstants {
    pub rows: u32,
    pub dim: u32,
    pub eps: f32,
}

/// RMSNorm over `[rows, dim]`: `input`, `weight` (length `dim`), `output`
/// (`spec.md` §4.9 steps 1 and 7).
pub struct RmsNormPipeline<'a> {
    backend: &'a Backend,
    shader_dir: PathBuf,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    cached: Option<CachedPipeline>,
}

impl<'a> RmsNormPipeline<'a> {
    /// # Safety
    /// Issues raw Vulkan object-creation calls against `backend`'s device.
    pub unsafe fn new(backend: &'a Backend, shader_dir: Option<&Path>) -> Result<Self> {
        let (descriptor_set_layout, pipeline_layout) =
            create_descriptor_and_pipeline_layout(backend, 3, std::mem::size_of::<RmsNormPushConstants>() as u32)?;
        Ok(Self {
            backend,
            shader_dir: resolve_shader_dir(shader_dir),
            descriptor_set_layout,
            pipeline_layout,
            cached: None,
        })
    }

    unsafe fn pipeline(&mut self) -> Result<vk::Pipeline> {
        if let Some(cached) = &self.cached {
            return Ok(cached.pipeline);
        }
        let path = self.shader_dir.join("rmsnorm.comp.spv");
        let cached = compile_pipeline(self.backend, &path, self.pipeline_layout)?;
        let pipeline = cached.pipeline;
        self.cached = Some(cached);
        Ok(pipeline)
    }

    /// # Safety
    /// `cmd` must be recording; the three buffers must be storage buffers,
    /// `input`/`output` sized `rows * dim` f32 elements and `weight` sized
    /// `dim` f32 elements.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn record_dispatch(
        &mut self,
        cmd: vk::CommandBuffer,
        input: vk::Buffer,
        weight: vk::Buffer,
        output: vk::Buffer,
        rows: u32,
        dim: u32,
        eps: f32,
    ) -> Result<()> {
        if rows == 0 || dim == 0 {
            return Err(CoreError::InvalidParameters("rmsnorm requires positive rows and dim".into()));
        }
        let pipeline = self.pipeline()?;
        let push_constants = RmsNormPushConstants { rows, dim, eps };
        record_buffer_dispatch(
            self.backend,
            cmd,
            pipeline,
            self.pipeline_layout,
            self.descriptor_set_layout,
            &[input, weight, output],
            bytemuck::bytes_of(&push_constants),
            (rows, 1, 1),
        )
    }
}

impl Drop for RmsNormPipeline<'_> {
    fn drop(&mut self) {
        unsafe {
            let device = self.backend.device();
            if let Some(cached) = &self.cached {
                device.destroy_pipeline(cached.pipeline, None);
                device.destroy_shader_module(cached.module, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// `{num_heads, num_heads_kv, head_dim, seq_len, max_seq_len, seq_start,
/// scale, rope_base}`, matching the fused RoPE-in-shared-memory
/// flash-attention-decode launch descriptor (`spec.md` §4.7).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AttentionPushConstants {
    pub num_heads: u32,
    pub num_heads_kv: u32,
    pub head_dim: u32,
    pub seq_len: u32,
    pub max_seq_len: u32,
    pub seq_start: u32,
    pub scale: f32,
    pub rope_base: f32,
}

/// Fused RoPE + KV-cache append + scaled dot-product attention decode:
/// `q`, `k_new`, `v_new` (this step's projected Q/K/V), `cache_k`/`cache_v`
/// (appended in place), `out` (`spec.md` §4.9 steps 3-5).
pub struct AttentionDecodePipeline<'a> {
    backend: &'a Backend,
    shader_dir: PathBuf,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    cached: Option<CachedPipeline>,
}

impl<'a> AttentionDecodePipeline<'a> {
    /// # Safety
    /// Issues raw Vulkan object-creation calls against `backend`'s device.
    pub unsafe fn new(backend: &'a Backend, shader_dir: Option<&Path>) -> Result<Self> {
        let (descriptor_set_layout, pipeline_layout) =
            create_descriptor_and_pipeline_layout(backend, 6, std::mem::size_of::<AttentionPushConstants>() as u32)?;
        Ok(Self {
            backend,
            shader_dir: resolve_shader_dir(shader_dir),
            descriptor_set_layout,
            pipeline_layout,
            cached: None,
        })
    }

    unsafe fn pipeline(&mut self) -> Result<vk::Pipeline> {
        if let Some(cached) = &self.cached {
            return Ok(cached.pipeline);
        }
        let path = self.shader_dir.join("attention_decode.comp.spv");
        let cached = compile_pipeline(self.backend, &path, self.pipeline_layout)?;
        let pipeline = cached.pipeline;
        self.cached = Some(cached);
        Ok(pipeline)
    }

    /// # Safety
    /// `cmd` must be recording; all six buffers must be storage buffers
    /// sized per `spec.md` §4.9's activation/cache layout.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn record_dispatch(
        &mut self,
        cmd: vk::CommandBuffer,
        q: vk::Buffer,
        k_new: vk::Buffer,
        v_new: vk::Buffer,
        cache_k: vk::Buffer,
        cache_v: vk::Buffer,
        out: vk::Buffer,
        push_constants: AttentionPushConstants,
    ) -> Result<()> {
        if push_constants.num_heads == 0 || push_constants.head_dim == 0 {
            return Err(CoreError::InvalidParameters(
                "attention decode requires positive num_heads and head_dim".into(),
            ));
        }
        let pipeline = self.pipeline()?;
        record_buffer_dispatch(
            self.backend,
            cmd,
            pipeline,
            self.pipeline_layout,
            self.descriptor_set_layout,
            &[q, k_new, v_new, cache_k, cache_v, out],
            bytemuck::bytes_of(&push_constants),
            (push_constants.num_heads, 1, 1),
        )
    }
}

impl Drop for AttentionDecodePipeline<'_> {
    fn drop(&mut self) {
        unsafe {
            let device = self.backend.device();
            if let Some(cached) = &self.cached {
                device.destroy_pipeline(cached.pipeline, None);
                device.destroy_shader_module(cached.module, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
    /// `dst += src`, used for residual accumulation.
    Add,
    /// `dst = silu(dst) * src`, used for the MLP's gate/up fusion.
    SiluMul,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ElementwisePushConstants {
    pub n: u32,
    pub op: u32,
}

const ELEMENTWISE_WORKGROUP_SIZE: u32 = 256;

/// In-place elementwise `dst <- f(dst, src)` over `n` f32 elements
/// (`spec.md` §4.9 steps 6, 9, 10's residual add and SiLU*up fusion).
pub struct ElementwisePipeline<'a> {
    backend: &'a Backend,
    shader_dir: PathBuf,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    cached: Option<CachedPipeline>,
}

impl<'a> ElementwisePipeline<'a> {
    /// # Safety
    /// Issues raw Vulkan object-creation calls against `backend`'s device.
    pub unsafe fn new(backend: &'a Backend, shader_dir: Option<&Path>) -> Result<Self> {
        let (descriptor_set_layout, pipeline_layout) =
            create_descriptor_and_pipeline_layout(backend, 2, std::mem::size_of::<ElementwisePushConstants>() as u32)?;
        Ok(Self {
            backend,
            shader_dir: resolve_shader_dir(shader_dir),
            descriptor_set_layout,
            pipeline_layout,
            cached: None,
        })
    }

    unsafe fn pipeline(&mut self) -> Result<vk::Pipeline> {
        if let Some(cached) = &self.cached {
            return Ok(cached.pipeline);
        }
        let path = self.shader_dir.join("elementwise.comp.spv");
        let cached = compile_pipeline(self.backend, &path, self.pipeline_layout)?;
        let pipeline = cached.pipeline;
        self.cached = Some(cached);
        Ok(pipeline)
    }

    /// # Safety
    /// `cmd` must be recording; `dst` and `src` must both hold at least `n`
    /// f32 elements.
    pub unsafe fn record_dispatch(
        &mut self,
        cmd: vk::CommandBuffer,
        op: ElementwiseOp,
        dst: vk::Buffer,
        src: vk::Buffer,
        n: u32,
    ) -> Result<()> {
        if n == 0 {
            return Err(CoreError::InvalidParameters("elementwise dispatch requires n > 0".into()));
        }
        let pipeline = self.pipeline()?;
        let push_constants = ElementwisePushConstants {
            n,
            op: match op {
                ElementwiseOp::Add => 0,
                ElementwiseOp::SiluMul => 1,
            },
        };
        record_buffer_dispatch(
            self.backend,
            cmd,
            pipeline,
            self.pipeline_layout,
            self.descriptor_set_layout,
            &[dst, src],
            bytemuck::bytes_of(&push_constants),
            (div_round_up(n, ELEMENTWISE_WORKGROUP_SIZE), 1, 1),
        )
    }
}

impl Drop for ElementwisePipeline<'_> {
    fn drop(&mut self) {
        unsafe {
            let device = self.backend.device();
            if let Some(cached) = &self.cached {
                device.destroy_pipeline(cached.pipeline, None);
                device.destroy_shader_module(cached.module, None);
            }
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// Bundles every kernel pipeline the compute façade dispatches, owned
/// lazily by the block scheduler (`spec.md` §5: "no cross-thread
/// contention assumed, scheduler is single-threaded").
pub struct ComputeKernels<'a> {
    pub gemm: crate::gemm::PipelineCache<'a>,
    pub rmsnorm: RmsNormPipeline<'a>,
    pub attention: AttentionDecodePipeline<'a>,
    pub elementwise: ElementwisePipeline<'a>,
}

impl<'a> ComputeKernels<'a> {
    /// # Safety
    /// Issues raw Vulkan object-creation calls against `backend`'s device.
    pub unsafe fn new(backend: &'a Backend, shader_dir: Option<&Path>) -> Result<Self> {
        Ok(Self {
            gemm: crate::gemm::PipelineCache::new(backend, shader_dir)?,
            rmsnorm: RmsNormPipeline::new(backend, shader_dir)?,
            attention: AttentionDecodePipeline::new(backend, shader_dir)?,
            elementwise: ElementwisePipeline::new(backend, shader_dir)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_round_up_rounds_partial_groups_up() {
        assert_eq!(div_round_up(256, 256), 1);
        assert_eq!(div_round_up(257, 256), 2);
        assert_eq!(div_round_up(0, 256), 0);
    }

    #[test]
    fn elementwise_op_encodes_to_distinct_push_constant_values() {
        let add = ElementwisePushConstants { n: 1, op: 0 };
        let silu_mul = ElementwisePushConstants { n: 1, op: 1 };
        assert_ne!(add.op, silu_mul.op);
    }
}
