//! Dispatch contract for a GEMM variant (`spec.md` §4.5 "Dispatch contract").

use ash::vk;

use super::pipeline_cache::{GemmVariant, PipelineCache, PushConstants};
use crate::rt::backend::Backend;
use crate::utils::{CoreError, Result};

/// Operand description for one GEMM dispatch. All three buffers must be
/// non-null and all dimensions positive.
pub struct DispatchDesc {
    pub a: vk::Buffer,
    pub b: vk::Buffer,
    pub c: vk::Buffer,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub lda: u32,
    pub ldb: u32,
    pub ldc: u32,
}

impl DispatchDesc {
    fn validate(&self) -> Result<()> {
        if self.a == vk::Buffer::null() || self.b == vk::Buffer::null() || self.c == vk::Buffer::null() {
            return Err(CoreError::InvalidParameters(
                "gemm dispatch requires non-null A, B, C buffers".into(),
            ));
        }
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(CoreError::InvalidParameters(
                "gemm dispatch requires positive M, N, K".into(),
            ));
        }
        Ok(())
    }
}

fn div_round_up(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Records a GEMM dispatch for one variant into a command buffer, owning a
/// one-shot descriptor pool per dispatch (`spec.md` §9 "Descriptor pool per
/// dispatch").
pub struct GemmDispatcher<'a, 'b> {
    backend: &'a Backend,
    cache: &'b mut PipelineCache<'a>,
}

impl<'a, 'b> GemmDispatcher<'a, 'b> {
    pub fn new(backend: &'a Backend, cache: &'b mut PipelineCache<'a>) -> Self {
        Self { backend, cache }
    }

    /// Record `variant`'s dispatch of `desc` into `cmd`.
    ///
    /// # Safety
    /// `cmd` must be a command buffer currently in the recording state; the
    /// buffers in `desc` must have been created with
    /// `VK_BUFFER_USAGE_STORAGE_BUFFER_BIT`.
    pub unsafe fn record_dispatch(
        &mut self,
        cmd: vk::CommandBuffer,
        variant: GemmVariant,
        desc: &DispatchDesc,
    ) -> Result<()> {
        desc.validate()?;

        let variant = if variant == GemmVariant::Subgroup32
            && !self.backend.subgroup_control_allowed()
            && std::env::var("GEMM_FORCE").is_err()
        {
            GemmVariant::TiledVec2_32x8
        } else {
            variant
        };

        let (gx, gy) = grid_for(variant, desc.m, desc.n);
        if gx == 0 || gy == 0 {
            return Err(CoreError::InvalidParameters(
                "gemm dispatch grid has a zero dimension".into(),
            ));
        }

        let pipeline = self.cache.get_or_create(variant)?;
        let device = self.backend.device();

        let pool_sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(3)
            .build()];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        let descriptor_pool = device
            .create_descriptor_pool(&pool_info, None)
            .map_err(|e| CoreError::Device(format!("vkCreateDescriptorPool failed: {e}")))?;

        let set_layouts = [self.cache.descriptor_set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_sets = device.allocate_descriptor_sets(&alloc_info).map_err(|e| {
            device.destroy_descriptor_pool(descriptor_pool, None);
            CoreError::Device(format!("vkAllocateDescriptorSets failed: {e}"))
        })?;
        let descriptor_set = descriptor_sets[0];

        let buffer_infos = [desc.a, desc.b, desc.c].map(|buffer| {
            vk::DescriptorBufferInfo::builder()
                .buffer(buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE)
                .build()
        });
        let writes: Vec<_> = (0u32..3)
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
            self.cache.pipeline_layout(),
            0,
            &[descriptor_set],
            &[],
        );
        let push_constants = PushConstants {
            m: desc.m,
            n: desc.n,
            k: desc.k,
            lda: desc.lda,
            ldb: desc.ldb,
            ldc: desc.ldc,
        };
        device.cmd_push_constants(
            cmd,
            self.cache.pipeline_layout(),
            vk::ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(&push_constants),
        );
        device.cmd_dispatch(cmd, gx, gy, 1);

        // Transient: this pool only ever backs one dispatch's descriptor set.
        device.destroy_descriptor_pool(descriptor_pool, None);
        Ok(())
    }
}

fn grid_for(variant: GemmVariant, m: u32, n: u32) -> (u32, u32) {
    match variant {
        GemmVariant::TiledF32 => (div_round_up(n, 16), div_round_up(m, 16)),
        _ => (div_round_up(n, 32), div_round_up(m, 8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_grid_uses_32x8_tiles() {
        assert_eq!(grid_for(GemmVariant::TiledVec2, 8, 32), (1, 1));
        assert_eq!(grid_for(GemmVariant::TiledVec2, 9, 33), (2, 2));
    }

    #[test]
    fn f32_grid_uses_16x16_tiles() {
        assert_eq!(grid_for(GemmVariant::TiledF32, 16, 16), (1, 1));
        assert_eq!(grid_for(GemmVariant::TiledF32, 17, 17), (2, 2));
    }

    #[test]
    fn rejects_null_buffers() {
        let desc = DispatchDesc {
            a: vk::Buffer::null(),
            b: vk::Buffer::null(),
            c: vk::Buffer::null(),
            m: 1,
            n: 1,
            k: 1,
            lda: 1,
            ldb: 1,
            ldc: 1,
        };
        assert!(desc.validate().is_err());
    }

    #[test]
    fn rejects_zero_dimensions() {
        let desc = DispatchDesc {
            a: vk::Buffer::from_raw(1),
            b: vk::Buffer::from_raw(1),
            c: vk::Buffer::from_raw(1),
            m: 0,
            n: 1,
            k: 1,
            lda: 1,
            ldb: 1,
            ldc: 1,
        };
        assert!(desc.validate().is_err());
    }
}
