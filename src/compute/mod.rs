//! Compute façade: three entry points that select a kernel, optionally emit
//! an audit line, and record + submit a real dispatch (`spec.md` §4.7).
//!
//! Grounded on `original_source/src/inference/{include/gcore/inference/block_scheduler.hpp,
//! src/block_scheduler.cpp}`'s `execute_layer`, which is the only caller of
//! these three primitives in the reference. Each dispatch runs as a
//! one-shot command buffer (allocate, record, submit, wait idle, free),
//! the same idiom [`crate::rt::buffer::Buffer::upload_staged`] and
//! [`crate::rt::backend::Backend::empty_submit`] already use — `Stream`
//! (`crate::rt::stream`) is a host-side closure FIFO with no Vulkan
//! command-buffer concept of its own, so it is threaded through for
//! signature fidelity but is not itself the submission mechanism.

use ash::vk;
use tracing::trace;

use crate::gemm::{DispatchDesc, GemmDispatcher, GemmVariant};
use crate::rt::backend::Backend;
use crate::rt::buffer::Buffer;
use crate::rt::memory::DType;
use crate::rt::stream::Stream;
use crate::utils::{CoreError, Result};

pub mod cpu_ref;
pub mod kernels;

pub use kernels::{
    AttentionPushConstants, ComputeKernels, ElementwiseOp, ElementwisePipeline, RmsNormPipeline, RmsNormPushConstants,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmRoute {
    Mfma,
    Valu,
}

impl GemmRoute {
    fn from_env_override() -> Option<Self> {
        match std::env::var("GEMM_FORCE").ok()?.to_uppercase().as_str() {
            "MFMA" => Some(GemmRoute::Mfma),
            "VALU" => Some(GemmRoute::Valu),
            _ => None,
        }
    }
}

/// `M > 32 → mfma`, else `valu`; overridable by `GEMM_FORCE`.
fn select_route(m: u32) -> (GemmRoute, &'static str) {
    if let Some(forced) = GemmRoute::from_env_override() {
        return (forced, "env-forced");
    }
    if m > 32 {
        (GemmRoute::Mfma, "M>32")
    } else {
        (GemmRoute::Valu, "M<=32")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelTag {
    FourBitWeight,
    EightBitWeight,
    MixedPrecision,
    MatrixCore,
}

fn select_kernel(b_dtype: DType) -> KernelTag {
    match b_dtype {
        DType::Grouped4BitK | DType::Int4 => KernelTag::FourBitWeight,
        DType::Int8 | DType::Fp8E4M3 | DType::Fp8E5M2 => KernelTag::EightBitWeight,
        DType::F16 | DType::Bf16 => KernelTag::MixedPrecision,
        DType::F32 => KernelTag::MatrixCore,
    }
}

fn profile_blocks_enabled() -> bool {
    std::env::var("PROFILE_BLOCKS").as_deref() == Ok("1")
}

/// The GEMM pipeline cache carries only the two tiling families it has
/// shaders for (`tiled` for F32, `tiled_vec2_32x8` as the safe F16/mixed
/// default); the façade's `KernelTag` (4-bit/8-bit/mixed/matrix-core) is an
/// audit-only label for the weight-format dispatch the original's
/// quantized kernels would target, not yet a distinct `GemmVariant` each
/// (`DESIGN.md`: quantized GEMM shaders are out of scope for this pass).
fn select_variant(a_dtype: DType, b_dtype: DType) -> GemmVariant {
    if a_dtype == DType::F32 && b_dtype == DType::F32 {
        GemmVariant::TiledF32
    } else {
        GemmVariant::TiledVec2_32x8
    }
}

/// Allocate, record `record`, submit and wait idle on a single primary
/// command buffer (`spec.md` §4.4's staged-upload idiom, reused here for
/// every compute dispatch).
///
/// # Safety
/// Issues raw Vulkan command-buffer and queue calls against `backend`.
unsafe fn run_one_shot(backend: &Backend, record: impl FnOnce(vk::CommandBuffer) -> Result<()>) -> Result<()> {
    let device = backend.device();
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(backend.command_pool())
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let cmd = device
        .allocate_command_buffers(&alloc_info)
        .map_err(|e| CoreError::Device(format!("allocate_command_buffers failed: {e}")))?[0];

    let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device
        .begin_command_buffer(cmd, &begin_info)
        .map_err(|e| CoreError::Device(format!("begin_command_buffer failed: {e}")))?;
    record(cmd)?;
    device
        .end_command_buffer(cmd)
        .map_err(|e| CoreError::Device(format!("end_command_buffer failed: {e}")))?;

    let cmds = [cmd];
    let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
    device
        .queue_submit(backend.queue(), &[submit], vk::Fence::null())
        .map_err(|e| CoreError::Device(format!("queue_submit failed: {e}")))?;
    device
        .queue_wait_idle(backend.queue())
        .map_err(|e| CoreError::Device(format!("queue_wait_idle failed: {e}")))?;
    device.free_command_buffers(backend.command_pool(), &cmds);
    Ok(())
}

/// Operand description for one `gemm` façade call: `a[M,K] x b[K,N] = c[M,N]`,
/// row-major with no padding (`lda=K`, `ldb=N`, `ldc=N`).
pub struct GemmOperands<'a> {
    pub a: &'a Buffer<'a>,
    pub b: &'a Buffer<'a>,
    pub c: &'a Buffer<'a>,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    /// Carried for dispatch-contract parity with `spec.md` §4.5; every
    /// layer-forward call site passes `false` for both, since row-major
    /// `lda=K, ldb=N, ldc=N` is the only layout the loaded weights use.
    /// Transposed strides are not yet wired into `DispatchDesc`.
    pub transpose_a: bool,
    pub transpose_b: bool,
}

/// Select a route/kernel for `operands`, print an audit line when
/// `PROFILE_BLOCKS=1`, and record + submit the dispatch against the
/// cached pipeline for the selected [`GemmVariant`].
///
/// # Safety
/// Issues raw Vulkan object-creation, command-recording and submission
/// calls via `backend` and `kernels`.
pub unsafe fn gemm(
    backend: &Backend,
    kernels: &mut ComputeKernels<'_>,
    stream: &Stream,
    operands: &GemmOperands<'_>,
) -> Result<(GemmRoute, &'static str, &'static str)> {
    let _ = stream;
    let (route, reason) = select_route(operands.m);
    let kernel = select_kernel(operands.b.dtype());
    let kernel_name = match kernel {
        KernelTag::FourBitWeight => "4bit",
        KernelTag::EightBitWeight => "8bit",
        KernelTag::MixedPrecision => "mixed_precision",
        KernelTag::MatrixCore => "matrix_core",
    };

    if profile_blocks_enabled() {
        println!(
            "GEMM M={} N={} K={} threshold=32 route={:?} reason={} dtype_a={:?} dtype_b={:?}",
            operands.m,
            operands.n,
            operands.k,
            route,
            reason,
            operands.a.dtype(),
            operands.b.dtype()
        );
    }
    trace!(m = operands.m, n = operands.n, k = operands.k, ?route, kernel_name, "gemm dispatch");

    let variant = select_variant(operands.a.dtype(), operands.b.dtype());
    let desc = DispatchDesc {
        a: operands.a.handle(),
        b: operands.b.handle(),
        c: operands.c.handle(),
        m: operands.m,
        n: operands.n,
        k: operands.k,
        lda: operands.k,
        ldb: operands.n,
        ldc: operands.n,
    };
    run_one_shot(backend, |cmd| {
        GemmDispatcher::new(backend, &mut kernels.gemm).record_dispatch(cmd, variant, &desc)
    })?;

    Ok((route, reason, kernel_name))
}

/// Fused RoPE-in-shared-memory flash-attention-decode launch descriptor
/// (`spec.md` §4.7, §4.9 steps 3-5): `q`/`k_new`/`v_new` are this step's
/// freshly-projected Q/K/V, `cache_k`/`cache_v` are appended to in place,
/// `out` receives the attention output.
pub struct AttentionDecodeArgs<'a> {
    pub stream: &'a Stream,
    pub q: &'a Buffer<'a>,
    pub k_new: &'a Buffer<'a>,
    pub v_new: &'a Buffer<'a>,
    pub cache_k: &'a Buffer<'a>,
    pub cache_v: &'a Buffer<'a>,
    pub out: &'a Buffer<'a>,
    pub num_heads: u32,
    pub num_heads_kv: u32,
    pub head_dim: u32,
    pub seq_len: u32,
    pub max_seq_len: u32,
    pub seq_start: u32,
    pub scale: f32,
    pub rope_base: f32,
}

/// # Safety
/// Issues raw Vulkan object-creation, command-recording and submission
/// calls via `backend` and `kernels`.
pub unsafe fn attention_decode(backend: &Backend, kernels: &mut ComputeKernels<'_>, args: &AttentionDecodeArgs<'_>) -> Result<()> {
    let _ = args.stream;
    trace!(
        heads = args.num_heads,
        heads_kv = args.num_heads_kv,
        head_dim = args.head_dim,
        seq_len = args.seq_len,
        "attention decode dispatch"
    );
    let push_constants = AttentionPushConstants {
        num_heads: args.num_heads,
        num_heads_kv: args.num_heads_kv,
        head_dim: args.head_dim,
        seq_len: args.seq_len,
        max_seq_len: args.max_seq_len,
        seq_start: args.seq_start,
        scale: args.scale,
        rope_base: args.rope_base,
    };
    run_one_shot(backend, |cmd| {
        kernels.attention.record_dispatch(
            cmd,
            args.q.handle(),
            args.k_new.handle(),
            args.v_new.handle(),
            args.cache_k.handle(),
            args.cache_v.handle(),
            args.out.handle(),
            push_constants,
        )
    })
}

/// # Safety
/// Issues raw Vulkan object-creation, command-recording and submission
/// calls via `backend` and `kernels`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn rmsnorm(
    backend: &Backend,
    kernels: &mut ComputeKernels<'_>,
    stream: &Stream,
    input: &Buffer<'_>,
    weight: &Buffer<'_>,
    output: &Buffer<'_>,
    rows: u32,
    dim: u32,
    eps: f32,
) -> Result<()> {
    let _ = stream;
    trace!(rows, dim, eps, "rmsnorm dispatch");
    run_one_shot(backend, |cmd| {
        kernels
            .rmsnorm
            .record_dispatch(cmd, input.handle(), weight.handle(), output.handle(), rows, dim, eps)
    })
}

/// In-place elementwise `dst <- f(dst, src)` over `n` f32 elements
/// (`spec.md` §4.9 steps 6, 9, 10).
///
/// # Safety
/// Issues raw Vulkan object-creation, command-recording and submission
/// calls via `backend` and `kernels`.
pub unsafe fn elementwise(
    backend: &Backend,
    kernels: &mut ComputeKernels<'_>,
    stream: &Stream,
    op: ElementwiseOp,
    dst: &Buffer<'_>,
    src: &Buffer<'_>,
    n: u32,
) -> Result<()> {
    let _ = stream;
    trace!(?op, n, "elementwise dispatch");
    run_one_shot(backend, |cmd| {
        kernels.elementwise.record_dispatch(cmd, op, dst.handle(), src.handle(), n)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_selection_thresholds_on_m() {
        std::env::remove_var("GEMM_FORCE");
        assert_eq!(select_route(33).0, GemmRoute::Mfma);
        assert_eq!(select_route(32).0, GemmRoute::Valu);
    }

    #[test]
    fn gemm_force_env_overrides_threshold() {
        std::env::set_var("GEMM_FORCE", "valu");
        assert_eq!(select_route(1000).0, GemmRoute::Valu);
        std::env::remove_var("GEMM_FORCE");
    }

    #[test]
    fn kernel_selection_routes_by_b_dtype() {
        assert_eq!(select_kernel(DType::Grouped4BitK), KernelTag::FourBitWeight);
        assert_eq!(select_kernel(DType::Int8), KernelTag::EightBitWeight);
        assert_eq!(select_kernel(DType::F16), KernelTag::MixedPrecision);
        assert_eq!(select_kernel(DType::F32), KernelTag::MatrixCore);
    }

    #[test]
    fn variant_selection_prefers_f32_tiled_only_when_both_operands_are_f32() {
        assert_eq!(select_variant(DType::F32, DType::F32), GemmVariant::TiledF32);
        assert_eq!(select_variant(DType::F32, DType::F16), GemmVariant::TiledVec2_32x8);
        assert_eq!(select_variant(DType::F16, DType::F16), GemmVariant::TiledVec2_32x8);
    }
}
