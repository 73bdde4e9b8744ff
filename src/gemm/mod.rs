//! GEMM pipeline cache and dispatch (`spec.md` §4.5).
//!
//! Grounded on `original_source/src/rt/backend/vulkan/{include/gcore/rt/vk/gemm.hpp,
//! kernels/gemm_f16acc32_runtime.{hpp,cpp}}`: a per-variant pipeline cache
//! keyed off a shared descriptor layout (3 storage bindings) and a shared
//! push-constant layout, with a one-shot descriptor pool allocated per
//! dispatch (§4.5 "Descriptor pool per dispatch").

pub mod pipeline_cache;
pub mod dispatch;

pub use dispatch::{DispatchDesc, GemmDispatcher};
pub use pipeline_cache::{GemmPrecision, GemmVariant, PipelineCache};
