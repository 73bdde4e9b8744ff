//! Autotuner: device-fingerprint-keyed GEMM variant selection with a
//! persistent JSON cache and an FP16 health-check/blacklist (`spec.md` §4.6).
//!
//! Grounded on
//! `original_source/src/rt/backend/vulkan/autotune/vk_autotune.{hpp,cpp}`.

pub mod cache;
pub mod fp16_blacklist;
pub mod resolve;

pub use cache::{AutotuneCache, CacheEntry};
pub use fp16_blacklist::Fp16Blacklist;
pub use resolve::{Candidate, CandidateResult, ResolveResult, RunArgs};
