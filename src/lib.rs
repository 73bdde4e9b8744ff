//! EXSA core: a GPU compute runtime for decoder-only transformer inference
//! on AMD-class accelerators.
//!
//! This crate owns the pieces below the model-serving layer: a host
//! allocator and device arena, a Vulkan backend with safety-policy gating,
//! a GEMM pipeline cache/dispatcher with a device-fingerprint-keyed
//! autotuner, a GGUF/SafeTensors weight loader, a per-layer block scheduler,
//! and an autoregressive token generator. It does not serve HTTP, manage
//! sessions, or run a tokenizer — those are the consuming application's
//! concern.
//!
//! ## Example
//!
//! ```no_run
//! use exsa_core::rt::Backend;
//! use exsa_core::inference::BlockScheduler;
//! use exsa_core::weights::create_weight_loader;
//!
//! # fn run() -> exsa_core::utils::Result<()> {
//! let loader = create_weight_loader("model.gguf")?;
//! let config = loader.get_config();
//! unsafe {
//!     let backend = Backend::new()?;
//!     let mut scheduler = BlockScheduler::init(&backend, config);
//!     scheduler.allocate_weights()?;
//!     scheduler.load_weights(loader.as_ref())?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod autotune;
pub mod compute;
pub mod config;
pub mod generator;
pub mod gemm;
pub mod inference;
pub mod rt;
pub mod utils;
pub mod weights;

pub use config::RuntimeConfig;
pub use generator::{AlignmentStep, GenerationStats, Generator, SamplingParams};
pub use inference::{BlockScheduler, ModelConfig};
pub use rt::Backend;
pub use utils::{CoreError, Result};
pub use weights::{create_weight_loader, WeightLoader};
