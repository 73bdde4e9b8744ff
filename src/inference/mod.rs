//! Transformer layer execution and model shape configuration (`spec.md`
//! §4.8, §4.9).

pub mod block_scheduler;
pub mod model_config;

pub use block_scheduler::{Activations, BlockScheduler, LayerWeights};
pub use model_config::ModelConfig;
