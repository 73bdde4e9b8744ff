//! Weight container parsing and loading (`spec.md` §4.8, §6.1).

pub mod gguf;
pub mod loader;
pub mod safetensors;

pub use loader::{create_weight_loader, GgufWeightLoader, SafeTensorsWeightLoader, TensorInfo, WeightLoader};
