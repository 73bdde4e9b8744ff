//! `WeightLoader` trait and `create_weight_loader` factory (`spec.md` §4.8).
//!
//! Grounded on `original_source/src/inference/include/gcore/inference/weight_loader.hpp`'s
//! abstract `WeightLoader` interface and extension-keyed factory.

use std::path::Path;

use crate::inference::model_config::ModelConfig;
use crate::rt::backend::Backend;
use crate::rt::buffer::Buffer;
use crate::rt::memory::DType;
use crate::utils::{CoreError, Result};

use super::gguf::GgufFile;
use super::safetensors::SafeTensorsFile;

/// Tensor metadata common to both backends, independent of container
/// format.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<u64>,
    pub size_bytes: u64,
}

/// Abstract interface over a weight container. Implemented by the GGUF and
/// SafeTensors backends.
pub trait WeightLoader {
    fn list_tensors(&self) -> Vec<TensorInfo>;

    /// Load a tensor into a freshly allocated `DeviceOnly` buffer.
    ///
    /// # Safety
    /// Issues raw Vulkan allocation/transfer calls against `backend`.
    unsafe fn load_tensor<'a>(&self, backend: &'a Backend, name: &str) -> Result<Buffer<'a>>;

    /// Best-effort model shape; a hard-coded Llama-2-7B preset when the
    /// container carries no architecture metadata.
    fn get_config(&self) -> ModelConfig;
}

pub struct GgufWeightLoader {
    file: GgufFile,
}

impl GgufWeightLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: GgufFile::open(path)?,
        })
    }
}

impl WeightLoader for GgufWeightLoader {
    fn list_tensors(&self) -> Vec<TensorInfo> {
        self.file
            .list_tensors()
            .iter()
            .map(|t| TensorInfo {
                name: t.name.clone(),
                shape: t.shape.clone(),
                size_bytes: t.size_bytes,
            })
            .collect()
    }

    unsafe fn load_tensor<'a>(&self, backend: &'a Backend, name: &str) -> Result<Buffer<'a>> {
        let bytes = self.file.read_tensor_bytes(name)?;
        let dtype = self
            .file
            .find_tensor(name)
            .map(|t| t.dtype.to_dtype())
            .unwrap_or(DType::F32);
        Buffer::upload_staged(backend, &bytes, dtype)
    }

    fn get_config(&self) -> ModelConfig {
        self.file.config.clone()
    }
}

impl GgufWeightLoader {
    /// Load a tensor's raw bytes without touching the device, for callers
    /// that manage their own staging/upload (the block scheduler).
    pub fn read_tensor_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.file.read_tensor_bytes(name)
    }
}

pub struct SafeTensorsWeightLoader {
    file: SafeTensorsFile,
}

impl SafeTensorsWeightLoader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: SafeTensorsFile::open(path)?,
        })
    }

    pub fn read_tensor_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.file.read_tensor_bytes(name)
    }
}

impl WeightLoader for SafeTensorsWeightLoader {
    fn list_tensors(&self) -> Vec<TensorInfo> {
        self.file
            .list_tensors()
            .iter()
            .map(|t| TensorInfo {
                name: t.name.clone(),
                shape: t.shape.clone(),
                size_bytes: t.size_bytes,
            })
            .collect()
    }

    unsafe fn load_tensor<'a>(&self, backend: &'a Backend, name: &str) -> Result<Buffer<'a>> {
        let bytes = self.file.read_tensor_bytes(name)?;
        // SafeTensors carries no quantized block types (`spec.md` §4.8
        // supplement); every tensor uploads as F32.
        Buffer::upload_staged(backend, &bytes, DType::F32)
    }

    fn get_config(&self) -> ModelConfig {
        self.file.config()
    }
}

/// Selects a reader by file-extension substring; fails for unrecognized
/// extensions.
pub fn create_weight_loader(path: impl AsRef<Path>) -> Result<Box<dyn WeightLoader>> {
    let path = path.as_ref();
    let path_str = path.to_string_lossy();
    if path_str.contains(".gguf") {
        return Ok(Box::new(GgufWeightLoader::open(path)?));
    }
    if path_str.contains(".safetensors") {
        return Ok(Box::new(SafeTensorsWeightLoader::open(path)?));
    }
    Err(CoreError::InvalidParameters(format!(
        "unsupported weight format: {}",
        path.display()
    )))
}
