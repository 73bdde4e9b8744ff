//! A minimal SafeTensors reader (`spec.md` §4.8 supplement — `original_source/`
//! only shows `SafeTensorsLoader`'s class declaration, so this parser is
//! grounded on the well-known SafeTensors container layout instead: an
//! 8-byte little-endian header length, a UTF-8 JSON header describing
//! `{dtype, shape, data_offsets}` per tensor, then the data segment.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::inference::model_config::ModelConfig;
use crate::utils::{CoreError, Result};

#[derive(Debug, Clone, Deserialize)]
struct RawTensorEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<u64>,
    pub dtype: String,
    /// Absolute file offset of the tensor's first byte.
    pub offset: u64,
    pub size_bytes: u64,
}

pub struct SafeTensorsFile {
    path: PathBuf,
    pub tensors: Vec<TensorInfo>,
}

impl SafeTensorsFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| CoreError::Resource(format!("failed to open {}: {e}", path.display())))?;

        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf)
            .map_err(|e| CoreError::Configuration(format!("failed to read safetensors header length: {e}")))?;
        let header_len = u64::from_le_bytes(len_buf);

        let mut header_buf = vec![0u8; header_len as usize];
        file.read_exact(&mut header_buf)
            .map_err(|e| CoreError::Configuration(format!("failed to read safetensors header: {e}")))?;

        // The header is a JSON object whose keys are tensor names (and an
        // optional "__metadata__" entry, which is not a tensor).
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&header_buf)?;

        let data_start = 8 + header_len;
        let mut tensors = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            if name == "__metadata__" {
                continue;
            }
            let entry: RawTensorEntry = serde_json::from_value(value).map_err(|e| {
                CoreError::Configuration(format!("malformed safetensors entry for {name}: {e}"))
            })?;
            let [start, end] = entry.data_offsets;
            if end < start {
                return Err(CoreError::Configuration(format!(
                    "safetensors tensor {name} has inverted data_offsets"
                )));
            }
            tensors.push(TensorInfo {
                name,
                shape: entry.shape,
                dtype: entry.dtype,
                offset: data_start + start,
                size_bytes: end - start,
            });
        }

        Ok(Self { path, tensors })
    }

    pub fn list_tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn read_tensor_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let info = self
            .find_tensor(name)
            .ok_or_else(|| CoreError::NotFound(format!("tensor not found: {name}")))?;
        let mut file = File::open(&self.path)
            .map_err(|e| CoreError::Resource(format!("failed to reopen {}: {e}", self.path.display())))?;
        file.seek(SeekFrom::Start(info.offset))
            .map_err(|e| CoreError::Resource(format!("seek failed: {e}")))?;
        let mut buf = vec![0u8; info.size_bytes as usize];
        file.read_exact(&mut buf)
            .map_err(|e| CoreError::Resource(format!("read failed for tensor {name}: {e}")))?;
        Ok(buf)
    }

    /// SafeTensors carries no architecture metadata; callers fall back to
    /// the same hard-coded preset the GGUF backend uses when its KV
    /// metadata is absent.
    pub fn config(&self) -> ModelConfig {
        ModelConfig::llama2_7b()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_safetensors(path: &Path) {
        let header = serde_json::json!({
            "weight": {
                "dtype": "F32",
                "shape": [2, 2],
                "data_offsets": [0, 16],
            }
        });
        let header_bytes = serde_json::to_vec(&header).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        let mut file = File::create(path).unwrap();
        file.write_all(&buf).unwrap();
    }

    #[test]
    fn parses_header_and_reads_tensor() {
        let path = std::env::temp_dir().join(format!("exsa_core_st_min_{}.safetensors", std::process::id()));
        write_minimal_safetensors(&path);

        let st = SafeTensorsFile::open(&path).unwrap();
        assert_eq!(st.list_tensors().len(), 1);
        let tensor = st.find_tensor("weight").unwrap();
        assert_eq!(tensor.shape, vec![2, 2]);
        assert_eq!(tensor.size_bytes, 16);

        let bytes = st.read_tensor_bytes("weight").unwrap();
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn metadata_entry_is_not_treated_as_a_tensor() {
        let header = serde_json::json!({
            "__metadata__": {"format": "pt"},
            "weight": {"dtype": "F32", "shape": [1], "data_offsets": [0, 4]},
        });
        let header_bytes = serde_json::to_vec(&header).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&1.0f32.to_le_bytes());

        let path = std::env::temp_dir().join(format!("exsa_core_st_meta_{}.safetensors", std::process::id()));
        std::fs::write(&path, &buf).unwrap();

        let st = SafeTensorsFile::open(&path).unwrap();
        assert_eq!(st.list_tensors().len(), 1);
        assert_eq!(st.list_tensors()[0].name, "weight");

        let _ = std::fs::remove_file(&path);
    }
}
