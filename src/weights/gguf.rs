//! GGUF binary weight container parser (`spec.md` §4.8, §6.1).
//!
//! Grounded on `original_source/src/inference/src/weight_loader.cpp`'s
//! `GGUFLoader::Impl`. The reference skips key-value metadata unconditionally
//! and hard-codes `ModelConfig::llama2_7b()`; this port attempts a best-effort
//! extraction of the handful of KV keys that determine model shape and falls
//! back to the same hard-coded preset when those keys are absent or
//! unparseable (an Open Question resolved in `DESIGN.md`).

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::inference::model_config::ModelConfig;
use crate::utils::{CoreError, Result};

const GGUF_MAGIC: u32 = 0x4655_4747;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q8_0,
    Q4K,
    Q5K,
    Q6K,
    Other(u32),
}

impl GgmlType {
    fn from_tag(tag: u32) -> Self {
        match tag {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            8 => GgmlType::Q8_0,
            12 => GgmlType::Q4K,
            13 => GgmlType::Q5K,
            14 => GgmlType::Q6K,
            other => GgmlType::Other(other),
        }
    }

    /// `(block_size, block_bytes)`, per `spec.md` §4.8's type table.
    fn block_layout(self) -> Option<(u64, u64)> {
        match self {
            GgmlType::F32 => Some((1, 4)),
            GgmlType::F16 => Some((1, 2)),
            GgmlType::Q4_0 => Some((32, 18)),
            GgmlType::Q8_0 => Some((32, 34)),
            GgmlType::Q4K => Some((256, 144)),
            GgmlType::Q5K => Some((256, 176)),
            GgmlType::Q6K => Some((256, 210)),
            GgmlType::Other(_) => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            GgmlType::F32 => "F32",
            GgmlType::F16 => "F16",
            GgmlType::Q4_0 => "Q4_0",
            GgmlType::Q8_0 => "Q8_0",
            GgmlType::Q4K => "Q4_K",
            GgmlType::Q5K => "Q5_K",
            GgmlType::Q6K => "Q6_K",
            GgmlType::Other(_) => "UNKNOWN",
        }
    }

    /// Nearest [`DType`] representation for the device buffer this tensor
    /// is uploaded into. `spec.md` §3 only names a single grouped-4-bit
    /// dtype tag; the 5/6-bit K-quants are carried on that same tag since
    /// the crate's `DType` enum (per the Non-goals in `spec.md` §1) does
    /// not distinguish richer grouped-quant block layouts.
    pub fn to_dtype(self) -> crate::rt::memory::DType {
        use crate::rt::memory::DType;
        match self {
            GgmlType::F32 => DType::F32,
            GgmlType::F16 => DType::F16,
            GgmlType::Q8_0 => DType::Int8,
            GgmlType::Q4_0 | GgmlType::Q4K | GgmlType::Q5K | GgmlType::Q6K => DType::Grouped4BitK,
            GgmlType::Other(_) => DType::F32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<u64>,
    pub offset: u64,
    pub size_bytes: u64,
    pub dtype: GgmlType,
}

fn tensor_size_bytes(shape: &[u64], dtype: GgmlType) -> u64 {
    let n_elements: u64 = shape.iter().product();
    match dtype.block_layout() {
        Some((block_size, block_bytes)) => {
            let n_blocks = (n_elements + block_size - 1) / block_size;
            n_blocks * block_bytes
        }
        None => n_elements * 2,
    }
}

fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// A length-prefixed GGUF KV scalar, widened enough to pull out the integer
/// and float metadata keys model-shape extraction needs.
#[derive(Debug, Clone)]
enum KvValue {
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Other,
}

struct Reader<R> {
    inner: R,
}

impl<R: Read + Seek> Reader<R> {
    fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }
    fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0u8; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    fn read_i32(&mut self) -> std::io::Result<i32> {
        Ok(self.read_u32()? as i32)
    }
    fn read_u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
    fn read_i64(&mut self) -> std::io::Result<i64> {
        Ok(self.read_u64()? as i64)
    }
    fn read_f32(&mut self) -> std::io::Result<f32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
    fn read_f64(&mut self) -> std::io::Result<f64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
    fn read_string(&mut self) -> std::io::Result<String> {
        let len = self.read_u64()?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
    fn skip(&mut self, n: i64) -> std::io::Result<()> {
        self.inner.seek(SeekFrom::Current(n))?;
        Ok(())
    }

    /// Read one typed value by its GGUF value-type tag, recursing into
    /// arrays. Returns `None` for unrecognized scalar sub-types inside an
    /// array or at the top level (caller treats as a skip-only entry).
    fn read_value(&mut self, value_type: u32) -> std::io::Result<KvValue> {
        Ok(match value_type {
            0 => KvValue::U32(self.read_u8()? as u32),
            1 => KvValue::I32(self.read_u8()? as i32),
            2 => KvValue::U32(self.read_u16()? as u32),
            3 => {
                self.skip(2)?;
                KvValue::Other
            }
            4 => KvValue::U32(self.read_u32()?),
            5 => KvValue::I32(self.read_i32()?),
            6 => KvValue::F32(self.read_f32()?),
            7 => KvValue::Bool(self.read_u8()? != 0),
            8 => KvValue::String(self.read_string()?),
            9 => {
                let arr_type = self.read_u32()?;
                let arr_len = self.read_u64()?;
                for _ in 0..arr_len {
                    self.read_value(arr_type)?;
                }
                KvValue::Other
            }
            10 => KvValue::U64(self.read_u64()?),
            11 => KvValue::I64(self.read_i64()?),
            12 => KvValue::F64(self.read_f64()?),
            _ => KvValue::Other,
        })
    }
}

impl KvValue {
    fn as_u32(&self) -> Option<u32> {
        match *self {
            KvValue::U32(v) => Some(v),
            KvValue::I32(v) if v >= 0 => Some(v as u32),
            KvValue::U64(v) => Some(v as u32),
            KvValue::I64(v) if v >= 0 => Some(v as u32),
            _ => None,
        }
    }
    fn as_f32(&self) -> Option<f32> {
        match *self {
            KvValue::F32(v) => Some(v),
            KvValue::F64(v) => Some(v as f32),
            _ => None,
        }
    }
}

/// A parsed GGUF file's tensor table, config (best-effort from KV metadata),
/// and data-section base offset.
pub struct GgufFile {
    path: std::path::PathBuf,
    pub tensors: Vec<TensorInfo>,
    pub config: ModelConfig,
}

fn extract_config(kv: &HashMap<String, KvValue>) -> ModelConfig {
    let mut cfg = ModelConfig::llama2_7b();
    let mut found_any = false;

    let suffixed = |suffix: &str| -> Option<&KvValue> {
        kv.iter().find(|(k, _)| k.ends_with(suffix)).map(|(_, v)| v)
    };

    if let Some(v) = suffixed(".context_length").and_then(KvValue::as_u32) {
        cfg.max_seq_len = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".embedding_length").and_then(KvValue::as_u32) {
        cfg.dim = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".block_count").and_then(KvValue::as_u32) {
        cfg.num_layers = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".attention.head_count").and_then(KvValue::as_u32) {
        cfg.num_heads = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".attention.head_count_kv").and_then(KvValue::as_u32) {
        cfg.num_heads_kv = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".feed_forward_length").and_then(KvValue::as_u32) {
        cfg.hidden_dim = v;
        found_any = true;
    }
    if let Some(v) = suffixed(".rope.freq_base").and_then(KvValue::as_f32) {
        cfg.rope_base = v;
        found_any = true;
    }
    if let Some(v) = suffixed("tokenizer.ggml.eos_token_id").and_then(KvValue::as_u32) {
        cfg.eos_token_id = Some(v);
    }
    if found_any && cfg.num_heads > 0 {
        cfg.head_dim = cfg.dim / cfg.num_heads;
    }
    cfg
}

impl GgufFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| CoreError::Resource(format!("failed to open {}: {e}", path.display())))?;
        let mut reader = Reader { inner: file };

        let magic = reader
            .read_u32()
            .map_err(|e| CoreError::Configuration(format!("failed to read GGUF magic: {e}")))?;
        if magic != GGUF_MAGIC {
            return Err(CoreError::Configuration(format!(
                "invalid GGUF magic: {magic:#010x}"
            )));
        }
        let version = reader
            .read_u32()
            .map_err(|e| CoreError::Configuration(format!("failed to read GGUF version: {e}")))?;
        if !(2..=3).contains(&version) {
            return Err(CoreError::Configuration(format!(
                "unsupported GGUF version: {version}"
            )));
        }

        let tensor_count = reader
            .read_u64()
            .map_err(|e| CoreError::Configuration(format!("failed to read tensor count: {e}")))?;
        let kv_count = reader
            .read_u64()
            .map_err(|e| CoreError::Configuration(format!("failed to read kv count: {e}")))?;

        let mut kv = HashMap::with_capacity(kv_count as usize);
        for _ in 0..kv_count {
            let key = reader
                .read_string()
                .map_err(|e| CoreError::Configuration(format!("failed to read kv key: {e}")))?;
            let value_type = reader
                .read_u32()
                .map_err(|e| CoreError::Configuration(format!("failed to read kv value type: {e}")))?;
            match reader.read_value(value_type) {
                Ok(value) => {
                    kv.insert(key, value);
                }
                Err(_) => continue,
            }
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for _ in 0..tensor_count {
            let name = reader
                .read_string()
                .map_err(|e| CoreError::Configuration(format!("failed to read tensor name: {e}")))?;
            let n_dims = reader
                .read_u32()
                .map_err(|e| CoreError::Configuration(format!("failed to read tensor dim count: {e}")))?;
            let mut shape = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                shape.push(
                    reader
                        .read_u64()
                        .map_err(|e| CoreError::Configuration(format!("failed to read tensor dim: {e}")))?,
                );
            }
            let type_tag = reader
                .read_u32()
                .map_err(|e| CoreError::Configuration(format!("failed to read tensor dtype: {e}")))?;
            let _relative_offset = reader
                .read_u64()
                .map_err(|e| CoreError::Configuration(format!("failed to read tensor offset: {e}")))?;
            let dtype = GgmlType::from_tag(type_tag);
            let size_bytes = tensor_size_bytes(&shape, dtype);
            tensors.push(TensorInfo {
                name,
                shape,
                offset: 0,
                size_bytes,
                dtype,
            });
        }

        let header_end = reader
            .inner
            .stream_position()
            .map_err(|e| CoreError::Configuration(format!("failed to determine header length: {e}")))?;
        let data_offset = align_up(header_end, 32);
        let mut cursor = data_offset;
        for tensor in &mut tensors {
            tensor.offset = cursor;
            cursor = align_up(cursor + tensor.size_bytes, 32);
        }

        Ok(Self {
            path,
            tensors,
            config: extract_config(&kv),
        })
    }

    pub fn list_tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Read a tensor's raw bytes off disk into a host staging buffer.
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
}
