//! Data types and quantization metadata shared by every device memory
//! handle (`spec.md` §3 "Device memory handle").

use serde::{Deserialize, Serialize};

/// Element data type carried by a device memory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F32,
    F16,
    Bf16,
    Int8,
    Int4,
    /// Grouped 4-bit K-quant (e.g. Q4_K).
    Grouped4BitK,
    Fp8E4M3,
    Fp8E5M2,
}

impl DType {
    /// Bytes per element for the non-grouped types; grouped types must be
    /// sized via [`crate::weights::gguf::GgmlType`] block tables instead.
    pub fn element_bytes(self) -> Option<usize> {
        match self {
            DType::F32 => Some(4),
            DType::F16 | DType::Bf16 => Some(2),
            DType::Int8 | DType::Fp8E4M3 | DType::Fp8E5M2 => Some(1),
            DType::Int4 | DType::Grouped4BitK => None,
        }
    }
}

/// Optional quantization descriptor attached to a device memory handle.
#[derive(Debug, Clone)]
pub struct QuantDescriptor {
    /// Device offset (bytes) of the per-group scale table.
    pub scales_offset: u64,
    /// Device offset (bytes) of the per-head scale table, if the tensor is
    /// laid out head-major (QKV-like layouts).
    pub head_scales_offset: Option<u64>,
    pub zero_point: f32,
    pub group_size: u32,
    pub head_count: u32,
}

/// Where a memory handle's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device-local only; no host-visible mapping.
    DeviceOnly,
    /// Host-visible and host-coherent; exposes a mapped address.
    HostVisible,
}

/// Bounds-check an offset/size pair against a capacity, mirroring the
/// "safe offset-copy" contract of `spec.md` §4.4: `offset + size <= capacity`.
pub fn checked_range(offset: usize, size: usize, capacity: usize) -> crate::utils::Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| crate::utils::CoreError::InvalidParameters("offset + size overflowed".into()))?;
    if end > capacity {
        return Err(crate::utils::CoreError::InvalidParameters(format!(
            "copy out of bounds: offset={offset} size={size} capacity={capacity}"
        )));
    }
    Ok(offset..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_range_accepts_exact_fit() {
        assert_eq!(checked_range(4, 4, 8).unwrap(), 4..8);
    }

    #[test]
    fn checked_range_rejects_overflow() {
        assert!(checked_range(4, 8, 8).is_err());
    }

    #[test]
    fn element_bytes_known_for_dense_types() {
        assert_eq!(DType::F32.element_bytes(), Some(4));
        assert_eq!(DType::F16.element_bytes(), Some(2));
        assert_eq!(DType::Grouped4BitK.element_bytes(), None);
    }
}
