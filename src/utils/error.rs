//! Crate-wide error type for the EXSA core compute runtime.
//!
//! The reference implementation threads a `std::string* err` out-parameter
//! through every fallible call. Rust replaces that with `Result<T, CoreError>`
//! propagated via `?`; no panics or out-parameters cross a module boundary.

use thiserror::Error;

/// Error categories, matching the taxonomy in the error-handling design
/// (configuration / resource / device / parse / foreign-free).
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad dimensions, bad magic/version, or any other input the caller
    /// could have prevented by constructing things correctly.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Out-of-memory, file-open failure, or other resource exhaustion.
    #[error("resource error: {0}")]
    Resource(String),

    /// Pipeline creation, submission, or fence-wait failure at the device
    /// boundary. Safe-mode/blacklist downgrades to `Skipped` instead of
    /// this variant; see [`CoreError::Skipped`].
    #[error("device error: {0}")]
    Device(String),

    /// A GPU initialization path was intentionally skipped because the
    /// device is in safe mode or blacklisted. Not a failure: callers that
    /// can proceed without the skipped feature should do so.
    #[error("skipped: {0}")]
    Skipped(String),

    /// Index or name not found (layer index out of range, tensor name
    /// absent from the weight container, unknown kernel variant, …).
    #[error("not found: {0}")]
    NotFound(String),

    /// Sampling or runtime-config parameters failed validation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
