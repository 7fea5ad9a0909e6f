//! Errors that cross a component boundary.
//!
//! Pipeline internals use `anyhow`; these typed errors are what callers of the
//! snapshot store and the write-back gateway match on.

use thiserror::Error;

/// Soft failures of an in-place snapshot patch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("record '{record_id}' not found in current snapshot")]
    NotFound { record_id: String },
    #[error("snapshot not loaded yet")]
    Empty,
}

/// Why a field edit was rejected. `Display` is the user-facing message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteBackError {
    #[error("'{raw}' is not a valid number for field '{field}'")]
    InvalidValue { field: String, raw: String },
    #[error("'{record_id}' is not a valid record id")]
    InvalidRecordId { record_id: String },
    #[error("field '{field}' is maintained automatically and cannot be edited")]
    ReadOnlyField { field: String },
    #[error("record '{record_id}' is a forecast and cannot be edited")]
    ForecastRecord { record_id: String },
    #[error("update failed: {reason}")]
    Remote { reason: String },
}

impl WriteBackError {
    /// Rejected before anything was sent to the remote store
    pub fn is_rejected_locally(&self) -> bool {
        !matches!(self, Self::Remote { .. })
    }
}
