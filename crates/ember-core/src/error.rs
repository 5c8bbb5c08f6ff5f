//! Error types for device operations.

use thiserror::Error;

/// Error type for fallible device operations.
///
/// Only object creation and mapping can fail; everything else a device does
/// is either infallible or a contract violation.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("Failed to create {object}: {reason}")]
    ResourceCreation { object: &'static str, reason: String },

    #[error("Failed to map resource: {0}")]
    MapFailed(String),

    #[error("Unknown {object} handle {raw}")]
    InvalidHandle { object: &'static str, raw: u64 },
}

impl GpuError {
    /// Shorthand for a creation failure of `object`.
    pub fn creation(object: &'static str, reason: impl Into<String>) -> Self {
        GpuError::ResourceCreation {
            object,
            reason: reason.into(),
        }
    }
}

/// Result type for device operations
pub type GpuResult<T> = Result<T, GpuError>;
