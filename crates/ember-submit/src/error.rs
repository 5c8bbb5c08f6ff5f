//! Initialization errors.

use ember_core::{ConfigError, GpuError};

/// Error returned when the graphics core cannot be brought up.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid core configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Device initialization failed: {0}")]
    Device(#[from] GpuError),
}
