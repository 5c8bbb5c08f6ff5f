//! Submission core configuration
//!
//! Tunables for page sizes, descriptor heap sizes and barrier batching,
//! loadable from RON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::DEFAULT_ALIGN;

/// Hard upper bound of the per-context barrier batch.
pub const MAX_PENDING_BARRIERS: usize = 16;

/// Configuration error types
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Deserialization error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transient memory suballocator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Page size of the GPU-exclusive (default heap) allocator
    pub gpu_page_size: u64,
    /// Page size of the CPU-writable (upload heap) allocator
    pub cpu_page_size: u64,
    /// Alignment used when the caller does not ask for one
    pub default_alignment: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            gpu_page_size: 0x10000,
            cpu_page_size: 0x200000,
            default_alignment: DEFAULT_ALIGN,
        }
    }
}

/// Descriptor heap settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Slots per shader-visible heap handed to dynamic descriptor heaps
    pub descriptors_per_dynamic_heap: u32,
    /// Slots per CPU-only heap used by the descriptor allocators
    pub descriptors_per_cpu_heap: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            descriptors_per_dynamic_heap: 1024,
            descriptors_per_cpu_heap: 256,
        }
    }
}

/// Recording context settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Barriers batched before an implicit flush (at most 16)
    pub max_pending_barriers: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_pending_barriers: MAX_PENDING_BARRIERS,
        }
    }
}

/// Complete core configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub descriptors: DescriptorConfig,
    #[serde(default)]
    pub contexts: ContextConfig,
}

impl CoreConfig {
    /// Parses a configuration from RON text and validates it.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = ron::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_ron_str(&content)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Loads `path`, falling back to defaults if it is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => {
                tracing::info!("No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config file: {}", e);
                Self::default()
            }
        }
    }

    /// Serializes to pretty RON.
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Checks sizes are usable by the allocators and heaps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.allocator;
        for (name, size) in [("gpu_page_size", a.gpu_page_size), ("cpu_page_size", a.cpu_page_size)] {
            if !size.is_power_of_two() || size < a.default_alignment {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a power of two of at least the default alignment, got {size}"
                )));
            }
        }
        if !a.default_alignment.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "default_alignment must be a power of two, got {}",
                a.default_alignment
            )));
        }

        let d = &self.descriptors;
        if d.descriptors_per_dynamic_heap == 0 || d.descriptors_per_cpu_heap == 0 {
            return Err(ConfigError::Invalid("descriptor heaps need at least one slot".into()));
        }

        let max = self.contexts.max_pending_barriers;
        if max == 0 || max > MAX_PENDING_BARRIERS {
            return Err(ConfigError::Invalid(format!(
                "max_pending_barriers must be within 1..={MAX_PENDING_BARRIERS}, got {max}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allocator.gpu_page_size, 64 * 1024);
        assert_eq!(config.allocator.cpu_page_size, 2 * 1024 * 1024);
        assert_eq!(config.descriptors.descriptors_per_dynamic_heap, 1024);
    }

    #[test]
    fn test_partial_ron_fills_defaults() {
        let config = CoreConfig::from_ron_str("(contexts: (max_pending_barriers: 4))").unwrap();
        assert_eq!(config.contexts.max_pending_barriers, 4);
        assert_eq!(config.allocator, AllocatorConfig::default());
    }

    #[test]
    fn test_ron_roundtrip() {
        let mut config = CoreConfig::default();
        config.allocator.gpu_page_size = 0x20000;
        let text = config.to_ron_string().unwrap();
        assert_eq!(CoreConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let result = CoreConfig::from_ron_str("(allocator: (gpu_page_size: 1000, cpu_page_size: 2097152, default_alignment: 256))");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = CoreConfig::from_ron_str("(contexts: (max_pending_barriers: 17))");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        assert!(matches!(CoreConfig::from_ron_str("(allocator: "), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = CoreConfig::load_or_default("/nonexistent/ember/config.ron");
        assert_eq!(config, CoreConfig::default());
    }
}
