//! Ember core types
//!
//! Shared vocabulary for the submission core and the devices it drives:
//! - [`FenceValue`] / [`QueueType`]: queue-qualified fence points
//! - Opaque device handles and descriptor handles
//! - [`ResourceState`], [`GpuResource`] and [`ResourceBarrier`]: state tracking
//! - [`RootSignature`]: which root parameters are descriptor tables
//! - [`Device`]: the trait every backend implements
//! - [`CoreConfig`]: tunables loaded from RON

pub mod bits;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod handles;
pub mod math;
pub mod resource;
pub mod root_signature;

pub use command::*;
pub use config::{AllocatorConfig, ConfigError, ContextConfig, CoreConfig, DescriptorConfig, MAX_PENDING_BARRIERS};
pub use device::*;
pub use error::{GpuError, GpuResult};
pub use fence::{FenceValue, QueueType};
pub use handles::*;
pub use resource::*;
pub use root_signature::*;
