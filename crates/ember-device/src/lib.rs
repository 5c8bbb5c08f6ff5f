//! Software device
//!
//! An in-memory implementation of [`ember_core::Device`]. Queues run their
//! submitted work on the CPU, either synchronously, on explicit request, or
//! on a background worker thread (see [`ExecutionMode`]). Memory, descriptor
//! heaps and resource states are simulated closely enough to check the
//! submission core's temporal-safety and state-tracking guarantees.

mod descriptors;
mod device;
mod execution;
mod memory;
mod stats;

pub use device::{ExecutionMode, SoftwareDevice};
pub use execution::DrawRecord;
pub use stats::DeviceStats;
