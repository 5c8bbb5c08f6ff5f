//! Ember submission core
//!
//! Records GPU work on many threads and recycles what it consumed once the
//! GPU is done with it:
//! - [`CommandQueue`]: fence-tracked submission, one per queue type
//! - [`CommandBufferPool`]: command buffers reused by fence
//! - [`LinearAllocator`] / [`PageManager`]: transient upload and scratch memory
//! - [`DynamicDescriptorHeap`]: descriptor table staging into shader-visible heaps
//! - [`CommandContext`]: the recording API, leased from [`GraphicsCore::begin`]

pub mod buffer_pool;
pub mod context;
pub mod context_pool;
pub mod descriptor_allocator;
pub mod dynamic_descriptor_heap;
pub mod error;
pub mod graphics_core;
pub mod linear_allocator;
pub mod queue;

#[cfg(test)]
mod tests;

pub use buffer_pool::CommandBufferPool;
pub use context::CommandContext;
pub use context_pool::ContextPool;
pub use descriptor_allocator::DescriptorAllocator;
pub use dynamic_descriptor_heap::{DescriptorHandleCache, DescriptorHeapPool, DynamicDescriptorHeap};
pub use error::CoreError;
pub use graphics_core::GraphicsCore;
pub use linear_allocator::{AllocationPage, AllocatorKind, DynAlloc, LinearAllocator, PageManager};
pub use queue::{CommandQueue, CommandQueueManager};
