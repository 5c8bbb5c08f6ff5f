//! Device trait definitions
//!
//! This trait is the whole surface the submission core needs from a GPU
//! backend. Handles are opaque; the device owns the objects behind them.

use std::ptr::NonNull;

use crate::command::Command;
use crate::error::GpuResult;
use crate::fence::QueueType;
use crate::handles::{
    CommandBufferHandle, CpuDescriptorHandle, DescriptorHeapHandle, FenceHandle, GpuAddress,
    GpuDescriptorHandle, QueueHandle, ResourceHandle,
};
use crate::resource::{BufferDesc, TextureDesc};

/// Kind of descriptors a heap stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views.
    CbvSrvUav,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl DescriptorHeapKind {
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::CbvSrvUav,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::RenderTarget,
        DescriptorHeapKind::DepthStencil,
    ];

    pub fn index(self) -> usize {
        match self {
            DescriptorHeapKind::CbvSrvUav => 0,
            DescriptorHeapKind::Sampler => 1,
            DescriptorHeapKind::RenderTarget => 2,
            DescriptorHeapKind::DepthStencil => 3,
        }
    }

    /// Only view and sampler heaps can be bound for shader access.
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Sampler)
    }
}

/// Parameters for [`Device::create_descriptor_heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub count: u32,
    pub shader_visible: bool,
}

/// A created descriptor heap and the handles of its first slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub handle: DescriptorHeapHandle,
    pub kind: DescriptorHeapKind,
    pub count: u32,
    pub cpu_start: CpuDescriptorHandle,
    /// Null unless the heap is shader visible.
    pub gpu_start: GpuDescriptorHandle,
}

/// A run of `count` consecutive descriptors starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorRange {
    pub start: CpuDescriptorHandle,
    pub count: u32,
}

/// A GPU backend.
///
/// Implementations must be usable from many threads at once; the core
/// serializes per-queue submission itself.
pub trait Device: Send + Sync {
    /// Returns a name for logs.
    fn name(&self) -> &str;

    // Queues and fences

    fn create_queue(&self, ty: QueueType) -> GpuResult<QueueHandle>;

    fn create_fence(&self, initial_value: u64) -> GpuResult<FenceHandle>;

    /// Enqueues a signal of `value` on `fence` after all prior work on `queue`.
    fn signal(&self, queue: QueueHandle, fence: FenceHandle, value: u64);

    /// Makes `queue` wait (on the GPU) until `fence` reaches `value`.
    fn queue_wait(&self, queue: QueueHandle, fence: FenceHandle, value: u64);

    /// The highest value the fence has reached.
    fn fence_completed_value(&self, fence: FenceHandle) -> u64;

    /// Blocks the calling thread until `fence` reaches `value`.
    fn wait_for_fence_value(&self, fence: FenceHandle, value: u64);

    // Command buffers

    /// Creates a command buffer in the recording state.
    fn create_command_buffer(&self, ty: QueueType) -> GpuResult<CommandBufferHandle>;

    /// Clears a command buffer and reopens it for recording.
    ///
    /// The caller guarantees the GPU has finished with it.
    fn reset_command_buffer(&self, buffer: CommandBufferHandle);

    fn record(&self, buffer: CommandBufferHandle, command: Command<'_>);

    fn close_command_buffer(&self, buffer: CommandBufferHandle);

    /// Submits a closed command buffer to `queue`.
    fn execute(&self, queue: QueueHandle, buffer: CommandBufferHandle);

    // Memory

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<ResourceHandle>;

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<ResourceHandle>;

    fn gpu_address(&self, resource: ResourceHandle) -> GpuAddress;

    /// Maps a CPU-visible resource; the pointer stays valid until `unmap`.
    fn map(&self, resource: ResourceHandle) -> GpuResult<NonNull<u8>>;

    fn unmap(&self, resource: ResourceHandle);

    // Descriptors

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GpuResult<DescriptorHeapInfo>;

    /// Byte distance between consecutive descriptors of `kind`.
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    /// Copies descriptors from `src` ranges into `dst` ranges.
    ///
    /// Both lists describe the same total number of descriptors. A null
    /// source handle yields a null descriptor at the destination.
    fn copy_descriptors(&self, dst: &[DescriptorRange], src: &[DescriptorRange], kind: DescriptorHeapKind);

    // Destruction

    fn destroy_queue(&self, queue: QueueHandle);

    fn destroy_fence(&self, fence: FenceHandle);

    fn destroy_command_buffer(&self, buffer: CommandBufferHandle);

    fn destroy_resource(&self, resource: ResourceHandle);

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapHandle);
}
