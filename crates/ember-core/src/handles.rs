//! Opaque device object handles.
//!
//! Handles are lightweight and can be copied freely. The objects they name
//! live inside the [`Device`](crate::Device) that created them.

macro_rules! device_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Returns the raw handle value.
            pub fn raw(&self) -> u64 {
                self.0
            }

            /// Creates a handle from a raw value (for device implementations).
            pub fn from_raw(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

device_handle!(
    /// A hardware submission queue.
    QueueHandle
);
device_handle!(
    /// A device fence object.
    FenceHandle
);
device_handle!(
    /// A recordable command buffer (command list plus its backing allocator).
    CommandBufferHandle
);
device_handle!(
    /// A committed buffer or texture.
    ResourceHandle
);
device_handle!(
    /// A descriptor heap.
    DescriptorHeapHandle
);
device_handle!(
    /// A root signature built by an external collaborator.
    RootSignatureHandle
);
device_handle!(
    /// A pipeline state object built by an external collaborator.
    PipelineHandle
);

/// A GPU virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub const NULL: GpuAddress = GpuAddress(0);

    /// Returns the address `bytes` past this one.
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// CPU-side descriptor location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub const NULL: CpuDescriptorHandle = CpuDescriptorHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Advances by `count` descriptors of `increment` bytes each.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + count as u64 * increment as u64)
    }
}

/// GPU-side descriptor location (only valid inside shader-visible heaps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub const NULL: GpuDescriptorHandle = GpuDescriptorHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + count as u64 * increment as u64)
    }
}

/// A CPU/GPU descriptor handle pair addressing the same heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorHandle {
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
}

impl DescriptorHandle {
    pub fn new(cpu: CpuDescriptorHandle, gpu: GpuDescriptorHandle) -> Self {
        Self { cpu, gpu }
    }

    /// Returns true if the pair points into a shader-visible heap.
    pub fn is_shader_visible(&self) -> bool {
        !self.gpu.is_null()
    }

    /// Advances both halves; a null GPU half stays null.
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self {
            cpu: self.cpu.offset(count, increment),
            gpu: if self.gpu.is_null() {
                self.gpu
            } else {
                self.gpu.offset(count, increment)
            },
        }
    }
}
