//! GPU resources and their usage-state tracking.

use bitflags::bitflags;

use crate::handles::{GpuAddress, ResourceHandle};
use crate::math::{TEXTURE_DATA_PITCH_ALIGNMENT, align_up};

bitflags! {
    /// How the GPU currently accesses a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// States a compute or copy queue is allowed to transition between.
    pub const VALID_COMPUTE_QUEUE: ResourceState = ResourceState::UNORDERED_ACCESS
        .union(ResourceState::NON_PIXEL_SHADER_RESOURCE)
        .union(ResourceState::COPY_DEST)
        .union(ResourceState::COPY_SOURCE);

    /// Returns true if staying in this state still needs an ordering barrier
    /// between consecutive accesses (read-modify-write hazards).
    pub fn requires_sync_when_unchanged(self) -> bool {
        self.contains(ResourceState::UNORDERED_ACCESS)
    }
}

/// Memory pool a committed resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU-local memory, not CPU visible.
    Default,
    /// CPU-writable memory the GPU reads from.
    Upload,
    /// CPU-readable memory the GPU writes to.
    Readback,
}

impl HeapKind {
    /// Returns true if resources in this heap can be mapped.
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapKind::Default)
    }
}

/// View flavour of a buffer; only view construction distinguishes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferKind {
    /// Untyped bytes (byte-address buffers, upload pages).
    #[default]
    Raw,
    /// Array of fixed-stride elements.
    Structured { stride: u32 },
    /// Formatted elements.
    Typed { element_size: u32 },
}

/// Description of a committed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub heap: HeapKind,
    pub kind: BufferKind,
    pub allow_unordered_access: bool,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    /// A GPU-local buffer starting in the common state.
    pub fn default_heap(size: u64, kind: BufferKind) -> Self {
        Self {
            size,
            heap: HeapKind::Default,
            kind,
            allow_unordered_access: true,
            initial_state: ResourceState::COMMON,
        }
    }

    /// An upload buffer (always generic read).
    pub fn upload(size: u64) -> Self {
        Self {
            size,
            heap: HeapKind::Upload,
            kind: BufferKind::Raw,
            allow_unordered_access: false,
            initial_state: ResourceState::GENERIC_READ,
        }
    }

    /// A readback buffer (always copy destination).
    pub fn readback(size: u64) -> Self {
        Self {
            size,
            heap: HeapKind::Readback,
            kind: BufferKind::Raw,
            allow_unordered_access: false,
            initial_state: ResourceState::COPY_DEST,
        }
    }
}

/// Description of a single-subresource 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub allow_unordered_access: bool,
    pub initial_state: ResourceState,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            allow_unordered_access: false,
            initial_state: ResourceState::COMMON,
        }
    }

    /// Tightly packed bytes per row.
    pub fn row_bytes(&self) -> u64 {
        self.width as u64 * self.bytes_per_pixel as u64
    }

    /// Row pitch of a buffer footprint holding this texture.
    pub fn footprint_row_pitch(&self) -> u64 {
        align_up(self.row_bytes(), TEXTURE_DATA_PITCH_ALIGNMENT)
    }

    /// Total tightly packed size.
    pub fn size_bytes(&self) -> u64 {
        self.row_bytes() * self.height as u64
    }
}

/// Creation parameters for either resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

/// A committed resource plus the state the recording side believes it is in.
///
/// Only the owning context mutates the tracked state while recording.
#[derive(Debug)]
pub struct GpuResource {
    handle: ResourceHandle,
    desc: ResourceDesc,
    usage_state: ResourceState,
    gpu_address: GpuAddress,
}

impl GpuResource {
    pub fn new(handle: ResourceHandle, desc: ResourceDesc, gpu_address: GpuAddress) -> Self {
        let usage_state = match desc {
            ResourceDesc::Buffer(b) => b.initial_state,
            ResourceDesc::Texture(t) => t.initial_state,
        };
        Self {
            handle,
            desc,
            usage_state,
            gpu_address,
        }
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    /// Returns the buffer description, if this is a buffer.
    pub fn buffer_desc(&self) -> Option<&BufferDesc> {
        match &self.desc {
            ResourceDesc::Buffer(b) => Some(b),
            ResourceDesc::Texture(_) => None,
        }
    }

    /// Returns the texture description, if this is a texture.
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match &self.desc {
            ResourceDesc::Texture(t) => Some(t),
            ResourceDesc::Buffer(_) => None,
        }
    }

    /// Size in bytes (tightly packed for textures).
    pub fn size(&self) -> u64 {
        match &self.desc {
            ResourceDesc::Buffer(b) => b.size,
            ResourceDesc::Texture(t) => t.size_bytes(),
        }
    }

    pub fn usage_state(&self) -> ResourceState {
        self.usage_state
    }

    pub fn set_usage_state(&mut self, state: ResourceState) {
        self.usage_state = state;
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu_address
    }
}

/// A synchronization point recorded into a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBarrier {
    /// Usage-state change.
    Transition {
        resource: ResourceHandle,
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders unordered-access reads/writes without a state change.
    UnorderedAccess { resource: ResourceHandle },
}

impl ResourceBarrier {
    pub fn resource(&self) -> ResourceHandle {
        match *self {
            ResourceBarrier::Transition { resource, .. } => resource,
            ResourceBarrier::UnorderedAccess { resource } => resource,
        }
    }
}
