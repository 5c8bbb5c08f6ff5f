//! Commands recorded into a command buffer.

use crate::handles::{
    DescriptorHeapHandle, GpuDescriptorHandle, PipelineHandle, ResourceHandle, RootSignatureHandle,
};
use crate::resource::ResourceBarrier;

/// Pipeline a root signature / descriptor table is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

/// Source rectangle of a texture copy, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CopyBox {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// One side of a texture copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureCopyLocation {
    /// The single subresource of a texture.
    Texture { resource: ResourceHandle },
    /// A linear image laid out inside a buffer.
    Footprint {
        resource: ResourceHandle,
        offset: u64,
        width: u32,
        height: u32,
        row_pitch: u64,
        bytes_per_pixel: u32,
    },
}

impl TextureCopyLocation {
    pub fn resource(&self) -> ResourceHandle {
        match *self {
            TextureCopyLocation::Texture { resource } => resource,
            TextureCopyLocation::Footprint { resource, .. } => resource,
        }
    }
}

/// A single recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    ResourceBarriers(&'a [ResourceBarrier]),
    CopyBufferRegion {
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        size: u64,
    },
    CopyTextureRegion {
        dst: TextureCopyLocation,
        dst_x: u32,
        dst_y: u32,
        src: TextureCopyLocation,
        src_box: Option<CopyBox>,
    },
    SetDescriptorHeaps {
        view: Option<DescriptorHeapHandle>,
        sampler: Option<DescriptorHeapHandle>,
    },
    SetRootSignature {
        bind_point: BindPoint,
        signature: RootSignatureHandle,
    },
    SetPipelineState(PipelineHandle),
    SetRootDescriptorTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}
