//! Command recording contexts.
//!
//! A [`CommandContext`] is leased from [`GraphicsCore::begin`] and owns
//! everything a single recording thread touches: a command buffer, two
//! transient allocators, two dynamic descriptor heaps and a barrier batch.
//! [`CommandContext::finish`] submits the recording, retires what it used
//! against the new fence and hands the context back to the pool.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bytemuck::Pod;
use ember_core::math::TEXTURE_DATA_PITCH_ALIGNMENT;
use ember_core::{
    BindPoint, BufferDesc, Command, CommandBufferHandle, CopyBox, CpuDescriptorHandle, DescriptorHeapHandle, Device,
    FenceValue, GpuDescriptorHandle, GpuResource, GpuResult, MAX_PENDING_BARRIERS, PipelineHandle, QueueType,
    ResourceBarrier, ResourceState, RootSignature, RootSignatureHandle, TextureCopyLocation,
};

use crate::dynamic_descriptor_heap::DynamicDescriptorHeap;
use crate::graphics_core::GraphicsCore;
use crate::linear_allocator::{DynAlloc, LinearAllocator};
use crate::queue::CommandQueueManager;

/// Recording state that outlives a single lease and is pooled between uses.
pub(crate) struct ContextState {
    queue_type: QueueType,
    device: Arc<dyn Device>,
    queues: Arc<CommandQueueManager>,
    buffer: CommandBufferHandle,
    /// True between a lease and its submission.
    recording: bool,
    cpu_allocator: LinearAllocator,
    gpu_allocator: LinearAllocator,
    view_heap: DynamicDescriptorHeap,
    sampler_heap: DynamicDescriptorHeap,
    barriers: ArrayVec<ResourceBarrier, MAX_PENDING_BARRIERS>,
    max_pending_barriers: usize,
    graphics_signature: Option<RootSignatureHandle>,
    compute_signature: Option<RootSignatureHandle>,
    pipeline: Option<PipelineHandle>,
    bound_heaps: (Option<DescriptorHeapHandle>, Option<DescriptorHeapHandle>),
}

impl ContextState {
    /// Builds a context for `queue_type` that is already recording.
    pub(crate) fn new(core: &GraphicsCore, queue_type: QueueType) -> GpuResult<Self> {
        let queues = core.queues().clone();
        let buffer = queues.queue(queue_type).request_buffer()?;
        let default_alignment = core.config().allocator.default_alignment;
        Ok(Self {
            queue_type,
            device: core.device().clone(),
            buffer,
            recording: true,
            cpu_allocator: LinearAllocator::new(core.cpu_pages().clone(), default_alignment),
            gpu_allocator: LinearAllocator::new(core.gpu_pages().clone(), default_alignment),
            view_heap: DynamicDescriptorHeap::new(core.device().clone(), core.view_heaps().clone()),
            sampler_heap: DynamicDescriptorHeap::new(core.device().clone(), core.sampler_heaps().clone()),
            barriers: ArrayVec::new(),
            max_pending_barriers: core.config().contexts.max_pending_barriers,
            graphics_signature: None,
            compute_signature: None,
            pipeline: None,
            bound_heaps: (None, None),
            queues,
        })
    }

    pub(crate) fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Starts a new recording on a pooled context.
    pub(crate) fn reset(&mut self) -> GpuResult<()> {
        debug_assert!(!self.recording, "resetting a context that is still recording");
        self.buffer = self.queues.queue(self.queue_type).request_buffer()?;
        self.recording = true;
        self.barriers.clear();
        self.graphics_signature = None;
        self.compute_signature = None;
        self.pipeline = None;
        self.bound_heaps = (None, None);
        self.bind_descriptor_heaps();
        Ok(())
    }

    fn record(&self, command: Command<'_>) {
        self.device.record(self.buffer, command);
    }

    fn flush_resource_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        self.record(Command::ResourceBarriers(&self.barriers));
        self.barriers.clear();
    }

    /// Binds the current descriptor heaps if they differ from the bound ones.
    fn bind_descriptor_heaps(&mut self) {
        let heaps = (self.view_heap.current_heap(), self.sampler_heap.current_heap());
        if heaps == self.bound_heaps {
            return;
        }
        self.bound_heaps = heaps;
        self.record(Command::SetDescriptorHeaps {
            view: heaps.0,
            sampler: heaps.1,
        });
    }

    /// Closes and submits the recording, then retires everything it used.
    fn submit(&mut self) -> FenceValue {
        self.flush_resource_barriers();
        let queue = self.queues.queue(self.queue_type);
        let fence = queue.execute_command_buffer(self.buffer);
        queue.discard_buffer(fence, self.buffer);
        self.retire_resources(fence);
        fence
    }

    fn retire_resources(&mut self, fence: FenceValue) {
        self.cpu_allocator.cleanup_used_pages(fence);
        self.gpu_allocator.cleanup_used_pages(fence);
        self.view_heap.cleanup_used_heaps(fence);
        self.sampler_heap.cleanup_used_heaps(fence);
        self.recording = false;
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        if !self.recording {
            return;
        }
        tracing::warn!("{} context dropped while recording, its commands are discarded", self.queue_type);
        let queue = self.queues.queue(self.queue_type);
        let fence = queue.last_issued_fence_value();
        queue.discard_buffer(fence, self.buffer);
        self.retire_resources(fence);
    }
}

/// A leased recording context.
///
/// Single-owner: it is `Send` but not shared, and [`CommandContext::finish`]
/// consumes it.
pub struct CommandContext {
    core: Arc<GraphicsCore>,
    state: ContextState,
}

impl CommandContext {
    pub(crate) fn new(core: Arc<GraphicsCore>, state: ContextState) -> Self {
        Self { core, state }
    }

    pub fn queue_type(&self) -> QueueType {
        self.state.queue_type
    }

    pub fn core(&self) -> &Arc<GraphicsCore> {
        &self.core
    }

    /// The command buffer currently being recorded.
    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.state.buffer
    }

    /// Barriers batched but not yet recorded.
    pub fn pending_barrier_count(&self) -> usize {
        self.state.barriers.len()
    }

    // Barriers

    /// Moves `resource` to `new_state`, batching the barrier.
    ///
    /// A resource already in `new_state` gets no barrier unless that state
    /// needs one between accesses (unordered access), in which case a UAV
    /// barrier is batched instead.
    pub fn transition_resource(&mut self, resource: &mut GpuResource, new_state: ResourceState, flush_now: bool) {
        let old_state = resource.usage_state();
        if self.state.queue_type != QueueType::Graphics {
            assert!(
                ResourceState::VALID_COMPUTE_QUEUE.contains(old_state)
                    && ResourceState::VALID_COMPUTE_QUEUE.contains(new_state),
                "transition {old_state:?} -> {new_state:?} is not allowed on the {} queue",
                self.state.queue_type
            );
        }

        if old_state != new_state {
            self.push_barrier(ResourceBarrier::Transition {
                resource: resource.handle(),
                before: old_state,
                after: new_state,
            });
            resource.set_usage_state(new_state);
        } else if new_state.requires_sync_when_unchanged() {
            self.push_barrier(ResourceBarrier::UnorderedAccess {
                resource: resource.handle(),
            });
        }

        if flush_now {
            self.flush_resource_barriers();
        }
    }

    /// Orders unordered-access work on `resource` before what follows.
    pub fn insert_uav_barrier(&mut self, resource: &GpuResource, flush_now: bool) {
        self.push_barrier(ResourceBarrier::UnorderedAccess {
            resource: resource.handle(),
        });
        if flush_now {
            self.flush_resource_barriers();
        }
    }

    fn push_barrier(&mut self, barrier: ResourceBarrier) {
        self.state.barriers.push(barrier);
        if self.state.barriers.len() >= self.state.max_pending_barriers {
            self.state.flush_resource_barriers();
        }
    }

    /// Records every batched barrier.
    pub fn flush_resource_barriers(&mut self) {
        self.state.flush_resource_barriers();
    }

    // Copies

    /// Copies all of `src` to the start of `dst`.
    pub fn copy_buffer(&mut self, dst: &mut GpuResource, src: &mut GpuResource) {
        let size = src.size();
        assert!(dst.size() >= size, "copying {size} bytes into a {}-byte buffer", dst.size());
        self.copy_buffer_region(dst, 0, src, 0, size);
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &mut GpuResource,
        dst_offset: u64,
        src: &mut GpuResource,
        src_offset: u64,
        size: u64,
    ) {
        self.transition_resource(dst, ResourceState::COPY_DEST, false);
        self.prepare_copy_source(src);
        self.flush_resource_barriers();
        self.state.record(Command::CopyBufferRegion {
            dst: dst.handle(),
            dst_offset,
            src: src.handle(),
            src_offset,
            size,
        });
    }

    /// Copies `src_box` of `src` (all of it if `None`) to `(dst_x, dst_y)` of `dst`.
    pub fn copy_texture_region(
        &mut self,
        dst: &mut GpuResource,
        dst_x: u32,
        dst_y: u32,
        src: &mut GpuResource,
        src_box: Option<CopyBox>,
    ) {
        assert!(
            dst.texture_desc().is_some() && src.texture_desc().is_some(),
            "texture copies need two textures"
        );
        self.transition_resource(dst, ResourceState::COPY_DEST, false);
        self.prepare_copy_source(src);
        self.flush_resource_barriers();
        self.state.record(Command::CopyTextureRegion {
            dst: TextureCopyLocation::Texture { resource: dst.handle() },
            dst_x,
            dst_y,
            src: TextureCopyLocation::Texture { resource: src.handle() },
            src_box,
        });
    }

    /// Generic-read resources can already be copied from.
    fn prepare_copy_source(&mut self, src: &mut GpuResource) {
        if !src.usage_state().contains(ResourceState::COPY_SOURCE) {
            self.transition_resource(src, ResourceState::COPY_SOURCE, false);
        }
    }

    fn copy_from_upload(&mut self, dst: &mut GpuResource, dst_offset: u64, upload: &DynAlloc, size: u64) {
        self.transition_resource(dst, ResourceState::COPY_DEST, true);
        self.state.record(Command::CopyBufferRegion {
            dst: dst.handle(),
            dst_offset,
            src: upload.resource(),
            src_offset: upload.offset(),
            size,
        });
    }

    /// Stages `data` in upload memory and copies it to `dst` at `dst_offset`.
    pub fn write_buffer<T: Pod>(&mut self, dst: &mut GpuResource, dst_offset: u64, data: &[T]) -> GpuResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        assert!(
            dst_offset + bytes.len() as u64 <= dst.size(),
            "writing {} bytes at {dst_offset} overflows a {}-byte buffer",
            bytes.len(),
            dst.size()
        );
        let upload = self.state.cpu_allocator.allocate_default(bytes.len() as u64)?;
        upload.write_bytes(0, bytes);
        self.copy_from_upload(dst, dst_offset, &upload, bytes.len() as u64);
        Ok(())
    }

    /// Fills `num_bytes` of `dst` at `dst_offset` with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, dst: &mut GpuResource, dst_offset: u64, value: u32, num_bytes: u64) -> GpuResult<()> {
        assert!(num_bytes % 4 == 0, "fill size {num_bytes} is not a multiple of 4");
        assert!(
            dst_offset + num_bytes <= dst.size(),
            "filling {num_bytes} bytes at {dst_offset} overflows a {}-byte buffer",
            dst.size()
        );
        if num_bytes == 0 {
            return Ok(());
        }
        let upload = self.state.cpu_allocator.allocate_default(num_bytes)?;
        upload.fill_u32(value);
        self.copy_from_upload(dst, dst_offset, &upload, num_bytes);
        Ok(())
    }

    /// Transient CPU-writable memory, valid until this recording retires.
    pub fn reserve_upload_memory(&mut self, size: u64) -> GpuResult<DynAlloc> {
        self.state.cpu_allocator.allocate_default(size)
    }

    /// Transient GPU-only memory in the unordered-access state.
    pub fn reserve_scratch_memory(&mut self, size: u64) -> GpuResult<DynAlloc> {
        self.state.gpu_allocator.allocate_default(size)
    }

    // Pipeline state

    fn assert_bind_point(&self, bind_point: BindPoint) {
        let allowed = match self.state.queue_type {
            QueueType::Graphics => true,
            QueueType::Compute => bind_point == BindPoint::Compute,
            QueueType::Copy => false,
        };
        assert!(allowed, "{bind_point:?} bindings on a {} context", self.state.queue_type);
    }

    pub fn set_root_signature(&mut self, bind_point: BindPoint, signature: &RootSignature) {
        self.assert_bind_point(bind_point);
        let cached = match bind_point {
            BindPoint::Graphics => &mut self.state.graphics_signature,
            BindPoint::Compute => &mut self.state.compute_signature,
        };
        if *cached == Some(signature.handle()) {
            return;
        }
        *cached = Some(signature.handle());

        self.state.record(Command::SetRootSignature {
            bind_point,
            signature: signature.handle(),
        });
        self.state.view_heap.parse_root_signature(bind_point, signature);
        self.state.sampler_heap.parse_root_signature(bind_point, signature);
    }

    pub fn set_pipeline_state(&mut self, pipeline: PipelineHandle) {
        assert!(self.state.queue_type != QueueType::Copy, "pipeline state on a copy context");
        if self.state.pipeline == Some(pipeline) {
            return;
        }
        self.state.pipeline = Some(pipeline);
        self.state.record(Command::SetPipelineState(pipeline));
    }

    /// Stages view descriptors into table `root_index` starting at `offset`.
    pub fn set_dynamic_descriptors(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        self.assert_bind_point(bind_point);
        self.state
            .view_heap
            .set_descriptor_handles(bind_point, root_index, offset, handles);
    }

    /// Stages sampler descriptors into table `root_index` starting at `offset`.
    pub fn set_dynamic_samplers(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        self.assert_bind_point(bind_point);
        self.state
            .sampler_heap
            .set_descriptor_handles(bind_point, root_index, offset, handles);
    }

    /// Copies one view descriptor into the heap now and binds it as table `root_index`.
    pub fn set_dynamic_descriptor_direct(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        handle: CpuDescriptorHandle,
    ) -> GpuResult<()> {
        self.assert_bind_point(bind_point);
        let (base, changed) = self.state.view_heap.upload_direct(handle)?;
        if changed {
            self.state.bind_descriptor_heaps();
        }
        self.set_descriptor_table(bind_point, root_index, base);
        Ok(())
    }

    /// Binds a table the caller placed in a shader-visible heap.
    pub fn set_descriptor_table(&mut self, bind_point: BindPoint, root_index: u32, base: GpuDescriptorHandle) {
        self.assert_bind_point(bind_point);
        self.state.record(Command::SetRootDescriptorTable {
            bind_point,
            root_index,
            base,
        });
    }

    /// Copies and binds the stale descriptor tables of `bind_point`.
    fn commit_descriptor_tables(&mut self, bind_point: BindPoint) -> GpuResult<()> {
        let view_changed = self.state.view_heap.prepare_staged_tables(bind_point)?;
        let sampler_changed = self.state.sampler_heap.prepare_staged_tables(bind_point)?;
        if view_changed || sampler_changed {
            self.state.bind_descriptor_heaps();
        }

        let device = &self.state.device;
        let buffer = self.state.buffer;
        let mut set_table = |root_index, base| {
            device.record(
                buffer,
                Command::SetRootDescriptorTable {
                    bind_point,
                    root_index,
                    base,
                },
            )
        };
        self.state.view_heap.bind_staged_tables(bind_point, &mut set_table);
        self.state.sampler_heap.bind_staged_tables(bind_point, &mut set_table);
        Ok(())
    }

    // Work

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> GpuResult<()> {
        self.draw_instanced(vertex_count, 1, start_vertex, 0)
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> GpuResult<()> {
        assert!(self.state.queue_type == QueueType::Graphics, "draw on a {} context", self.state.queue_type);
        self.flush_resource_barriers();
        self.commit_descriptor_tables(BindPoint::Graphics)?;
        self.state.record(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) -> GpuResult<()> {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> GpuResult<()> {
        assert!(self.state.queue_type == QueueType::Graphics, "draw on a {} context", self.state.queue_type);
        self.flush_resource_barriers();
        self.commit_descriptor_tables(BindPoint::Graphics)?;
        self.state.record(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> GpuResult<()> {
        assert!(self.state.queue_type != QueueType::Copy, "dispatch on a copy context");
        self.flush_resource_barriers();
        self.commit_descriptor_tables(BindPoint::Compute)?;
        self.state.record(Command::Dispatch { x, y, z });
        Ok(())
    }

    // Submission

    /// Submits what has been recorded so far and keeps recording into a
    /// fresh command buffer with the same bindings.
    pub fn flush(&mut self, wait: bool) -> GpuResult<FenceValue> {
        let state = &mut self.state;
        let queues = state.queues.clone();
        let queue = queues.queue(state.queue_type);
        let next = queue.request_buffer()?;

        state.flush_resource_barriers();
        let fence = queue.execute_command_buffer(state.buffer);
        queue.discard_buffer(fence, std::mem::replace(&mut state.buffer, next));
        if wait {
            queue.wait_for(fence);
        }

        state.bound_heaps = (None, None);
        state.bind_descriptor_heaps();
        if let Some(signature) = state.graphics_signature {
            state.record(Command::SetRootSignature {
                bind_point: BindPoint::Graphics,
                signature,
            });
        }
        if let Some(signature) = state.compute_signature {
            state.record(Command::SetRootSignature {
                bind_point: BindPoint::Compute,
                signature,
            });
        }
        if let Some(pipeline) = state.pipeline {
            state.record(Command::SetPipelineState(pipeline));
        }
        state.view_heap.unbind_all_valid();
        state.sampler_heap.unbind_all_valid();
        Ok(fence)
    }

    /// Submits the recording and returns the context to the pool.
    ///
    /// With `wait` set, blocks until the GPU has finished the submission.
    pub fn finish(self, wait: bool) -> FenceValue {
        let CommandContext { core, mut state } = self;
        let fence = state.submit();
        core.context_pool().release(state);
        if wait {
            core.wait_for_fence(fence);
        }
        fence
    }

    // Synchronous helpers

    /// Uploads `data` into `dst` at `dst_offset`, leaves it in the
    /// generic-read state and waits for the copy.
    pub fn initialize_buffer<T: Pod>(
        core: &Arc<GraphicsCore>,
        dst: &mut GpuResource,
        dst_offset: u64,
        data: &[T],
    ) -> GpuResult<FenceValue> {
        let mut context = core.begin(QueueType::Graphics)?;
        context.write_buffer(dst, dst_offset, data)?;
        context.transition_resource(dst, ResourceState::GENERIC_READ, true);
        Ok(context.finish(true))
    }

    /// Uploads tightly packed rows of `data` into the texture `dst`, leaves it
    /// in the generic-read state and waits for the copy.
    pub fn initialize_texture(core: &Arc<GraphicsCore>, dst: &mut GpuResource, data: &[u8]) -> GpuResult<FenceValue> {
        let Some(desc) = dst.texture_desc().copied() else {
            panic!("initialize_texture on a buffer");
        };
        assert_eq!(
            data.len() as u64,
            desc.size_bytes(),
            "texture data does not match a {}x{} texture",
            desc.width,
            desc.height
        );

        let mut context = core.begin(QueueType::Graphics)?;
        let row_bytes = desc.row_bytes() as usize;
        let row_pitch = desc.footprint_row_pitch();
        let upload = context
            .state
            .cpu_allocator
            .allocate(row_pitch * desc.height as u64, TEXTURE_DATA_PITCH_ALIGNMENT)?;
        if row_bytes > 0 {
            for (row, bytes) in data.chunks_exact(row_bytes).enumerate() {
                upload.write_bytes(row as u64 * row_pitch, bytes);
            }
        }

        context.transition_resource(dst, ResourceState::COPY_DEST, true);
        context.state.record(Command::CopyTextureRegion {
            dst: TextureCopyLocation::Texture { resource: dst.handle() },
            dst_x: 0,
            dst_y: 0,
            src: TextureCopyLocation::Footprint {
                resource: upload.resource(),
                offset: upload.offset(),
                width: desc.width,
                height: desc.height,
                row_pitch,
                bytes_per_pixel: desc.bytes_per_pixel,
            },
            src_box: None,
        });
        context.transition_resource(dst, ResourceState::GENERIC_READ, true);
        Ok(context.finish(true))
    }

    /// Copies `size` bytes of `src` at `offset` back to the CPU.
    pub fn readback_buffer(
        core: &Arc<GraphicsCore>,
        src: &mut GpuResource,
        offset: u64,
        size: u64,
    ) -> GpuResult<Vec<u8>> {
        let mut readback = core.create_buffer(&BufferDesc::readback(size))?;
        let result = Self::copy_to_readback(core, &mut readback, src, offset, size);
        core.destroy_resource(readback);
        result
    }

    fn copy_to_readback(
        core: &Arc<GraphicsCore>,
        readback: &mut GpuResource,
        src: &mut GpuResource,
        offset: u64,
        size: u64,
    ) -> GpuResult<Vec<u8>> {
        let mut context = core.begin(QueueType::Graphics)?;
        context.copy_buffer_region(readback, 0, src, offset, size);
        context.finish(true);

        let device = core.device();
        let ptr = device.map(readback.handle())?;
        // SAFETY: the mapping covers the whole `size`-byte readback buffer and
        // the GPU finished writing it before `finish` returned.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size as usize) }.to_vec();
        device.unmap(readback.handle());
        Ok(bytes)
    }
}
