//! [`SoftwareDevice`]: the [`Device`] implementation.

use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;

use ember_core::{
    BindPoint, BufferDesc, Command, CommandBufferHandle, CpuDescriptorHandle, DescriptorHeapDesc,
    DescriptorHeapHandle, DescriptorHeapInfo, DescriptorHeapKind, DescriptorRange, Device, FenceHandle,
    GpuAddress, GpuDescriptorHandle, GpuError, GpuResult, HeapKind, QueueHandle, QueueType, ResourceHandle,
    ResourceState, TextureDesc,
};
use parking_lot::{Condvar, Mutex};

use crate::descriptors::increment_for;
use crate::execution::{DrawRecord, QueueOp, RecordedCommand, SoftCommandBuffer, SoftQueue, SoftResource, State};
use crate::memory::HostMemory;
use crate::stats::DeviceStats;

/// When submitted work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Work runs inside the call that submits it.
    Immediate,
    /// Work runs only when [`SoftwareDevice::step`] or
    /// [`SoftwareDevice::run_until_idle`] is called, or when the host blocks
    /// on a fence that queued work would signal.
    ///
    /// A host wait that queued work cannot satisfy blocks forever, exactly
    /// as on hardware.
    Deferred,
    /// Work runs on a dedicated worker thread.
    Background,
}

struct Shared {
    mode: ExecutionMode,
    state: Mutex<State>,
    fence_cv: Condvar,
    work_cv: Condvar,
}

impl Shared {
    /// Lets queued work run according to the execution mode.
    fn kick(&self, state: &mut State) {
        match self.mode {
            ExecutionMode::Immediate => {
                if state.pump() {
                    self.fence_cv.notify_all();
                }
            }
            ExecutionMode::Background => {
                self.work_cv.notify_one();
            }
            ExecutionMode::Deferred => {}
        }
    }
}

/// A GPU simulated in host memory.
pub struct SoftwareDevice {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl SoftwareDevice {
    pub fn new(mode: ExecutionMode) -> Self {
        let shared = Arc::new(Shared {
            mode,
            state: Mutex::new(State::new()),
            fence_cv: Condvar::new(),
            work_cv: Condvar::new(),
        });
        let worker = (mode == ExecutionMode::Background).then(|| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || worker_loop(&shared))
        });
        tracing::debug!("Created software device ({:?})", mode);
        Self {
            shared,
            worker,
            name: format!("software ({mode:?})"),
        }
    }

    pub fn immediate() -> Self {
        Self::new(ExecutionMode::Immediate)
    }

    pub fn deferred() -> Self {
        Self::new(ExecutionMode::Deferred)
    }

    pub fn background() -> Self {
        Self::new(ExecutionMode::Background)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    /// Runs the next operation queued on `queue`, if it is not blocked.
    pub fn step(&self, queue: QueueHandle) -> bool {
        let mut state = self.shared.state.lock();
        let ran = state.step_queue(queue.raw());
        if ran {
            self.shared.fence_cv.notify_all();
        }
        ran
    }

    /// Runs queued work on every queue until nothing can make progress.
    pub fn run_until_idle(&self) {
        let mut state = self.shared.state.lock();
        if state.pump() {
            self.shared.fence_cv.notify_all();
        }
    }

    /// Operations queued on `queue` that have not run yet.
    pub fn pending_ops(&self, queue: QueueHandle) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(&queue.raw())
            .map_or(0, |q| q.ops.len())
    }

    /// Operations queued on all queues.
    pub fn pending_work(&self) -> usize {
        self.shared.state.lock().pending_ops()
    }

    /// Sets a fence from the host, as an external producer would.
    pub fn set_fence_value(&self, fence: FenceHandle, value: u64) {
        let mut state = self.shared.state.lock();
        if let Some(current) = state.fences.get_mut(&fence.raw()) {
            *current = value;
        }
        self.shared.fence_cv.notify_all();
        self.shared.kick(&mut state);
    }

    /// Makes the next `count` object creations fail.
    pub fn fail_next_creations(&self, count: u32) {
        self.shared.state.lock().injected_failures = count;
    }

    pub fn stats(&self) -> DeviceStats {
        self.shared.state.lock().stats.clone()
    }

    /// Misuse detected so far (state mismatches, use after destroy, ...).
    pub fn validation_errors(&self) -> Vec<String> {
        self.shared.state.lock().validation_errors.clone()
    }

    /// The state the device last transitioned a resource to.
    pub fn resource_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.shared.state.lock().resources.get(&resource.raw()).map(|r| r.state)
    }

    /// Reads resource memory as the GPU currently sees it.
    pub fn read_resource(&self, resource: ResourceHandle, offset: u64, len: u64) -> Option<Vec<u8>> {
        let state = self.shared.state.lock();
        state
            .resources
            .get(&resource.raw())?
            .memory
            .read(offset as usize, len as usize)
    }

    pub fn is_resource_alive(&self, resource: ResourceHandle) -> bool {
        self.shared.state.lock().resources.contains_key(&resource.raw())
    }

    pub fn live_resource_count(&self) -> usize {
        self.shared.state.lock().resources.len()
    }

    pub fn live_descriptor_heap_count(&self) -> usize {
        self.shared.state.lock().descriptors.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.shared.state.lock().command_buffers.len()
    }

    /// Stores a descriptor payload (what view creation would write).
    pub fn write_descriptor(&self, handle: CpuDescriptorHandle, payload: u64) -> bool {
        self.shared.state.lock().descriptors.write(handle, payload)
    }

    pub fn read_descriptor(&self, handle: CpuDescriptorHandle) -> Option<u64> {
        self.shared.state.lock().descriptors.read(handle)
    }

    /// Reads the descriptor a shader would fetch at `handle`.
    pub fn read_descriptor_gpu(&self, handle: GpuDescriptorHandle) -> Option<u64> {
        self.shared.state.lock().descriptors.read_gpu(handle)
    }

    /// The table most recently bound at `root_index` by executed work.
    pub fn last_bound_table(&self, bind_point: BindPoint, root_index: u32) -> Option<GpuDescriptorHandle> {
        self.shared.state.lock().last_bound.get(&(bind_point, root_index)).copied()
    }

    /// Bindings seen by every executed draw and dispatch, in execution order.
    pub fn draw_records(&self) -> Vec<DrawRecord> {
        self.shared.state.lock().draw_records.clone()
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::immediate()
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.state.lock().shutdown = true;
            self.shared.work_cv.notify_all();
            if worker.join().is_err() {
                tracing::error!("Software device worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        if state.pump() {
            shared.fence_cv.notify_all();
            continue;
        }
        shared.work_cv.wait(&mut state);
    }
}

impl Device for SoftwareDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_queue(&self, ty: QueueType) -> GpuResult<QueueHandle> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("queue", "injected failure"));
        }
        let id = state.next_id();
        state.queues.insert(
            id,
            SoftQueue {
                ty,
                ops: Default::default(),
            },
        );
        state.stats.queues_created += 1;
        Ok(QueueHandle::from_raw(id))
    }

    fn create_fence(&self, initial_value: u64) -> GpuResult<FenceHandle> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("fence", "injected failure"));
        }
        let id = state.next_id();
        state.fences.insert(id, initial_value);
        state.stats.fences_created += 1;
        Ok(FenceHandle::from_raw(id))
    }

    fn signal(&self, queue: QueueHandle, fence: FenceHandle, value: u64) {
        let mut state = self.shared.state.lock();
        state.stats.signals += 1;
        match state.queues.get_mut(&queue.raw()) {
            Some(q) => q.ops.push_back(QueueOp::Signal {
                fence: fence.raw(),
                value,
            }),
            None => state.report(format!("signal on unknown queue {}", queue.raw())),
        }
        self.shared.kick(&mut state);
    }

    fn queue_wait(&self, queue: QueueHandle, fence: FenceHandle, value: u64) {
        let mut state = self.shared.state.lock();
        state.stats.queue_waits += 1;
        match state.queues.get_mut(&queue.raw()) {
            Some(q) => q.ops.push_back(QueueOp::Wait {
                fence: fence.raw(),
                value,
            }),
            None => state.report(format!("wait on unknown queue {}", queue.raw())),
        }
        self.shared.kick(&mut state);
    }

    fn fence_completed_value(&self, fence: FenceHandle) -> u64 {
        self.shared.state.lock().fence_value(fence.raw()).unwrap_or(0)
    }

    fn wait_for_fence_value(&self, fence: FenceHandle, value: u64) {
        let mut state = self.shared.state.lock();
        loop {
            match state.fence_value(fence.raw()) {
                Some(current) if current >= value => return,
                Some(_) if self.shared.mode == ExecutionMode::Deferred && state.pump() => {
                    self.shared.fence_cv.notify_all();
                }
                Some(_) => self.shared.fence_cv.wait(&mut state),
                None => {
                    state.report(format!("host wait on unknown fence {}", fence.raw()));
                    return;
                }
            }
        }
    }

    fn create_command_buffer(&self, ty: QueueType) -> GpuResult<CommandBufferHandle> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("command buffer", "injected failure"));
        }
        let id = state.next_id();
        state.command_buffers.insert(
            id,
            SoftCommandBuffer {
                ty,
                commands: Vec::new(),
                closed: false,
                in_flight: 0,
            },
        );
        state.stats.command_buffers_created += 1;
        Ok(CommandBufferHandle::from_raw(id))
    }

    fn reset_command_buffer(&self, buffer: CommandBufferHandle) {
        let mut state = self.shared.state.lock();
        state.stats.command_buffer_resets += 1;
        let in_flight = match state.command_buffers.get_mut(&buffer.raw()) {
            Some(cb) => {
                let in_flight = cb.in_flight;
                cb.commands.clear();
                cb.closed = false;
                in_flight
            }
            None => {
                state.report(format!("reset of unknown command buffer {}", buffer.raw()));
                return;
            }
        };
        if in_flight > 0 {
            state.report(format!("command buffer {} reset while still in flight", buffer.raw()));
        }
    }

    fn record(&self, buffer: CommandBufferHandle, command: Command<'_>) {
        let mut state = self.shared.state.lock();
        let error = match state.command_buffers.get_mut(&buffer.raw()) {
            Some(cb) if cb.closed => Some(format!("record into closed command buffer {}", buffer.raw())),
            Some(cb) => {
                cb.commands.push(RecordedCommand::from(command));
                None
            }
            None => Some(format!("record into unknown command buffer {}", buffer.raw())),
        };
        if let Some(error) = error {
            state.report(error);
        }
    }

    fn close_command_buffer(&self, buffer: CommandBufferHandle) {
        let mut state = self.shared.state.lock();
        match state.command_buffers.get_mut(&buffer.raw()) {
            Some(cb) => cb.closed = true,
            None => state.report(format!("close of unknown command buffer {}", buffer.raw())),
        }
    }

    fn execute(&self, queue: QueueHandle, buffer: CommandBufferHandle) {
        let mut state = self.shared.state.lock();
        let queue_ty = state.queues.get(&queue.raw()).map(|q| q.ty);
        let error = match (queue_ty, state.command_buffers.get_mut(&buffer.raw())) {
            (None, _) => Some(format!("execute on unknown queue {}", queue.raw())),
            (_, None) => Some(format!("execute of unknown command buffer {}", buffer.raw())),
            (Some(ty), Some(cb)) => {
                cb.in_flight += 1;
                let mut error = None;
                if !cb.closed {
                    error = Some(format!("command buffer {} executed while open", buffer.raw()));
                }
                if cb.ty != ty {
                    error = Some(format!("{} command buffer executed on {} queue", cb.ty, ty));
                }
                error
            }
        };
        if let Some(error) = error {
            state.report(error);
        }
        if let Some(q) = state.queues.get_mut(&queue.raw()) {
            q.ops.push_back(QueueOp::Execute(buffer.raw()));
        }
        self.shared.kick(&mut state);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<ResourceHandle> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("buffer", "injected failure"));
        }
        if desc.size == 0 {
            return Err(GpuError::creation("buffer", "size must be non-zero"));
        }
        let required = match desc.heap {
            HeapKind::Default => None,
            HeapKind::Upload => Some(ResourceState::GENERIC_READ),
            HeapKind::Readback => Some(ResourceState::COPY_DEST),
        };
        if let Some(required) = required
            && desc.initial_state != required
        {
            return Err(GpuError::creation(
                "buffer",
                format!("{:?} heap buffers must start in {:?}", desc.heap, required),
            ));
        }

        let id = state.next_id();
        let gpu_address = state.reserve_gpu_address(desc.size);
        state.resources.insert(
            id,
            SoftResource {
                memory: HostMemory::new(desc.size as usize),
                heap: desc.heap,
                texture: None,
                state: desc.initial_state,
                gpu_address,
                map_count: 0,
            },
        );
        state.stats.resources_created += 1;
        Ok(ResourceHandle::from_raw(id))
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<ResourceHandle> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("texture", "injected failure"));
        }
        if desc.width == 0 || desc.height == 0 || desc.bytes_per_pixel == 0 {
            return Err(GpuError::creation("texture", "dimensions must be non-zero"));
        }
        let id = state.next_id();
        let size = desc.size_bytes();
        let gpu_address = state.reserve_gpu_address(size);
        state.resources.insert(
            id,
            SoftResource {
                memory: HostMemory::new(size as usize),
                heap: HeapKind::Default,
                texture: Some(*desc),
                state: desc.initial_state,
                gpu_address,
                map_count: 0,
            },
        );
        state.stats.resources_created += 1;
        Ok(ResourceHandle::from_raw(id))
    }

    fn gpu_address(&self, resource: ResourceHandle) -> GpuAddress {
        self.shared
            .state
            .lock()
            .resources
            .get(&resource.raw())
            .map_or(GpuAddress::NULL, |r| r.gpu_address)
    }

    fn map(&self, resource: ResourceHandle) -> GpuResult<NonNull<u8>> {
        let mut state = self.shared.state.lock();
        let Some(r) = state.resources.get_mut(&resource.raw()) else {
            return Err(GpuError::InvalidHandle {
                object: "resource",
                raw: resource.raw(),
            });
        };
        if !r.heap.is_cpu_visible() {
            return Err(GpuError::MapFailed(format!(
                "resource {} lives in the {:?} heap",
                resource.raw(),
                r.heap
            )));
        }
        r.map_count += 1;
        Ok(r.memory.as_ptr())
    }

    fn unmap(&self, resource: ResourceHandle) {
        let mut state = self.shared.state.lock();
        let error = match state.resources.get_mut(&resource.raw()) {
            Some(r) if r.map_count == 0 => Some(format!("unmap of unmapped resource {}", resource.raw())),
            Some(r) => {
                r.map_count -= 1;
                None
            }
            None => Some(format!("unmap of unknown resource {}", resource.raw())),
        };
        if let Some(error) = error {
            state.report(error);
        }
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GpuResult<DescriptorHeapInfo> {
        let mut state = self.shared.state.lock();
        if state.take_injected_failure() {
            return Err(GpuError::creation("descriptor heap", "injected failure"));
        }
        if desc.count == 0 {
            return Err(GpuError::creation("descriptor heap", "count must be non-zero"));
        }
        if desc.shader_visible && !desc.kind.can_be_shader_visible() {
            return Err(GpuError::creation(
                "descriptor heap",
                format!("{:?} heaps cannot be shader visible", desc.kind),
            ));
        }
        let id = state.next_id();
        let info = state.descriptors.create(DescriptorHeapHandle::from_raw(id), desc);
        state.stats.descriptor_heaps_created += 1;
        Ok(info)
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        increment_for(kind)
    }

    fn copy_descriptors(&self, dst: &[DescriptorRange], src: &[DescriptorRange], kind: DescriptorHeapKind) {
        let mut state = self.shared.state.lock();
        state.stats.copy_descriptor_calls += 1;
        match state.descriptors.copy(dst, src, kind) {
            Ok(copied) => state.stats.descriptors_copied += copied,
            Err(error) => state.report(error),
        }
    }

    fn destroy_queue(&self, queue: QueueHandle) {
        let mut state = self.shared.state.lock();
        let pending = state.queues.remove(&queue.raw()).map(|q| q.ops.len());
        if let Some(pending) = pending
            && pending > 0
        {
            state.report(format!("queue {} destroyed with {pending} pending operations", queue.raw()));
        }
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.shared.state.lock().fences.remove(&fence.raw());
    }

    fn destroy_command_buffer(&self, buffer: CommandBufferHandle) {
        let mut state = self.shared.state.lock();
        if let Some(cb) = state.command_buffers.remove(&buffer.raw())
            && cb.in_flight > 0
        {
            state.report(format!("command buffer {} destroyed while in flight", buffer.raw()));
        }
    }

    fn destroy_resource(&self, resource: ResourceHandle) {
        let mut state = self.shared.state.lock();
        if state.resources.remove(&resource.raw()).is_some() {
            state.stats.resources_destroyed += 1;
        } else {
            state.report(format!("double destroy of resource {}", resource.raw()));
        }
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapHandle) {
        let mut state = self.shared.state.lock();
        if state.descriptors.destroy(heap) {
            state.stats.descriptor_heaps_destroyed += 1;
        } else {
            state.report(format!("double destroy of descriptor heap {}", heap.raw()));
        }
    }
}
