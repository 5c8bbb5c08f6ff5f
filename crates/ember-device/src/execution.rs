//! Device state and the CPU-side "GPU" that runs submitted work.
//!
//! Every queue owns a FIFO of operations (executions, signals and waits).
//! Operations run strictly in order per queue; a wait blocks only its own
//! queue until the fence it names reaches the requested value.

use std::collections::{BTreeMap, HashMap, VecDeque};

use ember_core::{
    BindPoint, Command, CopyBox, DescriptorHeapHandle, GpuAddress, GpuDescriptorHandle, HeapKind,
    PipelineHandle, QueueType, ResourceBarrier, ResourceHandle, ResourceState, RootSignatureHandle,
    TextureCopyLocation, TextureDesc,
};

use crate::descriptors::DescriptorHeaps;
use crate::memory::HostMemory;
use crate::stats::DeviceStats;

/// Bindings visible to one draw or dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawRecord {
    pub bind_point: BindPoint,
    pub signature: Option<RootSignatureHandle>,
    pub pipeline: Option<PipelineHandle>,
    pub tables: BTreeMap<u32, GpuDescriptorHandle>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueOp {
    Execute(u64),
    Signal { fence: u64, value: u64 },
    Wait { fence: u64, value: u64 },
}

pub(crate) struct SoftQueue {
    pub(crate) ty: QueueType,
    pub(crate) ops: VecDeque<QueueOp>,
}

/// Owned copy of a [`Command`].
#[derive(Debug, Clone)]
pub(crate) enum RecordedCommand {
    Barriers(Vec<ResourceBarrier>),
    CopyBuffer {
        dst: ResourceHandle,
        dst_offset: u64,
        src: ResourceHandle,
        src_offset: u64,
        size: u64,
    },
    CopyTexture {
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
    SetPipeline(PipelineHandle),
    SetRootTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptorHandle,
    },
    Draw,
    Dispatch,
}

impl From<Command<'_>> for RecordedCommand {
    fn from(command: Command<'_>) -> Self {
        match command {
            Command::ResourceBarriers(barriers) => RecordedCommand::Barriers(barriers.to_vec()),
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => RecordedCommand::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            },
            Command::CopyTextureRegion {
                dst,
                dst_x,
                dst_y,
                src,
                src_box,
            } => RecordedCommand::CopyTexture {
                dst,
                dst_x,
                dst_y,
                src,
                src_box,
            },
            Command::SetDescriptorHeaps { view, sampler } => RecordedCommand::SetDescriptorHeaps { view, sampler },
            Command::SetRootSignature { bind_point, signature } => {
                RecordedCommand::SetRootSignature { bind_point, signature }
            }
            Command::SetPipelineState(pipeline) => RecordedCommand::SetPipeline(pipeline),
            Command::SetRootDescriptorTable {
                bind_point,
                root_index,
                base,
            } => RecordedCommand::SetRootTable {
                bind_point,
                root_index,
                base,
            },
            Command::Draw { .. } | Command::DrawIndexed { .. } => RecordedCommand::Draw,
            Command::Dispatch { .. } => RecordedCommand::Dispatch,
        }
    }
}

pub(crate) struct SoftCommandBuffer {
    pub(crate) ty: QueueType,
    pub(crate) commands: Vec<RecordedCommand>,
    pub(crate) closed: bool,
    pub(crate) in_flight: u32,
}

pub(crate) struct SoftResource {
    pub(crate) memory: HostMemory,
    pub(crate) heap: HeapKind,
    pub(crate) texture: Option<TextureDesc>,
    pub(crate) state: ResourceState,
    pub(crate) gpu_address: GpuAddress,
    pub(crate) map_count: u32,
}

/// A linear view of a copy location.
struct Layout {
    resource: u64,
    offset: u64,
    width: u32,
    height: u32,
    row_pitch: u64,
    bytes_per_pixel: u32,
}

/// Per-execution binding state; command lists start with nothing bound.
struct Bindings {
    queue_ty: QueueType,
    view_heap: Option<DescriptorHeapHandle>,
    sampler_heap: Option<DescriptorHeapHandle>,
    signatures: BTreeMap<BindPointKey, RootSignatureHandle>,
    pipeline: Option<PipelineHandle>,
    tables: BTreeMap<(BindPointKey, u32), GpuDescriptorHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BindPointKey {
    Graphics,
    Compute,
}

impl From<BindPoint> for BindPointKey {
    fn from(bind_point: BindPoint) -> Self {
        match bind_point {
            BindPoint::Graphics => BindPointKey::Graphics,
            BindPoint::Compute => BindPointKey::Compute,
        }
    }
}

/// Everything the device knows, guarded by one lock.
pub(crate) struct State {
    next_id: u64,
    next_gpu_address: u64,
    pub(crate) queues: HashMap<u64, SoftQueue>,
    pub(crate) fences: HashMap<u64, u64>,
    pub(crate) command_buffers: HashMap<u64, SoftCommandBuffer>,
    pub(crate) resources: HashMap<u64, SoftResource>,
    pub(crate) descriptors: DescriptorHeaps,
    pub(crate) stats: DeviceStats,
    pub(crate) validation_errors: Vec<String>,
    pub(crate) draw_records: Vec<DrawRecord>,
    pub(crate) last_bound: HashMap<(BindPoint, u32), GpuDescriptorHandle>,
    pub(crate) injected_failures: u32,
    pub(crate) shutdown: bool,
}

const GPU_ADDRESS_BASE: u64 = 0x10_0000_0000;
const GPU_ADDRESS_GRANULARITY: u64 = 0x10000;

impl State {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            next_gpu_address: GPU_ADDRESS_BASE,
            queues: HashMap::new(),
            fences: HashMap::new(),
            command_buffers: HashMap::new(),
            resources: HashMap::new(),
            descriptors: DescriptorHeaps::new(),
            stats: DeviceStats::default(),
            validation_errors: Vec::new(),
            draw_records: Vec::new(),
            last_bound: HashMap::new(),
            injected_failures: 0,
            shutdown: false,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn reserve_gpu_address(&mut self, size: u64) -> GpuAddress {
        let address = self.next_gpu_address;
        self.next_gpu_address += ember_core::math::align_up(size.max(1), GPU_ADDRESS_GRANULARITY);
        GpuAddress(address)
    }

    /// Consumes one injected failure, if any are pending.
    pub(crate) fn take_injected_failure(&mut self) -> bool {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn report(&mut self, message: String) {
        tracing::error!("validation: {}", message);
        self.validation_errors.push(message);
    }

    pub(crate) fn fence_value(&self, fence: u64) -> Option<u64> {
        self.fences.get(&fence).copied()
    }

    pub(crate) fn pending_ops(&self) -> usize {
        self.queues.values().map(|q| q.ops.len()).sum()
    }

    /// Runs operations on every queue until none can make progress.
    ///
    /// Returns true if anything ran.
    pub(crate) fn pump(&mut self) -> bool {
        let mut any = false;
        loop {
            let mut progressed = false;
            let mut ids: Vec<u64> = self.queues.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                while self.step_queue(id) {
                    progressed = true;
                }
            }
            if !progressed {
                return any;
            }
            any = true;
        }
    }

    /// Runs the next operation on one queue if it is not blocked.
    pub(crate) fn step_queue(&mut self, queue: u64) -> bool {
        let Some(op) = self.queues.get(&queue).and_then(|q| q.ops.front().copied()) else {
            return false;
        };
        match op {
            QueueOp::Wait { fence, value } => match self.fence_value(fence) {
                Some(current) if current >= value => {}
                Some(_) => return false,
                None => self.report(format!("queue {queue} waits on unknown fence {fence}")),
            },
            QueueOp::Signal { fence, value } => match self.fences.get_mut(&fence) {
                Some(current) => *current = value,
                None => self.report(format!("queue {queue} signals unknown fence {fence}")),
            },
            QueueOp::Execute(buffer) => self.execute_buffer(queue, buffer),
        }
        if let Some(q) = self.queues.get_mut(&queue) {
            q.ops.pop_front();
        }
        true
    }

    fn execute_buffer(&mut self, queue: u64, buffer: u64) {
        let Some(queue_ty) = self.queues.get(&queue).map(|q| q.ty) else {
            return;
        };
        let commands = match self.command_buffers.get_mut(&buffer) {
            Some(cb) => std::mem::take(&mut cb.commands),
            None => {
                self.report(format!("executing destroyed command buffer {buffer}"));
                return;
            }
        };

        let mut bindings = Bindings {
            queue_ty,
            view_heap: None,
            sampler_heap: None,
            signatures: BTreeMap::new(),
            pipeline: None,
            tables: BTreeMap::new(),
        };
        for command in &commands {
            self.run_command(&mut bindings, command);
        }
        self.stats.command_buffers_executed += 1;

        if let Some(cb) = self.command_buffers.get_mut(&buffer) {
            cb.commands = commands;
            cb.in_flight = cb.in_flight.saturating_sub(1);
        }
    }

    fn run_command(&mut self, bindings: &mut Bindings, command: &RecordedCommand) {
        match command {
            RecordedCommand::Barriers(barriers) => {
                self.stats.barrier_batches += 1;
                for barrier in barriers {
                    self.apply_barrier(bindings.queue_ty, barrier);
                }
            }
            RecordedCommand::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => self.copy_buffer(*dst, *dst_offset, *src, *src_offset, *size),
            RecordedCommand::CopyTexture {
                dst,
                dst_x,
                dst_y,
                src,
                src_box,
            } => self.copy_texture(dst, *dst_x, *dst_y, src, *src_box),
            RecordedCommand::SetDescriptorHeaps { view, sampler } => {
                for heap in view.iter().chain(sampler.iter()) {
                    match self.descriptors.get(*heap) {
                        Some(h) if h.is_shader_visible() => {}
                        Some(_) => self.report(format!("binding non shader-visible heap {}", heap.raw())),
                        None => self.report(format!("binding destroyed descriptor heap {}", heap.raw())),
                    }
                }
                bindings.view_heap = *view;
                bindings.sampler_heap = *sampler;
            }
            RecordedCommand::SetRootSignature { bind_point, signature } => {
                self.check_bind_point(bindings.queue_ty, *bind_point);
                let key = BindPointKey::from(*bind_point);
                bindings.tables.retain(|(bp, _), _| *bp != key);
                bindings.signatures.insert(key, *signature);
            }
            RecordedCommand::SetPipeline(pipeline) => {
                if bindings.queue_ty == QueueType::Copy {
                    self.report("pipeline state on copy queue".to_string());
                }
                bindings.pipeline = Some(*pipeline);
            }
            RecordedCommand::SetRootTable {
                bind_point,
                root_index,
                base,
            } => {
                self.check_bind_point(bindings.queue_ty, *bind_point);
                let owner = self.descriptors.heap_of_gpu(*base);
                if owner.is_none() || (owner != bindings.view_heap && owner != bindings.sampler_heap) {
                    self.report(format!(
                        "root table {root_index} at {:#x} is not inside a bound descriptor heap",
                        base.0
                    ));
                }
                bindings.tables.insert((BindPointKey::from(*bind_point), *root_index), *base);
                self.last_bound.insert((*bind_point, *root_index), *base);
            }
            RecordedCommand::Draw => {
                if bindings.queue_ty != QueueType::Graphics {
                    self.report(format!("draw on {} queue", bindings.queue_ty));
                }
                self.stats.draws += 1;
                self.record_draw(bindings, BindPoint::Graphics);
            }
            RecordedCommand::Dispatch => {
                if bindings.queue_ty == QueueType::Copy {
                    self.report("dispatch on copy queue".to_string());
                }
                self.stats.dispatches += 1;
                self.record_draw(bindings, BindPoint::Compute);
            }
        }
    }

    fn check_bind_point(&mut self, queue_ty: QueueType, bind_point: BindPoint) {
        let allowed = match queue_ty {
            QueueType::Graphics => true,
            QueueType::Compute => bind_point == BindPoint::Compute,
            QueueType::Copy => false,
        };
        if !allowed {
            self.report(format!("{bind_point:?} binding on {queue_ty} queue"));
        }
    }

    fn record_draw(&mut self, bindings: &Bindings, bind_point: BindPoint) {
        let key = BindPointKey::from(bind_point);
        let tables = bindings
            .tables
            .iter()
            .filter(|((bp, _), _)| *bp == key)
            .map(|((_, root), base)| (*root, *base))
            .collect();
        self.draw_records.push(DrawRecord {
            bind_point,
            signature: bindings.signatures.get(&key).copied(),
            pipeline: bindings.pipeline,
            tables,
        });
    }

    fn apply_barrier(&mut self, queue_ty: QueueType, barrier: &ResourceBarrier) {
        let id = barrier.resource().raw();
        let Some(resource) = self.resources.get_mut(&id) else {
            self.report(format!("barrier on destroyed resource {id}"));
            return;
        };
        match *barrier {
            ResourceBarrier::Transition { before, after, .. } => {
                let tracked = resource.state;
                resource.state = after;
                self.stats.transition_barriers += 1;
                if tracked != before {
                    self.report(format!(
                        "resource {id}: barrier expects {before:?} but resource is in {tracked:?}"
                    ));
                }
                if queue_ty != QueueType::Graphics
                    && !(ResourceState::VALID_COMPUTE_QUEUE.contains(before)
                        && ResourceState::VALID_COMPUTE_QUEUE.contains(after))
                {
                    self.report(format!(
                        "resource {id}: transition {before:?} -> {after:?} is not allowed on the {queue_ty} queue"
                    ));
                }
            }
            ResourceBarrier::UnorderedAccess { .. } => {
                self.stats.uav_barriers += 1;
            }
        }
    }

    fn check_copy_state(&mut self, id: u64, needed: ResourceState, role: &str) -> bool {
        let Some(resource) = self.resources.get(&id) else {
            self.report(format!("copy {role} {id} was destroyed"));
            return false;
        };
        let state = resource.state;
        if state != ResourceState::COMMON && !state.contains(needed) {
            self.report(format!("copy {role} {id} is in {state:?}, needs {needed:?}"));
        }
        true
    }

    fn copy_buffer(&mut self, dst: ResourceHandle, dst_offset: u64, src: ResourceHandle, src_offset: u64, size: u64) {
        self.stats.buffer_copies += 1;
        let dst_ok = self.check_copy_state(dst.raw(), ResourceState::COPY_DEST, "destination");
        let src_ok = self.check_copy_state(src.raw(), ResourceState::COPY_SOURCE, "source");
        if !(dst_ok && src_ok) {
            return;
        }
        let copied = match (self.resources.get(&dst.raw()), self.resources.get(&src.raw())) {
            (Some(d), Some(s)) => HostMemory::copy(
                &d.memory,
                dst_offset as usize,
                &s.memory,
                src_offset as usize,
                size as usize,
            ),
            _ => false,
        };
        if !copied {
            self.report(format!(
                "buffer copy of {size} bytes out of bounds (dst {} @ {dst_offset}, src {} @ {src_offset})",
                dst.raw(),
                src.raw()
            ));
        }
    }

    fn layout(&mut self, location: &TextureCopyLocation) -> Option<Layout> {
        let id = location.resource().raw();
        let Some(resource) = self.resources.get(&id) else {
            self.report(format!("texture copy references destroyed resource {id}"));
            return None;
        };
        match (*location, resource.texture) {
            (TextureCopyLocation::Texture { .. }, Some(desc)) => Some(Layout {
                resource: id,
                offset: 0,
                width: desc.width,
                height: desc.height,
                row_pitch: desc.row_bytes(),
                bytes_per_pixel: desc.bytes_per_pixel,
            }),
            (
                TextureCopyLocation::Footprint {
                    offset,
                    width,
                    height,
                    row_pitch,
                    bytes_per_pixel,
                    ..
                },
                None,
            ) => Some(Layout {
                resource: id,
                offset,
                width,
                height,
                row_pitch,
                bytes_per_pixel,
            }),
            _ => {
                self.report(format!("copy location kind does not match resource {id}"));
                None
            }
        }
    }

    fn copy_texture(
        &mut self,
        dst: &TextureCopyLocation,
        dst_x: u32,
        dst_y: u32,
        src: &TextureCopyLocation,
        src_box: Option<CopyBox>,
    ) {
        self.stats.texture_copies += 1;
        if !self.check_copy_state(dst.resource().raw(), ResourceState::COPY_DEST, "destination")
            || !self.check_copy_state(src.resource().raw(), ResourceState::COPY_SOURCE, "source")
        {
            return;
        }
        let (Some(d), Some(s)) = (self.layout(dst), self.layout(src)) else {
            return;
        };
        let region = src_box.unwrap_or(CopyBox {
            left: 0,
            top: 0,
            right: s.width,
            bottom: s.height,
        });
        if d.bytes_per_pixel != s.bytes_per_pixel
            || region.right > s.width
            || region.bottom > s.height
            || region.left > region.right
            || region.top > region.bottom
            || dst_x + region.width() > d.width
            || dst_y + region.height() > d.height
        {
            self.report(format!("texture copy region {region:?} does not fit"));
            return;
        }

        let bpp = s.bytes_per_pixel as u64;
        let row_len = region.width() as u64 * bpp;
        let mut ok = true;
        if let (Some(dm), Some(sm)) = (self.resources.get(&d.resource), self.resources.get(&s.resource)) {
            for row in 0..region.height() as u64 {
                let src_offset = s.offset + (region.top as u64 + row) * s.row_pitch + region.left as u64 * bpp;
                let dst_offset = d.offset + (dst_y as u64 + row) * d.row_pitch + dst_x as u64 * bpp;
                ok &= HostMemory::copy(
                    &dm.memory,
                    dst_offset as usize,
                    &sm.memory,
                    src_offset as usize,
                    row_len as usize,
                );
            }
        }
        if !ok {
            self.report("texture copy rows out of bounds".to_string());
        }
    }
}
