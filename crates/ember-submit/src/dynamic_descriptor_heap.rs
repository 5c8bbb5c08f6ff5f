//! Descriptor table staging.
//!
//! Recording code stages CPU descriptor handles per root parameter into a
//! [`DescriptorHandleCache`]. Before a draw or dispatch the stale tables are
//! copied into a shader-visible heap leased from a [`DescriptorHeapPool`] and
//! bound. When the heap runs out mid-recording a fresh one is leased and every
//! valid table is re-copied, so bindings survive the swap.

use std::collections::VecDeque;
use std::sync::Arc;

use arrayvec::ArrayVec;
use ember_core::bits::{SetBits, bit_scan_reverse64};
use ember_core::{
    BindPoint, CpuDescriptorHandle, DescriptorHandle, DescriptorHeapDesc, DescriptorHeapHandle, DescriptorHeapInfo,
    DescriptorHeapKind, DescriptorRange, Device, FenceValue, GpuDescriptorHandle, GpuResult, RootSignature,
};
use parking_lot::Mutex;

use crate::queue::CommandQueueManager;

/// Descriptors one cache can hold across all of its tables.
pub const MAX_CACHED_DESCRIPTORS: usize = 256;

/// Root parameters a cache can track.
pub const MAX_DESCRIPTOR_TABLES: usize = 16;

/// Source ranges handed to a single descriptor copy call.
pub const MAX_DESCRIPTORS_PER_COPY: usize = 16;

const SLOT_WORDS: usize = MAX_CACHED_DESCRIPTORS / 64;

/// Bitmap of assigned slots in one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotMask([u64; SLOT_WORDS]);

impl SlotMask {
    /// Marks `count` slots starting at `offset`.
    pub fn set_range(&mut self, offset: u32, count: u32) {
        for slot in offset..offset + count {
            self.0[slot as usize / 64] |= 1 << (slot % 64);
        }
    }

    pub fn is_set(&self, slot: u32) -> bool {
        self.0[slot as usize / 64] & (1 << (slot % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|word| *word == 0)
    }

    /// Index of the highest assigned slot.
    pub fn highest(&self) -> Option<u32> {
        self.0
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, word)| bit_scan_reverse64(*word).map(|bit| i as u32 * 64 + bit))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DescriptorTableCache {
    assigned: SlotMask,
    /// First slot of this table in the handle cache.
    start: u32,
    size: u32,
}

/// CPU mirror of the descriptor tables of one root signature.
pub struct DescriptorHandleCache {
    kind: DescriptorHeapKind,
    root_table_mask: u32,
    stale_mask: u32,
    max_cached: u32,
    tables: [DescriptorTableCache; MAX_DESCRIPTOR_TABLES],
    handles: Box<[CpuDescriptorHandle; MAX_CACHED_DESCRIPTORS]>,
}

impl DescriptorHandleCache {
    pub fn new(kind: DescriptorHeapKind) -> Self {
        Self {
            kind,
            root_table_mask: 0,
            stale_mask: 0,
            max_cached: 0,
            tables: [DescriptorTableCache::default(); MAX_DESCRIPTOR_TABLES],
            handles: Box::new([CpuDescriptorHandle::NULL; MAX_CACHED_DESCRIPTORS]),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Forgets the current root signature layout.
    pub fn clear_cache(&mut self) {
        self.root_table_mask = 0;
        self.stale_mask = 0;
        self.max_cached = 0;
    }

    /// Root parameters that are tables of this cache's kind.
    pub fn root_table_mask(&self) -> u32 {
        self.root_table_mask
    }

    /// Root parameters with handles staged since their last flush.
    pub fn stale_mask(&self) -> u32 {
        self.stale_mask
    }

    /// Slots the handle cache spans for the current layout.
    pub fn max_cached_descriptors(&self) -> u32 {
        self.max_cached
    }

    /// Lays out one table per descriptor-table parameter of `signature`.
    pub fn parse_root_signature(&mut self, signature: &RootSignature) {
        self.stale_mask = 0;
        self.root_table_mask = signature.table_mask(self.kind);

        let mut offset = 0u32;
        for root_index in SetBits::new(self.root_table_mask) {
            let size = signature.table_size(root_index);
            assert!(size > 0, "descriptor table {root_index} is empty");
            self.tables[root_index as usize] = DescriptorTableCache {
                assigned: SlotMask::default(),
                start: offset,
                size,
            };
            offset += size;
        }
        assert!(
            offset as usize <= MAX_CACHED_DESCRIPTORS,
            "root signature needs {offset} cached descriptors, at most {MAX_CACHED_DESCRIPTORS} are supported"
        );
        self.max_cached = offset;
        self.handles[..offset as usize].fill(CpuDescriptorHandle::NULL);
    }

    /// Copies `handles` into table `root_index` starting at slot `offset`.
    pub fn stage_descriptor_handles(&mut self, root_index: u32, offset: u32, handles: &[CpuDescriptorHandle]) {
        assert!(
            (root_index as usize) < MAX_DESCRIPTOR_TABLES && self.root_table_mask & (1 << root_index) != 0,
            "root parameter {root_index} is not a {:?} descriptor table",
            self.kind
        );
        let table = &mut self.tables[root_index as usize];
        let count = handles.len() as u32;
        assert!(
            offset + count <= table.size,
            "staging {count} handles at {offset} overflows table {root_index} of size {}",
            table.size
        );
        if handles.is_empty() {
            return;
        }

        let start = (table.start + offset) as usize;
        self.handles[start..start + handles.len()].copy_from_slice(handles);
        table.assigned.set_range(offset, count);
        self.stale_mask |= 1 << root_index;
    }

    /// Heap slots the next flush will consume.
    pub fn staged_size(&self) -> u32 {
        SetBits::new(self.stale_mask)
            .map(|root_index| self.table_copy_len(root_index))
            .sum()
    }

    /// Slots copied for a table: everything up to its highest assigned slot.
    fn table_copy_len(&self, root_index: u32) -> u32 {
        match self.tables[root_index as usize].assigned.highest() {
            Some(max) => max + 1,
            None => {
                debug_assert!(false, "root parameter {root_index} is stale without assigned handles");
                0
            }
        }
    }

    /// Copies every stale table into consecutive slots starting at `dest` and
    /// reports each table's GPU base through `set_table`.
    ///
    /// Tables are copied from slot 0 up to their highest assigned slot,
    /// including unassigned gaps, which copy as null descriptors.
    pub fn copy_and_bind_stale_tables(
        &mut self,
        device: &dyn Device,
        increment: u32,
        mut dest: DescriptorHandle,
        mut set_table: impl FnMut(u32, GpuDescriptorHandle),
    ) {
        let stale = std::mem::take(&mut self.stale_mask);
        if stale == 0 {
            return;
        }

        let mut dst_ranges: ArrayVec<DescriptorRange, MAX_DESCRIPTORS_PER_COPY> = ArrayVec::new();
        let mut src_ranges: ArrayVec<DescriptorRange, MAX_DESCRIPTORS_PER_COPY> = ArrayVec::new();

        for root_index in SetBits::new(stale) {
            let len = self.table_copy_len(root_index);
            set_table(root_index, dest.gpu);

            let start = self.tables[root_index as usize].start;
            for slot in 0..len {
                let src = self.handles[(start + slot) as usize];
                let dst = dest.cpu.offset(slot, increment);

                if !extend_range(src_ranges.last_mut(), src, increment) {
                    if src_ranges.is_full() {
                        device.copy_descriptors(&dst_ranges, &src_ranges, self.kind);
                        dst_ranges.clear();
                        src_ranges.clear();
                    }
                    src_ranges.push(DescriptorRange { start: src, count: 1 });
                }
                if !extend_range(dst_ranges.last_mut(), dst, increment) {
                    dst_ranges.push(DescriptorRange { start: dst, count: 1 });
                }
            }
            dest = dest.offset(len, increment);
        }

        if !src_ranges.is_empty() {
            device.copy_descriptors(&dst_ranges, &src_ranges, self.kind);
        }
    }

    /// Marks every table with assigned handles stale, so the next flush
    /// re-copies all bindings (after a heap swap or a new command buffer).
    pub fn unbind_all_valid(&mut self) {
        self.stale_mask = 0;
        for root_index in SetBits::new(self.root_table_mask) {
            if !self.tables[root_index as usize].assigned.is_empty() {
                self.stale_mask |= 1 << root_index;
            }
        }
    }
}

/// Grows `range` by one if `handle` directly follows it.
///
/// Runs of null handles merge too; the device expands a null range start into
/// null descriptors.
fn extend_range(range: Option<&mut DescriptorRange>, handle: CpuDescriptorHandle, increment: u32) -> bool {
    let Some(range) = range else {
        return false;
    };
    let follows = if range.start.is_null() {
        handle.is_null()
    } else {
        !handle.is_null() && range.start.offset(range.count, increment) == handle
    };
    if follows {
        range.count += 1;
    }
    follows
}

struct HeapPoolInner {
    all: Vec<DescriptorHeapInfo>,
    retired: VecDeque<(FenceValue, DescriptorHeapInfo)>,
    available: VecDeque<DescriptorHeapInfo>,
}

/// Shader-visible heaps of one kind shared by all contexts.
pub struct DescriptorHeapPool {
    kind: DescriptorHeapKind,
    descriptors_per_heap: u32,
    device: Arc<dyn Device>,
    queues: Arc<CommandQueueManager>,
    inner: Mutex<HeapPoolInner>,
}

impl DescriptorHeapPool {
    pub fn new(
        kind: DescriptorHeapKind,
        descriptors_per_heap: u32,
        device: Arc<dyn Device>,
        queues: Arc<CommandQueueManager>,
    ) -> Self {
        assert!(kind.can_be_shader_visible(), "{kind:?} heaps cannot be shader visible");
        Self {
            kind,
            descriptors_per_heap,
            device,
            queues,
            inner: Mutex::new(HeapPoolInner {
                all: Vec::new(),
                retired: VecDeque::new(),
                available: VecDeque::new(),
            }),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn descriptors_per_heap(&self) -> u32 {
        self.descriptors_per_heap
    }

    /// Returns a heap whose previous users have all completed.
    pub fn request_heap(&self) -> GpuResult<DescriptorHeapInfo> {
        let mut inner = self.inner.lock();

        while let Some((fence, _)) = inner.retired.front() {
            if !self.queues.is_fence_complete(*fence) {
                break;
            }
            if let Some((_, heap)) = inner.retired.pop_front() {
                inner.available.push_back(heap);
            }
        }

        if let Some(heap) = inner.available.pop_front() {
            return Ok(heap);
        }

        let heap = self.device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: self.kind,
            count: self.descriptors_per_heap,
            shader_visible: true,
        })?;
        inner.all.push(heap);
        tracing::debug!("Created shader-visible {:?} heap #{}", self.kind, inner.all.len());
        Ok(heap)
    }

    /// Retires heaps until `fence` completes.
    pub fn discard_heaps(&self, fence: FenceValue, heaps: impl IntoIterator<Item = DescriptorHeapInfo>) {
        let mut inner = self.inner.lock();
        inner.retired.extend(heaps.into_iter().map(|heap| (fence, heap)));
    }

    pub fn heap_count(&self) -> usize {
        self.inner.lock().all.len()
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.len()
    }

    /// Destroys every heap. The GPU must be idle.
    pub fn destroy_all(&self) {
        let mut inner = self.inner.lock();
        inner.retired.clear();
        inner.available.clear();
        for heap in inner.all.drain(..) {
            self.device.destroy_descriptor_heap(heap.handle);
        }
    }
}

/// A context's view of one shader-visible heap kind.
///
/// Holds the staging caches of both bind points and the heap currently being
/// filled. Heaps it fills are retired to the pool when the owning context
/// submits.
pub struct DynamicDescriptorHeap {
    kind: DescriptorHeapKind,
    increment: u32,
    device: Arc<dyn Device>,
    pool: Arc<DescriptorHeapPool>,
    current: Option<DescriptorHeapInfo>,
    current_offset: u32,
    retired: Vec<DescriptorHeapInfo>,
    graphics: DescriptorHandleCache,
    compute: DescriptorHandleCache,
}

impl DynamicDescriptorHeap {
    pub fn new(device: Arc<dyn Device>, pool: Arc<DescriptorHeapPool>) -> Self {
        let kind = pool.kind();
        Self {
            kind,
            increment: device.descriptor_increment(kind),
            device,
            pool,
            current: None,
            current_offset: 0,
            retired: Vec::new(),
            graphics: DescriptorHandleCache::new(kind),
            compute: DescriptorHandleCache::new(kind),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// The heap currently bound for this kind, if any.
    pub fn current_heap(&self) -> Option<DescriptorHeapHandle> {
        self.current.map(|heap| heap.handle)
    }

    pub fn has_space(&self, count: u32) -> bool {
        self.current.is_some() && self.current_offset + count <= self.pool.descriptors_per_heap()
    }

    pub fn cache(&self, bind_point: BindPoint) -> &DescriptorHandleCache {
        match bind_point {
            BindPoint::Graphics => &self.graphics,
            BindPoint::Compute => &self.compute,
        }
    }

    fn cache_mut(&mut self, bind_point: BindPoint) -> &mut DescriptorHandleCache {
        match bind_point {
            BindPoint::Graphics => &mut self.graphics,
            BindPoint::Compute => &mut self.compute,
        }
    }

    pub fn parse_root_signature(&mut self, bind_point: BindPoint, signature: &RootSignature) {
        self.cache_mut(bind_point).parse_root_signature(signature);
    }

    pub fn set_descriptor_handles(
        &mut self,
        bind_point: BindPoint,
        root_index: u32,
        offset: u32,
        handles: &[CpuDescriptorHandle],
    ) {
        self.cache_mut(bind_point)
            .stage_descriptor_handles(root_index, offset, handles);
    }

    pub fn staged_size(&self, bind_point: BindPoint) -> u32 {
        self.cache(bind_point).staged_size()
    }

    /// Ensures the current heap can take the stale tables of `bind_point`.
    ///
    /// Returns true if the current heap changed and must be rebound.
    pub fn prepare_staged_tables(&mut self, bind_point: BindPoint) -> GpuResult<bool> {
        let mut needed = self.staged_size(bind_point);
        if needed == 0 {
            return Ok(false);
        }

        if self.current.is_some() && !self.has_space(needed) {
            self.retire_current_heap();
            self.unbind_all_valid();
            needed = self.staged_size(bind_point);
        }
        assert!(
            needed <= self.pool.descriptors_per_heap(),
            "{needed} staged descriptors do not fit in a heap of {}",
            self.pool.descriptors_per_heap()
        );

        self.ensure_heap()
    }

    /// Copies the stale tables of `bind_point` into the current heap and
    /// reports each table's base through `set_table`.
    ///
    /// Call [`DynamicDescriptorHeap::prepare_staged_tables`] first.
    pub fn bind_staged_tables(&mut self, bind_point: BindPoint, set_table: impl FnMut(u32, GpuDescriptorHandle)) {
        let needed = self.staged_size(bind_point);
        if needed == 0 {
            return;
        }
        let Some(heap) = self.current else {
            debug_assert!(false, "binding staged tables without a heap");
            return;
        };
        debug_assert!(self.has_space(needed));

        let dest = DescriptorHandle::new(
            heap.cpu_start.offset(self.current_offset, self.increment),
            heap.gpu_start.offset(self.current_offset, self.increment),
        );
        self.current_offset += needed;

        let cache = match bind_point {
            BindPoint::Graphics => &mut self.graphics,
            BindPoint::Compute => &mut self.compute,
        };
        cache.copy_and_bind_stale_tables(self.device.as_ref(), self.increment, dest, set_table);
    }

    /// Copies one descriptor straight into the current heap.
    ///
    /// Returns its GPU handle and whether the current heap changed.
    pub fn upload_direct(&mut self, handle: CpuDescriptorHandle) -> GpuResult<(GpuDescriptorHandle, bool)> {
        if self.current.is_some() && !self.has_space(1) {
            self.retire_current_heap();
            self.unbind_all_valid();
        }
        let changed = self.ensure_heap()?;
        let Some(heap) = self.current else {
            unreachable!("ensure_heap leaves a current heap");
        };

        let cpu = heap.cpu_start.offset(self.current_offset, self.increment);
        let gpu = heap.gpu_start.offset(self.current_offset, self.increment);
        self.current_offset += 1;
        self.device.copy_descriptors(
            &[DescriptorRange { start: cpu, count: 1 }],
            &[DescriptorRange { start: handle, count: 1 }],
            self.kind,
        );
        Ok((gpu, changed))
    }

    fn ensure_heap(&mut self) -> GpuResult<bool> {
        if self.current.is_some() {
            return Ok(false);
        }
        self.current = Some(self.pool.request_heap()?);
        self.current_offset = 0;
        Ok(true)
    }

    /// Moves a partially used current heap to the retired list.
    ///
    /// An untouched heap is kept.
    pub fn retire_current_heap(&mut self) {
        if self.current_offset == 0 {
            return;
        }
        if let Some(heap) = self.current.take() {
            tracing::debug!("Retiring {:?} heap after {} descriptors", self.kind, self.current_offset);
            self.retired.push(heap);
        }
        self.current_offset = 0;
    }

    /// Re-marks every bound table of both bind points as stale.
    pub fn unbind_all_valid(&mut self) {
        self.graphics.unbind_all_valid();
        self.compute.unbind_all_valid();
    }

    /// Retires every heap used so far to the pool, tagged with `fence`, and
    /// clears both caches.
    pub fn cleanup_used_heaps(&mut self, fence: FenceValue) {
        self.retire_current_heap();
        if !self.retired.is_empty() {
            self.pool.discard_heaps(fence, self.retired.drain(..));
        }
        self.graphics.clear_cache();
        self.compute.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use ember_core::{DescriptorRangeKind, QueueType, RootParameter, RootSignatureHandle};
    use ember_device::SoftwareDevice;

    use super::*;

    fn signature(tables: &[u32]) -> RootSignature {
        let parameters = tables
            .iter()
            .map(|&count| RootParameter::descriptor_range(DescriptorRangeKind::ShaderResource, 0, count))
            .collect();
        RootSignature::new(RootSignatureHandle::from_raw(1), parameters)
    }

    struct Fixture {
        device: Arc<SoftwareDevice>,
        queues: Arc<CommandQueueManager>,
        pool: Arc<DescriptorHeapPool>,
        source: DescriptorHeapInfo,
        increment: u32,
    }

    impl Fixture {
        fn new(heap_size: u32) -> Self {
            let device = Arc::new(SoftwareDevice::immediate());
            let queues = Arc::new(CommandQueueManager::new(device.clone()).unwrap());
            let pool = Arc::new(DescriptorHeapPool::new(
                DescriptorHeapKind::CbvSrvUav,
                heap_size,
                device.clone(),
                queues.clone(),
            ));
            let source = device
                .create_descriptor_heap(&DescriptorHeapDesc {
                    kind: DescriptorHeapKind::CbvSrvUav,
                    count: 64,
                    shader_visible: false,
                })
                .unwrap();
            let increment = device.descriptor_increment(DescriptorHeapKind::CbvSrvUav);
            for slot in 0..64 {
                device.write_descriptor(source.cpu_start.offset(slot, increment), 100 + slot as u64);
            }
            Self {
                device,
                queues,
                pool,
                source,
                increment,
            }
        }

        /// CPU handle whose payload is `100 + slot`.
        fn handle(&self, slot: u32) -> CpuDescriptorHandle {
            self.source.cpu_start.offset(slot, self.increment)
        }

        fn heap(&self) -> DynamicDescriptorHeap {
            DynamicDescriptorHeap::new(self.device.clone(), self.pool.clone())
        }

        fn flush(&self, heap: &mut DynamicDescriptorHeap) -> Vec<(u32, GpuDescriptorHandle)> {
            heap.prepare_staged_tables(BindPoint::Graphics).unwrap();
            let mut bound = Vec::new();
            heap.bind_staged_tables(BindPoint::Graphics, |root, base| bound.push((root, base)));
            bound
        }
    }

    #[test]
    fn test_slot_mask_highest() {
        let mut mask = SlotMask::default();
        assert_eq!(mask.highest(), None);
        mask.set_range(1, 1);
        assert_eq!(mask.highest(), Some(1));
        mask.set_range(190, 3);
        assert_eq!(mask.highest(), Some(192));
        assert!(mask.is_set(191));
        assert!(!mask.is_set(0));
    }

    #[test]
    fn test_parse_root_signature_lays_out_tables() {
        let mut cache = DescriptorHandleCache::new(DescriptorHeapKind::CbvSrvUav);
        cache.parse_root_signature(&signature(&[4, 8]));
        assert_eq!(cache.root_table_mask(), 0b11);
        assert_eq!(cache.max_cached_descriptors(), 12);
        assert_eq!(cache.stale_mask(), 0);
    }

    #[test]
    #[should_panic]
    fn test_staging_past_table_end_panics() {
        let mut cache = DescriptorHandleCache::new(DescriptorHeapKind::CbvSrvUav);
        cache.parse_root_signature(&signature(&[4]));
        cache.stage_descriptor_handles(0, 3, &[CpuDescriptorHandle(1), CpuDescriptorHandle(2)]);
    }

    #[test]
    fn test_flush_copies_staged_handles() {
        let fx = Fixture::new(64);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[4, 4]));
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 0, &[fx.handle(3), fx.handle(4)]);
        heap.set_descriptor_handles(BindPoint::Graphics, 1, 2, &[fx.handle(9)]);

        let bound = fx.flush(&mut heap);
        assert_eq!(bound.len(), 2);
        let (root0, base0) = bound[0];
        let (root1, base1) = bound[1];
        assert_eq!((root0, root1), (0, 1));

        assert_eq!(fx.device.read_descriptor_gpu(base0), Some(103));
        assert_eq!(fx.device.read_descriptor_gpu(base0.offset(1, fx.increment)), Some(104));
        assert_eq!(fx.device.read_descriptor_gpu(base1.offset(2, fx.increment)), Some(109));
        // Tables are packed: table 1 starts right after table 0's two slots.
        assert_eq!(base1, base0.offset(2, fx.increment));
    }

    #[test]
    fn test_flush_is_conservative_from_slot_zero() {
        let fx = Fixture::new(64);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[4]));
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 1, &[fx.handle(7)]);
        assert_eq!(heap.staged_size(BindPoint::Graphics), 2);

        let before = fx.device.stats().descriptors_copied;
        let bound = fx.flush(&mut heap);
        assert_eq!(fx.device.stats().descriptors_copied - before, 2);

        let base = bound[0].1;
        assert_eq!(fx.device.read_descriptor_gpu(base), Some(0));
        assert_eq!(fx.device.read_descriptor_gpu(base.offset(1, fx.increment)), Some(107));
    }

    #[test]
    fn test_second_flush_without_staging_is_noop() {
        let fx = Fixture::new(64);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[4]));
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 0, &[fx.handle(1)]);
        fx.flush(&mut heap);

        let calls = fx.device.stats().copy_descriptor_calls;
        let bound = fx.flush(&mut heap);
        assert!(bound.is_empty());
        assert_eq!(fx.device.stats().copy_descriptor_calls, calls);
    }

    #[test]
    fn test_copies_are_batched() {
        let fx = Fixture::new(256);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[40]));
        // Every other source slot, so no two source handles are adjacent.
        let handles: Vec<_> = (0..20).map(|i| fx.handle(i * 2)).collect();
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 0, &handles);

        let bound = fx.flush(&mut heap);
        assert_eq!(fx.device.stats().copy_descriptor_calls, 2);
        assert_eq!(fx.device.stats().descriptors_copied, 20);
        for i in 0..20 {
            assert_eq!(
                fx.device.read_descriptor_gpu(bound[0].1.offset(i, fx.increment)),
                Some(100 + 2 * i as u64)
            );
        }
        assert!(fx.device.validation_errors().is_empty());
    }

    #[test]
    fn test_adjacent_sources_share_one_range() {
        let fx = Fixture::new(256);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[32]));
        let handles: Vec<_> = (0..32).map(|i| fx.handle(i)).collect();
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 0, &handles);
        fx.flush(&mut heap);
        assert_eq!(fx.device.stats().copy_descriptor_calls, 1);
        assert_eq!(fx.device.stats().descriptors_copied, 32);
    }

    #[test]
    fn test_exhausted_heap_swaps_and_rebinds_everything() {
        let fx = Fixture::new(6);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Graphics, &signature(&[2, 2]));
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 0, &[fx.handle(1), fx.handle(2)]);
        heap.set_descriptor_handles(BindPoint::Graphics, 1, 0, &[fx.handle(3), fx.handle(4)]);
        assert!(heap.prepare_staged_tables(BindPoint::Graphics).unwrap());
        heap.bind_staged_tables(BindPoint::Graphics, |_, _| {});
        let first_heap = heap.current_heap();

        // Two more slots fit (4 + 2 = 6).
        heap.set_descriptor_handles(BindPoint::Graphics, 1, 0, &[fx.handle(5), fx.handle(6)]);
        assert!(!heap.prepare_staged_tables(BindPoint::Graphics).unwrap());
        heap.bind_staged_tables(BindPoint::Graphics, |_, _| {});

        // The next table does not fit: swap heaps and re-copy both tables.
        heap.set_descriptor_handles(BindPoint::Graphics, 0, 1, &[fx.handle(8)]);
        assert!(heap.prepare_staged_tables(BindPoint::Graphics).unwrap());
        assert_ne!(heap.current_heap(), first_heap);
        assert_eq!(heap.staged_size(BindPoint::Graphics), 4);

        let mut bound = Vec::new();
        heap.bind_staged_tables(BindPoint::Graphics, |root, base| bound.push((root, base)));
        assert_eq!(bound.len(), 2);
        assert_eq!(fx.device.read_descriptor_gpu(bound[0].1), Some(101));
        assert_eq!(fx.device.read_descriptor_gpu(bound[0].1.offset(1, fx.increment)), Some(108));
        assert_eq!(fx.device.read_descriptor_gpu(bound[1].1), Some(105));
        assert_eq!(fx.device.read_descriptor_gpu(bound[1].1.offset(1, fx.increment)), Some(106));
        assert_eq!(fx.pool.heap_count(), 2);
    }

    #[test]
    fn test_upload_direct() {
        let fx = Fixture::new(2);
        let mut heap = fx.heap();
        let (first, changed) = heap.upload_direct(fx.handle(10)).unwrap();
        assert!(changed);
        assert_eq!(fx.device.read_descriptor_gpu(first), Some(110));

        let (_, changed) = heap.upload_direct(fx.handle(11)).unwrap();
        assert!(!changed);
        let (third, changed) = heap.upload_direct(fx.handle(12)).unwrap();
        assert!(changed);
        assert_eq!(fx.device.read_descriptor_gpu(third), Some(112));
    }

    #[test]
    fn test_cleanup_returns_heaps_after_fence() {
        let fx = Fixture::new(16);
        let mut heap = fx.heap();
        heap.parse_root_signature(BindPoint::Compute, &signature(&[4]));
        heap.set_descriptor_handles(BindPoint::Compute, 0, 0, &[fx.handle(0)]);
        heap.prepare_staged_tables(BindPoint::Compute).unwrap();
        heap.bind_staged_tables(BindPoint::Compute, |_, _| {});
        let used = heap.current_heap();

        let fence = fx.queues.queue(QueueType::Compute).increment_fence();
        heap.cleanup_used_heaps(fence);
        assert_eq!(heap.current_heap(), None);
        assert_eq!(heap.cache(BindPoint::Compute).root_table_mask(), 0);
        assert_eq!(fx.pool.retired_count(), 1);

        let reused = fx.pool.request_heap().unwrap();
        assert_eq!(Some(reused.handle), used);
    }
}
