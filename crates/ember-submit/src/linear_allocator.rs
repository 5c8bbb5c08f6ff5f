//! Transient GPU memory suballocation.
//!
//! A [`LinearAllocator`] bumps an offset through fixed-size pages it leases
//! from a shared [`PageManager`]. Pages used by a submission are handed back
//! tagged with its fence and only become available again once that fence has
//! completed. Requests larger than a page get a dedicated page that is
//! destroyed once retired.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use bytemuck::Pod;
use ember_core::math::{align_up, is_aligned};
use ember_core::{
    BufferDesc, BufferKind, Device, FenceValue, GpuAddress, GpuResult, ResourceHandle, ResourceState,
};
use parking_lot::{Mutex, RwLock};

use crate::queue::CommandQueueManager;

/// Placement of an allocator's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// Default heap, unordered access. Scratch memory for GPU writes.
    GpuExclusive,
    /// Upload heap, generic read, persistently mapped.
    CpuWritable,
}

impl AllocatorKind {
    pub fn name(self) -> &'static str {
        match self {
            AllocatorKind::GpuExclusive => "gpu-exclusive",
            AllocatorKind::CpuWritable => "cpu-writable",
        }
    }

    /// State pages of this kind are created in.
    pub fn page_state(self) -> ResourceState {
        match self {
            AllocatorKind::GpuExclusive => ResourceState::UNORDERED_ACCESS,
            AllocatorKind::CpuWritable => ResourceState::GENERIC_READ,
        }
    }
}

/// A buffer the allocators carve allocations out of.
pub struct AllocationPage {
    resource: ResourceHandle,
    size: u64,
    gpu_address: GpuAddress,
    /// Null unless the page is mapped.
    cpu_address: AtomicPtr<u8>,
    /// Bumped each time the page is retired. CPU writes hold the read side.
    lease: RwLock<u64>,
}

impl AllocationPage {
    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.gpu_address
    }

    /// Base of the CPU mapping, if the page is mapped.
    pub fn cpu_address(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.cpu_address.load(Ordering::Acquire))
    }

    /// Ends the current lease. Allocations made under it refuse further writes.
    fn retire(&self) {
        *self.lease.write() += 1;
    }

    fn unmap(&self, device: &dyn Device) {
        if !self.cpu_address.swap(std::ptr::null_mut(), Ordering::AcqRel).is_null() {
            device.unmap(self.resource);
        }
    }
}

impl std::fmt::Debug for AllocationPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationPage")
            .field("resource", &self.resource)
            .field("size", &self.size)
            .field("mapped", &self.cpu_address().is_some())
            .finish()
    }
}

/// A suballocation: a byte range of a page.
///
/// CPU writes are only allowed until the recording that made it is
/// submitted; after that the page belongs to the GPU and later to other
/// recordings, and writes panic.
#[derive(Debug, Clone)]
pub struct DynAlloc {
    page: Arc<AllocationPage>,
    offset: u64,
    size: u64,
    lease: u64,
}

impl DynAlloc {
    /// The page buffer, for use as a copy source or destination.
    pub fn resource(&self) -> ResourceHandle {
        self.page.resource
    }

    /// Byte offset of the allocation inside [`DynAlloc::resource`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.page.gpu_address.offset(self.offset)
    }

    /// False once the page has been retired with a fence.
    pub fn is_writable(&self) -> bool {
        *self.page.lease.read() == self.lease
    }

    /// CPU pointer to the start of the allocation, if the page is mapped.
    ///
    /// The pointer is only meaningful while [`DynAlloc::is_writable`] holds.
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.page
            .cpu_address()
            // SAFETY: offset < page size, so the result stays inside the mapping.
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset as usize)) })
    }

    /// Copies `data` into the allocation at `offset`.
    ///
    /// Panics if the range exceeds the allocation or the page is not mapped.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let end = offset.checked_add(data.len() as u64);
        assert!(
            end.is_some_and(|end| end <= self.size),
            "write of {} bytes at {offset} overflows a {}-byte allocation",
            data.len(),
            self.size
        );
        let lease = self.page.lease.read();
        assert!(*lease == self.lease, "write to a retired allocation of {:?}", self.page);
        let Some(base) = self.cpu_ptr() else {
            panic!("write to an unmapped {:?}", self.page);
        };
        // SAFETY: bounds checked above. The lease guard keeps the page from
        // being retired, so neither the GPU nor another recording uses it.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset as usize), data.len());
        }
    }

    /// Copies plain-old-data values into the allocation at `offset`.
    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) {
        self.write_bytes(offset, bytemuck::cast_slice(data));
    }

    /// Fills the whole allocation with a repeated 32-bit pattern.
    pub fn fill_u32(&self, value: u32) {
        let bytes = value.to_le_bytes();
        let lease = self.page.lease.read();
        assert!(*lease == self.lease, "fill of a retired allocation of {:?}", self.page);
        let Some(base) = self.cpu_ptr() else {
            panic!("fill of an unmapped {:?}", self.page);
        };
        for i in 0..self.size as usize {
            // SAFETY: i < size.
            unsafe { *base.as_ptr().add(i) = bytes[i % 4] };
        }
    }
}

#[derive(Default)]
struct PageManagerInner {
    /// Every regular page ever created, for shutdown.
    pool: Vec<Arc<AllocationPage>>,
    available: VecDeque<Arc<AllocationPage>>,
    retired: VecDeque<(FenceValue, Arc<AllocationPage>)>,
    deletion: VecDeque<(FenceValue, Arc<AllocationPage>)>,
}

/// Owns the pages of one [`AllocatorKind`] and recycles them by fence.
///
/// Retired entries from different queues share one FIFO; only the head is
/// checked, so a page waiting on a slow queue can briefly hold back pages
/// behind it.
pub struct PageManager {
    kind: AllocatorKind,
    page_size: u64,
    device: Arc<dyn Device>,
    queues: Arc<CommandQueueManager>,
    inner: Mutex<PageManagerInner>,
}

impl PageManager {
    pub fn new(kind: AllocatorKind, page_size: u64, device: Arc<dyn Device>, queues: Arc<CommandQueueManager>) -> Self {
        assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");
        Self {
            kind,
            page_size,
            device,
            queues,
            inner: Mutex::new(PageManagerInner::default()),
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Creates a page of `size` bytes (the default page size if `None`).
    ///
    /// The page is not tracked by the manager; callers either register it
    /// (regular pages) or free it through [`PageManager::free_large_pages`].
    pub fn create_new_page(&self, size: Option<u64>) -> GpuResult<Arc<AllocationPage>> {
        let size = size.unwrap_or(self.page_size);
        let desc = match self.kind {
            AllocatorKind::GpuExclusive => BufferDesc {
                initial_state: ResourceState::UNORDERED_ACCESS,
                ..BufferDesc::default_heap(size, BufferKind::Raw)
            },
            AllocatorKind::CpuWritable => BufferDesc::upload(size),
        };
        let resource = self.device.create_buffer(&desc)?;

        let cpu_address = match self.kind {
            AllocatorKind::GpuExclusive => std::ptr::null_mut(),
            AllocatorKind::CpuWritable => match self.device.map(resource) {
                Ok(ptr) => ptr.as_ptr(),
                Err(e) => {
                    self.device.destroy_resource(resource);
                    return Err(e);
                }
            },
        };

        tracing::debug!("Created {} page of {} bytes", self.kind.name(), size);
        Ok(Arc::new(AllocationPage {
            resource,
            size,
            gpu_address: self.device.gpu_address(resource),
            cpu_address: AtomicPtr::new(cpu_address),
            lease: RwLock::new(0),
        }))
    }

    /// Returns a free page, reusing retired pages whose fence has completed.
    pub fn request_page(&self) -> GpuResult<Arc<AllocationPage>> {
        let mut inner = self.inner.lock();

        while let Some((fence, _)) = inner.retired.front() {
            if !self.queues.is_fence_complete(*fence) {
                break;
            }
            if let Some((_, page)) = inner.retired.pop_front() {
                inner.available.push_back(page);
            }
        }

        if let Some(page) = inner.available.pop_front() {
            return Ok(page);
        }

        let page = self.create_new_page(None)?;
        inner.pool.push(page.clone());
        Ok(page)
    }

    /// Retires regular pages until `fence` completes.
    pub fn discard_pages(&self, fence: FenceValue, pages: impl IntoIterator<Item = Arc<AllocationPage>>) {
        let mut inner = self.inner.lock();
        for page in pages {
            page.retire();
            inner.retired.push_back((fence, page));
        }
    }

    /// Unmaps one-off pages and queues them for destruction after `fence`.
    ///
    /// Destroys previously queued pages whose fence has completed first.
    pub fn free_large_pages(&self, fence: FenceValue, pages: impl IntoIterator<Item = Arc<AllocationPage>>) {
        let mut inner = self.inner.lock();

        while let Some((done, _)) = inner.deletion.front() {
            if !self.queues.is_fence_complete(*done) {
                break;
            }
            if let Some((_, page)) = inner.deletion.pop_front() {
                self.device.destroy_resource(page.resource);
            }
        }

        for page in pages {
            page.retire();
            page.unmap(self.device.as_ref());
            inner.deletion.push_back((fence, page));
        }
    }

    /// Number of regular pages created so far.
    pub fn page_count(&self) -> usize {
        self.inner.lock().pool.len()
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.len()
    }

    /// One-off pages still waiting for their fence.
    pub fn pending_deletion_count(&self) -> usize {
        self.inner.lock().deletion.len()
    }

    /// Releases every page. The GPU must be idle.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.available.clear();
        inner.retired.clear();
        for (_, page) in inner.deletion.drain(..) {
            self.device.destroy_resource(page.resource);
        }
        for page in inner.pool.drain(..) {
            page.retire();
            page.unmap(self.device.as_ref());
            self.device.destroy_resource(page.resource);
        }
    }
}

/// Bump allocator over pages of one [`PageManager`].
///
/// Owned by a single recording context; not shared between threads.
pub struct LinearAllocator {
    page_manager: Arc<PageManager>,
    default_alignment: u64,
    current_page: Option<Arc<AllocationPage>>,
    current_offset: u64,
    retired_pages: Vec<Arc<AllocationPage>>,
    large_pages: Vec<Arc<AllocationPage>>,
}

impl LinearAllocator {
    pub fn new(page_manager: Arc<PageManager>, default_alignment: u64) -> Self {
        assert!(default_alignment.is_power_of_two());
        Self {
            page_manager,
            default_alignment,
            current_page: None,
            current_offset: 0,
            retired_pages: Vec::new(),
            large_pages: Vec::new(),
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        self.page_manager.kind()
    }

    pub fn page_size(&self) -> u64 {
        self.page_manager.page_size()
    }

    /// Allocates with the default alignment.
    pub fn allocate_default(&mut self, size: u64) -> GpuResult<DynAlloc> {
        self.allocate(size, self.default_alignment)
    }

    /// Allocates `size` bytes at an offset that is a multiple of `alignment`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> GpuResult<DynAlloc> {
        assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        let aligned_size = align_up(size, alignment);
        let page_size = self.page_size();

        if aligned_size > page_size {
            return self.allocate_large_page(aligned_size);
        }

        self.current_offset = align_up(self.current_offset, alignment);
        if self.current_offset + aligned_size > page_size
            && let Some(page) = self.current_page.take()
        {
            self.retired_pages.push(page);
        }

        let page = match &self.current_page {
            Some(page) => page.clone(),
            None => {
                let page = self.page_manager.request_page()?;
                self.current_page = Some(page.clone());
                self.current_offset = 0;
                page
            }
        };

        let lease = *page.lease.read();
        let alloc = DynAlloc {
            page,
            offset: self.current_offset,
            size: aligned_size,
            lease,
        };
        debug_assert!(is_aligned(alloc.offset, alignment));
        self.current_offset += aligned_size;
        Ok(alloc)
    }

    fn allocate_large_page(&mut self, size: u64) -> GpuResult<DynAlloc> {
        let page = self.page_manager.create_new_page(Some(size))?;
        tracing::debug!("Oversize {} allocation of {} bytes", self.kind().name(), size);
        self.large_pages.push(page.clone());
        Ok(DynAlloc {
            page,
            offset: 0,
            size,
            lease: 0,
        })
    }

    /// Retires every page used since the last cleanup, tagged with `fence`.
    pub fn cleanup_used_pages(&mut self, fence: FenceValue) {
        if let Some(page) = self.current_page.take() {
            self.retired_pages.push(page);
        }
        self.current_offset = 0;

        if !self.retired_pages.is_empty() {
            self.page_manager.discard_pages(fence, self.retired_pages.drain(..));
        }
        if !self.large_pages.is_empty() {
            self.page_manager.free_large_pages(fence, self.large_pages.drain(..));
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_core::QueueType;
    use ember_device::SoftwareDevice;

    use super::*;

    const GPU_PAGE: u64 = 0x10000;

    fn setup(device: Arc<SoftwareDevice>, kind: AllocatorKind, page_size: u64) -> (Arc<CommandQueueManager>, Arc<PageManager>) {
        let queues = Arc::new(CommandQueueManager::new(device.clone()).unwrap());
        let manager = Arc::new(PageManager::new(kind, page_size, device, queues.clone()));
        (queues, manager)
    }

    #[test]
    fn test_allocations_are_aligned_and_in_page() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (_queues, manager) = setup(device, AllocatorKind::GpuExclusive, GPU_PAGE);
        let mut allocator = LinearAllocator::new(manager, 256);

        for (size, align) in [(1, 256), (100, 512), (3000, 4096), (17, 16), (256, 256)] {
            let alloc = allocator.allocate(size, align).unwrap();
            assert_eq!(alloc.offset() % align, 0);
            assert!(alloc.offset() + alloc.size() <= GPU_PAGE);
            assert!(alloc.size() >= size);
        }
    }

    #[test]
    fn test_two_40k_allocations_need_two_pages() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (_queues, manager) = setup(device, AllocatorKind::GpuExclusive, GPU_PAGE);
        let mut allocator = LinearAllocator::new(manager.clone(), 256);

        let first = allocator.allocate(40 * 1024, 256).unwrap();
        let second = allocator.allocate(40 * 1024, 256).unwrap();
        assert_ne!(first.resource(), second.resource());
        assert_eq!(second.offset(), 0);
        assert_eq!(manager.page_count(), 2);
    }

    #[test]
    fn test_oversize_allocation_gets_dedicated_page() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (queues, manager) = setup(device.clone(), AllocatorKind::CpuWritable, 0x1000);
        let mut allocator = LinearAllocator::new(manager.clone(), 256);

        let large = allocator.allocate(0x1800, 256).unwrap();
        assert_eq!(large.offset(), 0);
        assert_eq!(large.size(), 0x1800);
        assert_eq!(manager.page_count(), 0);
        large.write_bytes(0x17ff, &[1]);

        let fence = queues.graphics().increment_fence();
        allocator.cleanup_used_pages(fence);
        assert_eq!(manager.pending_deletion_count(), 1);
        assert!(large.cpu_ptr().is_none());
        assert!(!large.is_writable());

        // The next batch of one-off pages flushes completed deletions.
        let live = device.live_resource_count();
        manager.free_large_pages(fence, std::iter::empty());
        assert_eq!(manager.pending_deletion_count(), 0);
        assert_eq!(device.live_resource_count(), live - 1);
    }

    #[test]
    fn test_retired_page_waits_for_fence() {
        let device = Arc::new(SoftwareDevice::deferred());
        let (queues, manager) = setup(device.clone(), AllocatorKind::CpuWritable, 0x1000);
        let mut allocator = LinearAllocator::new(manager.clone(), 256);

        let used = allocator.allocate(64, 256).unwrap();
        let fence = queues.copy().increment_fence();
        allocator.cleanup_used_pages(fence);
        assert_eq!(manager.retired_count(), 1);

        let fresh = manager.request_page().unwrap();
        assert_ne!(fresh.resource(), used.resource());

        device.run_until_idle();
        let reused = manager.request_page().unwrap();
        assert_eq!(reused.resource(), used.resource());
    }

    #[test]
    fn test_cpu_writes_land_in_page_memory() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (_queues, manager) = setup(device.clone(), AllocatorKind::CpuWritable, 0x1000);
        let mut allocator = LinearAllocator::new(manager, 256);

        allocator.allocate(16, 256).unwrap();
        let alloc = allocator.allocate(16, 256).unwrap();
        alloc.write::<u32>(4, &[0xdead_beef]);
        let bytes = device.read_resource(alloc.resource(), alloc.offset() + 4, 4).unwrap();
        assert_eq!(bytes, 0xdead_beef_u32.to_le_bytes());

        alloc.fill_u32(0x0102_0304);
        let bytes = device.read_resource(alloc.resource(), alloc.offset(), 8).unwrap();
        assert_eq!(bytes, [4, 3, 2, 1, 4, 3, 2, 1]);
    }

    #[test]
    #[should_panic]
    fn test_write_past_allocation_panics() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (_queues, manager) = setup(device, AllocatorKind::CpuWritable, 0x1000);
        let mut allocator = LinearAllocator::new(manager, 256);
        let alloc = allocator.allocate(8, 8).unwrap();
        alloc.write_bytes(4, &[0; 8]);
    }

    #[test]
    fn test_retired_allocation_refuses_writes() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (queues, manager) = setup(device.clone(), AllocatorKind::CpuWritable, 0x1000);
        let mut first = LinearAllocator::new(manager.clone(), 256);
        let mut second = LinearAllocator::new(manager, 256);

        let stale = first.allocate(256, 256).unwrap();
        assert!(stale.is_writable());
        first.cleanup_used_pages(queues.graphics().increment_fence());
        assert!(!stale.is_writable());

        let live = second.allocate(256, 256).unwrap();
        assert_eq!(live.resource(), stale.resource());
        assert!(live.is_writable());
        live.write_bytes(0, &[0xaa; 4]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stale.write_bytes(0, &[0x55; 4])));
        assert!(result.is_err());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| stale.fill_u32(0x5555_5555)));
        assert!(result.is_err());
        let bytes = device.read_resource(live.resource(), live.offset(), 4).unwrap();
        assert_eq!(bytes, [0xaa; 4]);
    }

    #[test]
    fn test_gpu_pages_are_unmapped_uav() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (_queues, manager) = setup(device.clone(), AllocatorKind::GpuExclusive, GPU_PAGE);
        let page = manager.request_page().unwrap();
        assert!(page.cpu_address().is_none());
        assert_eq!(device.resource_state(page.resource()), Some(ResourceState::UNORDERED_ACCESS));
    }

    #[test]
    fn test_destroy_releases_pages() {
        let device = Arc::new(SoftwareDevice::immediate());
        let (queues, manager) = setup(device.clone(), AllocatorKind::CpuWritable, 0x1000);
        let mut allocator = LinearAllocator::new(manager.clone(), 256);
        allocator.allocate(64, 256).unwrap();
        allocator.allocate(0x2000, 256).unwrap();
        allocator.cleanup_used_pages(queues.queue(QueueType::Graphics).increment_fence());

        manager.destroy();
        assert_eq!(device.live_resource_count(), 0);
        assert!(device.validation_errors().is_empty());
    }
}
