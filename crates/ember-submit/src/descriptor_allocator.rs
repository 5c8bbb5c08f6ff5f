//! CPU-only descriptor allocation.

use std::sync::Arc;

use ember_core::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapHandle, DescriptorHeapKind, Device, GpuResult,
};

/// Linear allocator of non shader-visible descriptors of one kind.
///
/// Views are written into these handles by whoever creates them; the
/// dynamic descriptor heaps copy them into shader-visible heaps when a table
/// is flushed. Descriptors are never freed individually.
pub struct DescriptorAllocator {
    kind: DescriptorHeapKind,
    descriptors_per_heap: u32,
    device: Arc<dyn Device>,
    heaps: Vec<DescriptorHeapHandle>,
    current: CpuDescriptorHandle,
    remaining: u32,
    increment: u32,
}

impl DescriptorAllocator {
    pub fn new(device: Arc<dyn Device>, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        Self {
            kind,
            descriptors_per_heap,
            increment: device.descriptor_increment(kind),
            device,
            heaps: Vec::new(),
            current: CpuDescriptorHandle::NULL,
            remaining: 0,
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Returns the first of `count` consecutive descriptors.
    pub fn allocate(&mut self, count: u32) -> GpuResult<CpuDescriptorHandle> {
        assert!(
            count <= self.descriptors_per_heap,
            "cannot allocate {count} descriptors from heaps of {}",
            self.descriptors_per_heap
        );
        if self.current.is_null() || self.remaining < count {
            let info = self.device.create_descriptor_heap(&DescriptorHeapDesc {
                kind: self.kind,
                count: self.descriptors_per_heap,
                shader_visible: false,
            })?;
            tracing::debug!("Created CPU {:?} descriptor heap #{}", self.kind, self.heaps.len() + 1);
            self.heaps.push(info.handle);
            self.current = info.cpu_start;
            self.remaining = self.descriptors_per_heap;
        }
        let handle = self.current;
        self.current = self.current.offset(count, self.increment);
        self.remaining -= count;
        Ok(handle)
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Destroys every heap this allocator created.
    pub fn destroy_all(&mut self) {
        for heap in self.heaps.drain(..) {
            self.device.destroy_descriptor_heap(heap);
        }
        self.current = CpuDescriptorHandle::NULL;
        self.remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use ember_device::SoftwareDevice;

    use super::*;

    #[test]
    fn test_consecutive_allocations_are_contiguous() {
        let device = Arc::new(SoftwareDevice::immediate());
        let mut allocator = DescriptorAllocator::new(device.clone(), DescriptorHeapKind::CbvSrvUav, 256);
        let increment = device.descriptor_increment(DescriptorHeapKind::CbvSrvUav);
        let a = allocator.allocate(2).unwrap();
        let b = allocator.allocate(1).unwrap();
        assert_eq!(b, a.offset(2, increment));
        assert!(device.write_descriptor(b, 5));
        assert_eq!(allocator.heap_count(), 1);
    }

    #[test]
    fn test_exhausted_heap_starts_a_new_one() {
        let device = Arc::new(SoftwareDevice::immediate());
        let mut allocator = DescriptorAllocator::new(device.clone(), DescriptorHeapKind::Sampler, 4);
        allocator.allocate(3).unwrap();
        allocator.allocate(2).unwrap();
        assert_eq!(allocator.heap_count(), 2);

        allocator.destroy_all();
        assert_eq!(device.live_descriptor_heap_count(), 0);
    }
}
