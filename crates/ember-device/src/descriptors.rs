//! Simulated descriptor heaps.
//!
//! A descriptor is modelled as an opaque `u64` payload; zero is the null
//! descriptor. CPU and GPU handles are addresses in two disjoint ranges so a
//! handle from the wrong heap or of the wrong kind is detected on use.

use std::collections::HashMap;

use ember_core::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapHandle, DescriptorHeapInfo,
    DescriptorHeapKind, DescriptorRange, GpuDescriptorHandle,
};

const CPU_DESCRIPTOR_BASE: u64 = 0x1000_0000;
const GPU_DESCRIPTOR_BASE: u64 = 0x8000_0000_0000;
const HEAP_GUARD_BYTES: u64 = 0x1000;

/// Byte stride of one descriptor of `kind`.
pub(crate) fn increment_for(kind: DescriptorHeapKind) -> u32 {
    match kind {
        DescriptorHeapKind::CbvSrvUav => 32,
        DescriptorHeapKind::Sampler => 16,
        DescriptorHeapKind::RenderTarget => 32,
        DescriptorHeapKind::DepthStencil => 8,
    }
}

pub(crate) struct SoftDescriptorHeap {
    info: DescriptorHeapInfo,
    increment: u32,
    slots: Vec<u64>,
}

impl SoftDescriptorHeap {
    fn cpu_slot(&self, handle: CpuDescriptorHandle) -> Option<usize> {
        slot_of(handle.0, self.info.cpu_start.0, self.increment, self.info.count)
    }

    fn gpu_slot(&self, handle: GpuDescriptorHandle) -> Option<usize> {
        if self.info.gpu_start.is_null() {
            return None;
        }
        slot_of(handle.0, self.info.gpu_start.0, self.increment, self.info.count)
    }

    pub(crate) fn kind(&self) -> DescriptorHeapKind {
        self.info.kind
    }

    pub(crate) fn is_shader_visible(&self) -> bool {
        !self.info.gpu_start.is_null()
    }
}

fn slot_of(address: u64, base: u64, increment: u32, count: u32) -> Option<usize> {
    let offset = address.checked_sub(base)?;
    let increment = increment as u64;
    if offset % increment != 0 {
        return None;
    }
    let slot = offset / increment;
    (slot < count as u64).then_some(slot as usize)
}

/// All live descriptor heaps of a device.
pub(crate) struct DescriptorHeaps {
    heaps: HashMap<u64, SoftDescriptorHeap>,
    next_cpu: u64,
    next_gpu: u64,
}

impl DescriptorHeaps {
    pub(crate) fn new() -> Self {
        Self {
            heaps: HashMap::new(),
            next_cpu: CPU_DESCRIPTOR_BASE,
            next_gpu: GPU_DESCRIPTOR_BASE,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heaps.len()
    }

    pub(crate) fn create(&mut self, handle: DescriptorHeapHandle, desc: &DescriptorHeapDesc) -> DescriptorHeapInfo {
        let increment = increment_for(desc.kind);
        let span = desc.count as u64 * increment as u64 + HEAP_GUARD_BYTES;

        let cpu_start = CpuDescriptorHandle(self.next_cpu);
        self.next_cpu += span;

        let gpu_start = if desc.shader_visible {
            let start = GpuDescriptorHandle(self.next_gpu);
            self.next_gpu += span;
            start
        } else {
            GpuDescriptorHandle::NULL
        };

        let info = DescriptorHeapInfo {
            handle,
            kind: desc.kind,
            count: desc.count,
            cpu_start,
            gpu_start,
        };
        self.heaps.insert(
            handle.raw(),
            SoftDescriptorHeap {
                info,
                increment,
                slots: vec![0; desc.count as usize],
            },
        );
        info
    }

    pub(crate) fn destroy(&mut self, handle: DescriptorHeapHandle) -> bool {
        self.heaps.remove(&handle.raw()).is_some()
    }

    pub(crate) fn get(&self, handle: DescriptorHeapHandle) -> Option<&SoftDescriptorHeap> {
        self.heaps.get(&handle.raw())
    }

    fn locate_cpu(&self, handle: CpuDescriptorHandle) -> Option<(u64, usize)> {
        self.heaps
            .iter()
            .find_map(|(id, heap)| heap.cpu_slot(handle).map(|slot| (*id, slot)))
    }

    /// Reads the payload at a CPU handle.
    pub(crate) fn read(&self, handle: CpuDescriptorHandle) -> Option<u64> {
        let (id, slot) = self.locate_cpu(handle)?;
        self.heaps.get(&id).map(|heap| heap.slots[slot])
    }

    /// Reads the payload a shader would see at a GPU handle.
    pub(crate) fn read_gpu(&self, handle: GpuDescriptorHandle) -> Option<u64> {
        self.heaps
            .values()
            .find_map(|heap| heap.gpu_slot(handle).map(|slot| heap.slots[slot]))
    }

    /// The shader-visible heap a GPU handle points into.
    pub(crate) fn heap_of_gpu(&self, handle: GpuDescriptorHandle) -> Option<DescriptorHeapHandle> {
        self.heaps
            .values()
            .find(|heap| heap.gpu_slot(handle).is_some())
            .map(|heap| heap.info.handle)
    }

    /// Writes a payload at a CPU handle, returning false if the handle is unknown.
    pub(crate) fn write(&mut self, handle: CpuDescriptorHandle, payload: u64) -> bool {
        let Some((id, slot)) = self.locate_cpu(handle) else {
            return false;
        };
        match self.heaps.get_mut(&id) {
            Some(heap) => {
                heap.slots[slot] = payload;
                true
            }
            None => false,
        }
    }

    /// Performs a batched descriptor copy and returns how many descriptors moved.
    pub(crate) fn copy(
        &mut self,
        dst: &[DescriptorRange],
        src: &[DescriptorRange],
        kind: DescriptorHeapKind,
    ) -> Result<u64, String> {
        let increment = increment_for(kind);
        let expand = |ranges: &[DescriptorRange]| -> Vec<CpuDescriptorHandle> {
            ranges
                .iter()
                .flat_map(|range| {
                    (0..range.count).map(move |i| {
                        if range.start.is_null() {
                            CpuDescriptorHandle::NULL
                        } else {
                            range.start.offset(i, increment)
                        }
                    })
                })
                .collect()
        };
        let dst_handles = expand(dst);
        let src_handles = expand(src);
        if dst_handles.len() != src_handles.len() {
            return Err(format!(
                "descriptor copy size mismatch: {} destination vs {} source descriptors",
                dst_handles.len(),
                src_handles.len()
            ));
        }

        // Resolve every source before writing so overlapping copies read the old values.
        let mut payloads = Vec::with_capacity(src_handles.len());
        for handle in &src_handles {
            if handle.is_null() {
                payloads.push(0);
                continue;
            }
            let (id, slot) = self
                .locate_cpu(*handle)
                .ok_or_else(|| format!("unknown source descriptor {:#x}", handle.0))?;
            let heap = &self.heaps[&id];
            if heap.kind() != kind {
                return Err(format!("source descriptor {:#x} is not a {:?} descriptor", handle.0, kind));
            }
            payloads.push(heap.slots[slot]);
        }

        for (handle, payload) in dst_handles.iter().zip(payloads) {
            let (id, slot) = self
                .locate_cpu(*handle)
                .ok_or_else(|| format!("unknown destination descriptor {:#x}", handle.0))?;
            let heap = self
                .heaps
                .get_mut(&id)
                .ok_or_else(|| format!("destination heap vanished for {:#x}", handle.0))?;
            if heap.kind() != kind {
                return Err(format!("destination descriptor {:#x} is not a {:?} descriptor", handle.0, kind));
            }
            heap.slots[slot] = payload;
        }
        Ok(dst_handles.len() as u64)
    }
}
