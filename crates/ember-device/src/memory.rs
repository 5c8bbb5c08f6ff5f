//! Backing storage for simulated resources.

use std::ptr::NonNull;

/// A fixed-size, zero-initialised byte allocation with a stable address.
///
/// The CPU writes through mapped pointers while the simulated GPU copies
/// between allocations, so all access goes through raw pointers rather than
/// references.
pub(crate) struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: HostMemory owns its allocation; concurrent access is governed by the
// same fence discipline as real device memory.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    pub(crate) fn new(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut u8).unwrap_or(NonNull::dangling());
        Self { ptr, len }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Copies `len` bytes at `offset` into a new vector.
    pub(crate) fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }

    /// Copies `len` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
    ///
    /// Returns false (copying nothing) if either range is out of bounds.
    pub(crate) fn copy(
        dst: &HostMemory,
        dst_offset: usize,
        src: &HostMemory,
        src_offset: usize,
        len: usize,
    ) -> bool {
        let in_bounds = |mem: &HostMemory, offset: usize| {
            offset.checked_add(len).is_some_and(|end| end <= mem.len)
        };
        if !in_bounds(dst, dst_offset) || !in_bounds(src, src_offset) {
            return false;
        }
        // SAFETY: ranges checked above; `copy` tolerates overlap when the
        // source and destination are the same allocation.
        unsafe {
            std::ptr::copy(
                src.ptr.as_ptr().add(src_offset),
                dst.ptr.as_ptr().add(dst_offset),
                len,
            );
        }
        true
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len.max(1));
        // SAFETY: reconstructs the box leaked in `new`.
        drop(unsafe { Box::from_raw(slice) });
    }
}
