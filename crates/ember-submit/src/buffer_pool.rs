//! Command buffer recycling.

use std::collections::VecDeque;
use std::sync::Arc;

use ember_core::{CommandBufferHandle, Device, FenceValue, GpuResult, QueueType};
use parking_lot::Mutex;

struct PoolInner {
    /// Every buffer this pool created, for shutdown.
    all: Vec<CommandBufferHandle>,
    /// Discarded buffers in discard order.
    ready: VecDeque<(FenceValue, CommandBufferHandle)>,
}

/// Recycles the command buffers of one queue.
///
/// Buffers come back tagged with the fence of the submission that used them
/// and are handed out again only once that fence has completed. Discards
/// arrive in fence order, so only the head of the FIFO ever needs checking.
pub struct CommandBufferPool {
    queue_type: QueueType,
    device: Arc<dyn Device>,
    inner: Mutex<PoolInner>,
}

impl CommandBufferPool {
    pub fn new(device: Arc<dyn Device>, queue_type: QueueType) -> Self {
        Self {
            queue_type,
            device,
            inner: Mutex::new(PoolInner {
                all: Vec::new(),
                ready: VecDeque::new(),
            }),
        }
    }

    /// Returns a buffer ready for recording.
    ///
    /// Reuses the oldest discarded buffer if `completed` covers its fence,
    /// otherwise creates a new one.
    pub fn request(&self, completed: FenceValue) -> GpuResult<CommandBufferHandle> {
        let mut inner = self.inner.lock();

        if let Some(&(fence, buffer)) = inner.ready.front()
            && fence.is_at_or_before(completed)
        {
            inner.ready.pop_front();
            self.device.reset_command_buffer(buffer);
            return Ok(buffer);
        }

        let buffer = self.device.create_command_buffer(self.queue_type)?;
        inner.all.push(buffer);
        tracing::debug!("Created {} command buffer #{}", self.queue_type, inner.all.len());
        Ok(buffer)
    }

    /// Queues `buffer` for reuse once `fence` completes.
    pub fn discard(&self, fence: FenceValue, buffer: CommandBufferHandle) {
        debug_assert_eq!(fence.queue(), self.queue_type);
        self.inner.lock().ready.push_back((fence, buffer));
    }

    /// Number of buffers ever created.
    pub fn len(&self) -> usize {
        self.inner.lock().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of discarded buffers waiting for reuse.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Destroys every buffer the pool created.
    ///
    /// The GPU must be idle.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.ready.clear();
        for buffer in inner.all.drain(..) {
            self.device.destroy_command_buffer(buffer);
        }
    }
}
