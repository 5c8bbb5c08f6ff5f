//! Fence-tracked command queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ember_core::{CommandBufferHandle, Device, FenceHandle, FenceValue, GpuResult, QueueHandle, QueueType};
use parking_lot::Mutex;

use crate::buffer_pool::CommandBufferPool;

/// One hardware submission channel plus its monotonic fence.
///
/// Fence counters start at 1; the device fence is created at 0 so nothing is
/// complete before the first submission. The submission mutex is held only
/// across signal and enqueue, never while recording.
pub struct CommandQueue {
    queue_type: QueueType,
    device: Arc<dyn Device>,
    queue: QueueHandle,
    fence: FenceHandle,
    /// Next counter to signal; the lock also serializes submission.
    next_counter: Mutex<u64>,
    /// Cached completed counter, only ever raised.
    last_completed: AtomicU64,
    buffer_pool: CommandBufferPool,
    destroyed: AtomicBool,
}

impl CommandQueue {
    pub fn new(device: Arc<dyn Device>, queue_type: QueueType) -> GpuResult<Self> {
        let queue = device.create_queue(queue_type)?;
        let fence = match device.create_fence(0) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_queue(queue);
                return Err(e);
            }
        };
        tracing::debug!("Created {} queue", queue_type);

        Ok(Self {
            queue_type,
            buffer_pool: CommandBufferPool::new(device.clone(), queue_type),
            device,
            queue,
            fence,
            next_counter: Mutex::new(1),
            last_completed: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn handle(&self) -> QueueHandle {
        self.queue
    }

    pub fn fence_handle(&self) -> FenceHandle {
        self.fence
    }

    pub fn buffer_pool(&self) -> &CommandBufferPool {
        &self.buffer_pool
    }

    /// The value the next submission will signal.
    pub fn next_fence_value(&self) -> FenceValue {
        FenceValue::new(self.queue_type, *self.next_counter.lock())
    }

    /// The most recently issued value (the initial value if nothing was issued).
    pub fn last_issued_fence_value(&self) -> FenceValue {
        FenceValue::new(self.queue_type, *self.next_counter.lock() - 1)
    }

    /// The highest value known to be complete, without querying the device.
    pub fn last_completed_fence_value(&self) -> FenceValue {
        FenceValue::new(self.queue_type, self.last_completed.load(Ordering::Acquire))
    }

    /// Signals the next fence value without submitting work and returns it.
    pub fn increment_fence(&self) -> FenceValue {
        let mut next = self.next_counter.lock();
        let value = FenceValue::new(self.queue_type, *next);
        self.device.signal(self.queue, self.fence, value.counter());
        *next += 1;
        tracing::trace!("Signalled {}", value);
        value
    }

    /// Returns true once the GPU has passed `value`.
    ///
    /// Only touches the device when the cached value is older than `value`.
    pub fn is_complete(&self, value: FenceValue) -> bool {
        assert_eq!(value.queue(), self.queue_type, "fence {value} checked on the {} queue", self.queue_type);
        let counter = value.counter();
        if counter > self.last_completed.load(Ordering::Acquire) {
            self.refresh_completed();
        }
        counter <= self.last_completed.load(Ordering::Acquire)
    }

    fn refresh_completed(&self) -> u64 {
        let completed = self.device.fence_completed_value(self.fence);
        self.last_completed.fetch_max(completed, Ordering::AcqRel).max(completed)
    }

    /// Blocks until `value` completes. Returns immediately if it already has.
    pub fn wait_for(&self, value: FenceValue) {
        if self.is_complete(value) {
            return;
        }
        tracing::trace!("Waiting for {}", value);
        self.device.wait_for_fence_value(self.fence, value.counter());
        self.last_completed.fetch_max(value.counter(), Ordering::AcqRel);
    }

    /// Blocks until everything submitted so far has completed.
    pub fn wait_for_idle(&self) {
        let value = self.increment_fence();
        self.wait_for(value);
    }

    /// Makes this queue wait on the GPU for the producer's latest submission.
    ///
    /// If the producer has not submitted anything yet the wait is for its
    /// initial value and is satisfied immediately.
    pub fn stall_for_producer(&self, producer: &CommandQueue) {
        let value = producer.last_issued_fence_value();
        self.device.queue_wait(self.queue, producer.fence, value.counter());
    }

    /// Makes this queue wait on the GPU for `value` of `producer`.
    pub(crate) fn stall_for_value(&self, producer: &CommandQueue, value: FenceValue) {
        debug_assert_eq!(value.queue(), producer.queue_type);
        self.device.queue_wait(self.queue, producer.fence, value.counter());
    }

    /// Closes and submits `buffer`, then signals and returns the next value.
    pub fn execute_command_buffer(&self, buffer: CommandBufferHandle) -> FenceValue {
        let mut next = self.next_counter.lock();
        self.device.close_command_buffer(buffer);
        self.device.execute(self.queue, buffer);
        let value = FenceValue::new(self.queue_type, *next);
        self.device.signal(self.queue, self.fence, value.counter());
        *next += 1;
        tracing::trace!("Submitted {:?} as {}", buffer, value);
        value
    }

    /// Leases a command buffer, reusing one whose fence has completed.
    pub fn request_buffer(&self) -> GpuResult<CommandBufferHandle> {
        let completed = self.refresh_completed();
        self.buffer_pool.request(FenceValue::new(self.queue_type, completed))
    }

    /// Returns a buffer to the pool; it is reused once `fence` completes.
    pub fn discard_buffer(&self, fence: FenceValue, buffer: CommandBufferHandle) {
        self.buffer_pool.discard(fence, buffer);
    }

    /// Destroys the pool's buffers, the fence and the queue. Idempotent.
    ///
    /// The queue must be idle.
    pub fn shutdown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.buffer_pool.shutdown();
        self.device.destroy_fence(self.fence);
        self.device.destroy_queue(self.queue);
        tracing::debug!("Destroyed {} queue", self.queue_type);
    }
}

/// The graphics, compute and copy queues.
pub struct CommandQueueManager {
    queues: [CommandQueue; QueueType::COUNT],
}

impl CommandQueueManager {
    pub fn new(device: Arc<dyn Device>) -> GpuResult<Self> {
        let graphics = CommandQueue::new(device.clone(), QueueType::Graphics)?;
        let compute = match CommandQueue::new(device.clone(), QueueType::Compute) {
            Ok(queue) => queue,
            Err(e) => {
                graphics.shutdown();
                return Err(e);
            }
        };
        let copy = match CommandQueue::new(device, QueueType::Copy) {
            Ok(queue) => queue,
            Err(e) => {
                graphics.shutdown();
                compute.shutdown();
                return Err(e);
            }
        };
        Ok(Self {
            queues: [graphics, compute, copy],
        })
    }

    pub fn queue(&self, queue_type: QueueType) -> &CommandQueue {
        &self.queues[queue_type.index()]
    }

    pub fn graphics(&self) -> &CommandQueue {
        self.queue(QueueType::Graphics)
    }

    pub fn compute(&self) -> &CommandQueue {
        self.queue(QueueType::Compute)
    }

    pub fn copy(&self) -> &CommandQueue {
        self.queue(QueueType::Copy)
    }

    /// Checks a value against the queue it belongs to.
    pub fn is_fence_complete(&self, value: FenceValue) -> bool {
        self.queue(value.queue()).is_complete(value)
    }

    /// Blocks until `value` completes on its queue.
    pub fn wait_for_fence(&self, value: FenceValue) {
        self.queue(value.queue()).wait_for(value);
    }

    /// Orders `consumer` behind `value`, whichever queue issued it.
    pub fn stall_for_fence(&self, consumer: QueueType, value: FenceValue) {
        let producer = self.queue(value.queue());
        self.queue(consumer).stall_for_value(producer, value);
    }

    /// Orders `consumer` behind everything `producer` has submitted so far.
    pub fn stall_for_producer(&self, consumer: QueueType, producer: QueueType) {
        self.queue(consumer).stall_for_producer(self.queue(producer));
    }

    /// Waits until all three queues are idle.
    pub fn idle_gpu(&self) {
        for queue in &self.queues {
            queue.wait_for_idle();
        }
    }

    pub fn shutdown(&self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use ember_device::SoftwareDevice;

    use super::*;

    #[test]
    fn test_fence_values_increase_from_one() {
        let device = Arc::new(SoftwareDevice::immediate());
        let queue = CommandQueue::new(device, QueueType::Compute).unwrap();
        assert_eq!(queue.last_issued_fence_value(), FenceValue::initial(QueueType::Compute));
        assert_eq!(queue.increment_fence(), FenceValue::new(QueueType::Compute, 1));
        assert_eq!(queue.increment_fence(), FenceValue::new(QueueType::Compute, 2));
        assert_eq!(queue.next_fence_value(), FenceValue::new(QueueType::Compute, 3));
    }

    #[test]
    fn test_completion_follows_device_progress() {
        let device = Arc::new(SoftwareDevice::deferred());
        let queue = CommandQueue::new(device.clone(), QueueType::Graphics).unwrap();
        let v1 = queue.increment_fence();
        let v2 = queue.increment_fence();
        let v3 = queue.increment_fence();

        assert!(!queue.is_complete(v1));
        device.step(queue.handle());
        device.step(queue.handle());

        assert!(queue.is_complete(v1));
        assert!(queue.is_complete(v2));
        assert!(!queue.is_complete(v3));
        assert!(queue.is_complete(FenceValue::initial(QueueType::Graphics)));
    }

    #[test]
    fn test_cached_completion_avoids_device() {
        let device = Arc::new(SoftwareDevice::immediate());
        let queue = CommandQueue::new(device.clone(), QueueType::Graphics).unwrap();
        let v = queue.increment_fence();
        assert!(queue.is_complete(v));
        assert_eq!(queue.last_completed_fence_value(), v);
        // The cache answers even though the device fence is rewound.
        device.set_fence_value(queue.fence_handle(), 0);
        assert!(queue.is_complete(v));
    }

    #[test]
    #[should_panic]
    fn test_foreign_fence_value_panics() {
        let device = Arc::new(SoftwareDevice::immediate());
        let queue = CommandQueue::new(device, QueueType::Graphics).unwrap();
        queue.is_complete(FenceValue::new(QueueType::Copy, 1));
    }

    #[test]
    fn test_wait_for_blocks_until_completion() {
        let device = Arc::new(SoftwareDevice::background());
        let queue = CommandQueue::new(device, QueueType::Copy).unwrap();
        let v = queue.increment_fence();
        queue.wait_for(v);
        assert!(queue.is_complete(v));
        queue.wait_for(v);
    }

    #[test]
    fn test_stall_for_fence_orders_queues() {
        let device = Arc::new(SoftwareDevice::deferred());
        let manager = CommandQueueManager::new(device.clone()).unwrap();

        let produced = manager.copy().increment_fence();
        manager.stall_for_fence(QueueType::Graphics, produced);
        let consumed = manager.graphics().increment_fence();

        // The graphics queue cannot run past its wait before the copy queue.
        device.step(manager.graphics().handle());
        assert!(!manager.is_fence_complete(consumed));

        device.step(manager.copy().handle());
        device.run_until_idle();
        assert!(manager.is_fence_complete(produced));
        assert!(manager.is_fence_complete(consumed));
    }

    #[test]
    fn test_stall_for_producer_without_submissions_is_satisfied() {
        let device = Arc::new(SoftwareDevice::deferred());
        let manager = CommandQueueManager::new(device.clone()).unwrap();
        manager.stall_for_producer(QueueType::Compute, QueueType::Graphics);
        let v = manager.compute().increment_fence();
        device.run_until_idle();
        assert!(manager.is_fence_complete(v));
    }

    #[test]
    fn test_request_buffer_reuses_after_completion() {
        let device = Arc::new(SoftwareDevice::immediate());
        let queue = CommandQueue::new(device.clone(), QueueType::Graphics).unwrap();
        let buffer = queue.request_buffer().unwrap();
        let fence = queue.execute_command_buffer(buffer);
        queue.discard_buffer(fence, buffer);
        assert_eq!(queue.request_buffer().unwrap(), buffer);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn test_idle_and_shutdown() {
        let device = Arc::new(SoftwareDevice::background());
        let manager = CommandQueueManager::new(device.clone()).unwrap();
        let buffer = manager.graphics().request_buffer().unwrap();
        let fence = manager.graphics().execute_command_buffer(buffer);
        manager.graphics().discard_buffer(fence, buffer);
        manager.idle_gpu();
        assert!(manager.is_fence_complete(fence));

        manager.shutdown();
        manager.shutdown();
        assert_eq!(device.live_command_buffer_count(), 0);
        assert!(device.validation_errors().is_empty());
    }
}
