//! Queue-qualified fence values.
//!
//! A fence value is a point on one queue's monotonic timeline. Internally it
//! is kept as an explicit `(queue, counter)` pair; the packed 64-bit form with
//! the queue id in the top byte only exists at API boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bits reserved for the per-queue counter in the packed form.
pub const FENCE_COUNTER_BITS: u32 = 56;

const COUNTER_MASK: u64 = (1 << FENCE_COUNTER_BITS) - 1;

/// Hardware submission channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueueType {
    /// Graphics queue: accepts draws, dispatches and copies.
    Graphics,
    /// Async compute queue: dispatches and copies.
    Compute,
    /// Copy queue: transfers only.
    Copy,
}

impl QueueType {
    /// All queue types, in index order.
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    /// Number of queue types.
    pub const COUNT: usize = 3;

    /// Dense index for per-queue arrays.
    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    /// Queue id stored in the high byte of a packed fence value.
    fn id(self) -> u64 {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 2,
            QueueType::Copy => 3,
        }
    }

    fn from_id(id: u64) -> Option<Self> {
        match id {
            0 => Some(QueueType::Graphics),
            2 => Some(QueueType::Compute),
            3 => Some(QueueType::Copy),
            _ => None,
        }
    }

    /// Human-readable name used in logs and debug labels.
    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A point on a queue's fence timeline.
///
/// Ordering is only meaningful between values of the same queue: a later
/// value never completes before an earlier one. The derived `Ord` sorts by
/// queue first and is only used to keep values in deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue {
    queue: QueueType,
    counter: u64,
}

impl FenceValue {
    /// Creates a fence value for `queue`.
    ///
    /// Panics if `counter` does not fit into the packed representation.
    pub fn new(queue: QueueType, counter: u64) -> Self {
        assert!(counter <= COUNTER_MASK, "fence counter overflow: {counter}");
        Self { queue, counter }
    }

    /// The value that is complete before any work was submitted.
    pub fn initial(queue: QueueType) -> Self {
        Self { queue, counter: 0 }
    }

    /// The queue this value belongs to.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// The per-queue counter (the value actually signalled on the device fence).
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Returns true if `self` is at or before `other` on the same queue.
    pub fn is_at_or_before(&self, other: FenceValue) -> bool {
        debug_assert_eq!(self.queue, other.queue, "comparing fences of different queues");
        self.counter <= other.counter
    }

    /// Packs the value as `queue_id << 56 | counter`.
    pub fn to_raw(&self) -> u64 {
        (self.queue.id() << FENCE_COUNTER_BITS) | self.counter
    }

    /// Unpacks a value produced by [`FenceValue::to_raw`].
    pub fn from_raw(raw: u64) -> Option<Self> {
        let queue = QueueType::from_id(raw >> FENCE_COUNTER_BITS)?;
        Some(Self {
            queue,
            counter: raw & COUNTER_MASK,
        })
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queue, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip_keeps_queue_identity() {
        for queue in QueueType::ALL {
            let value = FenceValue::new(queue, 42);
            let raw = value.to_raw();
            assert_eq!(FenceValue::from_raw(raw), Some(value));
            assert_eq!(raw & COUNTER_MASK, 42);
        }
    }

    #[test]
    fn test_raw_queue_ids_are_distinct() {
        let graphics = FenceValue::new(QueueType::Graphics, 1).to_raw();
        let compute = FenceValue::new(QueueType::Compute, 1).to_raw();
        let copy = FenceValue::new(QueueType::Copy, 1).to_raw();
        assert_eq!(graphics, 1);
        assert_eq!(compute >> FENCE_COUNTER_BITS, 2);
        assert_eq!(copy >> FENCE_COUNTER_BITS, 3);
    }

    #[test]
    fn test_from_raw_rejects_unknown_queue() {
        assert!(FenceValue::from_raw(1u64 << FENCE_COUNTER_BITS).is_none());
    }

    #[test]
    fn test_same_queue_ordering() {
        let early = FenceValue::new(QueueType::Copy, 3);
        let late = FenceValue::new(QueueType::Copy, 9);
        assert!(early.is_at_or_before(late));
        assert!(!late.is_at_or_before(early));
        assert!(early.is_at_or_before(early));
    }
}
