//! Idle recording contexts.

use std::collections::VecDeque;

use ember_core::QueueType;
use parking_lot::Mutex;

use crate::context::ContextState;

#[derive(Default)]
struct ContextPoolInner {
    available: [VecDeque<ContextState>; QueueType::COUNT],
    created: [usize; QueueType::COUNT],
}

/// Finished contexts waiting to be leased again, one FIFO per queue type.
#[derive(Default)]
pub struct ContextPool {
    inner: Mutex<ContextPoolInner>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the oldest idle context of `queue_type`.
    pub(crate) fn acquire(&self, queue_type: QueueType) -> Option<ContextState> {
        self.inner.lock().available[queue_type.index()].pop_front()
    }

    /// Counts a newly built context and returns how many exist for its type.
    pub(crate) fn note_created(&self, queue_type: QueueType) -> usize {
        let mut inner = self.inner.lock();
        inner.created[queue_type.index()] += 1;
        inner.created[queue_type.index()]
    }

    pub(crate) fn release(&self, state: ContextState) {
        let index = state.queue_type().index();
        self.inner.lock().available[index].push_back(state);
    }

    /// Idle contexts of `queue_type`.
    pub fn available(&self, queue_type: QueueType) -> usize {
        self.inner.lock().available[queue_type.index()].len()
    }

    /// Contexts ever built for `queue_type`.
    pub fn created(&self, queue_type: QueueType) -> usize {
        self.inner.lock().created[queue_type.index()]
    }

    /// Drops every idle context.
    pub(crate) fn destroy_all(&self) {
        let drained: Vec<ContextState> = {
            let mut inner = self.inner.lock();
            inner.available.iter_mut().flat_map(|queue| queue.drain(..)).collect()
        };
        tracing::debug!("Destroyed {} pooled contexts", drained.len());
    }
}
