use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};

use crate::request::QueuedRequest;
use crate::util::lock_unpoisoned;

pub(crate) mod cache;
pub(crate) mod network;

pub(crate) use cache::CacheDispatcher;
pub(crate) use network::NetworkDispatcher;

/// Priority-ordered blocking queue handing requests to dispatcher threads.
/// Ordering is priority descending, then admission sequence ascending.
/// Closing releases every blocked `take`; pending requests survive a
/// close/open cycle so a stopped queue can be restarted.
pub(crate) struct DispatchQueue {
    state: Mutex<DispatchState>,
    available: Condvar,
}

struct DispatchState {
    heap: BinaryHeap<QueueSlot>,
    closed: bool,
}

struct QueueSlot(Arc<dyn QueuedRequest>);

impl PartialEq for QueueSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueSlot {}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence first.
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.sequence().cmp(&self.0.sequence()))
    }
}

impl DispatchQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, request: Arc<dyn QueuedRequest>) {
        let mut state = lock_unpoisoned(&self.state);
        state.heap.push(QueueSlot(request));
        drop(state);
        self.available.notify_one();
    }

    /// Blocks until a request is available or the queue is closed.
    pub(crate) fn take(&self) -> Option<Arc<dyn QueuedRequest>> {
        let mut state = lock_unpoisoned(&self.state);
        loop {
            if let Some(slot) = state.heap.pop() {
                return Some(slot.0);
            }
            if state.closed {
                return None;
            }
            state = match self.available.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub(crate) fn close(&self) {
        lock_unpoisoned(&self.state).closed = true;
        self.available.notify_all();
    }

    pub(crate) fn open(&self) {
        lock_unpoisoned(&self.state).closed = false;
    }
}
