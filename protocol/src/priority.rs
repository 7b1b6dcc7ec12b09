//! Bounded worker slots handed out by priority.
//!
//! A free slot goes to the highest-priority waiter; equal priorities are
//! served in arrival order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug)]
struct GateState {
    available: usize,
    next_seq: u64,
    waiting: BinaryHeap<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    priority: f64,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Admission control point in front of the handler stage.
#[derive(Debug, Clone)]
pub struct PriorityGate {
    state: Arc<Mutex<GateState>>,
    slots: usize,
}

impl PriorityGate {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            state: Arc::new(Mutex::new(GateState {
                available: slots,
                next_seq: 0,
                waiting: BinaryHeap::new(),
            })),
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        lock(&self.state).available
    }

    /// Requests queued behind busy slots
    pub fn pending(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    /// Wait for a slot. Dropping the returned future before it resolves
    /// gives up the place in the queue without leaking a slot.
    pub async fn acquire(&self, priority: f64) -> GatePermit {
        let rx = {
            let mut state = lock(&self.state);
            if state.available > 0 && state.waiting.is_empty() {
                state.available -= 1;
                return GatePermit {
                    state: self.state.clone(),
                };
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(Waiter {
                priority,
                seq,
                wake: tx,
            });
            rx
        };

        let mut pending = PendingSlot {
            rx: Some(rx),
            state: self.state.clone(),
        };
        if let Some(rx) = pending.rx.as_mut() {
            // The sender only disappears together with the gate state, which
            // `pending` keeps alive, so this always resolves to Ok.
            let _ = rx.await;
        }
        pending.rx = None;
        GatePermit {
            state: self.state.clone(),
        }
    }
}

/// A held worker slot; released on drop.
#[derive(Debug)]
pub struct GatePermit {
    state: Arc<Mutex<GateState>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        release(&self.state);
    }
}

struct PendingSlot {
    rx: Option<oneshot::Receiver<()>>,
    state: Arc<Mutex<GateState>>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            // A slot was handed over after all; pass it on
            if rx.try_recv().is_ok() {
                release(&self.state);
            }
        }
    }
}

fn release(state: &Mutex<GateState>) {
    let mut state = lock(state);
    while let Some(waiter) = state.waiting.pop() {
        if waiter.wake.send(()).is_ok() {
            return;
        }
    }
    state.available += 1;
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
