//! Virtual timer queue owned by the dispatcher.
//!
//! Timers are kept in a min-heap keyed by absolute deadline, with a sequence
//! number breaking ties so that two timers due at the same instant fire in
//! the order they were armed. Discards are lazy: the heap entry stays behind
//! and is skipped once its id no longer appears in the armed set. The heap is
//! rebuilt once stale entries outnumber armed timers, so timers re-armed far
//! in the future do not pile up.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
};

use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::{NodeId, TimerId};

/// A timer waiting in the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTimer {
    deadline: Instant,
    sequence: u64,
    id: TimerId,
}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap; reverse both keys so the earliest deadline,
        // then the earliest armed, sits on top.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// An armed timer: who owns it and where its firing goes.
#[derive(Debug)]
pub(crate) struct ArmedTimer {
    pub(crate) node: NodeId,
    pub(crate) deadline: Instant,
    pub(crate) fire: watch::Sender<Option<Instant>>,
}

/// Deadline-ordered set of armed timers.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<ScheduledTimer>,
    armed: HashMap<TimerId, ArmedTimer>,
    next_sequence: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm a timer. Re-arming an id that is still armed replaces it.
    pub(crate) fn arm(
        &mut self,
        id: TimerId,
        node: NodeId,
        deadline: Instant,
        fire: watch::Sender<Option<Instant>>,
    ) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(ScheduledTimer {
            deadline,
            sequence,
            id,
        });
        self.armed.insert(
            id,
            ArmedTimer {
                node,
                deadline,
                fire,
            },
        );
    }

    /// Remove a timer that has not fired yet. Returns whether it was armed.
    pub(crate) fn discard(&mut self, id: TimerId) -> bool {
        let was_armed = self.armed.remove(&id).is_some();
        self.compact();
        was_armed
    }

    /// Earliest deadline among armed timers, dropping stale heap heads.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            match self.armed.get(&head.id) {
                Some(armed) if armed.deadline == head.deadline => return Some(head.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every armed timer whose deadline is at or before `now`, in firing order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, ArmedTimer)> {
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Some(head) = self.heap.pop() else {
                break;
            };
            let still_armed = self
                .armed
                .get(&head.id)
                .is_some_and(|armed| armed.deadline == head.deadline);
            if still_armed {
                if let Some(armed) = self.armed.remove(&head.id) {
                    due.push((head.id, armed));
                }
            }
        }
        due
    }

    /// Drop every timer anchored to `node`. Waiters observe a closed channel.
    pub(crate) fn drop_node(&mut self, node: NodeId) -> usize {
        let before = self.armed.len();
        self.armed.retain(|_, armed| armed.node != node);
        self.compact();
        before - self.armed.len()
    }

    /// Drop stale heap entries once they outnumber the armed timers.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.armed.len() {
            return;
        }
        let armed = &self.armed;
        self.heap.retain(|entry| {
            armed
                .get(&entry.id)
                .is_some_and(|timer| timer.deadline == entry.deadline)
        });
    }

    /// Drop everything.
    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.armed.clear();
    }

    /// Number of armed timers.
    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }
}
