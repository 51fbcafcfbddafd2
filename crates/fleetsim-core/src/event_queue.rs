//! Per-instance chronological event queue.
//!
//! A min-heap of [`InstanceEvent`]s ordered by timestamp, with an
//! insertion-sequence counter breaking ties so same-timestamp events
//! execute in FIFO order. Each instance owns exactly one queue; events
//! never cross instance boundaries.

use crate::request::TrackedRequest;
use std::collections::BinaryHeap;

/// A deferred state transition on one instance.
///
/// Handlers return the follow-up events to enqueue rather than pushing
/// into the queue recursively, which keeps the execution loop a flat,
/// testable step function.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// A routed request handed over by the control plane.
    Arrival { request: TrackedRequest },
    /// The request becomes eligible for batching after its queueing delay.
    Eligible { request_id: u64 },
    /// Trigger batch formation.
    BatchStep,
    /// The in-flight batch step finishes.
    StepComplete,
    /// A preempted request re-enters the wait queue after the
    /// preemption overhead has elapsed.
    Preemption { request_id: u64 },
}

/// Discriminant of [`InstanceEvent`], reported to the cluster
/// coordinator after each processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Arrival,
    Eligible,
    BatchStep,
    StepComplete,
    Preemption,
}

impl InstanceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InstanceEvent::Arrival { .. } => EventKind::Arrival,
            InstanceEvent::Eligible { .. } => EventKind::Eligible,
            InstanceEvent::BatchStep => EventKind::BatchStep,
            InstanceEvent::StepComplete => EventKind::StepComplete,
            InstanceEvent::Preemption { .. } => EventKind::Preemption,
        }
    }
}

/// A timestamped event with its insertion sequence.
#[derive(Debug, Clone)]
struct TimedEvent {
    time_us: u64,
    sequence: u64,
    event: InstanceEvent,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time_us == other.time_us && self.sequence == other.sequence
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse for a min-heap
        other
            .time_us
            .cmp(&self.time_us)
            .then(other.sequence.cmp(&self.sequence))
    }
}

/// Min-heap of instance events ordered by (timestamp, insertion order).
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<TimedEvent>,
    sequence: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event at a given time.
    pub fn push(&mut self, time_us: u64, event: InstanceEvent) {
        self.heap.push(TimedEvent {
            time_us,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    /// Timestamp of the earliest pending event.
    pub fn peek_time(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.time_us)
    }

    /// Remove and return the earliest event.
    ///
    /// # Panics
    ///
    /// Panics on an empty queue. Callers check [`Self::peek_time`]
    /// first; popping empty is a programming error, not a runtime
    /// condition.
    pub fn pop(&mut self) -> (u64, InstanceEvent) {
        let timed = self.heap.pop().expect("pop from empty event queue");
        (timed.time_us, timed.event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
