//! Virtual clock for discrete-event simulation.
//!
//! [`SimClock`] tracks simulation time independently of wall-clock time,
//! advancing only when events are processed. Time is in microseconds,
//! matching the latency scales the cost model operates on.

use serde::{Deserialize, Serialize};

/// Virtual simulation clock. Monotonically non-decreasing for the
/// lifetime of a run; moving it backwards is a programming error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    current_us: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_us: 0 }
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.current_us
    }

    /// Advance the clock to a specific time.
    ///
    /// # Panics
    ///
    /// Panics if `us` is in the past; the event loops only ever hand
    /// the clock timestamps in non-decreasing order.
    pub fn advance_to_us(&mut self, us: u64) {
        assert!(
            us >= self.current_us,
            "clock moved backwards: current={}us, target={}us",
            self.current_us,
            us,
        );
        self.current_us = us;
    }

    /// Advance the clock by a duration.
    pub fn advance_by_us(&mut self, delta_us: u64) {
        self.current_us += delta_us;
    }
}
