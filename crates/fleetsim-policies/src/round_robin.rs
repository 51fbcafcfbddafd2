//! Round-robin routing policy.
//!
//! The simplest placement strategy: cycles through instances in id order,
//! ignoring their state. Good fairness on uniform workloads; blind to
//! queue depth and cache pressure.

use crate::traits::*;

/// Round-robin router. Keeps a cursor over the snapshot set; the cursor
/// is policy-internal state, not cluster state.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: u64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, _request: &RequestInfo, state: &ClusterState) -> RouteDecision {
        assert!(
            !state.snapshots.is_empty(),
            "RoundRobin::route called with empty snapshot set"
        );
        let idx = (self.counter as usize) % state.snapshots.len();
        let target = state.snapshots[idx].id;
        self.counter += 1;
        RouteDecision::to_instance(target, format!("round-robin[{}]", self.counter - 1))
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}
