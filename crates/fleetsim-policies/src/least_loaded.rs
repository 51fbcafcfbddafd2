//! Least-loaded routing policy.

use crate::traits::*;

/// Routes each request to the instance with the minimum effective load
/// (queue depth + running batch size + routed-but-not-queued requests).
///
/// Counting routed-but-not-queued requests matters at high arrival rates:
/// many routing decisions can land at one timestamp before any instance
/// event runs, and without it they would all pile onto the same target.
/// Ties are broken by the first occurrence in snapshot order.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, _request: &RequestInfo, state: &ClusterState) -> RouteDecision {
        assert!(
            !state.snapshots.is_empty(),
            "LeastLoaded::route called with empty snapshot set"
        );
        let mut target = &state.snapshots[0];
        let mut min_load = target.effective_load();
        for snap in &state.snapshots[1..] {
            let load = snap.effective_load();
            if load < min_load {
                min_load = load;
                target = snap;
            }
        }
        RouteDecision::to_instance(target.id, format!("least-loaded (load={})", min_load))
    }

    fn name(&self) -> &str {
        "least_loaded"
    }
}
