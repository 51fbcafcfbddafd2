//! Built-in decision policies for FleetSim.
//!
//! This crate provides the [`AdmissionPolicy`] and [`RoutingPolicy`]
//! contracts consumed by the cluster control plane, plus the built-in
//! implementations:
//!
//! | Policy | Kind | Strategy |
//! |--------|------|----------|
//! | [`AlwaysAdmit`] | admission | Admit everything (default) |
//! | [`RejectAll`] | admission | Reject everything |
//! | [`TokenBucket`] | admission | Rate-limit by input tokens |
//! | [`RoundRobin`] | routing | Cycle through instances |
//! | [`LeastLoaded`] | routing | Minimize queue + batch + pending |
//! | [`WeightedScoring`] | routing | Composite scorer pipeline |
//!
//! Policies never see live simulator state, only [`InstanceSnapshot`]
//! values and the clock. New strategies are added by implementing the
//! contract and registering a name here, not by touching the coordinator.

pub mod admission;
pub mod least_loaded;
pub mod round_robin;
pub mod traits;
pub mod weighted;

pub use admission::{AlwaysAdmit, RejectAll, TokenBucket};
pub use least_loaded::LeastLoaded;
pub use round_robin::RoundRobin;
pub use traits::*;
pub use weighted::{available_scorers, WeightedScoring};

/// Create an admission policy by name. `capacity` and `refill_rate`
/// configure the token bucket and are ignored by the other policies.
/// An empty name defaults to always-admit.
pub fn admission_policy_by_name(
    name: &str,
    capacity: f64,
    refill_rate: f64,
) -> Option<Box<dyn AdmissionPolicy>> {
    match name {
        "" | "always-admit" => Some(Box::new(AlwaysAdmit)),
        "reject-all" => Some(Box::new(RejectAll)),
        "token-bucket" => Some(Box::new(TokenBucket::new(capacity, refill_rate))),
        _ => None,
    }
}

/// Create a routing policy by name. `weighted` gets an equal-weight
/// pipeline over all scorers; use [`WeightedScoring::with_scorers`] for
/// a configured pipeline.
pub fn routing_policy_by_name(name: &str) -> Option<Box<dyn RoutingPolicy>> {
    match name {
        "round_robin" => Some(Box::new(RoundRobin::new())),
        "least_loaded" => Some(Box::new(LeastLoaded::new())),
        "weighted" => Some(Box::new(WeightedScoring::new())),
        _ => None,
    }
}

/// List all built-in admission policy names.
pub fn available_admission_policies() -> Vec<&'static str> {
    vec!["always-admit", "reject-all", "token-bucket"]
}

/// List all built-in routing policy names.
pub fn available_routing_policies() -> Vec<&'static str> {
    vec!["round_robin", "least_loaded", "weighted"]
}
