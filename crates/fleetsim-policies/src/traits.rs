//! Decision-policy trait definitions.
//!
//! The cluster control plane consults an [`AdmissionPolicy`] and a
//! [`RoutingPolicy`] for every request. Policies see the cluster only
//! through immutable [`InstanceSnapshot`] values, never live simulator
//! state, so a policy cannot corrupt the simulation while observing it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only, point-in-time view of one instance's externally observable
/// state, provided to admission and routing policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance identifier.
    pub id: u32,
    /// Number of requests waiting in the instance's queue.
    pub queue_depth: u32,
    /// Number of requests in the running batch.
    pub batch_size: u32,
    /// Fast-tier cache utilization (0.0 - 1.0).
    pub kv_utilization: f64,
    /// Free fast-tier cache blocks.
    pub free_blocks: u64,
    /// Requests routed to this instance but not yet absorbed into its queue.
    /// Prevents pile-on when many routing decisions land at one timestamp.
    pub pending_requests: u32,
}

impl InstanceSnapshot {
    /// Total effective load: queued + running + routed-but-not-queued.
    pub fn effective_load(&self) -> u32 {
        self.queue_depth + self.batch_size + self.pending_requests
    }
}

/// Cluster-wide state handed to a policy for one decision: the snapshot
/// set plus the control-plane clock. Built once per decision and never
/// re-sampled mid-decision.
#[derive(Debug, Clone)]
pub struct ClusterState {
    /// One snapshot per instance, in instance-id order.
    pub snapshots: Vec<InstanceSnapshot>,
    /// Current simulation clock in microseconds.
    pub clock_us: u64,
}

/// The policy-facing view of an incoming request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub priority: f64,
}

/// Outcome of an admission decision.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub admitted: bool,
    /// Human-readable explanation, recorded in the decision trace.
    pub reason: String,
}

/// Outcome of a routing decision.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Instance to route to. Must name an instance present in the
    /// snapshot set; an unknown id is a broken policy contract.
    pub target: u32,
    /// Human-readable explanation, recorded in the decision trace.
    pub reason: String,
    /// Instance id -> composite score, for policies that score candidates.
    /// `None` for policies without scoring (round-robin, least-loaded).
    pub scores: Option<HashMap<u32, f64>>,
    /// One-shot priority hint applied to the request before injection.
    /// Zero (the default) leaves the request's priority untouched.
    pub priority: f64,
}

impl RouteDecision {
    /// Plain decision with no scores and no priority hint.
    pub fn to_instance(target: u32, reason: String) -> Self {
        Self {
            target,
            reason,
            scores: None,
            priority: 0.0,
        }
    }
}

/// Gate that accepts or rejects a request before routing.
///
/// Implementations may keep encapsulated internal state (token-bucket
/// levels, cursors); that state is the policy's own, not cluster state.
pub trait AdmissionPolicy: Send {
    fn admit(&mut self, request: &RequestInfo, state: &ClusterState) -> AdmissionDecision;

    /// Human-readable name for reports.
    fn name(&self) -> &str;
}

/// Selects the target instance for an admitted request.
pub trait RoutingPolicy: Send {
    fn route(&mut self, request: &RequestInfo, state: &ClusterState) -> RouteDecision;

    /// Human-readable name for reports.
    fn name(&self) -> &str;
}
