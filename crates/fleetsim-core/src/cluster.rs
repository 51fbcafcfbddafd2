//! Cluster coordinator: N instances behind a shared clock, with a
//! control-plane pipeline in front of them.
//!
//! Every request passes arrival -> admission -> routing at the control
//! plane before its instance ever sees it. The coordinator runs a merged
//! event loop over the control-plane queue and all instance queues,
//! always executing the globally earliest event, preferring the
//! control-plane event when timestamps are equal, so that placement
//! decisions (including zero-latency decision chains) fully drain before
//! any instance work at the same instant.

use crate::clock::SimClock;
use crate::config::{ConfigError, SimConfig};
use crate::control::{ControlEvent, ControlPlaneQueue, ControlStage};
use crate::event_queue::EventKind;
use crate::instance::InstanceSim;
use crate::metrics::{self, InstanceReport, RequestMetric, SimulationMetrics};
use crate::request::{RequestState, SimRequest, TrackedRequest};
use crate::trace::{compute_counterfactual, AdmissionRecord, RoutingRecord, SimulationTrace};
use fleetsim_policies::{
    AdmissionPolicy, ClusterState, InstanceSnapshot, RequestInfo, RoutingPolicy, WeightedScoring,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds snapshot sets for decision policies, honoring the configured
/// staleness tolerance: the set is rebuilt at most once per refresh
/// interval (0 = rebuilt per decision) and one decision always sees a
/// single consistent set, never a mid-decision re-sample.
struct SnapshotProvider {
    refresh_interval_us: u64,
    last_built_us: Option<u64>,
    cached: Vec<InstanceSnapshot>,
}

impl SnapshotProvider {
    fn new(refresh_interval_us: u64) -> Self {
        Self {
            refresh_interval_us,
            last_built_us: None,
            cached: Vec::new(),
        }
    }

    fn state(
        &mut self,
        now_us: u64,
        instances: &[InstanceSim],
        pending_routed: &[u32],
    ) -> ClusterState {
        let stale = match self.last_built_us {
            None => true,
            Some(last) => {
                self.refresh_interval_us == 0
                    || now_us.saturating_sub(last) >= self.refresh_interval_us
            }
        };
        if stale {
            self.cached = instances
                .iter()
                .zip(pending_routed)
                .map(|(inst, &pending)| inst.snapshot(pending))
                .collect();
            self.last_built_us = Some(now_us);
        }
        ClusterState {
            snapshots: self.cached.clone(),
            clock_us: now_us,
        }
    }
}

/// The cluster simulator: control plane plus data-plane instances.
pub struct ClusterSim {
    clock: SimClock,
    horizon_us: u64,
    control: ControlPlaneQueue,
    instances: Vec<InstanceSim>,
    admission: Box<dyn AdmissionPolicy>,
    routing: Box<dyn RoutingPolicy>,
    admission_latency_us: u64,
    routing_latency_us: u64,
    snapshots: SnapshotProvider,
    /// Per-instance count of routed-but-not-yet-queued requests.
    pending_routed: Vec<u32>,
    trace: Option<SimulationTrace>,
    warmup_requests: u64,
    arrivals: u64,
    rejected: u64,
    routed: u64,
    has_run: bool,
}

impl ClusterSim {
    /// Build a cluster from a validated configuration. Policy and cost
    /// factories each consume only their own config sub-group.
    pub fn new(config: &SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let admission = fleetsim_policies::admission_policy_by_name(
            &config.cluster.admission_policy,
            config.cluster.token_bucket_capacity,
            config.cluster.token_bucket_refill_rate,
        )
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "unknown admission policy {:?}",
                config.cluster.admission_policy
            ))
        })?;

        let routing: Box<dyn RoutingPolicy> = if config.cluster.routing_policy == "weighted"
            && !config.cluster.weighted_scorers.is_empty()
        {
            Box::new(
                WeightedScoring::with_scorers(
                    &config.cluster.weighted_scorers,
                    &config.cluster.weighted_weights,
                )
                .map_err(ConfigError::Validation)?,
            )
        } else {
            fleetsim_policies::routing_policy_by_name(&config.cluster.routing_policy).ok_or_else(
                || {
                    ConfigError::Validation(format!(
                        "unknown routing policy {:?}",
                        config.cluster.routing_policy
                    ))
                },
            )?
        };

        let cost = Arc::new(config.cost_model.clone());
        let instances: Vec<InstanceSim> = (0..config.cluster.num_instances)
            .map(|id| {
                InstanceSim::new(
                    id,
                    config.instance_limits(),
                    config.kv_params(),
                    cost.clone(),
                )
            })
            .collect();

        let pipeline_latency = config.cluster.admission_latency_us + config.cluster.routing_latency_us;
        if config.simulation.horizon_us < pipeline_latency {
            warn!(
                horizon_us = config.simulation.horizon_us,
                pipeline_latency_us = pipeline_latency,
                "horizon is shorter than the decision pipeline; no request can complete"
            );
        }

        Ok(Self {
            clock: SimClock::new(),
            horizon_us: config.simulation.horizon_us,
            control: ControlPlaneQueue::new(),
            pending_routed: vec![0; instances.len()],
            instances,
            admission,
            routing,
            admission_latency_us: config.cluster.admission_latency_us,
            routing_latency_us: config.cluster.routing_latency_us,
            snapshots: SnapshotProvider::new(config.cluster.snapshot_refresh_interval_us),
            trace: config.trace_config().map(SimulationTrace::new),
            warmup_requests: config.simulation.warmup_requests,
            arrivals: 0,
            rejected: 0,
            routed: 0,
            has_run: false,
        })
    }

    /// Schedule the workload's arrival events. No request is dispatched
    /// before the event loop runs.
    pub fn load_workload(&mut self, requests: Vec<SimRequest>) {
        for request in requests {
            let time_us = request.arrival_time_us;
            self.control.push(ControlEvent {
                time_us,
                stage: ControlStage::Arrival,
                request: TrackedRequest::new(request),
            });
            self.arrivals += 1;
        }
    }

    /// Run the merged event loop to exhaustion or past the horizon,
    /// then aggregate metrics.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn run(&mut self) -> SimulationMetrics {
        assert!(!self.has_run, "ClusterSim::run called more than once");
        self.has_run = true;

        loop {
            let control_time = self.control.peek_time();
            let mut instance_next: Option<(u64, usize)> = None;
            for (idx, instance) in self.instances.iter().enumerate() {
                if let Some(t) = instance.peek_time() {
                    if instance_next.map_or(true, |(best, _)| t < best) {
                        instance_next = Some((t, idx));
                    }
                }
            }

            // Control-plane work at time T runs before instance work at
            // time T: <= keeps decisions ahead of their consequences.
            let control_first = match (control_time, instance_next) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(ct), Some((it, _))) => ct <= it,
            };

            if control_first {
                let ct = control_time.expect("control event selected");
                if ct > self.horizon_us {
                    break;
                }
                self.clock.advance_to_us(ct);
                let event = self.control.pop();
                self.execute_control(event);
            } else {
                let (t, idx) = instance_next.expect("instance event selected");
                if t > self.horizon_us {
                    break;
                }
                self.clock.advance_to_us(t);
                let (_, kind) = self.instances[idx].process_next();
                // The eligible transition is the moment a routed request
                // is absorbed into the instance queue.
                if kind == EventKind::Eligible {
                    if self.pending_routed[idx] > 0 {
                        self.pending_routed[idx] -= 1;
                    } else {
                        debug!(instance = idx, "eligible event with no pending route");
                    }
                }
            }
        }

        for instance in &mut self.instances {
            instance.finalize();
        }

        let completed: u64 = self.instances.iter().map(|i| i.metrics().completed).sum();
        if completed == 0 && self.arrivals > 0 {
            if self.rejected == self.arrivals {
                warn!(
                    rejected = self.rejected,
                    "every request was rejected at admission; nothing completed"
                );
            } else {
                warn!("no request completed; the horizon may be too short for this workload");
            }
        }

        self.aggregate()
    }

    /// Count of requests rejected by the admission policy.
    pub fn rejected_requests(&self) -> u64 {
        self.rejected
    }

    /// Count of requests handed to instances by routing decisions.
    pub fn routed_requests(&self) -> u64 {
        self.routed
    }

    pub fn arrivals(&self) -> u64 {
        self.arrivals
    }

    pub fn clock_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// The decision trace, if tracing was enabled.
    pub fn trace(&self) -> Option<&SimulationTrace> {
        self.trace.as_ref()
    }

    pub fn instances(&self) -> &[InstanceSim] {
        &self.instances
    }

    fn execute_control(&mut self, event: ControlEvent) {
        match event.stage {
            ControlStage::Arrival => {
                debug!(request = event.request.id(), clock_us = event.time_us, "arrival");
                self.control.push(ControlEvent {
                    time_us: event.time_us + self.admission_latency_us,
                    stage: ControlStage::Admission,
                    request: event.request,
                });
            }
            ControlStage::Admission => {
                let mut request = event.request;
                let state =
                    self.snapshots
                        .state(event.time_us, &self.instances, &self.pending_routed);
                let info = request_info(&request);
                let decision = self.admission.admit(&info, &state);
                if let Some(trace) = self.trace.as_mut() {
                    trace.record_admission(AdmissionRecord {
                        request_id: request.id(),
                        clock_us: event.time_us,
                        admitted: decision.admitted,
                        reason: decision.reason.clone(),
                    });
                }
                if decision.admitted {
                    request.state = RequestState::Admitted;
                    self.control.push(ControlEvent {
                        time_us: event.time_us + self.routing_latency_us,
                        stage: ControlStage::Routing,
                        request,
                    });
                } else {
                    request.state = RequestState::Rejected;
                    self.rejected += 1;
                    debug!(
                        request = request.id(),
                        reason = %decision.reason,
                        "rejected at admission"
                    );
                }
            }
            ControlStage::Routing => {
                let mut request = event.request;
                let state =
                    self.snapshots
                        .state(event.time_us, &self.instances, &self.pending_routed);
                let info = request_info(&request);
                let decision = self.routing.route(&info, &state);
                let target = decision.target as usize;
                // A target outside the cluster is a broken policy
                // contract, not a runtime condition.
                assert!(
                    target < self.instances.len(),
                    "routing policy chose unknown instance {} (cluster has {})",
                    decision.target,
                    self.instances.len(),
                );
                if let Some(trace) = self.trace.as_mut() {
                    let (candidates, regret) = compute_counterfactual(
                        decision.target,
                        decision.scores.as_ref(),
                        &state.snapshots,
                        trace.config.counterfactual_k,
                    );
                    trace.record_routing(RoutingRecord {
                        request_id: request.id(),
                        clock_us: event.time_us,
                        chosen_instance: decision.target,
                        reason: decision.reason.clone(),
                        scores: decision
                            .scores
                            .as_ref()
                            .map(|m| m.iter().map(|(k, v)| (*k, *v)).collect()),
                        candidates,
                        regret,
                    });
                }
                if decision.priority != 0.0 {
                    request.request.priority = decision.priority;
                }
                request.state = RequestState::Routed;
                request.routed_time_us = Some(event.time_us);
                self.routed += 1;
                self.pending_routed[target] += 1;
                // Handed over at the control-plane clock; the original
                // arrival time stays on the request for latency metrics.
                self.instances[target].inject(request, event.time_us);
            }
        }
    }

    fn aggregate(&self) -> SimulationMetrics {
        let reports: Vec<InstanceReport> = self
            .instances
            .iter()
            .map(|instance| {
                let m = instance.metrics();
                InstanceReport {
                    id: instance.id(),
                    completed: m.completed,
                    preemptions: m.preemptions,
                    dropped_unservable: m.dropped_unservable,
                    total_input_tokens: m.total_input_tokens,
                    total_output_tokens: m.total_output_tokens,
                    peak_queue_depth: m.peak_queue_depth,
                    peak_batch_size: m.peak_batch_size,
                    busy_us: m.busy_us,
                    events_processed: m.events_processed,
                    still_queued: m.still_queued,
                    still_running: m.still_running,
                    kv: instance.kv_stats(),
                }
            })
            .collect();
        let per_request: Vec<RequestMetric> = self
            .instances
            .iter()
            .flat_map(|instance| instance.metrics().records.iter().cloned())
            .collect();
        metrics::aggregate(
            self.routing.name(),
            self.admission.name(),
            self.arrivals,
            self.rejected,
            self.clock.now_us().min(self.horizon_us),
            self.warmup_requests,
            reports,
            per_request,
        )
    }
}

fn request_info(request: &TrackedRequest) -> RequestInfo {
    RequestInfo {
        id: request.id(),
        input_tokens: request.request.input_tokens,
        output_tokens: request.request.output_tokens,
        priority: request.request.priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> SimConfig {
        SimConfig::from_str(&format!(
            r#"
[simulation]
name = "cluster-test"
seed = 7
horizon_us = 60000000

[cluster]
num_instances = 2
admission_latency_us = 0
routing_latency_us = 0

[cost_model]
fixed_step_us = 100.0
prefill_us_per_token = 0.0
decode_us_per_token = 0.0
per_prefill_request_us = 0.0
queueing_us = 0.0
output_token_us = 0.0
scheduling_us = 0.0
preemption_us = 0.0
{extra}
"#
        ))
        .unwrap()
    }

    fn simultaneous_requests(n: u64) -> Vec<SimRequest> {
        (0..n)
            .map(|id| SimRequest {
                id,
                arrival_time_us: 0,
                input_tokens: 32,
                output_tokens: 4,
                priority: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_alternates_targets() {
        let config = config("[trace]\nlevel = \"decisions\"");
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.load_workload(simultaneous_requests(10));
        let metrics = cluster.run();

        assert_eq!(metrics.completed_requests, 10);
        let trace = cluster.trace().unwrap();
        for record in &trace.routings {
            assert_eq!(record.chosen_instance, (record.request_id % 2) as u32);
        }
    }

    #[test]
    fn test_reject_all_short_circuits_instances() {
        let mut config = config("");
        config.cluster.admission_policy = "reject-all".to_string();
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.load_workload(simultaneous_requests(10));
        let metrics = cluster.run();

        assert_eq!(metrics.rejected_requests, 10);
        assert_eq!(metrics.completed_requests, 0);
        assert_eq!(cluster.routed_requests(), 0);
        for report in &metrics.per_instance {
            assert_eq!(report.events_processed, 0);
        }
    }

    #[test]
    fn test_routing_plus_rejections_equal_arrivals() {
        let mut config = config("");
        config.cluster.admission_policy = "token-bucket".to_string();
        config.cluster.token_bucket_capacity = 100.0;
        config.cluster.token_bucket_refill_rate = 0.0;
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.load_workload(simultaneous_requests(10));
        cluster.run();

        assert_eq!(
            cluster.routed_requests() + cluster.rejected_requests(),
            cluster.arrivals()
        );
        // 32-token requests against a 100-token bucket: only 3 admitted
        assert_eq!(cluster.routed_requests(), 3);
    }

    #[test]
    fn test_horizon_stops_processing() {
        let mut config = config("");
        config.simulation.horizon_us = 50;
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.load_workload(vec![SimRequest {
            id: 0,
            arrival_time_us: 100, // beyond the horizon
            input_tokens: 32,
            output_tokens: 4,
            priority: 0.0,
        }]);
        let metrics = cluster.run();
        assert_eq!(metrics.completed_requests, 0);
        assert!(metrics.duration_us <= 50);
    }

    #[test]
    fn test_snapshot_refresh_interval_caches() {
        let mut config = config("");
        config.cluster.snapshot_refresh_interval_us = 1_000_000;
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.load_workload(simultaneous_requests(4));
        let metrics = cluster.run();
        // Cached snapshots change decision inputs, never correctness
        assert_eq!(metrics.completed_requests, 4);
    }

    #[test]
    fn test_priority_hint_applied_before_injection() {
        struct PinWithPriority;
        impl RoutingPolicy for PinWithPriority {
            fn route(&mut self, _request: &RequestInfo, _state: &ClusterState) -> fleetsim_policies::RouteDecision {
                fleetsim_policies::RouteDecision {
                    target: 0,
                    reason: "pinned".into(),
                    scores: None,
                    priority: 7.5,
                }
            }
            fn name(&self) -> &str {
                "pin-with-priority"
            }
        }

        let config = config("");
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.routing = Box::new(PinWithPriority);
        cluster.load_workload(simultaneous_requests(2));
        let metrics = cluster.run();
        assert_eq!(metrics.per_instance[0].completed, 2);
        assert_eq!(metrics.per_instance[1].completed, 0);
    }

    #[test]
    #[should_panic(expected = "run called more than once")]
    fn test_run_twice_panics() {
        let config = config("");
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.run();
        cluster.run();
    }

    #[test]
    #[should_panic(expected = "unknown instance")]
    fn test_unknown_routing_target_is_fatal() {
        struct Wild;
        impl RoutingPolicy for Wild {
            fn route(&mut self, _request: &RequestInfo, _state: &ClusterState) -> fleetsim_policies::RouteDecision {
                fleetsim_policies::RouteDecision::to_instance(99, "wild".into())
            }
            fn name(&self) -> &str {
                "wild"
            }
        }
        let config = config("");
        let mut cluster = ClusterSim::new(&config).unwrap();
        cluster.routing = Box::new(Wild);
        cluster.load_workload(simultaneous_requests(1));
        cluster.run();
    }
}
