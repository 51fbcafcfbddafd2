//! Integration tests for the cluster coordinator: end-to-end latency,
//! placement, ordering, and accounting.

use fleetsim_core::config::SimConfig;
use fleetsim_core::{ClusterSim, SimRequest};

fn request(id: u64, arrival_time_us: u64, input_tokens: u32, output_tokens: u32) -> SimRequest {
    SimRequest {
        id,
        arrival_time_us,
        input_tokens,
        output_tokens,
        priority: 0.0,
    }
}

#[test]
fn test_single_request_latency_is_exact() {
    // Every latency component is configured explicitly; the recorded
    // end-to-end latency must match their sum to the microsecond.
    let config = SimConfig::from_str(
        r#"
[simulation]
name = "exact-latency"
horizon_us = 60000000

[cluster]
num_instances = 1
admission_latency_us = 100
routing_latency_us = 200

[kv_cache]
fast_blocks = 1024
block_size_tokens = 16

[cost_model]
fixed_step_us = 1000.0
prefill_us_per_token = 10.0
decode_us_per_token = 50.0
per_prefill_request_us = 25.0
queueing_us = 300.0
output_token_us = 5.0
scheduling_us = 7.0
preemption_us = 0.0
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload(vec![request(0, 0, 64, 4)]);
    let metrics = cluster.run();

    assert_eq!(metrics.completed_requests, 1);
    let record = &metrics.per_request[0];

    // Pipeline: admission 100 + routing 200 + queueing 300 = 600.
    // Prefill step: 1000 + 10*64 + 25 + scheduling 7 = 1672; TTFT at 2272.
    let expected_ttft = 100 + 200 + 300 + 1000 + 10 * 64 + 25 + 7;
    assert_eq!(record.ttft_us, expected_ttft);

    // Three decode steps of 1000 + 50 + 5 each complete the request.
    let expected_e2e = expected_ttft + 3 * (1000 + 50 + 5);
    assert_eq!(record.e2e_us, expected_e2e);
    assert_eq!(record.queue_wait_us, 0);
}

#[test]
fn test_round_robin_interleaves_simultaneous_arrivals() {
    // Ten requests at t=0 with zero decision latency: the stage-ranked
    // control queue drains all arrivals, then all admissions, then all
    // routings in insertion order, so round-robin alternates cleanly.
    let config = SimConfig::from_str(
        r#"
[simulation]
horizon_us = 60000000

[cluster]
num_instances = 2
admission_latency_us = 0
routing_latency_us = 0
routing_policy = "round_robin"

[cost_model]
fixed_step_us = 100.0
prefill_us_per_token = 0.0
decode_us_per_token = 0.0
per_prefill_request_us = 0.0
queueing_us = 0.0
output_token_us = 0.0
scheduling_us = 0.0
preemption_us = 0.0
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload((0..10).map(|id| request(id, 0, 32, 2)).collect());
    let metrics = cluster.run();

    assert_eq!(metrics.completed_requests, 10);
    for record in &metrics.per_request {
        assert_eq!(
            record.instance_id,
            (record.request_id % 2) as u32,
            "request {} landed on instance {}",
            record.request_id,
            record.instance_id
        );
    }
}

#[test]
fn test_control_plane_wins_timestamp_ties() {
    // Request 0 finishes its last step at t=200. Request 1 arrives at
    // exactly t=200 with a zero-latency decision chain. The control
    // plane must fully drain first, so request 1's routing decision
    // still sees request 0 inside the running batch.
    let config = SimConfig::from_str(
        r#"
[simulation]
horizon_us = 60000000

[cluster]
num_instances = 1
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

[trace]
level = "decisions"
counterfactual_k = 1
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    // Prefill step completes at 100, the single decode step at 200.
    cluster.load_workload(vec![request(0, 0, 16, 2), request(1, 200, 16, 2)]);
    let metrics = cluster.run();
    assert_eq!(metrics.completed_requests, 2);

    let trace = cluster.trace().unwrap();
    let second_route = trace
        .routings
        .iter()
        .find(|r| r.request_id == 1)
        .expect("request 1 was routed");
    assert_eq!(second_route.clock_us, 200);
    assert_eq!(
        second_route.candidates[0].batch_size, 1,
        "routing at t=200 must observe the step that completes at t=200 as still pending"
    );
}

#[test]
fn test_tight_cache_queues_third_request() {
    // Two one-block requests arrive together and run immediately; a
    // third arriving just after waits until a block frees, then runs.
    let config = SimConfig::from_str(
        r#"
[simulation]
horizon_us = 60000000

[cluster]
num_instances = 1
admission_latency_us = 0
routing_latency_us = 0

[kv_cache]
fast_blocks = 2
block_size_tokens = 16

[cost_model]
fixed_step_us = 100.0
prefill_us_per_token = 0.0
decode_us_per_token = 0.0
per_prefill_request_us = 0.0
queueing_us = 0.0
output_token_us = 0.0
scheduling_us = 0.0
preemption_us = 0.0
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload(vec![
        request(0, 0, 8, 4),
        request(1, 0, 8, 4),
        request(2, 10, 8, 4),
    ]);
    let metrics = cluster.run();

    assert_eq!(metrics.completed_requests, 3);
    let by_id = |id: u64| {
        metrics
            .per_request
            .iter()
            .find(|r| r.request_id == id)
            .unwrap()
    };
    // First two share four 100us steps (prefill + 3 decodes).
    assert_eq!(by_id(0).e2e_us, 400);
    assert_eq!(by_id(1).e2e_us, 400);
    // The third waits from t=10 until the release at t=400.
    assert_eq!(by_id(2).queue_wait_us, 390);
    assert_eq!(by_id(2).e2e_us, 790);
}

#[test]
fn test_reject_all_never_reaches_instances() {
    let config = SimConfig::from_str(
        r#"
[simulation]
horizon_us = 60000000

[cluster]
num_instances = 3
admission_policy = "reject-all"

[trace]
level = "decisions"
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload((0..25).map(|id| request(id, id * 100, 64, 8)).collect());
    let metrics = cluster.run();

    assert_eq!(metrics.rejected_requests, 25);
    assert_eq!(metrics.rejected_requests, cluster.arrivals());
    assert_eq!(metrics.completed_requests, 0);
    assert_eq!(cluster.routed_requests(), 0);
    for report in &metrics.per_instance {
        assert_eq!(report.events_processed, 0, "instance {} saw events", report.id);
    }
    let trace = cluster.trace().unwrap();
    assert_eq!(trace.admissions.len(), 25);
    assert!(trace.routings.is_empty());
}

#[test]
fn test_routing_plus_rejections_account_for_every_arrival() {
    let config = SimConfig::from_str(
        r#"
[simulation]
horizon_us = 60000000

[cluster]
num_instances = 2
admission_policy = "token-bucket"
token_bucket_capacity = 300.0
token_bucket_refill_rate = 0.0
"#,
    )
    .unwrap();

    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload((0..20).map(|id| request(id, id * 50, 64, 8)).collect());
    cluster.run();

    assert_eq!(cluster.arrivals(), 20);
    assert_eq!(
        cluster.routed_requests() + cluster.rejected_requests(),
        cluster.arrivals(),
        "no request may silently disappear at the control plane"
    );
    // 64-token requests against a non-refilling 300-token bucket
    assert_eq!(cluster.routed_requests(), 4);
}

#[test]
fn test_every_routed_request_is_accounted_on_its_instance() {
    // Under heavy contention every routed request must end the run
    // completed, dropped, or still held by its instance; the totals add
    // up with nothing lost.
    let config = SimConfig::from_str(
        r#"
[simulation]
seed = 11
horizon_us = 600000000

[cluster]
num_instances = 2
routing_policy = "least_loaded"

[instance]
max_batch_requests = 8

[kv_cache]
fast_blocks = 32
block_size_tokens = 16

[workload]
source = "synthetic"
rate_per_sec = 500.0
num_requests = 150
input_tokens_mean = 128.0
input_tokens_spread = 64.0
output_tokens_mean = 32.0
output_tokens_spread = 16.0
"#,
    )
    .unwrap();

    let requests = fleetsim_core::load_requests(&config).unwrap();
    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload(requests);
    let metrics = cluster.run();

    let accounted: u64 = metrics
        .per_instance
        .iter()
        .map(|r| r.completed + r.dropped_unservable + r.still_queued + r.still_running)
        .sum();
    assert_eq!(accounted, cluster.routed_requests());
}
