//! Metrics collection and aggregation for simulation runs.
//!
//! Per-request latency records accumulate inside each instance; at the
//! end of a run they are merged into a [`SimulationMetrics`] with
//! latency distributions, throughput, and per-instance reports. The
//! serialized layout is additive-only across versions so stored
//! baselines keep parsing.

use crate::kv_cache::KvCacheStats;
use serde::{Deserialize, Serialize};

/// Per-request completion record. Times are microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    pub request_id: u64,
    pub instance_id: u32,
    pub arrival_time_us: u64,
    pub queue_wait_us: u64,
    pub ttft_us: u64,
    pub e2e_us: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Percentile values for a latency distribution, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p90: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Per-instance summary included in the run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub id: u32,
    pub completed: u64,
    pub preemptions: u64,
    pub dropped_unservable: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub peak_queue_depth: u32,
    pub peak_batch_size: u32,
    pub busy_us: u64,
    pub events_processed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub kv: KvCacheStats,
}

/// Aggregated metrics for one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub routing_policy: String,
    pub admission_policy: String,
    /// Simulated duration: last processed event, capped at the horizon.
    pub duration_us: u64,
    pub arrivals: u64,
    pub completed_requests: u64,
    pub rejected_requests: u64,
    pub preemptions: u64,
    pub dropped_unservable: u64,
    pub offloads: u64,
    pub fetches: u64,
    pub kv_alloc_failures: u64,

    // Latency distributions (milliseconds)
    pub ttft: Percentiles,
    pub e2e: Percentiles,
    pub queue_wait: Percentiles,

    // Throughput
    pub requests_per_sec: f64,
    pub output_tokens_per_sec: f64,

    pub per_instance: Vec<InstanceReport>,
    /// All completion records, sorted by request id.
    pub per_request: Vec<RequestMetric>,
}

/// Merge instance outputs into the run-level summary.
///
/// The first `warmup_requests` completions (by arrival order) are
/// excluded from the latency distributions but kept in `per_request`.
#[allow(clippy::too_many_arguments)]
pub fn aggregate(
    routing_policy: &str,
    admission_policy: &str,
    arrivals: u64,
    rejected: u64,
    duration_us: u64,
    warmup_requests: u64,
    per_instance: Vec<InstanceReport>,
    mut per_request: Vec<RequestMetric>,
) -> SimulationMetrics {
    per_request.sort_by_key(|r| (r.arrival_time_us, r.request_id));
    let measured = if (warmup_requests as usize) < per_request.len() {
        &per_request[warmup_requests as usize..]
    } else {
        if !per_request.is_empty() {
            tracing::warn!(
                warmup_requests,
                completed = per_request.len(),
                "warmup discards every completed request; latency metrics will be zero"
            );
        }
        &[]
    };

    let to_ms = |us: u64| us as f64 / 1000.0;
    let ttft_values: Vec<f64> = measured.iter().map(|r| to_ms(r.ttft_us)).collect();
    let e2e_values: Vec<f64> = measured.iter().map(|r| to_ms(r.e2e_us)).collect();
    let wait_values: Vec<f64> = measured.iter().map(|r| to_ms(r.queue_wait_us)).collect();

    let completed: u64 = per_instance.iter().map(|r| r.completed).sum();
    let output_tokens: u64 = per_instance.iter().map(|r| r.total_output_tokens).sum();
    let duration_sec = duration_us as f64 / 1e6;

    let mut metrics = SimulationMetrics {
        routing_policy: routing_policy.to_string(),
        admission_policy: admission_policy.to_string(),
        duration_us,
        arrivals,
        completed_requests: completed,
        rejected_requests: rejected,
        preemptions: per_instance.iter().map(|r| r.preemptions).sum(),
        dropped_unservable: per_instance.iter().map(|r| r.dropped_unservable).sum(),
        offloads: per_instance.iter().map(|r| r.kv.offloads).sum(),
        fetches: per_instance.iter().map(|r| r.kv.fetches).sum(),
        kv_alloc_failures: per_instance.iter().map(|r| r.kv.alloc_failures).sum(),
        ttft: Percentiles::from_values(&ttft_values),
        e2e: Percentiles::from_values(&e2e_values),
        queue_wait: Percentiles::from_values(&wait_values),
        requests_per_sec: 0.0,
        output_tokens_per_sec: 0.0,
        per_instance,
        per_request,
    };
    if duration_sec > 0.0 {
        metrics.requests_per_sec = completed as f64 / duration_sec;
        metrics.output_tokens_per_sec = output_tokens as f64 / duration_sec;
    }
    metrics.per_request.sort_by_key(|r| r.request_id);
    metrics
}

/// Format metrics as a pretty-printed table string.
pub fn format_table(metrics: &SimulationMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<72}\n",
        format!(
            "  {} / {} Results  ",
            metrics.routing_policy, metrics.admission_policy
        )
    ));
    out.push_str(&format!(
        "  Duration: {:.3}s | Arrivals: {} | Completed: {} | Rejected: {}\n",
        metrics.duration_us as f64 / 1e6,
        metrics.arrivals,
        metrics.completed_requests,
        metrics.rejected_requests,
    ));
    out.push_str(&format!("{:-<72}\n", "  Latency (ms)  "));
    out.push_str(&format!(
        "  TTFT        P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
        metrics.ttft.p50, metrics.ttft.p90, metrics.ttft.p99
    ));
    out.push_str(&format!(
        "  E2E         P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
        metrics.e2e.p50, metrics.e2e.p90, metrics.e2e.p99
    ));
    out.push_str(&format!(
        "  Queue wait  P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
        metrics.queue_wait.p50, metrics.queue_wait.p90, metrics.queue_wait.p99
    ));
    out.push_str(&format!("{:-<72}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.2}  Output tokens/sec: {:.0}\n",
        metrics.requests_per_sec, metrics.output_tokens_per_sec,
    ));
    out.push_str(&format!("{:-<72}\n", "  Pressure  "));
    out.push_str(&format!(
        "  Preemptions: {}  Offloads: {}  Fetches: {}  Alloc failures: {}\n",
        metrics.preemptions, metrics.offloads, metrics.fetches, metrics.kv_alloc_failures,
    ));
    out.push_str(&format!("{:-<72}\n", "  Per instance  "));
    for report in &metrics.per_instance {
        out.push_str(&format!(
            "  [{}] completed={} peak_queue={} peak_batch={} kv_peak={}/{}\n",
            report.id,
            report.completed,
            report.peak_queue_depth,
            report.peak_batch_size,
            report.kv.peak_fast_used,
            report.kv.fast_capacity,
        ));
    }
    out.push_str(&format!("{:=<72}\n", ""));
    out
}

/// Format a comparison table of multiple run results.
pub fn format_comparison_table(results: &[SimulationMetrics]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }
    let mut out = String::new();
    out.push_str(&format!("\n{:=<86}\n", "  Policy Comparison  "));
    out.push_str(&format!(
        "{:<16} {:>9} {:>9} {:>9} {:>9} {:>8} {:>8} {:>8}\n",
        "Routing", "TTFT p50", "TTFT p99", "E2E p50", "E2E p99", "Req/s", "Reject", "Preempt"
    ));
    out.push_str(&format!("{:-<86}\n", ""));
    for m in results {
        out.push_str(&format!(
            "{:<16} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>8.2} {:>8} {:>8}\n",
            m.routing_policy,
            m.ttft.p50,
            m.ttft.p99,
            m.e2e.p50,
            m.e2e.p99,
            m.requests_per_sec,
            m.rejected_requests,
            m.preemptions,
        ));
    }
    out.push_str(&format!("{:=<86}\n", ""));
    out
}
