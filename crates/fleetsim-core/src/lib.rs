//! FleetSim — discrete-event simulator for LLM inference clusters.
//!
//! Models a fleet of serving instances behind a cluster control plane:
//! requests arrive, pass an admission gate and a routing decision, then
//! run to completion on their instance's continuous-batching loop,
//! consuming tiered KV cache blocks along the way. The whole simulation
//! is logically single-threaded and exactly reproducible given a seed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌─────────────────────────────┐
//! │ Workload │────▶│      Control plane          │
//! │  source  │     │ arrival ▸ admission ▸ route │──── reject (counted)
//! └──────────┘     └──────────────┬──────────────┘
//!                                 │ snapshots ▲
//!                        ┌────────┴───────┐   │ policies
//!          ┌─────────────┼────────────────┼───┴─────┐
//!          ▼             ▼                ▼         │
//!    ┌──────────┐  ┌──────────┐    ┌──────────┐    │
//!    │Instance 0│  │Instance 1│    │Instance N│────┘
//!    │ KV cache │  │ KV cache │    │ KV cache │
//!    │  batcher │  │  batcher │    │  batcher │
//!    └────┬─────┘  └────┬─────┘    └────┬─────┘
//!         └─────────────┴───────┬───────┘
//!                               ▼
//!                      ┌────────────────┐
//!                      │ Metrics, trace │
//!                      └────────────────┘
//! ```
//!
//! The coordinator merges the control-plane queue with every instance's
//! event queue and always executes the globally earliest event, giving
//! control-plane work priority at equal timestamps.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod control;
pub mod cost;
pub mod event_queue;
pub mod instance;
pub mod kv_cache;
pub mod metrics;
pub mod request;
pub mod trace;
pub mod workload;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use cluster::ClusterSim;
pub use config::{ConfigError, SimConfig};
pub use cost::{BatchFeatures, CostModel, LinearCostModel};
pub use instance::InstanceSim;
pub use kv_cache::TieredKvCache;
pub use metrics::SimulationMetrics;
pub use request::{RequestState, SimRequest};
pub use trace::SimulationTrace;
pub use workload::{generate_synthetic, load_jsonl, write_jsonl, WorkloadError};

/// A finished run: aggregated metrics plus the decision trace when
/// tracing was enabled.
pub struct SimulationRun {
    pub metrics: SimulationMetrics,
    pub trace: Option<SimulationTrace>,
}

/// Run a complete simulation with the given config and workload.
pub fn run_simulation(
    config: &SimConfig,
    requests: Vec<SimRequest>,
) -> Result<SimulationRun, ConfigError> {
    let mut cluster = ClusterSim::new(config)?;
    cluster.load_workload(requests);
    let metrics = cluster.run();
    let trace = cluster.trace().cloned();
    Ok(SimulationRun { metrics, trace })
}

/// Run the same workload under several routing policies.
pub fn compare_policies(
    config: &SimConfig,
    requests: &[SimRequest],
    routing_policies: &[&str],
) -> Result<Vec<SimulationMetrics>, ConfigError> {
    routing_policies
        .iter()
        .map(|name| {
            let mut cfg = config.clone();
            cfg.cluster.routing_policy = name.to_string();
            run_simulation(&cfg, requests.to_vec()).map(|run| run.metrics)
        })
        .collect()
}

/// Materialize the workload the config describes.
pub fn load_requests(config: &SimConfig) -> Result<Vec<SimRequest>, WorkloadError> {
    match config.workload.source.as_str() {
        "jsonl" => {
            let path = config
                .workload
                .path
                .as_ref()
                .expect("jsonl workload path validated at config load");
            load_jsonl(std::path::Path::new(path))
        }
        _ => Ok(generate_synthetic(&config.workload, config.simulation.seed)),
    }
}
