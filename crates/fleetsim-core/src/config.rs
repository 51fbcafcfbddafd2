//! TOML configuration for FleetSim runs.
//!
//! The configuration is partitioned by concern: the cache factory never
//! sees cost-model coefficients, the cost model never sees cluster
//! latencies, and so on. Every validation failure names the offending
//! field and surfaces before any simulation starts.

use crate::cost::LinearCostModel;
use crate::instance::InstanceLimits;
use crate::kv_cache::{KvCacheParams, VictimPolicy};
use crate::trace::{TraceConfig, TraceLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub simulation: SimulationSection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub instance: InstanceSection,
    #[serde(default)]
    pub kv_cache: KvCacheSection,
    #[serde(default)]
    pub cost_model: LinearCostModel,
    #[serde(default)]
    pub workload: WorkloadSection,
    #[serde(default)]
    pub trace: TraceSection,
}

/// General run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this run.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Random seed for reproducibility.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated-time cutoff in microseconds.
    #[serde(default = "default_horizon")]
    pub horizon_us: u64,
    /// Completed requests to discard from latency metrics.
    #[serde(default)]
    pub warmup_requests: u64,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}
fn default_seed() -> u64 {
    42
}
fn default_horizon() -> u64 {
    60_000_000 // 60 simulated seconds
}

/// Control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Number of serving instances.
    pub num_instances: u32,
    /// Delay between arrival and the admission decision.
    #[serde(default = "default_admission_latency")]
    pub admission_latency_us: u64,
    /// Delay between admission and the routing decision.
    #[serde(default = "default_routing_latency")]
    pub routing_latency_us: u64,
    /// Admission policy name.
    #[serde(default = "default_admission_policy")]
    pub admission_policy: String,
    /// Routing policy name.
    #[serde(default = "default_routing_policy")]
    pub routing_policy: String,
    /// Token-bucket capacity (token-bucket admission only).
    #[serde(default = "default_bucket_capacity")]
    pub token_bucket_capacity: f64,
    /// Token-bucket refill rate in tokens/second (token-bucket only).
    #[serde(default = "default_bucket_refill")]
    pub token_bucket_refill_rate: f64,
    /// Scorer names for the weighted routing policy.
    #[serde(default)]
    pub weighted_scorers: Vec<String>,
    /// Weights matching `weighted_scorers`.
    #[serde(default)]
    pub weighted_weights: Vec<f64>,
    /// Snapshot staleness tolerance: rebuild at most once per interval.
    /// 0 rebuilds for every decision.
    #[serde(default)]
    pub snapshot_refresh_interval_us: u64,
}

fn default_admission_latency() -> u64 {
    50
}
fn default_routing_latency() -> u64 {
    50
}
fn default_admission_policy() -> String {
    "always-admit".to_string()
}
fn default_routing_policy() -> String {
    "round_robin".to_string()
}
fn default_bucket_capacity() -> f64 {
    1_000_000.0
}
fn default_bucket_refill() -> f64 {
    100_000.0
}

/// Per-instance batching limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSection {
    #[serde(default = "default_max_batch_requests")]
    pub max_batch_requests: u32,
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: u32,
    /// Chunked-prefill threshold; 0 disables chunking.
    #[serde(default)]
    pub prefill_chunk_tokens: u32,
}

fn default_max_batch_requests() -> u32 {
    256
}
fn default_max_batch_tokens() -> u32 {
    8192
}

impl Default for InstanceSection {
    fn default() -> Self {
        Self {
            max_batch_requests: default_max_batch_requests(),
            max_batch_tokens: default_max_batch_tokens(),
            prefill_chunk_tokens: 0,
        }
    }
}

/// Tiered KV cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheSection {
    #[serde(default = "default_fast_blocks")]
    pub fast_blocks: u64,
    #[serde(default = "default_block_size_tokens")]
    pub block_size_tokens: u32,
    /// Slow-tier capacity; 0 disables the slow tier.
    #[serde(default)]
    pub slow_blocks: u64,
    /// Fast-tier utilization above which offload starts.
    #[serde(default = "default_offload_threshold")]
    pub offload_threshold: f64,
    /// Offload victim selection: "lru" or "priority".
    #[serde(default = "default_victim_policy")]
    pub victim_policy: String,
    /// Bytes per block, for transfer-time estimation.
    #[serde(default = "default_block_bytes")]
    pub block_bytes: u64,
    /// Fixed latency per tier migration.
    #[serde(default = "default_transfer_base_latency")]
    pub transfer_base_latency_us: u64,
    /// Tier transfer bandwidth in GB/s.
    #[serde(default = "default_transfer_bandwidth")]
    pub transfer_bandwidth_gb_s: f64,
}

fn default_fast_blocks() -> u64 {
    4096
}
fn default_block_size_tokens() -> u32 {
    16
}
fn default_offload_threshold() -> f64 {
    0.95
}
fn default_victim_policy() -> String {
    "lru".to_string()
}
fn default_block_bytes() -> u64 {
    // 16 tokens/block for an 8B-class model in fp16
    262_144
}
fn default_transfer_base_latency() -> u64 {
    500
}
fn default_transfer_bandwidth() -> f64 {
    16.0
}

impl Default for KvCacheSection {
    fn default() -> Self {
        Self {
            fast_blocks: default_fast_blocks(),
            block_size_tokens: default_block_size_tokens(),
            slow_blocks: 0,
            offload_threshold: default_offload_threshold(),
            victim_policy: default_victim_policy(),
            block_bytes: default_block_bytes(),
            transfer_base_latency_us: default_transfer_base_latency(),
            transfer_bandwidth_gb_s: default_transfer_bandwidth(),
        }
    }
}

/// Workload source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSection {
    /// "synthetic" or "jsonl".
    #[serde(default = "default_workload_source")]
    pub source: String,
    /// Request file path (jsonl source).
    pub path: Option<String>,
    /// Synthetic: mean arrival rate, requests/second.
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
    /// Synthetic: number of requests to generate.
    #[serde(default = "default_num_requests")]
    pub num_requests: u64,
    /// Synthetic: mean prompt tokens.
    #[serde(default = "default_input_mean")]
    pub input_tokens_mean: f64,
    /// Synthetic: uniform spread around the prompt mean.
    #[serde(default = "default_input_spread")]
    pub input_tokens_spread: f64,
    /// Synthetic: mean generation tokens.
    #[serde(default = "default_output_mean")]
    pub output_tokens_mean: f64,
    /// Synthetic: uniform spread around the generation mean.
    #[serde(default = "default_output_spread")]
    pub output_tokens_spread: f64,
}

fn default_workload_source() -> String {
    "synthetic".to_string()
}
fn default_rate() -> f64 {
    8.0
}
fn default_num_requests() -> u64 {
    200
}
fn default_input_mean() -> f64 {
    512.0
}
fn default_input_spread() -> f64 {
    128.0
}
fn default_output_mean() -> f64 {
    64.0
}
fn default_output_spread() -> f64 {
    16.0
}

impl Default for WorkloadSection {
    fn default() -> Self {
        Self {
            source: default_workload_source(),
            path: None,
            rate_per_sec: default_rate(),
            num_requests: default_num_requests(),
            input_tokens_mean: default_input_mean(),
            input_tokens_spread: default_input_spread(),
            output_tokens_mean: default_output_mean(),
            output_tokens_spread: default_output_spread(),
        }
    }
}

/// Decision-trace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSection {
    /// "none" or "decisions".
    #[serde(default)]
    pub level: String,
    /// Counterfactual candidates per routing decision.
    #[serde(default = "default_counterfactual_k")]
    pub counterfactual_k: usize,
}

fn default_counterfactual_k() -> usize {
    3
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            level: String::new(),
            counterfactual_k: default_counterfactual_k(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency. Fails fast, naming the field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));

        if self.cluster.num_instances == 0 {
            return fail("cluster.num_instances must be > 0".into());
        }
        if !fleetsim_policies::available_admission_policies()
            .contains(&self.cluster.admission_policy.as_str())
            && !self.cluster.admission_policy.is_empty()
        {
            return fail(format!(
                "cluster.admission_policy: unknown policy {:?}; available: {:?}",
                self.cluster.admission_policy,
                fleetsim_policies::available_admission_policies(),
            ));
        }
        if !fleetsim_policies::available_routing_policies()
            .contains(&self.cluster.routing_policy.as_str())
        {
            return fail(format!(
                "cluster.routing_policy: unknown policy {:?}; available: {:?}",
                self.cluster.routing_policy,
                fleetsim_policies::available_routing_policies(),
            ));
        }
        if self.cluster.admission_policy == "token-bucket" {
            if self.cluster.token_bucket_capacity <= 0.0 {
                return fail("cluster.token_bucket_capacity must be > 0".into());
            }
            if self.cluster.token_bucket_refill_rate < 0.0 {
                return fail("cluster.token_bucket_refill_rate must be >= 0".into());
            }
        }
        if self.cluster.routing_policy == "weighted"
            && !self.cluster.weighted_scorers.is_empty()
        {
            // Surface scorer-name and weight errors at config time
            fleetsim_policies::WeightedScoring::with_scorers(
                &self.cluster.weighted_scorers,
                &self.cluster.weighted_weights,
            )
            .map_err(|e| ConfigError::Validation(format!("cluster.weighted_scorers: {}", e)))?;
        }
        if self.instance.max_batch_requests == 0 {
            return fail("instance.max_batch_requests must be > 0".into());
        }
        if self.instance.max_batch_tokens == 0 {
            return fail("instance.max_batch_tokens must be > 0".into());
        }
        if self.kv_cache.fast_blocks == 0 {
            return fail("kv_cache.fast_blocks must be > 0".into());
        }
        if self.kv_cache.block_size_tokens == 0 {
            return fail("kv_cache.block_size_tokens must be > 0".into());
        }
        if !(self.kv_cache.offload_threshold > 0.0 && self.kv_cache.offload_threshold <= 1.0) {
            return fail("kv_cache.offload_threshold must be in (0, 1]".into());
        }
        if self.victim_policy().is_none() {
            return fail(format!(
                "kv_cache.victim_policy: unknown policy {:?}; expected \"lru\" or \"priority\"",
                self.kv_cache.victim_policy,
            ));
        }
        if self.kv_cache.slow_blocks > 0 && self.kv_cache.transfer_bandwidth_gb_s <= 0.0 {
            return fail(
                "kv_cache.transfer_bandwidth_gb_s must be > 0 when a slow tier is configured"
                    .into(),
            );
        }
        self.cost_model
            .validate()
            .map_err(ConfigError::Validation)?;
        match self.workload.source.as_str() {
            "synthetic" => {
                if self.workload.rate_per_sec <= 0.0 {
                    return fail("workload.rate_per_sec must be > 0".into());
                }
                if self.workload.input_tokens_mean < 1.0 {
                    return fail("workload.input_tokens_mean must be >= 1".into());
                }
            }
            "jsonl" => {
                if self.workload.path.is_none() {
                    return fail("workload.path is required when workload.source = \"jsonl\"".into());
                }
            }
            other => {
                return fail(format!(
                    "workload.source: unknown source {:?}; expected \"synthetic\" or \"jsonl\"",
                    other
                ));
            }
        }
        if TraceLevel::parse(&self.trace.level).is_none() {
            return fail(format!(
                "trace.level: unknown level {:?}; expected \"none\" or \"decisions\"",
                self.trace.level,
            ));
        }
        Ok(())
    }

    /// Cache parameters for one instance's allocator.
    pub fn kv_params(&self) -> KvCacheParams {
        KvCacheParams {
            fast_blocks: self.kv_cache.fast_blocks,
            block_size_tokens: self.kv_cache.block_size_tokens,
            slow_blocks: self.kv_cache.slow_blocks,
            offload_threshold: self.kv_cache.offload_threshold,
            victim_policy: self
                .victim_policy()
                .expect("victim_policy validated at load time"),
            block_bytes: self.kv_cache.block_bytes,
            transfer_base_latency_us: self.kv_cache.transfer_base_latency_us,
            transfer_bandwidth_gb_s: self.kv_cache.transfer_bandwidth_gb_s,
        }
    }

    /// Batching limits for one instance.
    pub fn instance_limits(&self) -> InstanceLimits {
        InstanceLimits {
            max_batch_requests: self.instance.max_batch_requests,
            max_batch_tokens: self.instance.max_batch_tokens,
            prefill_chunk_tokens: self.instance.prefill_chunk_tokens,
        }
    }

    /// Decision-trace settings; `None` when tracing is disabled.
    pub fn trace_config(&self) -> Option<TraceConfig> {
        match TraceLevel::parse(&self.trace.level) {
            Some(TraceLevel::None) | None => None,
            Some(level) => Some(TraceConfig {
                level,
                counterfactual_k: self.trace.counterfactual_k,
            }),
        }
    }

    fn victim_policy(&self) -> Option<VictimPolicy> {
        match self.kv_cache.victim_policy.as_str() {
            "lru" => Some(VictimPolicy::LeastRecentlyUsed),
            "priority" => Some(VictimPolicy::OwnerPriority),
            _ => None,
        }
    }
}
