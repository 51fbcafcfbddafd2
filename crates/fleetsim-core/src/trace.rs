//! Decision tracing for control-plane policy analysis.
//!
//! An append-only log of admission and routing decisions, with optional
//! counterfactual analysis of routing choices (the top-k alternatives
//! and the regret against the best-scoring one). Purely observational:
//! nothing here is ever read back by the simulation. When the level is
//! `none` no trace object exists at all, so the cost is zero.

use fleetsim_policies::InstanceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Verbosity of decision tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    /// No tracing (zero overhead).
    #[default]
    None,
    /// Record every admission and routing decision.
    Decisions,
}

impl TraceLevel {
    /// Parse a config string; empty defaults to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "none" => Some(TraceLevel::None),
            "decisions" => Some(TraceLevel::Decisions),
            _ => None,
        }
    }
}

/// Trace collection settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraceConfig {
    pub level: TraceLevel,
    /// Counterfactual candidates recorded per routing decision.
    pub counterfactual_k: usize,
}

/// One admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub request_id: u64,
    pub clock_us: u64,
    pub admitted: bool,
    pub reason: String,
}

/// A counterfactual candidate: an instance the router could have chosen,
/// with its score and the state that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub instance_id: u32,
    pub score: f64,
    pub queue_depth: u32,
    pub batch_size: u32,
    pub pending_requests: u32,
    pub kv_utilization: f64,
    pub free_blocks: u64,
}

/// One routing decision with optional counterfactual analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub request_id: u64,
    pub clock_us: u64,
    pub chosen_instance: u32,
    pub reason: String,
    /// Instance id -> composite score; `None` for unscored policies.
    /// Ordered map so serialized traces are byte-stable.
    pub scores: Option<BTreeMap<u32, f64>>,
    /// Top-k candidates sorted by score descending; empty when k = 0.
    pub candidates: Vec<CandidateScore>,
    /// Best alternative score minus the chosen score; 0 when the chosen
    /// instance scores maximal. Never negative.
    pub regret: f64,
}

/// Append-only decision log for one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationTrace {
    pub config: TraceConfig,
    pub admissions: Vec<AdmissionRecord>,
    pub routings: Vec<RoutingRecord>,
}

impl SimulationTrace {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            admissions: Vec::new(),
            routings: Vec::new(),
        }
    }

    pub fn record_admission(&mut self, record: AdmissionRecord) {
        self.admissions.push(record);
    }

    pub fn record_routing(&mut self, record: RoutingRecord) {
        self.routings.push(record);
    }
}

/// Aggregate statistics over a [`SimulationTrace`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_decisions: usize,
    pub admitted_count: usize,
    pub rejected_count: usize,
    pub mean_regret: f64,
    pub max_regret: f64,
    pub unique_targets: usize,
    /// Instance id -> count of requests routed there.
    pub target_distribution: BTreeMap<u32, usize>,
}

/// Compute aggregate statistics. Safe for empty traces.
pub fn summarize(trace: &SimulationTrace) -> TraceSummary {
    let mut summary = TraceSummary {
        total_decisions: trace.admissions.len(),
        ..TraceSummary::default()
    };
    for admission in &trace.admissions {
        if admission.admitted {
            summary.admitted_count += 1;
        } else {
            summary.rejected_count += 1;
        }
    }
    if !trace.routings.is_empty() {
        let mut total_regret = 0.0;
        for routing in &trace.routings {
            *summary
                .target_distribution
                .entry(routing.chosen_instance)
                .or_insert(0) += 1;
            total_regret += routing.regret;
            if routing.regret > summary.max_regret {
                summary.max_regret = routing.regret;
            }
        }
        summary.mean_regret = total_regret / trace.routings.len() as f64;
    }
    summary.unique_targets = summary.target_distribution.len();
    summary
}

/// Rank the candidate instances for one routing decision and compute the
/// regret of the choice.
///
/// With policy scores, candidates rank by those scores. Without them
/// (round-robin, least-loaded), a synthetic load-based score is used:
/// the negated effective load, so lighter instances rank higher. Ties
/// break by instance id ascending for determinism. Returns the top-k
/// candidates (score descending) and the regret, which is >= 0 and zero
/// exactly when the chosen instance's score is maximal.
pub fn compute_counterfactual(
    chosen: u32,
    scores: Option<&HashMap<u32, f64>>,
    snapshots: &[InstanceSnapshot],
    k: usize,
) -> (Vec<CandidateScore>, f64) {
    if k == 0 || snapshots.is_empty() {
        return (Vec::new(), 0.0);
    }

    let mut ranked: Vec<(f64, &InstanceSnapshot)> = snapshots
        .iter()
        .map(|snap| {
            let score = match scores {
                Some(map) => map.get(&snap.id).copied().unwrap_or(0.0),
                None => -(snap.effective_load() as f64),
            };
            (score, snap)
        })
        .collect();

    let chosen_score = match ranked.iter().find(|(_, snap)| snap.id == chosen) {
        Some((score, _)) => *score,
        // Chosen instance missing from the snapshot set: the coordinator
        // validated the target, so this only happens in hand-built tests.
        None => return (Vec::new(), 0.0),
    };

    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.id.cmp(&b.1.id))
    });

    let candidates: Vec<CandidateScore> = ranked
        .iter()
        .take(k)
        .map(|(score, snap)| CandidateScore {
            instance_id: snap.id,
            score: *score,
            queue_depth: snap.queue_depth,
            batch_size: snap.batch_size,
            pending_requests: snap.pending_requests,
            kv_utilization: snap.kv_utilization,
            free_blocks: snap.free_blocks,
        })
        .collect();

    let regret = (ranked[0].0 - chosen_score).max(0.0);
    (candidates, regret)
}
