//! Weighted-scoring routing policy with a composable scorer pipeline.
//!
//! Each scorer rates every instance on a [0, 1] scale; composite score is
//! the weight-normalized sum of clamped scorer outputs, and the argmax
//! wins. The per-instance scores are returned in the decision so the
//! trace layer can run counterfactual analysis over them.

use crate::traits::*;
use std::collections::HashMap;

/// A scorer maps the snapshot set to per-instance scores in [0, 1].
type ScorerFn = fn(&[InstanceSnapshot]) -> HashMap<u32, f64>;

/// Min-max normalization of effective load: the least-loaded instance
/// scores 1.0, the most-loaded 0.0. Uniform load scores everyone 1.0.
fn score_queue_depth(snapshots: &[InstanceSnapshot]) -> HashMap<u32, f64> {
    let loads: Vec<u32> = snapshots.iter().map(|s| s.effective_load()).collect();
    let min = *loads.iter().min().unwrap_or(&0);
    let max = *loads.iter().max().unwrap_or(&0);
    snapshots
        .iter()
        .zip(&loads)
        .map(|(s, &load)| {
            let score = if max == min {
                1.0
            } else {
                1.0 - (load - min) as f64 / (max - min) as f64
            };
            (s.id, score)
        })
        .collect()
}

/// Free cache headroom: 1 - fast-tier utilization.
fn score_kv_utilization(snapshots: &[InstanceSnapshot]) -> HashMap<u32, f64> {
    snapshots
        .iter()
        .map(|s| (s.id, 1.0 - s.kv_utilization))
        .collect()
}

/// Inverse absolute load: 1 / (1 + effective load).
fn score_load_balance(snapshots: &[InstanceSnapshot]) -> HashMap<u32, f64> {
    snapshots
        .iter()
        .map(|s| (s.id, 1.0 / (1.0 + s.effective_load() as f64)))
        .collect()
}

fn scorer_by_name(name: &str) -> Option<ScorerFn> {
    match name {
        "queue-depth" => Some(score_queue_depth),
        "kv-utilization" => Some(score_kv_utilization),
        "load-balance" => Some(score_load_balance),
        _ => None,
    }
}

/// Scorer names accepted by [`WeightedScoring::with_scorers`].
pub fn available_scorers() -> Vec<&'static str> {
    vec!["queue-depth", "kv-utilization", "load-balance"]
}

/// Composite-score router. See the module docs for the scoring formula.
#[derive(Debug)]
pub struct WeightedScoring {
    scorers: Vec<ScorerFn>,
    weights: Vec<f64>,
    names: Vec<String>,
}

impl WeightedScoring {
    /// Equal-weight pipeline over all available scorers.
    pub fn new() -> Self {
        let names: Vec<String> = available_scorers().iter().map(|s| s.to_string()).collect();
        let weights = vec![1.0; names.len()];
        Self::with_scorers(&names, &weights).expect("built-in scorer names are valid")
    }

    /// Builds a pipeline from scorer names and weights. Weights are
    /// normalized to sum to 1.0. Fails on unknown names, length mismatch,
    /// or non-positive total weight.
    pub fn with_scorers(names: &[String], weights: &[f64]) -> Result<Self, String> {
        if names.is_empty() {
            return Err("weighted scoring requires at least one scorer".to_string());
        }
        if names.len() != weights.len() {
            return Err(format!(
                "scorer/weight length mismatch: {} scorers, {} weights",
                names.len(),
                weights.len()
            ));
        }
        let mut scorers = Vec::with_capacity(names.len());
        for name in names {
            match scorer_by_name(name) {
                Some(f) => scorers.push(f),
                None => {
                    return Err(format!(
                        "unknown scorer {:?}; available: {:?}",
                        name,
                        available_scorers()
                    ))
                }
            }
        }
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) || weights.iter().any(|w| *w < 0.0) {
            return Err("scorer weights must be non-negative with a positive sum".to_string());
        }
        let weights = weights.iter().map(|w| w / total).collect();
        Ok(Self {
            scorers,
            weights,
            names: names.to_vec(),
        })
    }

    /// Names of the scorers in this pipeline, in evaluation order.
    pub fn scorer_names(&self) -> &[String] {
        &self.names
    }
}

impl Default for WeightedScoring {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for WeightedScoring {
    fn route(&mut self, _request: &RequestInfo, state: &ClusterState) -> RouteDecision {
        assert!(
            !state.snapshots.is_empty(),
            "WeightedScoring::route called with empty snapshot set"
        );

        let mut scores: HashMap<u32, f64> = HashMap::with_capacity(state.snapshots.len());
        for (scorer, weight) in self.scorers.iter().zip(&self.weights) {
            let dim_scores = scorer(&state.snapshots);
            for snap in &state.snapshots {
                let s = dim_scores.get(&snap.id).copied().unwrap_or(0.0);
                *scores.entry(snap.id).or_insert(0.0) += s.clamp(0.0, 1.0) * weight;
            }
        }

        // Argmax over snapshot order; strict > keeps ties at the lowest index.
        let mut best_score = f64::NEG_INFINITY;
        let mut best_id = state.snapshots[0].id;
        for snap in &state.snapshots {
            let s = scores[&snap.id];
            if s > best_score {
                best_score = s;
                best_id = snap.id;
            }
        }

        RouteDecision {
            target: best_id,
            reason: format!("weighted (score={:.3})", best_score),
            scores: Some(scores),
            priority: 0.0,
        }
    }

    fn name(&self) -> &str {
        "weighted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{make_request, make_snapshots};

    #[test]
    fn test_prefers_idle_instance() {
        let mut snapshots = make_snapshots(3);
        snapshots[0].queue_depth = 10;
        snapshots[0].kv_utilization = 0.9;
        snapshots[2].queue_depth = 10;
        snapshots[2].kv_utilization = 0.9;
        let state = ClusterState {
            snapshots,
            clock_us: 0,
        };
        let mut policy = WeightedScoring::new();
        let decision = policy.route(&make_request(0), &state);
        assert_eq!(decision.target, 1);
        let scores = decision.scores.expect("weighted policy reports scores");
        assert!(scores[&1] > scores[&0]);
    }

    #[test]
    fn test_scores_clamped_to_unit_interval() {
        let state = ClusterState {
            snapshots: make_snapshots(4),
            clock_us: 0,
        };
        let mut policy = WeightedScoring::new();
        let decision = policy.route(&make_request(0), &state);
        for (_, score) in decision.scores.unwrap() {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_unknown_scorer_rejected() {
        let err = WeightedScoring::with_scorers(&["bogus".to_string()], &[1.0]).unwrap_err();
        assert!(err.contains("unknown scorer"));
    }

    #[test]
    fn test_mismatched_weights_rejected() {
        let names = vec!["queue-depth".to_string(), "load-balance".to_string()];
        assert!(WeightedScoring::with_scorers(&names, &[1.0]).is_err());
    }

    #[test]
    fn test_weights_normalized() {
        let names = vec!["queue-depth".to_string(), "load-balance".to_string()];
        let policy = WeightedScoring::with_scorers(&names, &[3.0, 1.0]).unwrap();
        let total: f64 = policy.weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_go_to_first() {
        let state = ClusterState {
            snapshots: make_snapshots(4),
            clock_us: 0,
        };
        let mut policy = WeightedScoring::new();
        assert_eq!(policy.route(&make_request(0), &state).target, 0);
    }
}
