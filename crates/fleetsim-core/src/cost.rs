//! Cost oracle: execution-time estimates for the instance step loop.
//!
//! The instance loop treats the oracle as an opaque, stateless function
//! from batch composition to durations. All estimates are in the same
//! microsecond unit as the simulation clock.

use crate::request::SimRequest;
use serde::{Deserialize, Serialize};

/// Composition of one batch step, as seen by the cost oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchFeatures {
    /// Requests receiving prefill tokens this step.
    pub num_prefill: u32,
    /// Requests receiving a decode token this step.
    pub num_decode: u32,
    /// Total prefill tokens scheduled this step.
    pub total_prefill_tokens: u32,
    /// Total decode tokens scheduled this step.
    pub total_decode_tokens: u32,
    /// Largest single-request prefill chunk this step.
    pub max_prefill_tokens: u32,
}

/// Estimates step and overhead durations for the instance loop.
/// Implementations are stateless and side-effect-free from the loop's
/// perspective.
pub trait CostModel: Send + Sync {
    /// Duration of one batch step with the given composition.
    fn step_time_us(&self, features: &BatchFeatures) -> u64;

    /// Arrival-to-queue delay for a request.
    fn queueing_time_us(&self, request: &SimRequest) -> u64;

    /// Per-token post-processing overhead.
    fn output_token_overhead_us(&self) -> u64;

    /// Scheduling overhead per newly batched request.
    fn scheduling_overhead_us(&self) -> u64;

    /// Overhead per preemption eviction.
    fn preemption_overhead_us(&self) -> u64;
}

/// Linear cost model over batch features.
///
/// `step = fixed + prefill_per_token * total_prefill
///        + decode_per_token * total_decode
///        + per_prefill_request * num_prefill`
///
/// Coefficients come from the `[cost_model]` configuration section and
/// are validated at construction: malformed sets never reach a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearCostModel {
    pub fixed_step_us: f64,
    pub prefill_us_per_token: f64,
    pub decode_us_per_token: f64,
    pub per_prefill_request_us: f64,
    pub queueing_us: f64,
    pub output_token_us: f64,
    pub scheduling_us: f64,
    pub preemption_us: f64,
}

impl LinearCostModel {
    /// Validates that every coefficient is finite and non-negative.
    /// Returns the offending field name on failure.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("fixed_step_us", self.fixed_step_us),
            ("prefill_us_per_token", self.prefill_us_per_token),
            ("decode_us_per_token", self.decode_us_per_token),
            ("per_prefill_request_us", self.per_prefill_request_us),
            ("queueing_us", self.queueing_us),
            ("output_token_us", self.output_token_us),
            ("scheduling_us", self.scheduling_us),
            ("preemption_us", self.preemption_us),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(format!(
                    "cost_model.{} must be finite and >= 0, got {}",
                    name, value
                ));
            }
        }
        Ok(())
    }
}

impl Default for LinearCostModel {
    fn default() -> Self {
        // Roughly H100-class single-GPU serving of a mid-size model.
        Self {
            fixed_step_us: 1_000.0,
            prefill_us_per_token: 20.0,
            decode_us_per_token: 150.0,
            per_prefill_request_us: 50.0,
            queueing_us: 500.0,
            output_token_us: 5.0,
            scheduling_us: 100.0,
            preemption_us: 200.0,
        }
    }
}

impl CostModel for LinearCostModel {
    fn step_time_us(&self, features: &BatchFeatures) -> u64 {
        let total = self.fixed_step_us
            + self.prefill_us_per_token * features.total_prefill_tokens as f64
            + self.decode_us_per_token * features.total_decode_tokens as f64
            + self.per_prefill_request_us * features.num_prefill as f64;
        total.round() as u64
    }

    fn queueing_time_us(&self, _request: &SimRequest) -> u64 {
        self.queueing_us.round() as u64
    }

    fn output_token_overhead_us(&self) -> u64 {
        self.output_token_us.round() as u64
    }

    fn scheduling_overhead_us(&self) -> u64 {
        self.scheduling_us.round() as u64
    }

    fn preemption_overhead_us(&self) -> u64 {
        self.preemption_us.round() as u64
    }
}
