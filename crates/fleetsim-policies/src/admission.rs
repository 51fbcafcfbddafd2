//! Built-in admission policies.
//!
//! Admission gates a request before any routing work happens. A rejected
//! request terminates at the control plane: it is counted and traced but
//! never reaches an instance.

use crate::traits::*;

/// Admits every request unconditionally. The default.
#[derive(Debug, Default)]
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _request: &RequestInfo, _state: &ClusterState) -> AdmissionDecision {
        AdmissionDecision {
            admitted: true,
            reason: String::new(),
        }
    }

    fn name(&self) -> &str {
        "always-admit"
    }
}

/// Rejects every request. Useful for drain scenarios and overload drills.
#[derive(Debug, Default)]
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn admit(&mut self, _request: &RequestInfo, _state: &ClusterState) -> AdmissionDecision {
        AdmissionDecision {
            admitted: false,
            reason: "reject-all".to_string(),
        }
    }

    fn name(&self) -> &str {
        "reject-all"
    }
}

/// Rate-limiting admission via a token bucket. Each request costs its
/// input token count; the bucket refills continuously at `refill_rate`
/// tokens per second of simulation time.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    current_tokens: f64,
    last_refill_us: u64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            current_tokens: capacity,
            last_refill_us: 0,
        }
    }

    /// Current bucket level, for tests and diagnostics.
    pub fn level(&self) -> f64 {
        self.current_tokens
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, request: &RequestInfo, state: &ClusterState) -> AdmissionDecision {
        let elapsed = state.clock_us.saturating_sub(self.last_refill_us);
        if elapsed > 0 {
            let refill = elapsed as f64 * self.refill_rate / 1e6;
            self.current_tokens = (self.current_tokens + refill).min(self.capacity);
            self.last_refill_us = state.clock_us;
        }
        let cost = request.input_tokens as f64;
        if self.current_tokens >= cost {
            self.current_tokens -= cost;
            AdmissionDecision {
                admitted: true,
                reason: String::new(),
            }
        } else {
            AdmissionDecision {
                admitted: false,
                reason: "insufficient tokens".to_string(),
            }
        }
    }

    fn name(&self) -> &str {
        "token-bucket"
    }
}
