//! Request model.
//!
//! [`SimRequest`] is the workload-facing description of one inference
//! call; [`TrackedRequest`] wraps it with the lifecycle state and
//! progress bookkeeping the control plane and instance loops mutate as
//! the request moves through the system.

use serde::{Deserialize, Serialize};

/// A single request as described by the workload source.
///
/// Output length is pre-specified: the simulation knows in advance how
/// many tokens each request will generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimRequest {
    /// Unique request identifier.
    pub id: u64,
    /// Arrival time at the cluster, in simulation microseconds.
    pub arrival_time_us: u64,
    /// Prompt length in tokens.
    pub input_tokens: u32,
    /// Generation length in tokens.
    pub output_tokens: u32,
    /// Priority hint (0.0 = unset). A routing decision may overwrite it;
    /// it informs preemption victim selection but not queue ordering.
    #[serde(default)]
    pub priority: f64,
}

/// Lifecycle of a request. Terminal states are `Completed` and
/// `Rejected`; a preempted request goes back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// In the control-plane pipeline or in an instance's wait queue.
    Queued,
    /// Passed admission, awaiting a routing decision.
    Admitted,
    /// Assigned a target instance, not yet absorbed into its queue.
    Routed,
    /// Member of a running batch.
    Running,
    /// All output tokens generated.
    Completed,
    /// Refused by the admission policy. Counted, never routed.
    Rejected,
}

/// A request plus the mutable state the simulator tracks for it.
///
/// Owned by exactly one component at a time: a control-plane event, an
/// instance's wait queue, or an instance's running batch. After a
/// terminal state it survives only inside metrics records.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub request: SimRequest,
    pub state: RequestState,
    /// Prompt tokens processed so far (prefill progress).
    pub progress_tokens: u32,
    /// Output tokens generated so far. The first output token is
    /// produced by the step that completes the prefill.
    pub generated_tokens: u32,
    /// Tokens assigned to this request in the step being executed.
    pub num_new_tokens: u32,
    /// When the routing decision handed this request to an instance.
    pub routed_time_us: Option<u64>,
    /// When the request entered the instance wait queue.
    pub enqueue_time_us: Option<u64>,
    /// When the request first joined a running batch.
    pub first_sched_time_us: Option<u64>,
    /// When the first output token was produced.
    pub first_token_time_us: Option<u64>,
}

impl TrackedRequest {
    pub fn new(request: SimRequest) -> Self {
        Self {
            request,
            state: RequestState::Queued,
            progress_tokens: 0,
            generated_tokens: 0,
            num_new_tokens: 0,
            routed_time_us: None,
            enqueue_time_us: None,
            first_sched_time_us: None,
            first_token_time_us: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.request.id
    }

    /// Prompt tokens still to process.
    pub fn remaining_prefill(&self) -> u32 {
        self.request.input_tokens.saturating_sub(self.progress_tokens)
    }

    pub fn prefill_done(&self) -> bool {
        self.progress_tokens >= self.request.input_tokens
    }

    /// Tokens whose cache blocks this request currently needs.
    pub fn tokens_covered(&self) -> u32 {
        self.progress_tokens + self.generated_tokens
    }

    /// A request with zero output tokens still produces the single token
    /// that marks prefill completion, so the floor is one.
    pub fn target_output_tokens(&self) -> u32 {
        self.request.output_tokens.max(1)
    }

    pub fn is_complete(&self) -> bool {
        self.prefill_done() && self.generated_tokens >= self.target_output_tokens()
    }

    /// Reset progress after a destructive preemption: cache blocks are
    /// gone, so prefill restarts from scratch.
    pub fn reset_progress(&mut self) {
        self.progress_tokens = 0;
        self.generated_tokens = 0;
        self.num_new_tokens = 0;
        self.state = RequestState::Queued;
    }

    /// Time to first token relative to cluster arrival.
    pub fn ttft_us(&self) -> Option<u64> {
        self.first_token_time_us
            .map(|t| t.saturating_sub(self.request.arrival_time_us))
    }
}
