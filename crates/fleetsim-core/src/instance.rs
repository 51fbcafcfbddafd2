//! Per-instance execution loop.
//!
//! An [`InstanceSim`] owns one chronological event queue, one tiered KV
//! cache, a FIFO wait queue, and the running batch. It advances strictly
//! by popping the earliest event, applying the transition, and enqueueing
//! whatever follow-up events the handler returns. The cluster coordinator
//! drives it one event at a time so that control-plane work at a given
//! instant always lands first.
//!
//! Batch formation follows the continuous-batching shape: continuing
//! requests first (chunked prefill or one decode token each), then FCFS
//! admission from the wait queue, bounded by a max concurrent-request
//! count and a per-step token budget. Capacity pressure is resolved by
//! preempting the lowest-priority running request, or, when a slow cache
//! tier is configured, by offloading a victim's blocks and suspending it
//! until they are fetched back.

use crate::clock::SimClock;
use crate::cost::{BatchFeatures, CostModel};
use crate::event_queue::{EventKind, EventQueue, InstanceEvent};
use crate::kv_cache::{KvCacheParams, KvCacheStats, TieredKvCache};
use crate::metrics::RequestMetric;
use crate::request::{RequestState, TrackedRequest};
use fleetsim_policies::InstanceSnapshot;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Batching limits for one instance.
#[derive(Debug, Clone)]
pub struct InstanceLimits {
    /// Maximum requests in the running batch.
    pub max_batch_requests: u32,
    /// Maximum new tokens scheduled per step.
    pub max_batch_tokens: u32,
    /// Chunked-prefill threshold; 0 disables chunking.
    pub prefill_chunk_tokens: u32,
}

/// Counters and per-request records accumulated by one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceMetrics {
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
    pub records: Vec<RequestMetric>,
}

/// Outcome of one batch-formation pass.
struct Formation {
    features: BatchFeatures,
    newly_scheduled: u32,
    preempted: Vec<u64>,
}

/// One simulated serving instance.
pub struct InstanceSim {
    id: u32,
    clock: SimClock,
    events: EventQueue,
    kv: TieredKvCache,
    /// Requests waiting to be batched, FCFS.
    wait_queue: VecDeque<TrackedRequest>,
    /// The running batch, in scheduling order.
    running: Vec<TrackedRequest>,
    /// Requests between events: arrived but not yet eligible, or evicted
    /// and awaiting their preemption re-entry.
    pending: HashMap<u64, TrackedRequest>,
    step_in_flight: bool,
    step_scheduled: bool,
    limits: InstanceLimits,
    cost: Arc<dyn CostModel>,
    metrics: InstanceMetrics,
}

impl InstanceSim {
    pub fn new(
        id: u32,
        limits: InstanceLimits,
        kv_params: KvCacheParams,
        cost: Arc<dyn CostModel>,
    ) -> Self {
        Self {
            id,
            clock: SimClock::new(),
            events: EventQueue::new(),
            kv: TieredKvCache::new(kv_params),
            wait_queue: VecDeque::new(),
            running: Vec::new(),
            pending: HashMap::new(),
            step_in_flight: false,
            step_scheduled: false,
            limits,
            cost,
            metrics: InstanceMetrics::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hand a routed request to this instance at the current cluster
    /// clock. The original arrival time stays on the request for
    /// latency metrics.
    pub fn inject(&mut self, request: TrackedRequest, now_us: u64) {
        self.events.push(now_us, InstanceEvent::Arrival { request });
    }

    /// Timestamp of this instance's earliest pending event.
    pub fn peek_time(&self) -> Option<u64> {
        self.events.peek_time()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Pop and execute the earliest event, pushing any follow-up events
    /// the handler returns. Returns the event's timestamp and kind.
    pub fn process_next(&mut self) -> (u64, EventKind) {
        let (time_us, event) = self.events.pop();
        self.clock.advance_to_us(time_us);
        let kind = event.kind();
        let follow_ups = match event {
            InstanceEvent::Arrival { request } => self.handle_arrival(request, time_us),
            InstanceEvent::Eligible { request_id } => self.handle_eligible(request_id, time_us),
            InstanceEvent::BatchStep => self.handle_batch_step(time_us),
            InstanceEvent::StepComplete => self.handle_step_complete(time_us),
            InstanceEvent::Preemption { request_id } => {
                self.handle_preemption(request_id, time_us)
            }
        };
        for (t, e) in follow_ups {
            self.events.push(t, e);
        }
        self.metrics.events_processed += 1;
        (time_us, kind)
    }

    /// Point-in-time value copy of observable state for decision
    /// policies. `pending_routed` is maintained by the coordinator.
    pub fn snapshot(&self, pending_routed: u32) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            queue_depth: self.wait_queue.len() as u32,
            batch_size: self.running.len() as u32,
            kv_utilization: self.kv.utilization(),
            free_blocks: self.kv.free_fast_blocks(),
            pending_requests: pending_routed,
        }
    }

    pub fn metrics(&self) -> &InstanceMetrics {
        &self.metrics
    }

    pub fn kv_stats(&self) -> KvCacheStats {
        self.kv.stats()
    }

    /// Record what never finished, called once after the run ends.
    pub fn finalize(&mut self) {
        self.metrics.still_queued = (self.wait_queue.len() + self.pending.len()) as u64;
        self.metrics.still_running = self.running.len() as u64;
    }

    // --- Event handlers. Each returns the follow-up events to enqueue. ---

    fn handle_arrival(
        &mut self,
        request: TrackedRequest,
        now_us: u64,
    ) -> Vec<(u64, InstanceEvent)> {
        let delay = self.cost.queueing_time_us(&request.request);
        let request_id = request.id();
        self.pending.insert(request_id, request);
        vec![(now_us + delay, InstanceEvent::Eligible { request_id })]
    }

    fn handle_eligible(&mut self, request_id: u64, now_us: u64) -> Vec<(u64, InstanceEvent)> {
        let mut request = self
            .pending
            .remove(&request_id)
            .expect("eligible event for a request not awaiting entry");
        request.state = RequestState::Queued;
        request.enqueue_time_us = Some(now_us);
        self.wait_queue.push_back(request);
        self.note_queue_depth();
        self.maybe_schedule_step(now_us)
    }

    fn handle_batch_step(&mut self, now_us: u64) -> Vec<(u64, InstanceEvent)> {
        self.step_scheduled = false;
        if self.step_in_flight {
            return vec![];
        }
        self.kv.set_clock(now_us);
        let formation = self.form_batch(now_us);

        let mut follow_ups = Vec::new();
        let preemption_overhead = self.cost.preemption_overhead_us();
        for victim in &formation.preempted {
            follow_ups.push((
                now_us + preemption_overhead,
                InstanceEvent::Preemption {
                    request_id: *victim,
                },
            ));
        }

        let features = formation.features;
        if features.total_prefill_tokens + features.total_decode_tokens > 0 {
            let duration = self.cost.step_time_us(&features)
                + self.cost.scheduling_overhead_us() * formation.newly_scheduled as u64
                + self.cost.output_token_overhead_us() * features.total_decode_tokens as u64;
            self.step_in_flight = true;
            self.metrics.busy_us += duration;
            follow_ups.push((now_us + duration, InstanceEvent::StepComplete));
        } else if let Some(wake) = self.kv.earliest_migration_completion() {
            // Nothing runnable until a tier migration settles.
            self.step_scheduled = true;
            follow_ups.push((wake.max(now_us), InstanceEvent::BatchStep));
        }
        follow_ups
    }

    fn handle_step_complete(&mut self, now_us: u64) -> Vec<(u64, InstanceEvent)> {
        self.step_in_flight = false;

        let batch = std::mem::take(&mut self.running);
        let mut still_running = Vec::with_capacity(batch.len());
        for mut request in batch {
            let new_tokens = request.num_new_tokens;
            request.num_new_tokens = 0;
            if new_tokens > 0 {
                if !request.prefill_done() {
                    request.progress_tokens += new_tokens;
                    if request.prefill_done() {
                        // Prefill completion emits the first output token.
                        request.generated_tokens = 1;
                        request.first_token_time_us = Some(now_us);
                    }
                } else {
                    request.generated_tokens += 1;
                }
            }
            if request.is_complete() {
                request.state = RequestState::Completed;
                self.kv.release(request.id());
                self.record_completion(&request, now_us);
            } else {
                still_running.push(request);
            }
        }
        self.running = still_running;

        if (!self.running.is_empty() || !self.wait_queue.is_empty()) && !self.step_scheduled {
            self.step_scheduled = true;
            return vec![(now_us, InstanceEvent::BatchStep)];
        }
        vec![]
    }

    fn handle_preemption(&mut self, request_id: u64, now_us: u64) -> Vec<(u64, InstanceEvent)> {
        let request = self
            .pending
            .remove(&request_id)
            .expect("preemption re-entry for a request not awaiting it");
        // Front of the queue: preemption must not reorder FCFS service.
        self.wait_queue.push_front(request);
        self.note_queue_depth();
        self.maybe_schedule_step(now_us)
    }

    // --- Batch formation ---

    fn form_batch(&mut self, now_us: u64) -> Formation {
        let mut token_budget = self.limits.max_batch_tokens;
        let mut preempted: Vec<u64> = Vec::new();
        let mut newly_scheduled: Vec<u64> = Vec::new();

        for request in &mut self.running {
            request.num_new_tokens = 0;
        }

        // Phase 1: continuing requests, in scheduling order. Chunked
        // prefill or one decode token each, until the budget runs out.
        let mut i = 0;
        'continuing: while i < self.running.len() {
            if token_budget == 0 {
                debug!(instance = self.id, "token budget exhausted, deferring to next step");
                break;
            }
            let (new_tokens, is_prefill) = self.next_tokens_for(&self.running[i], token_budget);
            loop {
                let request = &self.running[i];
                let covered = if is_prefill {
                    request.tokens_covered() + new_tokens
                } else {
                    request.tokens_covered() + 1
                };
                let id = request.id();
                let priority = request.request.priority;
                if self.kv.allocate(id, covered, priority, now_us).is_ok() {
                    break;
                }
                let victim_idx = select_victim(&self.running);
                self.evict(victim_idx, &mut preempted, now_us);
                if victim_idx == i {
                    // The failing request evicted itself; the index now
                    // points at the next batch member.
                    continue 'continuing;
                }
                if victim_idx < i {
                    i -= 1;
                }
            }
            let request = &mut self.running[i];
            request.num_new_tokens = new_tokens;
            token_budget -= new_tokens;
            i += 1;
        }

        // Phase 2: admit from the wait queue, FCFS. A preemption this
        // step means capacity is tight; do not refill until it settles.
        while (self.running.len() as u32) < self.limits.max_batch_requests
            && !self.wait_queue.is_empty()
            && token_budget > 0
            && preempted.is_empty()
        {
            let head = self.wait_queue.front().expect("checked non-empty");
            let head_id = head.id();
            let lifetime_tokens = head.request.input_tokens + head.target_output_tokens();
            if self.kv.blocks_for_tokens(lifetime_tokens) > self.kv.fast_capacity() {
                let dropped = self.wait_queue.pop_front().expect("checked non-empty");
                self.kv.release(dropped.id());
                warn!(
                    instance = self.id,
                    request = dropped.id(),
                    input_tokens = dropped.request.input_tokens,
                    output_tokens = dropped.request.output_tokens,
                    "request can never fit in the fast tier, dropping as unservable"
                );
                self.metrics.dropped_unservable += 1;
                continue;
            }
            if !self.kv.is_schedulable(head_id) {
                if self.kv.has_offloaded(head_id) && !self.kv.migrating(head_id) {
                    // Pull the head's blocks back; it becomes schedulable
                    // once the fetch settles. Failure means the fast tier
                    // is full; completions will free it.
                    let _ = self.kv.fetch(head_id, now_us);
                }
                break;
            }
            let (new_tokens, is_prefill) = self.next_tokens_for(head, token_budget);
            let covered = if is_prefill {
                head.tokens_covered() + new_tokens
            } else {
                head.tokens_covered() + 1
            };
            let priority = head.request.priority;
            if self.kv.allocate(head_id, covered, priority, now_us).is_err() {
                if self.running.is_empty() && !self.release_queued_holder(head_id) {
                    break;
                }
                if !self.running.is_empty() {
                    break;
                }
                continue;
            }
            let mut request = self.wait_queue.pop_front().expect("checked non-empty");
            request.state = RequestState::Running;
            if request.first_sched_time_us.is_none() {
                request.first_sched_time_us = Some(now_us);
            }
            request.num_new_tokens = new_tokens;
            token_budget -= new_tokens;
            newly_scheduled.push(request.id());
            self.running.push(request);
        }

        self.metrics.peak_batch_size = self
            .metrics
            .peak_batch_size
            .max(self.running.len() as u32);

        // Tier pressure with queued demand: suspend victims to the slow
        // tier. Requests scheduled this very step are not candidates.
        if !self.wait_queue.is_empty() {
            let candidates: Vec<u64> = self
                .running
                .iter()
                .map(|r| r.id())
                .filter(|id| !newly_scheduled.contains(id))
                .collect();
            let victims = self.kv.maybe_offload(now_us, &candidates);
            for victim in victims {
                let idx = self
                    .running
                    .iter()
                    .position(|r| r.id() == victim)
                    .expect("offload victim is in the running batch");
                let mut request = self.running.remove(idx);
                debug!(
                    instance = self.id,
                    request = victim,
                    "suspending request while its blocks move to the slow tier"
                );
                request.state = RequestState::Queued;
                request.num_new_tokens = 0;
                self.wait_queue.push_back(request);
            }
        }

        Formation {
            features: compute_features(&self.running),
            newly_scheduled: newly_scheduled.len() as u32,
            preempted,
        }
    }

    /// Next tokens to schedule for a request: a (possibly chunked)
    /// prefill slice, or a single decode token.
    fn next_tokens_for(&self, request: &TrackedRequest, token_budget: u32) -> (u32, bool) {
        let remaining = request.remaining_prefill();
        if remaining > 0 {
            let mut tokens = remaining;
            if self.limits.prefill_chunk_tokens > 0 {
                tokens = tokens.min(self.limits.prefill_chunk_tokens);
            }
            (tokens.min(token_budget), true)
        } else {
            (1, false)
        }
    }

    /// Destructively evict the running request at `idx`: blocks
    /// released, progress reset, re-entry deferred by the preemption
    /// overhead.
    fn evict(&mut self, idx: usize, preempted: &mut Vec<u64>, now_us: u64) {
        let mut victim = self.running.remove(idx);
        self.kv.release(victim.id());
        victim.reset_progress();
        self.metrics.preemptions += 1;
        debug!(
            instance = self.id,
            request = victim.id(),
            clock_us = now_us,
            "preempting request to reclaim cache blocks"
        );
        let victim_id = victim.id();
        self.pending.insert(victim_id, victim);
        preempted.push(victim_id);
    }

    /// Deadlock breaker for an empty batch: the queue head cannot
    /// allocate while another *queued* request still holds fast blocks
    /// (it was suspended and fetched back but lost its turn). Release
    /// the first such holder so the head can make progress.
    fn release_queued_holder(&mut self, head_id: u64) -> bool {
        for idx in 0..self.wait_queue.len() {
            let request = &self.wait_queue[idx];
            if request.id() != head_id
                && request.tokens_covered() > 0
                && self.kv.is_schedulable(request.id())
            {
                let id = request.id();
                self.kv.release(id);
                self.wait_queue[idx].reset_progress();
                self.metrics.preemptions += 1;
                debug!(
                    instance = self.id,
                    request = id,
                    "reclaiming blocks from a queued request to unblock the head"
                );
                return true;
            }
        }
        false
    }

    fn maybe_schedule_step(&mut self, now_us: u64) -> Vec<(u64, InstanceEvent)> {
        if !self.step_in_flight && !self.step_scheduled {
            self.step_scheduled = true;
            vec![(now_us, InstanceEvent::BatchStep)]
        } else {
            vec![]
        }
    }

    fn note_queue_depth(&mut self) {
        self.metrics.peak_queue_depth = self
            .metrics
            .peak_queue_depth
            .max(self.wait_queue.len() as u32);
    }

    fn record_completion(&mut self, request: &TrackedRequest, now_us: u64) {
        let arrival = request.request.arrival_time_us;
        let queue_wait = match (request.first_sched_time_us, request.enqueue_time_us) {
            (Some(sched), Some(enqueue)) => sched.saturating_sub(enqueue),
            _ => 0,
        };
        self.metrics.records.push(RequestMetric {
            request_id: request.id(),
            instance_id: self.id,
            arrival_time_us: arrival,
            queue_wait_us: queue_wait,
            ttft_us: request.ttft_us().unwrap_or(0),
            e2e_us: now_us.saturating_sub(arrival),
            input_tokens: request.request.input_tokens,
            output_tokens: request.generated_tokens,
        });
        self.metrics.completed += 1;
        self.metrics.total_input_tokens += request.request.input_tokens as u64;
        self.metrics.total_output_tokens += request.generated_tokens as u64;
    }
}

/// Batch composition for the cost oracle, derived from the per-request
/// token assignments of the step about to execute.
fn compute_features(running: &[TrackedRequest]) -> BatchFeatures {
    let mut features = BatchFeatures::default();
    for request in running {
        if request.num_new_tokens == 0 {
            continue;
        }
        if !request.prefill_done() {
            features.num_prefill += 1;
            features.total_prefill_tokens += request.num_new_tokens;
            features.max_prefill_tokens = features.max_prefill_tokens.max(request.num_new_tokens);
        } else {
            features.num_decode += 1;
            features.total_decode_tokens += request.num_new_tokens;
        }
    }
    features
}

/// Preemption victim: lowest priority; among equals, the most recently
/// scheduled batch member.
fn select_victim(running: &[TrackedRequest]) -> usize {
    let mut best = 0;
    for (idx, request) in running.iter().enumerate() {
        if request.request.priority <= running[best].request.priority {
            best = idx;
        }
    }
    best
}
