//! Tiered KV cache simulation with block-based allocation and
//! offload/fetch between a fast tier and an optional slow tier.
//!
//! Models the memory management of a paged KV cache backed by host
//! memory: block-level allocation with exclusive per-request ownership,
//! threshold-triggered offload of victim requests' blocks to the slow
//! tier, and fetch back to the fast tier before the owner can resume.
//! Tier migrations take `base_latency + size / bandwidth` simulated time
//! and settle lazily when the owning instance advances the cache clock.
//!
//! Accounting invariant: for every tier,
//! `settled + reserved_incoming + free == capacity` after every
//! operation. A migrating block is counted in its destination tier's
//! `reserved_incoming`, never in two tiers at once.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Allocation failure: not enough free fast-tier blocks. Never partial:
/// the cache either reserves the full count or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient cache capacity: requested {requested} blocks, {free} free")]
pub struct InsufficientCapacity {
    pub requested: u64,
    pub free: u64,
}

/// Storage tier for a cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Fast,
    Slow,
}

/// How offload victims are selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VictimPolicy {
    /// Owner with the oldest last allocation wins (ties: lowest id).
    LeastRecentlyUsed,
    /// Owner with the lowest priority wins (ties: lowest id).
    OwnerPriority,
}

/// Construction parameters, converted from the `[kv_cache]` config
/// section by the config layer.
#[derive(Debug, Clone)]
pub struct KvCacheParams {
    pub fast_blocks: u64,
    pub block_size_tokens: u32,
    /// Zero disables the slow tier (and with it offload/fetch).
    pub slow_blocks: u64,
    /// Fast-tier utilization above which offload kicks in.
    pub offload_threshold: f64,
    pub victim_policy: VictimPolicy,
    pub block_bytes: u64,
    pub transfer_base_latency_us: u64,
    pub transfer_bandwidth_gb_s: f64,
}

/// Per-tier block accounting. `free` is derived, never stored.
#[derive(Debug, Clone, Default)]
struct TierUsage {
    capacity: u64,
    settled: u64,
    reserved_incoming: u64,
}

impl TierUsage {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            settled: 0,
            reserved_incoming: 0,
        }
    }

    fn used(&self) -> u64 {
        self.settled + self.reserved_incoming
    }

    fn free(&self) -> u64 {
        self.capacity - self.used()
    }
}

/// Blocks held by one request, split by tier.
#[derive(Debug, Clone, Default)]
struct OwnerEntry {
    fast_blocks: u64,
    slow_blocks: u64,
    last_touch_us: u64,
    priority: f64,
}

/// An in-flight tier migration. The blocks involved are already
/// accounted in the destination tier's `reserved_incoming`.
#[derive(Debug, Clone)]
struct Migration {
    owner: u64,
    blocks: u64,
    dest: Tier,
    completes_at_us: u64,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub fast_capacity: u64,
    pub fast_used: u64,
    pub fast_free: u64,
    pub slow_capacity: u64,
    pub slow_used: u64,
    pub slow_free: u64,
    pub utilization: f64,
    pub peak_fast_used: u64,
    pub offloads: u64,
    pub fetches: u64,
    pub offload_stalls: u64,
    pub alloc_failures: u64,
    pub transfer_busy_us: u64,
}

/// Block allocator for one instance, with a fast tier and an optional
/// slow tier. Owned exclusively by that instance's execution loop.
#[derive(Debug)]
pub struct TieredKvCache {
    block_size_tokens: u32,
    fast: TierUsage,
    slow: Option<TierUsage>,
    owners: HashMap<u64, OwnerEntry>,
    in_flight: Vec<Migration>,
    clock_us: u64,
    offload_threshold: f64,
    victim_policy: VictimPolicy,
    block_bytes: u64,
    transfer_base_latency_us: u64,
    transfer_bandwidth_gb_s: f64,
    peak_fast_used: u64,
    offloads: u64,
    fetches: u64,
    offload_stalls: u64,
    alloc_failures: u64,
    transfer_busy_us: u64,
}

impl TieredKvCache {
    pub fn new(params: KvCacheParams) -> Self {
        Self {
            block_size_tokens: params.block_size_tokens,
            fast: TierUsage::new(params.fast_blocks),
            slow: (params.slow_blocks > 0).then(|| TierUsage::new(params.slow_blocks)),
            owners: HashMap::new(),
            in_flight: Vec::new(),
            clock_us: 0,
            offload_threshold: params.offload_threshold,
            victim_policy: params.victim_policy,
            block_bytes: params.block_bytes,
            transfer_base_latency_us: params.transfer_base_latency_us,
            transfer_bandwidth_gb_s: params.transfer_bandwidth_gb_s,
            peak_fast_used: 0,
            offloads: 0,
            fetches: 0,
            offload_stalls: 0,
            alloc_failures: 0,
            transfer_busy_us: 0,
        }
    }

    /// Blocks needed to cover a token count, rounding up.
    pub fn blocks_for_tokens(&self, tokens: u32) -> u64 {
        (tokens as u64).div_ceil(self.block_size_tokens as u64)
    }

    pub fn block_size_tokens(&self) -> u32 {
        self.block_size_tokens
    }

    pub fn fast_capacity(&self) -> u64 {
        self.fast.capacity
    }

    pub fn free_fast_blocks(&self) -> u64 {
        self.fast.free()
    }

    /// Fast-tier utilization (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.fast.capacity == 0 {
            return 0.0;
        }
        self.fast.used() as f64 / self.fast.capacity as f64
    }

    /// Whether the owner has a migration in flight.
    pub fn migrating(&self, owner: u64) -> bool {
        self.in_flight.iter().any(|m| m.owner == owner)
    }

    /// Whether the owner has blocks parked in the slow tier.
    pub fn has_offloaded(&self, owner: u64) -> bool {
        self.owners.get(&owner).is_some_and(|e| e.slow_blocks > 0)
    }

    /// An owner can be batched only when all its blocks are settled in
    /// the fast tier.
    pub fn is_schedulable(&self, owner: u64) -> bool {
        !self.migrating(owner) && !self.has_offloaded(owner)
    }

    /// Completion time of the earliest in-flight migration, used by the
    /// instance loop to schedule a wake-up when otherwise idle.
    pub fn earliest_migration_completion(&self) -> Option<u64> {
        self.in_flight.iter().map(|m| m.completes_at_us).min()
    }

    /// Advance the cache clock, settling every migration that has
    /// completed by `now`: its blocks move from the destination tier's
    /// reserved-incoming count into the settled count.
    pub fn set_clock(&mut self, now_us: u64) {
        assert!(
            now_us >= self.clock_us,
            "cache clock moved backwards: {} -> {}",
            self.clock_us,
            now_us
        );
        self.clock_us = now_us;

        let mut settled = Vec::new();
        self.in_flight.retain(|m| {
            if m.completes_at_us <= now_us {
                settled.push(m.clone());
                false
            } else {
                true
            }
        });
        for m in settled {
            let tier = match m.dest {
                Tier::Fast => &mut self.fast,
                Tier::Slow => self.slow.as_mut().expect("slow migration without slow tier"),
            };
            tier.reserved_incoming -= m.blocks;
            match self.owners.get_mut(&m.owner) {
                Some(entry) => {
                    tier.settled += m.blocks;
                    match m.dest {
                        Tier::Fast => entry.fast_blocks += m.blocks,
                        Tier::Slow => entry.slow_blocks += m.blocks,
                    }
                }
                // Owner released mid-migration; blocks go straight to free.
                None => {}
            }
        }
    }

    /// Atomically reserve enough fast-tier blocks for `owner` to cover
    /// `total_tokens`, on top of whatever it already holds. Fails
    /// without any partial allocation.
    pub fn allocate(
        &mut self,
        owner: u64,
        total_tokens: u32,
        priority: f64,
        now_us: u64,
    ) -> Result<(), InsufficientCapacity> {
        assert!(
            self.is_schedulable(owner),
            "allocate for owner {} with blocks offloaded or migrating",
            owner
        );
        let needed = self.blocks_for_tokens(total_tokens);
        let held = self.owners.get(&owner).map_or(0, |e| e.fast_blocks);
        let delta = needed.saturating_sub(held);
        if delta > self.fast.free() {
            self.alloc_failures += 1;
            return Err(InsufficientCapacity {
                requested: delta,
                free: self.fast.free(),
            });
        }
        self.fast.settled += delta;
        let entry = self.owners.entry(owner).or_default();
        entry.fast_blocks += delta;
        entry.last_touch_us = now_us;
        entry.priority = priority;
        self.peak_fast_used = self.peak_fast_used.max(self.fast.used());
        Ok(())
    }

    /// Return all of the owner's blocks to free, in whichever tier they
    /// occupy. An in-flight migration for the owner is cancelled and its
    /// blocks freed from the destination's reserved-incoming count.
    pub fn release(&mut self, owner: u64) {
        if let Some(entry) = self.owners.remove(&owner) {
            self.fast.settled -= entry.fast_blocks;
            if let Some(slow) = self.slow.as_mut() {
                slow.settled -= entry.slow_blocks;
            }
        }
        let mut cancelled = Vec::new();
        self.in_flight.retain(|m| {
            if m.owner == owner {
                cancelled.push((m.dest, m.blocks));
                false
            } else {
                true
            }
        });
        for (dest, blocks) in cancelled {
            match dest {
                Tier::Fast => self.fast.reserved_incoming -= blocks,
                Tier::Slow => {
                    self.slow
                        .as_mut()
                        .expect("slow migration without slow tier")
                        .reserved_incoming -= blocks;
                }
            }
        }
    }

    /// While fast-tier utilization exceeds the threshold, pick victim
    /// owners from `candidates` (per the configured policy) and start
    /// migrating all their fast blocks to the slow tier. Returns the
    /// victims, whose owners are unschedulable until they fetch back.
    pub fn maybe_offload(&mut self, now_us: u64, candidates: &[u64]) -> Vec<u64> {
        let mut victims = Vec::new();
        if self.slow.is_none() {
            return victims;
        }
        while self.utilization() > self.offload_threshold {
            let victim = match self.select_victim(candidates, &victims) {
                Some(v) => v,
                None => break,
            };
            let blocks = self.owners[&victim].fast_blocks;
            let slow = self.slow.as_mut().expect("checked above");
            if slow.free() < blocks {
                self.offload_stalls += 1;
                break;
            }
            let duration = self.transfer_time_us(blocks);
            self.fast.settled -= blocks;
            self.slow.as_mut().expect("checked above").reserved_incoming += blocks;
            let entry = self.owners.get_mut(&victim).expect("victim has an entry");
            entry.fast_blocks = 0;
            self.in_flight.push(Migration {
                owner: victim,
                blocks,
                dest: Tier::Slow,
                completes_at_us: now_us + duration,
            });
            self.offloads += 1;
            self.transfer_busy_us += duration;
            debug!(
                owner = victim,
                blocks,
                completes_at_us = now_us + duration,
                "offloading blocks to slow tier"
            );
            victims.push(victim);
        }
        victims
    }

    /// Start migrating the owner's slow-tier blocks back to the fast
    /// tier. Returns the completion time; the owner is unschedulable
    /// until then. Fails when the fast tier lacks free blocks.
    pub fn fetch(&mut self, owner: u64, now_us: u64) -> Result<u64, InsufficientCapacity> {
        let blocks = self.owners.get(&owner).map_or(0, |e| e.slow_blocks);
        if blocks == 0 {
            return Ok(now_us);
        }
        if blocks > self.fast.free() {
            self.alloc_failures += 1;
            return Err(InsufficientCapacity {
                requested: blocks,
                free: self.fast.free(),
            });
        }
        let duration = self.transfer_time_us(blocks);
        self.slow
            .as_mut()
            .expect("offloaded blocks imply a slow tier")
            .settled -= blocks;
        self.fast.reserved_incoming += blocks;
        self.peak_fast_used = self.peak_fast_used.max(self.fast.used());
        let entry = self.owners.get_mut(&owner).expect("owner has an entry");
        entry.slow_blocks = 0;
        let completes_at_us = now_us + duration;
        self.in_flight.push(Migration {
            owner,
            blocks,
            dest: Tier::Fast,
            completes_at_us,
        });
        self.fetches += 1;
        self.transfer_busy_us += duration;
        debug!(owner, blocks, completes_at_us, "fetching blocks to fast tier");
        Ok(completes_at_us)
    }

    pub fn stats(&self) -> KvCacheStats {
        let (slow_capacity, slow_used, slow_free) = match &self.slow {
            Some(s) => (s.capacity, s.used(), s.free()),
            None => (0, 0, 0),
        };
        KvCacheStats {
            fast_capacity: self.fast.capacity,
            fast_used: self.fast.used(),
            fast_free: self.fast.free(),
            slow_capacity,
            slow_used,
            slow_free,
            utilization: self.utilization(),
            peak_fast_used: self.peak_fast_used,
            offloads: self.offloads,
            fetches: self.fetches,
            offload_stalls: self.offload_stalls,
            alloc_failures: self.alloc_failures,
            transfer_busy_us: self.transfer_busy_us,
        }
    }

    /// Verifies the per-tier accounting: owner holdings match settled
    /// counts, in-flight migrations match reserved-incoming counts, and
    /// used + free equals capacity for both tiers.
    pub fn accounting_balanced(&self) -> bool {
        let owned_fast: u64 = self.owners.values().map(|e| e.fast_blocks).sum();
        let owned_slow: u64 = self.owners.values().map(|e| e.slow_blocks).sum();
        let inbound_fast: u64 = self
            .in_flight
            .iter()
            .filter(|m| m.dest == Tier::Fast)
            .map(|m| m.blocks)
            .sum();
        let inbound_slow: u64 = self
            .in_flight
            .iter()
            .filter(|m| m.dest == Tier::Slow)
            .map(|m| m.blocks)
            .sum();

        let fast_ok = owned_fast == self.fast.settled
            && inbound_fast == self.fast.reserved_incoming
            && self.fast.used() + self.fast.free() == self.fast.capacity;
        let slow_ok = match &self.slow {
            Some(slow) => {
                owned_slow == slow.settled
                    && inbound_slow == slow.reserved_incoming
                    && slow.used() + slow.free() == slow.capacity
            }
            None => owned_slow == 0 && inbound_slow == 0,
        };
        fast_ok && slow_ok
    }

    fn select_victim(&self, candidates: &[u64], already_chosen: &[u64]) -> Option<u64> {
        let eligible = candidates.iter().copied().filter(|&owner| {
            !already_chosen.contains(&owner)
                && !self.migrating(owner)
                && self.owners.get(&owner).is_some_and(|e| e.fast_blocks > 0)
        });
        match self.victim_policy {
            VictimPolicy::LeastRecentlyUsed => {
                eligible.min_by_key(|&owner| (self.owners[&owner].last_touch_us, owner))
            }
            VictimPolicy::OwnerPriority => eligible.min_by(|&a, &b| {
                let pa = self.owners[&a].priority;
                let pb = self.owners[&b].priority;
                pa.partial_cmp(&pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            }),
        }
    }

    /// Transfer duration: fixed base latency plus size over bandwidth.
    fn transfer_time_us(&self, blocks: u64) -> u64 {
        let bytes = blocks * self.block_bytes;
        // GB/s -> bytes per microsecond
        let bytes_per_us = self.transfer_bandwidth_gb_s * 1e3;
        self.transfer_base_latency_us + (bytes as f64 / bytes_per_us).ceil() as u64
    }
}
