//! Capacity-conservation properties of the tiered KV cache, including
//! mid-migration accounting and the transfer latency model.

use fleetsim_core::config::SimConfig;
use fleetsim_core::kv_cache::{KvCacheParams, TieredKvCache, VictimPolicy};
use fleetsim_core::ClusterSim;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn tiered_params() -> KvCacheParams {
    KvCacheParams {
        fast_blocks: 16,
        block_size_tokens: 16,
        slow_blocks: 32,
        offload_threshold: 0.5,
        victim_policy: VictimPolicy::LeastRecentlyUsed,
        block_bytes: 4096,
        transfer_base_latency_us: 100,
        transfer_bandwidth_gb_s: 4.0,
    }
}

#[test]
fn test_transfer_latency_is_base_plus_size_over_bandwidth() {
    // 4 blocks * 4096 B at 4 GB/s = 16384 B / 4000 B-per-us -> 5 us,
    // plus the 100 us base: the migration settles at exactly t+105.
    let mut cache = TieredKvCache::new(tiered_params());
    cache.allocate(1, 64, 0.0, 0).unwrap(); // 4 blocks
    for owner in 2..=4 {
        cache.allocate(owner, 32, 0.0, 0).unwrap(); // push past threshold
    }
    let victims = cache.maybe_offload(1_000, &[1]);
    assert_eq!(victims, vec![1]);

    cache.set_clock(1_104);
    assert!(cache.migrating(1), "one microsecond early: still in flight");
    cache.set_clock(1_105);
    assert!(!cache.migrating(1));
    assert!(cache.has_offloaded(1));
}

#[test]
fn test_conservation_through_random_op_sequence() {
    // Drive the cache through a seeded mix of allocate / release /
    // offload / fetch / settle and check the accounting after every
    // single operation, in-flight migrations included.
    let mut cache = TieredKvCache::new(tiered_params());
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let mut clock = 0u64;
    let mut live: Vec<u64> = Vec::new();
    let mut next_owner = 0u64;

    for _ in 0..500 {
        clock += rng.gen_range(0..300);
        match rng.gen_range(0..5) {
            0 => {
                let owner = next_owner;
                next_owner += 1;
                let tokens = rng.gen_range(1..200);
                if cache.allocate(owner, tokens, 0.0, clock).is_ok() {
                    live.push(owner);
                }
            }
            1 => {
                if !live.is_empty() {
                    let idx = rng.gen_range(0..live.len());
                    cache.release(live.swap_remove(idx));
                }
            }
            2 => {
                let candidates: Vec<u64> = live.clone();
                cache.maybe_offload(clock, &candidates);
            }
            3 => {
                if !live.is_empty() {
                    let idx = rng.gen_range(0..live.len());
                    let owner = live[idx];
                    if cache.has_offloaded(owner) && !cache.migrating(owner) {
                        let _ = cache.fetch(owner, clock);
                    }
                }
            }
            _ => {
                cache.set_clock(clock);
            }
        }
        assert!(
            cache.accounting_balanced(),
            "tier accounting broke at clock {}",
            clock
        );
        let stats = cache.stats();
        assert_eq!(stats.fast_used + stats.fast_free, stats.fast_capacity);
        assert_eq!(stats.slow_used + stats.slow_free, stats.slow_capacity);
    }
}

#[test]
fn test_allocate_blocked_while_owner_migrates() {
    let mut cache = TieredKvCache::new(tiered_params());
    cache.allocate(1, 200, 0.0, 0).unwrap(); // 13 of 16 blocks
    let victims = cache.maybe_offload(0, &[1]);
    assert_eq!(victims, vec![1]);
    assert!(!cache.is_schedulable(1));
    // Fetching back is refused until the offload settles
    cache.set_clock(50);
    assert!(cache.migrating(1));
    cache.set_clock(10_000);
    assert!(cache.has_offloaded(1));
    let completes = cache.fetch(1, 10_000).unwrap();
    assert!(completes > 10_000);
    cache.set_clock(completes);
    assert!(cache.is_schedulable(1));
    assert!(cache.accounting_balanced());
}

#[test]
fn test_full_run_with_slow_tier_releases_everything() {
    // A contended run over a tiered cache must end with every block
    // back in the free pool of both tiers.
    let config = SimConfig::from_str(
        r#"
[simulation]
seed = 5
horizon_us = 600000000

[cluster]
num_instances = 2
routing_policy = "least_loaded"

[instance]
max_batch_requests = 6

[kv_cache]
fast_blocks = 16
block_size_tokens = 16
slow_blocks = 32
offload_threshold = 0.6
transfer_base_latency_us = 150
transfer_bandwidth_gb_s = 8.0

[workload]
source = "synthetic"
rate_per_sec = 400.0
num_requests = 80
input_tokens_mean = 64.0
input_tokens_spread = 32.0
output_tokens_mean = 16.0
output_tokens_spread = 8.0
"#,
    )
    .unwrap();

    let requests = fleetsim_core::load_requests(&config).unwrap();
    let mut cluster = ClusterSim::new(&config).unwrap();
    cluster.load_workload(requests);
    let metrics = cluster.run();

    assert!(metrics.completed_requests > 0);
    for report in &metrics.per_instance {
        assert_eq!(
            report.kv.fast_used, 0,
            "instance {} ended with fast-tier blocks still owned",
            report.id
        );
        assert_eq!(
            report.kv.slow_used, 0,
            "instance {} ended with slow-tier blocks still owned",
            report.id
        );
        assert_eq!(report.kv.fast_free, report.kv.fast_capacity);
    }
}

#[test]
fn test_priority_victims_preferred_for_offload() {
    let mut params = tiered_params();
    params.victim_policy = VictimPolicy::OwnerPriority;
    let mut cache = TieredKvCache::new(params);
    cache.allocate(10, 64, 9.0, 0).unwrap();
    cache.allocate(11, 64, 1.0, 0).unwrap();
    cache.allocate(12, 64, 5.0, 0).unwrap();
    let victims = cache.maybe_offload(0, &[10, 11, 12]);
    assert_eq!(victims[0], 11, "lowest-priority owner is offloaded first");
}
