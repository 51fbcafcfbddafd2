//! Workload sources: a seeded synthetic generator and a compact-JSONL
//! loader/writer.
//!
//! Synthetic workloads draw Poisson arrivals at the configured mean rate
//! and uniform token counts spread around the configured means, from a
//! ChaCha8 stream seeded by the run seed: two runs with the same seed
//! and parameters see byte-identical workloads.

use crate::config::WorkloadSection;
use crate::request::SimRequest;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("failed to read workload file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed workload line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// Generate a synthetic workload from the config section. Request ids
/// are assigned sequentially in arrival order.
pub fn generate_synthetic(section: &WorkloadSection, seed: u64) -> Vec<SimRequest> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut requests = Vec::with_capacity(section.num_requests as usize);
    let mut arrival_us = 0u64;

    for id in 0..section.num_requests {
        // Poisson process: exponential inter-arrival times
        let u: f64 = rng.gen();
        let delta = -(1.0 - u).ln() / section.rate_per_sec * 1e6;
        arrival_us += delta as u64;

        let input_tokens = sample_tokens(
            &mut rng,
            section.input_tokens_mean,
            section.input_tokens_spread,
        );
        let output_tokens = sample_tokens(
            &mut rng,
            section.output_tokens_mean,
            section.output_tokens_spread,
        );
        requests.push(SimRequest {
            id,
            arrival_time_us: arrival_us,
            input_tokens,
            output_tokens,
            priority: 0.0,
        });
    }
    requests
}

/// Uniform sample in [mean - spread, mean + spread], floored at one token.
fn sample_tokens(rng: &mut ChaCha8Rng, mean: f64, spread: f64) -> u32 {
    (mean + rng.gen::<f64>() * spread * 2.0 - spread).max(1.0) as u32
}

/// Load requests from a compact-JSONL file: one JSON object per line.
/// Blank lines are skipped; malformed lines fail the load with their
/// line number rather than being dropped silently.
pub fn load_jsonl(path: &Path) -> Result<Vec<SimRequest>, WorkloadError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut requests = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: SimRequest =
            serde_json::from_str(&line).map_err(|source| WorkloadError::Parse {
                line: idx + 1,
                source,
            })?;
        requests.push(request);
    }
    requests.sort_by_key(|r| (r.arrival_time_us, r.id));
    Ok(requests)
}

/// Write requests as compact JSONL.
pub fn write_jsonl(requests: &[SimRequest], path: &Path) -> Result<(), WorkloadError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for request in requests {
        let line = serde_json::to_string(request).expect("request serializes");
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    Ok(())
}
