//! FleetSim CLI — simulate LLM inference clusters without GPUs.

use clap::{Parser, Subcommand};
use fleetsim_core::config::SimConfig;
use fleetsim_core::{metrics, trace, workload};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fleetsim",
    about = "Discrete-event simulation of LLM inference clusters",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation from a TOML config.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Workload JSONL file, overriding the config's workload source.
        #[arg(short, long)]
        workload: Option<PathBuf>,
        /// Write the metrics record to a JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the decision trace and its summary to a JSON file
        /// (requires trace.level = "decisions").
        #[arg(short, long)]
        trace_output: Option<PathBuf>,
    },
    /// Compare routing policies on the same workload.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated routing policy names (default: all).
        #[arg(short, long, value_delimiter = ',')]
        policies: Vec<String>,
        /// Write all metrics records to a JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a synthetic workload file.
    GenWorkload {
        /// Mean arrival rate in requests/second.
        #[arg(long, default_value = "8")]
        rate: f64,
        /// Number of requests.
        #[arg(long, default_value = "200")]
        num_requests: u64,
        /// Mean prompt tokens.
        #[arg(long, default_value = "512")]
        input_mean: f64,
        /// Uniform spread around the prompt mean.
        #[arg(long, default_value = "128")]
        input_spread: f64,
        /// Mean generation tokens.
        #[arg(long, default_value = "64")]
        output_mean: f64,
        /// Uniform spread around the generation mean.
        #[arg(long, default_value = "16")]
        output_spread: f64,
        /// Generator seed.
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List available admission and routing policies.
    ListPolicies,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            workload: workload_path,
            output,
            trace_output,
        } => {
            let sim_config = load_config(&config);
            let requests = match workload_path {
                Some(path) => workload::load_jsonl(&path).unwrap_or_else(|e| {
                    eprintln!("Error loading workload: {}", e);
                    std::process::exit(1);
                }),
                None => fleetsim_core::load_requests(&sim_config).unwrap_or_else(|e| {
                    eprintln!("Error loading workload: {}", e);
                    std::process::exit(1);
                }),
            };

            let run = fleetsim_core::run_simulation(&sim_config, requests).unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            });
            println!("{}", metrics::format_table(&run.metrics));

            if let Some(path) = output {
                write_json(&path, &run.metrics);
                println!("Metrics written to {}", path.display());
            }
            match (trace_output, &run.trace) {
                (Some(path), Some(sim_trace)) => {
                    let summary = trace::summarize(sim_trace);
                    let payload = serde_json::json!({
                        "summary": summary,
                        "trace": sim_trace,
                    });
                    write_json(&path, &payload);
                    println!("Decision trace written to {}", path.display());
                }
                (Some(_), None) => {
                    eprintln!("--trace-output requires trace.level = \"decisions\" in the config");
                    std::process::exit(1);
                }
                _ => {}
            }
        }
        Commands::Compare {
            config,
            policies,
            output,
        } => {
            let sim_config = load_config(&config);
            let requests = fleetsim_core::load_requests(&sim_config).unwrap_or_else(|e| {
                eprintln!("Error loading workload: {}", e);
                std::process::exit(1);
            });
            let names: Vec<&str> = if policies.is_empty() {
                fleetsim_policies::available_routing_policies()
            } else {
                policies.iter().map(|s| s.as_str()).collect()
            };
            let results = fleetsim_core::compare_policies(&sim_config, &requests, &names)
                .unwrap_or_else(|e| {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                });
            println!("{}", metrics::format_comparison_table(&results));
            if let Some(path) = output {
                write_json(&path, &results);
                println!("Results written to {}", path.display());
            }
        }
        Commands::GenWorkload {
            rate,
            num_requests,
            input_mean,
            input_spread,
            output_mean,
            output_spread,
            seed,
            output,
        } => {
            let section = fleetsim_core::config::WorkloadSection {
                source: "synthetic".to_string(),
                path: None,
                rate_per_sec: rate,
                num_requests,
                input_tokens_mean: input_mean,
                input_tokens_spread: input_spread,
                output_tokens_mean: output_mean,
                output_tokens_spread: output_spread,
            };
            let requests = workload::generate_synthetic(&section, seed);
            workload::write_jsonl(&requests, &output).unwrap_or_else(|e| {
                eprintln!("Error writing workload: {}", e);
                std::process::exit(1);
            });
            println!("Generated {} requests to {}", requests.len(), output.display());
        }
        Commands::ListPolicies => {
            println!("Admission policies:");
            for name in fleetsim_policies::available_admission_policies() {
                println!("  - {}", name);
            }
            println!("Routing policies:");
            for name in fleetsim_policies::available_routing_policies() {
                println!("  - {}", name);
            }
            println!("Weighted-routing scorers:");
            for name in fleetsim_policies::available_scorers() {
                println!("  - {}", name);
            }
        }
    }
}

fn load_config(path: &PathBuf) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    })
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) {
    let json = serde_json::to_string_pretty(value).expect("metrics serialize");
    std::fs::write(path, json).unwrap_or_else(|e| {
        eprintln!("Error writing output: {}", e);
        std::process::exit(1);
    });
}
