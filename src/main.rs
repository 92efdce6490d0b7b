//! loadpulse CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use loadpulse::config::cli::Cli;
use loadpulse::config::cli_convert::parse_size;
use loadpulse::config::toml::{merge_cli_with_config, parse_toml_file};
use loadpulse::config::validator::validate_config;
use loadpulse::config::ClientConfig;
use loadpulse::transport::loopback::{LoopbackOptions, LoopbackTransport};
use loadpulse::{PerfClient, RunReport};
use std::fs;
use std::sync::Arc;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    // `--debug` was merged into the config along with the file's `debug`
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.runtime.log_filter())).init();

    validate_config(&config).context("Configuration validation failed")?;
    print_configuration(&config);

    let chunk_size = parse_size(&cli.loopback_chunk).context("Invalid --loopback-chunk")?;
    let transport = LoopbackTransport::new(LoopbackOptions {
        executors: cli.loopback_executors.max(1),
        chunk_size: usize::try_from(chunk_size).context("--loopback-chunk too large")?.max(1),
        ..LoopbackOptions::default()
    })
    .context("Failed to start loopback transport")?;

    let mut client = PerfClient::new(config, Arc::new(transport)).context("Failed to create client")?;

    let stop = client.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, stopping");
        stop.stop();
    })
    .context("Failed to install Ctrl-C handler")?;

    let report = client.run().context("Run failed")?;
    print_results(&report);

    if let Some(ref path) = cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        log::info!("report written to {}", path.display());
    }

    Ok(())
}

/// Load the optional TOML file, then apply CLI overrides
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let base = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => ClientConfig::default(),
    };
    merge_cli_with_config(cli, base)
}

fn print_configuration(config: &ClientConfig) {
    println!("loadpulse v{}", env!("CARGO_PKG_VERSION"));
    println!();
    print!("{}", config);
    println!();
}

fn print_results(report: &RunReport) {
    let stats = &report.stats;
    println!();
    println!("Results ({:.2}s)", report.elapsed_ms as f64 / 1000.0);
    println!("  Connections:   {} total, {} connected", format_number(stats.total_connections), format_number(stats.connected_connections));
    println!(
        "  Requests:      {} started, {} send-completed, {} completed",
        format_number(stats.started_requests),
        format_number(stats.send_completed_requests),
        format_number(stats.completed_requests)
    );
    println!("  Throughput:    {:.1} requests/s", report.requests_per_second());
    if !report.drained {
        println!("  Drain:         incomplete ({} connections force-closed)", report.forced_shutdowns);
    }

    if report.workers.len() > 1 {
        println!();
        println!("  Per worker:");
        for worker in &report.workers {
            println!(
                "    [{}] connections {} / requests {}",
                worker.worker,
                format_number(worker.total_connections),
                format_number(worker.completed_requests)
            );
        }
    }

    if let Some(ref latency) = report.latency {
        println!();
        println!("  Latency (us):");
        println!("    min    {}", latency.min_us);
        println!("    mean   {:.1}", latency.mean_us);
        println!("    p50    {}", latency.p50_us);
        println!("    p90    {}", latency.p90_us);
        println!("    p99    {}", latency.p99_us);
        println!("    p99.9  {}", latency.p999_us);
        println!("    max    {}", latency.max_us);
        if report.latency_dropped > 0 {
            println!("    ({} samples dropped: buffer full)", format_number(report.latency_dropped));
        }
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}
