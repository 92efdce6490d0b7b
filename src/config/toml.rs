//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, Family};
use crate::config::cli_convert::{parse_duration_ms, parse_local_addresses, parse_size};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<ClientConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<ClientConfig> {
    let config: ClientConfig = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with a base configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: ClientConfig) -> Result<ClientConfig> {
    // Target
    if let Some(ref host) = cli.target {
        config.target.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.target.port = port;
    }
    if let Some(family) = cli.family {
        config.target.family = match family {
            Family::Unspec => AddressFamily::Unspec,
            Family::Inet => AddressFamily::Inet,
            Family::Inet6 => AddressFamily::Inet6,
        };
    }
    if cli.increment_target {
        config.target.increment_target = true;
    }
    if let Some(ref cibir) = cli.cibir {
        config.target.cibir_id = Some(cibir.clone());
    }
    if let Some(compartment) = cli.compartment {
        config.target.compartment_id = Some(compartment);
    }

    // Scenario
    let scenario = &mut config.scenario;
    if let Some(conns) = cli.conns {
        scenario.connections = conns;
    }
    if let Some(streams) = cli.streams {
        scenario.streams = streams;
    }
    if let Some(initial) = cli.initial_streams {
        scenario.initial_streams = Some(initial);
    }
    if let Some(requests) = cli.requests {
        scenario.requests_per_connection = Some(requests);
    }
    if let Some(total) = cli.total_requests {
        scenario.total_requests = Some(total);
    }
    if let Some(ref io_size) = cli.iosize {
        scenario.io_size = parse_size(io_size)?;
    }
    if cli.timed {
        scenario.timed = true;
    }

    // Upload/download units depend on the final `timed` flag
    let timed = scenario.timed;
    let parse_amount = |s: &str| if timed { parse_duration_ms(s) } else { parse_size(s) };
    if let Some(ref upload) = cli.upload {
        scenario.upload = parse_amount(upload).context("Invalid --upload")?;
    }
    if let Some(ref download) = cli.download {
        scenario.download = parse_amount(download).context("Invalid --download")?;
    }

    if cli.send_inline {
        scenario.send_inline = true;
    }
    if cli.repeat_conns {
        scenario.repeat_connections = true;
    }
    if cli.repeat_streams {
        scenario.repeat_streams = true;
    }
    if let Some(ref run_time) = cli.run_time {
        scenario.run_time_ms = parse_duration_ms(run_time)?;
    }
    if let Some(ref wait) = cli.handshake_wait {
        scenario.handshake_wait_ms = parse_duration_ms(wait).context("Invalid --handshake-wait")?;
    }

    // Workers
    if let Some(threads) = cli.threads {
        config.workers.threads = threads;
    }
    if cli.affinitize {
        config.workers.affinitize = true;
    }
    if let Some(ref cores) = cli.cpu_cores {
        config.workers.cpu_cores = Some(cores.clone());
    }
    if let Some(ref bind) = cli.bind {
        config.workers.local_addresses = parse_local_addresses(bind)?;
    }

    // Runtime
    if cli.no_encrypt {
        config.runtime.encryption = false;
    }
    if cli.no_pacing {
        config.runtime.pacing = false;
    }
    if cli.send_buffering {
        config.runtime.send_buffering = true;
    }
    if cli.ecn {
        config.runtime.ecn = true;
    }
    if cli.latency {
        config.runtime.print_latency = true;
    }
    if cli.stats {
        config.runtime.print_stats = true;
    }
    if cli.stream_stats {
        config.runtime.print_stream_stats = true;
    }
    if let Some(samples) = cli.latency_samples {
        config.runtime.latency_samples = Some(samples);
    }
    if let Some(ref drain) = cli.drain_timeout {
        config.runtime.drain_timeout_ms = parse_duration_ms(drain)?;
    }
    if cli.debug {
        config.runtime.debug = true;
    }

    Ok(config)
}
