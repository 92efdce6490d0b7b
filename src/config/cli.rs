//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Address family for target resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Family {
    Unspec,
    Inet,
    Inet6,
}

/// loadpulse - connection and stream load generator
///
/// Every flag overrides the matching field of the `--config` file.
#[derive(Parser, Debug, Default)]
#[command(name = "loadpulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    // === Target ===
    /// Target host name or IP address
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Target UDP port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Address family used to resolve the target
    #[arg(long, value_enum)]
    pub family: Option<Family>,

    /// Add the worker index to the target address
    #[arg(long)]
    pub increment_target: bool,

    /// CIBIR routing id (hex, up to 6 bytes)
    #[arg(long)]
    pub cibir: Option<String>,

    /// Network compartment id
    #[arg(long)]
    pub compartment: Option<u32>,

    // === Scenario ===
    /// Total number of connections
    #[arg(short = 'c', long)]
    pub conns: Option<u32>,

    /// Concurrent streams per connection (0 = handshake only)
    #[arg(short = 's', long)]
    pub streams: Option<u32>,

    /// Streams started as soon as a connection is up
    #[arg(long)]
    pub initial_streams: Option<u32>,

    /// Requests issued per connection before it closes
    #[arg(long)]
    pub requests: Option<u64>,

    /// Requests issued across the whole run
    #[arg(long)]
    pub total_requests: Option<u64>,

    /// Bytes per send (e.g., 4k, 64k)
    #[arg(short = 'i', long)]
    pub iosize: Option<String>,

    /// Upload per request: size (e.g., 1M), or duration with --timed (e.g., 2s)
    #[arg(short = 'u', long)]
    pub upload: Option<String>,

    /// Download per request: size (e.g., 1M), or duration with --timed (e.g., 2s)
    #[arg(short = 'd', long)]
    pub download: Option<String>,

    /// Interpret --upload/--download as durations
    #[arg(long)]
    pub timed: bool,

    /// Post follow-up sends from the completion callback
    #[arg(long = "inline")]
    pub send_inline: bool,

    /// Replace each closed connection while the run is active
    #[arg(long)]
    pub repeat_conns: bool,

    /// Replace each completed stream while the run is active
    #[arg(long)]
    pub repeat_streams: bool,

    /// Run duration (e.g., 10s, 500ms)
    #[arg(short = 'r', long)]
    pub run_time: Option<String>,

    /// Pause between handshake completion and the first stream (e.g., 100ms)
    #[arg(long)]
    pub handshake_wait: Option<String>,

    // === Workers ===
    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub threads: Option<usize>,

    /// Pin each worker thread to its own processor
    #[arg(long)]
    pub affinitize: bool,

    /// Processors for pinned workers (e.g., "0,2-4")
    #[arg(long)]
    pub cpu_cores: Option<String>,

    /// Local addresses to bind, spread over workers (e.g., "10.0.0.1,10.0.0.2")
    #[arg(long, value_name = "ADDRS")]
    pub bind: Option<String>,

    // === Transport ===
    /// Disable encryption
    #[arg(long)]
    pub no_encrypt: bool,

    /// Disable send pacing
    #[arg(long)]
    pub no_pacing: bool,

    /// Enable send buffering
    #[arg(long)]
    pub send_buffering: bool,

    /// Enable ECN marking
    #[arg(long)]
    pub ecn: bool,

    /// Loopback engine: executor threads
    #[arg(long, default_value = "2")]
    pub loopback_executors: usize,

    /// Loopback engine: largest receive chunk (e.g., 16k)
    #[arg(long, default_value = "16k")]
    pub loopback_chunk: String,

    // === Output ===
    /// Record and print request latency percentiles
    #[arg(long)]
    pub latency: bool,

    /// Log transport statistics for each connection at shutdown
    #[arg(long)]
    pub stats: bool,

    /// Log transport statistics for each stream at shutdown
    #[arg(long)]
    pub stream_stats: bool,

    /// Latency buffer size override
    #[arg(long)]
    pub latency_samples: Option<usize>,

    /// Time to wait for connections to close on stop (e.g., 2s)
    #[arg(long)]
    pub drain_timeout: Option<String>,

    /// Write the final report as JSON to this path
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}
