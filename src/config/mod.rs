//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! Every section deserializes with defaults so a TOML file only needs the
//! fields it changes; CLI flags are merged on top and the result is
//! validated before any thread is spawned.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::stats::latency::{MAX_LATENCY_SAMPLES, MAX_REQUESTS_PER_SECOND};
use crate::transport::{ConnectTarget, TransportSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// Hard cap on worker threads.
pub const MAX_WORKERS: usize = 64;

/// Default target port.
pub const DEFAULT_PORT: u16 = 4433;

/// Default size of one send, in bytes.
pub const DEFAULT_IO_SIZE: u64 = 64 * 1024;

/// Longest accepted CIBIR id, in bytes.
pub const MAX_CIBIR_ID_LEN: usize = 6;

/// Most local addresses workers can be spread over.
pub const MAX_LOCAL_ADDRESSES: usize = 256;

/// Invalid or inconsistent configuration, reported before the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("conflicting options: {0}")]
    Conflict(String),

    #[error("cannot resolve target {host}: {reason}")]
    Resolve { host: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Address family restriction for target resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Unspec,
    Inet,
    Inet6,
}

impl AddressFamily {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Unspec => true,
            AddressFamily::Inet => addr.is_ipv4(),
            AddressFamily::Inet6 => addr.is_ipv6(),
        }
    }
}

/// Target endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// IP literal or host name
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub family: AddressFamily,
    /// Worker `i` targets the base address plus `i` in its last octet/segment
    #[serde(default)]
    pub increment_target: bool,
    /// CIBIR routing id as a hex string (up to 6 bytes)
    #[serde(default)]
    pub cibir_id: Option<String>,
    #[serde(default)]
    pub compartment_id: Option<u32>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            family: AddressFamily::Unspec,
            increment_target: false,
            cibir_id: None,
            compartment_id: None,
        }
    }
}

impl TargetConfig {
    /// Resolve `host:port` honoring the family restriction.
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, self.port);
            if !self.family.accepts(&addr) {
                return Err(ConfigError::Conflict(format!(
                    "target {} does not match address family {:?}",
                    ip, self.family
                )));
            }
            return Ok(addr);
        }

        let candidates = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        candidates
            .into_iter()
            .find(|addr| self.family.accepts(addr))
            .ok_or_else(|| ConfigError::Resolve {
                host: self.host.clone(),
                reason: format!("no {:?} address", self.family),
            })
    }

    /// CIBIR tag as sent to the transport: offset byte (0) followed by the id.
    pub fn cibir_tag(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let Some(hex) = &self.cibir_id else {
            return Ok(None);
        };
        let id = cli_convert::parse_hex(hex).map_err(|e| ConfigError::invalid("cibir_id", e.to_string()))?;
        if id.is_empty() || id.len() > MAX_CIBIR_ID_LEN {
            return Err(ConfigError::invalid(
                "cibir_id",
                format!("must be 1-{} bytes, got {}", MAX_CIBIR_ID_LEN, id.len()),
            ));
        }
        let mut tag = Vec::with_capacity(id.len() + 1);
        tag.push(0);
        tag.extend_from_slice(&id);
        Ok(Some(tag))
    }

    /// Connection target for worker `worker`, given the resolved base address.
    pub fn connect_target(&self, base: SocketAddr, worker: usize) -> Result<ConnectTarget, ConfigError> {
        let address = if self.increment_target {
            increment_address(base, worker)
        } else {
            base
        };
        Ok(ConnectTarget {
            address,
            server_name: self.host.clone(),
            cibir_id: self.cibir_tag()?,
            compartment_id: self.compartment_id,
            local_address: None,
        })
    }
}

/// Add `offset` to the last octet (IPv4) or segment (IPv6), wrapping.
pub fn increment_address(base: SocketAddr, offset: usize) -> SocketAddr {
    match base.ip() {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            octets[3] = octets[3].wrapping_add(offset as u8);
            SocketAddr::new(IpAddr::from(octets), base.port())
        }
        IpAddr::V6(v6) => {
            let mut segments = v6.segments();
            segments[7] = segments[7].wrapping_add(offset as u16);
            SocketAddr::new(IpAddr::from(segments), base.port())
        }
    }
}

/// Load scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Total connections across all workers
    #[serde(default = "default_connections")]
    pub connections: u32,
    /// Concurrent stream limit per connection (0 = handshake only)
    #[serde(default)]
    pub streams: u32,
    /// Streams started as soon as a connection is up (default: `streams`);
    /// the rest start one per completion
    #[serde(default)]
    pub initial_streams: Option<u32>,
    /// Stop issuing requests on a connection after this many
    #[serde(default)]
    pub requests_per_connection: Option<u64>,
    /// Stop issuing requests process-wide after this many
    #[serde(default)]
    pub total_requests: Option<u64>,
    /// Bytes per send
    #[serde(default = "default_io_size")]
    pub io_size: u64,
    /// Upload bytes per request (milliseconds when `timed`)
    #[serde(default)]
    pub upload: u64,
    /// Download bytes per request (milliseconds when `timed`)
    #[serde(default)]
    pub download: u64,
    #[serde(default)]
    pub timed: bool,
    /// Post follow-up sends from the completion callback instead of the worker thread
    #[serde(default)]
    pub send_inline: bool,
    #[serde(default)]
    pub repeat_connections: bool,
    #[serde(default)]
    pub repeat_streams: bool,
    /// Run duration in milliseconds (0 = until all work completes)
    #[serde(default)]
    pub run_time_ms: u64,
    /// Pause between handshake completion and the first stream
    #[serde(default)]
    pub handshake_wait_ms: u64,
}

fn default_connections() -> u32 {
    1
}

fn default_io_size() -> u64 {
    DEFAULT_IO_SIZE
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            streams: 0,
            initial_streams: None,
            requests_per_connection: None,
            total_requests: None,
            io_size: default_io_size(),
            upload: 0,
            download: 0,
            timed: false,
            send_inline: false,
            repeat_connections: false,
            repeat_streams: false,
            run_time_ms: 0,
            handshake_wait_ms: 0,
        }
    }
}

impl ScenarioConfig {
    pub fn initial_streams(&self) -> u32 {
        self.initial_streams.unwrap_or(self.streams).min(self.streams)
    }

    pub fn run_time(&self) -> Option<Duration> {
        (self.run_time_ms > 0).then(|| Duration::from_millis(self.run_time_ms))
    }

    pub fn handshake_wait(&self) -> Option<Duration> {
        (self.handshake_wait_ms > 0).then(|| Duration::from_millis(self.handshake_wait_ms))
    }

    /// Requests each connection issues when nothing repeats.
    pub fn requests_per_connection_bound(&self) -> u64 {
        let per_connection = match self.requests_per_connection {
            Some(limit) => limit,
            None if self.repeat_streams => u64::MAX,
            None => u64::from(self.streams),
        };
        if self.repeat_streams {
            per_connection
        } else {
            per_connection.min(u64::from(self.streams))
        }
    }

    pub fn repeats(&self) -> bool {
        self.repeat_connections || self.repeat_streams
    }
}

/// Worker thread configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Pin each worker to its own processor
    #[serde(default)]
    pub affinitize: bool,
    /// Processors to pin to (e.g. "0,2-4"); workers take them round-robin
    #[serde(default)]
    pub cpu_cores: Option<String>,
    /// Local addresses to bind; workers take them round-robin
    #[serde(default)]
    pub local_addresses: Vec<SocketAddr>,
}

fn default_threads() -> usize {
    num_cpus::get().clamp(1, MAX_WORKERS)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            affinitize: false,
            cpu_cores: None,
            local_addresses: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Local address for worker `worker`, if addresses were configured.
    pub fn local_address(&self, worker: usize) -> Option<SocketAddr> {
        match self.local_addresses.len() {
            0 => None,
            len => Some(self.local_addresses[worker % len]),
        }
    }
}

/// Runtime toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default = "default_true")]
    pub pacing: bool,
    #[serde(default)]
    pub send_buffering: bool,
    #[serde(default)]
    pub ecn: bool,
    /// Keep per-request latency samples
    #[serde(default)]
    pub print_latency: bool,
    /// Log transport statistics for every connection at shutdown
    #[serde(default)]
    pub print_stats: bool,
    /// Log transport statistics for every stream at shutdown
    #[serde(default)]
    pub print_stream_stats: bool,
    /// Override the latency buffer size
    #[serde(default)]
    pub latency_samples: Option<usize>,
    /// How long to wait for connections to close before forcing them
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            encryption: true,
            pacing: true,
            send_buffering: false,
            ecn: false,
            print_latency: false,
            print_stats: false,
            print_stream_stats: false,
            latency_samples: None,
            drain_timeout_ms: default_drain_timeout_ms(),
            debug: false,
        }
    }
}

impl RuntimeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Default `env_logger` filter; `RUST_LOG` still takes precedence.
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

impl ClientConfig {
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            encryption: self.runtime.encryption,
            pacing: self.runtime.pacing,
            send_buffering: self.runtime.send_buffering,
            ecn: self.runtime.ecn,
        }
    }

    /// Latency sample slots to allocate; zero when latency is not tracked.
    ///
    /// Request-bounded runs size for every request they can issue;
    /// time-bounded repeating runs size for the run time at a nominal peak
    /// rate.
    pub fn latency_capacity(&self) -> usize {
        if !self.runtime.print_latency {
            return 0;
        }
        if let Some(samples) = self.runtime.latency_samples {
            return samples.min(MAX_LATENCY_SAMPLES);
        }

        let scenario = &self.scenario;
        let estimate = if scenario.repeats() && scenario.run_time_ms > 0 {
            let seconds = scenario.run_time_ms.div_ceil(1000);
            MAX_REQUESTS_PER_SECOND.saturating_mul(seconds)
        } else {
            u64::from(scenario.connections).saturating_mul(scenario.requests_per_connection_bound())
        };
        let estimate = match scenario.total_requests {
            Some(total) => estimate.min(total),
            None => estimate,
        };
        usize::try_from(estimate).map_or(MAX_LATENCY_SAMPLES, |n| n.min(MAX_LATENCY_SAMPLES))
    }
}

// Display trait implementations

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Target: {}", self.target)?;
        writeln!(f, "  Scenario: {}", self.scenario)?;
        writeln!(f, "  Workers: {}", self.workers)?;
        writeln!(f, "  Runtime: {}", self.runtime)?;
        Ok(())
    }
}

impl fmt::Display for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({:?})", self.host, self.port, self.family)?;
        if self.increment_target {
            write!(f, ", increment per worker")?;
        }
        if let Some(ref cibir) = self.cibir_id {
            write!(f, ", cibir={}", cibir)?;
        }
        if let Some(compartment) = self.compartment_id {
            write!(f, ", compartment={}", compartment)?;
        }
        Ok(())
    }
}

impl fmt::Display for ScenarioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} conns x {} streams (initial {}), io_size={}",
            self.connections,
            self.streams,
            self.initial_streams(),
            self.io_size
        )?;
        let unit = if self.timed { "ms" } else { "B" };
        write!(f, ", upload={}{}, download={}{}", self.upload, unit, self.download, unit)?;
        if self.repeat_connections {
            write!(f, ", repeat conns")?;
        }
        if self.repeat_streams {
            write!(f, ", repeat streams")?;
        }
        if self.run_time_ms > 0 {
            write!(f, ", run_time={}ms", self.run_time_ms)?;
        }
        if self.handshake_wait_ms > 0 {
            write!(f, ", handshake_wait={}ms", self.handshake_wait_ms)?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} threads", self.threads)?;
        if self.affinitize {
            write!(f, ", affinitized")?;
        }
        if let Some(ref cores) = self.cpu_cores {
            write!(f, ", cpus={}", cores)?;
        }
        if !self.local_addresses.is_empty() {
            write!(f, ", {} local addresses", self.local_addresses.len())?;
        }
        Ok(())
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encryption={}, pacing={}, send_buffering={}, ecn={}, latency={}, stats={}/{}",
            self.encryption,
            self.pacing,
            self.send_buffering,
            self.ecn,
            self.print_latency,
            self.print_stats,
            self.print_stream_stats
        )
    }
}
