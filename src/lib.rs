//! loadpulse - connection and stream load generator
//!
//! loadpulse drives a transport protocol stack with many concurrent
//! connections, each running request/response streams, and measures how
//! many requests complete and how long they take.
//!
//! # Architecture
//!
//! - **Frame codec**: Ethernet/IPv4/IPv6/UDP/TCP header build and parse for
//!   raw datapaths
//! - **Transport seam**: event-driven [`transport::Transport`] trait, with an
//!   in-process loopback engine
//! - **Workers**: one thread per worker, each owning its connections, stream
//!   pools and counters
//! - **Orchestrator**: [`client::PerfClient`] partitions connections, times
//!   the run, drains and aggregates statistics

pub mod client;
pub mod config;
pub mod datapath;
pub mod framing;
pub mod stats;
pub mod transport;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use client::{ClientError, PerfClient, RunReport, StopHandle};
pub use config::ClientConfig;
pub use transport::Transport;

/// Result type used by application-level code
pub type Result<T> = anyhow::Result<T>;
