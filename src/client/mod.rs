//! Client orchestrator
//!
//! [`PerfClient`] owns the workers and the state they share. A run goes:
//!
//! 1. `new()` validates the configuration, resolves the target and builds
//!    the request payload
//! 2. `start()` configures the transport, spawns the workers and hands each
//!    its share of the connections (remainder to the first workers)
//! 3. `wait()` blocks until every connection has closed, the run time has
//!    elapsed, or a [`StopHandle`] fires
//! 4. `stop()` clears the running flag so nothing is replenished, waits for
//!    connections to drain (shutting down stragglers after the drain
//!    timeout), joins the workers and returns a [`RunReport`]

pub mod connection;
pub mod pool;
pub mod request;
pub mod stream;

use crate::config::validator::{validate_config, validate_local_addresses};
use crate::config::{ClientConfig, ConfigError};
use crate::stats::latency::{LatencyBuffer, LatencySummary};
use crate::stats::{aggregate, ClientStats, WorkerSnapshot};
use crate::transport::{Transport, TransportError};
use crate::util::lock;
use crate::worker::{affinity, Worker};
use connection::StreamPolicy;
use request::RequestBuffer;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use stream::RequestPlan;
use thiserror::Error;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("transport rejected settings: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to spawn thread for worker {worker}")]
    ThreadSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("client already started")]
    AlreadyStarted,

    #[error("client not started")]
    NotStarted,
}

/// State shared by the orchestrator, every worker and every callback.
pub struct ClientShared {
    pub transport: Arc<dyn Transport>,
    pub request: RequestBuffer,
    pub plan: RequestPlan,
    pub policy: StreamPolicy,
    pub send_inline: bool,
    pub repeat_connections: bool,
    /// Delay between handshake completion and the first stream
    pub handshake_wait: Option<Duration>,
    pub print_stats: bool,
    pub print_stream_stats: bool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    /// Connections queued or alive
    outstanding: AtomicU64,
    request_budget: Option<AtomicU64>,
    latency: Option<LatencyBuffer>,
    signal: Mutex<()>,
    changed: Condvar,
}

impl ClientShared {
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let scenario = &config.scenario;
        let plan = RequestPlan::from_scenario(scenario);
        let io_size = usize::try_from(scenario.io_size).unwrap_or(u32::MAX as usize);
        let capacity = config.latency_capacity();

        Self {
            transport,
            request: RequestBuffer::new(plan.advertised_download(), io_size),
            plan,
            policy: StreamPolicy::from_scenario(scenario),
            send_inline: scenario.send_inline,
            repeat_connections: scenario.repeat_connections,
            handshake_wait: scenario.handshake_wait(),
            print_stats: config.runtime.print_stats,
            print_stream_stats: config.runtime.print_stream_stats,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            outstanding: AtomicU64::new(0),
            request_budget: scenario.total_requests.map(AtomicU64::new),
            latency: (capacity > 0).then(|| LatencyBuffer::with_capacity(capacity)),
            signal: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
        self.notify();
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Take one request from the process-wide budget, if there is one.
    pub fn try_reserve_request(&self) -> bool {
        match &self.request_budget {
            None => true,
            Some(budget) => budget
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
                .is_ok(),
        }
    }

    pub fn record_latency(&self, micros: u32) {
        if let Some(buffer) = &self.latency {
            buffer.record(micros);
        }
    }

    pub fn latency(&self) -> Option<&LatencyBuffer> {
        self.latency.as_ref()
    }

    pub fn outstanding_connections(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn connections_queued(&self, count: u64) {
        self.outstanding.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn connections_closed(&self, count: u64) {
        if count == 0 {
            return;
        }
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)))
            .unwrap_or_else(|n| n);
        if previous <= count {
            self.notify();
        }
    }

    fn notify(&self) {
        let _guard = lock(&self.signal);
        self.changed.notify_all();
    }

    /// Block until `done` holds or `deadline` passes. Returns whether `done`
    /// held.
    pub fn wait_until(&self, deadline: Option<Instant>, done: impl Fn(&Self) -> bool) -> bool {
        let mut guard = lock(&self.signal);
        loop {
            if done(self) {
                return true;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// Ends a run from another thread (e.g. a signal handler).
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<ClientShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

/// Final result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stats: ClientStats,
    pub workers: Vec<WorkerSnapshot>,
    pub elapsed_ms: u64,
    /// Connections shut down explicitly after the drain timeout
    pub forced_shutdowns: u64,
    /// Every connection closed before the workers were stopped
    pub drained: bool,
    pub latency: Option<LatencySummary>,
    pub latency_dropped: u64,
    #[serde(skip)]
    pub latency_samples: Vec<u32>,
}

impl RunReport {
    /// Completed requests per second over the run.
    pub fn requests_per_second(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.stats.completed_requests as f64 * 1000.0 / self.elapsed_ms as f64
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run finished in {} ms", self.elapsed_ms)?;
        writeln!(f, "  {}", self.stats)?;
        writeln!(f, "  Throughput: {:.1} requests/s", self.requests_per_second())?;
        if !self.drained {
            writeln!(f, "  Drain incomplete: {} connections force-closed", self.forced_shutdowns)?;
        }
        if let Some(ref latency) = self.latency {
            writeln!(
                f,
                "  Latency (us): min {} mean {:.1} p50 {} p90 {} p99 {} p99.9 {} max {} ({} samples)",
                latency.min_us,
                latency.mean_us,
                latency.p50_us,
                latency.p90_us,
                latency.p99_us,
                latency.p999_us,
                latency.max_us,
                latency.count
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Load generator: workers plus their shared run state.
pub struct PerfClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    workers: Vec<Worker>,
    shares: Vec<u64>,
    state: RunState,
    started_at: Option<Instant>,
}

/// Split `total` across `workers`; the first `total % workers` get one more.
pub fn partition_connections(total: u32, workers: usize) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let total = u64::from(total);
    let count = workers as u64;
    (0..count)
        .map(|i| total / count + u64::from(i < total % count))
        .collect()
}

impl PerfClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ClientError> {
        validate_config(&config)?;
        let base = config.target.resolve()?;
        validate_local_addresses(&config.workers, base)?;
        let cores = config
            .workers
            .cpu_cores
            .as_deref()
            .map(affinity::parse_cpu_list)
            .transpose()
            .map_err(|e| ConfigError::invalid("cpu_cores", e.to_string()))?;

        let shared = Arc::new(ClientShared::new(&config, transport));
        let shares = partition_connections(config.scenario.connections, config.workers.threads);
        let workers = shares
            .iter()
            .enumerate()
            .map(|(id, &share)| -> Result<Worker, ClientError> {
                let mut target = config.target.connect_target(base, id)?;
                target.local_address = config.workers.local_address(id);
                let processor = config
                    .workers
                    .affinitize
                    .then(|| affinity::processor_for_worker(id, cores.as_deref()));
                Ok(Worker::new(id, target, Arc::clone(&shared), share, processor))
            })
            .collect::<Result<Vec<_>, ClientError>>()?;

        log::debug!("target {} resolved to {}", config.target, base);
        Ok(Self {
            config,
            shared,
            workers,
            shares,
            state: RunState::Idle,
            started_at: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Start the workers and queue every connection.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.state != RunState::Idle {
            return Err(ClientError::AlreadyStarted);
        }
        self.shared.transport.configure(&self.config.transport_settings())?;
        if self.config.workers.affinitize {
            affinity::warn_if_oversubscribed(self.workers.len());
        }

        self.shared.set_running(true);
        for index in 0..self.workers.len() {
            if let Err(err) = self.workers[index].start() {
                self.shared.set_running(false);
                for worker in &mut self.workers {
                    worker.stop();
                }
                self.state = RunState::Stopped;
                return Err(err);
            }
        }

        self.started_at = Some(Instant::now());
        self.state = RunState::Running;
        for (worker, &share) in self.workers.iter().zip(&self.shares) {
            worker.queue_connections(share);
        }
        log::info!(
            "started {} connections on {} workers",
            self.config.scenario.connections,
            self.workers.len()
        );
        Ok(())
    }

    /// Wait for the run to finish, then stop it.
    pub fn wait(&mut self) -> Result<RunReport, ClientError> {
        if self.state != RunState::Running {
            return Err(ClientError::NotStarted);
        }
        let deadline = match (self.started_at, self.config.scenario.run_time()) {
            (Some(started), Some(run_time)) => Some(started + run_time),
            _ => None,
        };

        let finished = self
            .shared
            .wait_until(deadline, |s| s.outstanding_connections() == 0 || s.stop_requested());
        if finished && self.shared.stop_requested() {
            log::info!("stop requested");
        } else if finished {
            log::info!("all connections closed");
        } else {
            log::info!("run time elapsed");
        }
        self.stop()
    }

    /// Start, wait and stop in one call.
    pub fn run(&mut self) -> Result<RunReport, ClientError> {
        self.start()?;
        self.wait()
    }

    /// End the run: stop replenishing, drain, join the workers.
    pub fn stop(&mut self) -> Result<RunReport, ClientError> {
        match self.state {
            RunState::Idle => return Err(ClientError::NotStarted),
            RunState::Stopped => return Ok(self.report(true, 0)),
            RunState::Running => {}
        }
        self.shared.set_running(false);
        for worker in &self.workers {
            worker.wake();
        }

        let drain = self.config.runtime.drain_timeout();
        let mut drained = self.wait_drained(drain);
        let mut forced = 0;
        if !drained {
            forced = self.force_shutdown();
            log::warn!("drain timed out; shut down {} remaining connections", forced);
            drained = self.wait_drained(drain);
        }

        for worker in &mut self.workers {
            worker.stop();
        }
        self.state = RunState::Stopped;

        let report = self.report(drained, forced);
        log::info!(
            "run stopped after {} ms: {} requests completed",
            report.elapsed_ms,
            report.stats.completed_requests
        );
        Ok(report)
    }

    fn wait_drained(&self, timeout: Duration) -> bool {
        self.shared
            .wait_until(Some(Instant::now() + timeout), |s| s.outstanding_connections() == 0)
    }

    fn force_shutdown(&self) -> u64 {
        let mut forced = 0;
        for worker in &self.workers {
            for id in worker.active_connections() {
                match self.shared.transport.shutdown_connection(id, 0) {
                    Ok(()) => forced += 1,
                    Err(err) => log::debug!("worker {}: forced shutdown of {} failed: {}", worker.id(), id, err),
                }
            }
        }
        forced
    }

    fn report(&self, drained: bool, forced_shutdowns: u64) -> RunReport {
        let workers = self.worker_stats();
        let latency_samples = self.latency_samples();
        RunReport {
            stats: aggregate(&workers),
            workers,
            elapsed_ms: self
                .started_at
                .map_or(0, |started| started.elapsed().as_millis() as u64),
            forced_shutdowns,
            drained,
            latency: LatencySummary::from_samples(&latency_samples),
            latency_dropped: self.shared.latency().map_or(0, |buffer| buffer.dropped()),
            latency_samples,
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(Worker::snapshot).collect()
    }

    /// Client-wide counters; safe to call while running.
    pub fn stats(&self) -> ClientStats {
        aggregate(&self.worker_stats())
    }

    /// Copy of the recorded latency samples (microseconds).
    pub fn latency_samples(&self) -> Vec<u32> {
        self.shared.latency().map(LatencyBuffer::export).unwrap_or_default()
    }
}

impl Drop for PerfClient {
    fn drop(&mut self) {
        if self.state == RunState::Running {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackOptions, LoopbackTransport};

    fn transport() -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(LoopbackOptions::default()).unwrap())
    }

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.scenario.connections = 10;
        config.scenario.streams = 2;
        config.scenario.io_size = 1024;
        config.scenario.upload = 4096;
        config.scenario.download = 2048;
        config.workers.threads = 3;
        config
    }

    #[test]
    fn test_partition_connections() {
        assert_eq!(partition_connections(10, 3), vec![4, 3, 3]);
        assert_eq!(partition_connections(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(partition_connections(8, 4), vec![2, 2, 2, 2]);
        assert!(partition_connections(5, 0).is_empty());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut bad = config();
        bad.workers.threads = 0;
        assert!(matches!(
            PerfClient::new(bad, transport()),
            Err(ClientError::Config(ConfigError::Invalid { field: "threads", .. }))
        ));
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut client = PerfClient::new(config(), transport()).unwrap();
        assert!(matches!(client.wait(), Err(ClientError::NotStarted)));
        assert!(matches!(client.stop(), Err(ClientError::NotStarted)));

        client.start().unwrap();
        assert!(matches!(client.start(), Err(ClientError::AlreadyStarted)));
        let report = client.wait().unwrap();
        assert!(report.drained);
        assert!(matches!(client.start(), Err(ClientError::AlreadyStarted)));
    }

    #[test]
    fn test_run_reports_counts_per_worker() {
        let mut client = PerfClient::new(config(), transport()).unwrap();
        let report = client.run().unwrap();

        assert_eq!(report.workers.len(), 3);
        let totals: Vec<u64> = report.workers.iter().map(|w| w.total_connections).collect();
        assert_eq!(totals, vec![4, 3, 3]);
        assert_eq!(report.stats.total_connections, 10);
        assert_eq!(report.stats.completed_requests, 20);
        assert_eq!(report.stats.active_connections, 0);
        assert!(report.stats.is_conserved());
        assert!(report.latency.is_none());
    }

    #[test]
    fn test_settings_forwarded() {
        let transport = transport();
        let mut config = config();
        config.runtime.encryption = false;
        config.runtime.ecn = true;
        let mut client = PerfClient::new(config, transport.clone()).unwrap();
        client.run().unwrap();

        let settings = transport.settings().unwrap();
        assert!(!settings.encryption);
        assert!(settings.ecn);
        assert!(settings.pacing);
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let mut config = config();
        config.scenario.repeat_streams = true;
        config.scenario.streams = 1;
        config.scenario.run_time_ms = 60_000;
        let mut client = PerfClient::new(config, transport()).unwrap();
        let stop = client.stop_handle();
        client.start().unwrap();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let report = client.wait().unwrap();
        stopper.join().unwrap();

        assert!(report.drained);
        assert_eq!(report.stats.active_connections, 0);
        assert!(report.stats.completed_requests > 0);
        assert!(report.stats.completed_requests <= report.stats.started_requests);
    }

    #[test]
    fn test_new_rejects_unbounded_repeat() {
        let mut config = config();
        config.scenario.repeat_streams = true;
        assert!(matches!(
            PerfClient::new(config, transport()),
            Err(ClientError::Config(ConfigError::Conflict(_)))
        ));
    }

    #[test]
    fn test_new_rejects_local_address_family_mismatch() {
        let mut config = config();
        config.workers.local_addresses = vec!["[fd00::1]:0".parse().unwrap()];
        assert!(matches!(
            PerfClient::new(config, transport()),
            Err(ClientError::Config(ConfigError::Conflict(_)))
        ));
    }

    #[test]
    fn test_workers_get_local_addresses() {
        let mut config = config();
        config.workers.local_addresses = vec!["10.0.0.1:0".parse().unwrap(), "10.0.0.2:0".parse().unwrap()];
        let client = PerfClient::new(config, transport()).unwrap();
        let locals: Vec<String> = client
            .workers()
            .iter()
            .map(|w| w.target().local_address.map(|a| a.to_string()).unwrap_or_default())
            .collect();
        assert_eq!(locals, vec!["10.0.0.1:0", "10.0.0.2:0", "10.0.0.1:0"]);
    }

    #[test]
    fn test_stop_ends_handshake_wait() {
        let mut config = config();
        config.scenario.handshake_wait_ms = 60_000;
        config.scenario.run_time_ms = 100;
        config.scenario.repeat_streams = true;
        let mut client = PerfClient::new(config, transport()).unwrap();
        let report = client.run().unwrap();

        // Stopped long before the wait would have elapsed
        assert!(report.drained);
        assert_eq!(report.forced_shutdowns, 0);
        assert_eq!(report.stats.connected_connections, 10);
        assert_eq!(report.stats.started_requests, 0);
        assert!(report.elapsed_ms < 60_000);
    }

    #[test]
    fn test_report_display() {
        let mut config = config();
        config.runtime.print_latency = true;
        let mut client = PerfClient::new(config, transport()).unwrap();
        let report = client.run().unwrap();
        let text = report.to_string();
        assert!(text.contains("requests"));
        assert!(text.contains("Latency"));
        assert_eq!(report.latency.map(|l| l.count), Some(20));
    }
}
