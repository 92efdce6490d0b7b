//! Statistics collection
//!
//! Per-worker counters are cache-line aligned atomics mutated only by
//! increment/decrement, never under a lock. The orchestrator reads them
//! through [`WorkerCounters::snapshot`] and sums snapshots with the pure
//! [`aggregate`] function.
//!
//! # Example
//!
//! ```
//! use loadpulse::stats::{aggregate, WorkerCounters};
//!
//! let counters = WorkerCounters::default();
//! counters.started_requests.add(2);
//! counters.send_completed_requests.add(1);
//!
//! let total = aggregate(&[counters.snapshot(0)]);
//! assert_eq!(total.started_requests, 2);
//! assert!(total.is_conserved());
//! ```

pub mod latency;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned atomic counter to prevent false sharing
///
/// Each counter occupies its own 64-byte cache line so workers bumping
/// neighbouring counters on different cores do not invalidate each other.
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
///
/// Updates use `Release` and reads use `Acquire`: a reader that loads a
/// later pipeline stage first and an earlier stage second never observes the
/// later stage ahead of the earlier one.
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self::with_value(0)
    }

    pub fn with_value(val: u64) -> Self {
        Self {
            value: AtomicU64::new(val),
            _padding: [0; 56],
        }
    }

    #[inline]
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Release);
    }

    /// Decrement, saturating at zero.
    #[inline]
    pub fn sub(&self, val: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Release, Ordering::Relaxed, |v| Some(v.saturating_sub(val)));
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by one worker.
///
/// Everything except `active_connections` only grows during a run.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub total_connections: AlignedCounter,
    pub connected_connections: AlignedCounter,
    pub active_connections: AlignedCounter,
    pub started_requests: AlignedCounter,
    pub send_completed_requests: AlignedCounter,
    pub completed_requests: AlignedCounter,
}

impl WorkerCounters {
    /// Read all counters.
    ///
    /// Each pipeline is read from its last stage to its first, so
    /// `started >= send_completed >= completed` and `total >= connected`
    /// hold in every snapshot even while the worker is running.
    pub fn snapshot(&self, worker: usize) -> WorkerSnapshot {
        let completed_requests = self.completed_requests.get();
        let send_completed_requests = self.send_completed_requests.get();
        let started_requests = self.started_requests.get();
        let active_connections = self.active_connections.get();
        let connected_connections = self.connected_connections.get();
        let total_connections = self.total_connections.get();

        WorkerSnapshot {
            worker,
            total_connections,
            connected_connections,
            active_connections,
            started_requests,
            send_completed_requests,
            completed_requests,
        }
    }
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub worker: usize,
    pub total_connections: u64,
    pub connected_connections: u64,
    pub active_connections: u64,
    pub started_requests: u64,
    pub send_completed_requests: u64,
    pub completed_requests: u64,
}

/// Client-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub workers: usize,
    pub total_connections: u64,
    pub connected_connections: u64,
    pub active_connections: u64,
    pub started_requests: u64,
    pub send_completed_requests: u64,
    pub completed_requests: u64,
}

impl ClientStats {
    /// `started >= send_completed >= completed`
    pub fn is_conserved(&self) -> bool {
        self.started_requests >= self.send_completed_requests
            && self.send_completed_requests >= self.completed_requests
    }
}

/// Sum worker snapshots into client-wide totals.
pub fn aggregate(snapshots: &[WorkerSnapshot]) -> ClientStats {
    snapshots.iter().fold(
        ClientStats {
            workers: snapshots.len(),
            ..ClientStats::default()
        },
        |mut total, s| {
            total.total_connections += s.total_connections;
            total.connected_connections += s.connected_connections;
            total.active_connections += s.active_connections;
            total.started_requests += s.started_requests;
            total.send_completed_requests += s.send_completed_requests;
            total.completed_requests += s.completed_requests;
            total
        },
    )
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connections: {} total, {} connected, {} active; requests: {} started, {} send-completed, {} completed",
            self.total_connections,
            self.connected_connections,
            self.active_connections,
            self.started_requests,
            self.send_completed_requests,
            self.completed_requests
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_aligned_counter_layout() {
        assert_eq!(std::mem::size_of::<AlignedCounter>(), 64);
        assert_eq!(std::mem::align_of::<AlignedCounter>(), 64);
    }

    #[test]
    fn test_aligned_counter_ops() {
        let counter = AlignedCounter::with_value(5);
        counter.add(3);
        assert_eq!(counter.get(), 8);
        counter.sub(10);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_aggregate_sums_workers() {
        let a = WorkerSnapshot {
            worker: 0,
            total_connections: 3,
            connected_connections: 2,
            active_connections: 1,
            started_requests: 10,
            send_completed_requests: 9,
            completed_requests: 8,
        };
        let b = WorkerSnapshot {
            worker: 1,
            total_connections: 1,
            connected_connections: 1,
            active_connections: 0,
            started_requests: 5,
            send_completed_requests: 5,
            completed_requests: 5,
        };

        let total = aggregate(&[a, b]);
        assert_eq!(total.workers, 2);
        assert_eq!(total.total_connections, 4);
        assert_eq!(total.connected_connections, 3);
        assert_eq!(total.active_connections, 1);
        assert_eq!(total.started_requests, 15);
        assert_eq!(total.send_completed_requests, 14);
        assert_eq!(total.completed_requests, 13);
        assert!(total.is_conserved());
    }

    #[test]
    fn test_aggregate_empty() {
        assert_eq!(aggregate(&[]), ClientStats::default());
    }

    #[test]
    fn test_snapshot_conservation_under_concurrency() {
        let counters = Arc::new(WorkerCounters::default());
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        counters.started_requests.add(1);
                        counters.send_completed_requests.add(1);
                        counters.completed_requests.add(1);
                    }
                })
            })
            .collect();

        let reader = {
            let counters = Arc::clone(&counters);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let snapshot = counters.snapshot(0);
                    assert!(snapshot.started_requests >= snapshot.send_completed_requests);
                    assert!(snapshot.send_completed_requests >= snapshot.completed_requests);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        reader.join().unwrap();

        let total = aggregate(&[counters.snapshot(0)]);
        assert_eq!(total.started_requests, 80_000);
        assert_eq!(total.completed_requests, 80_000);
    }
}
