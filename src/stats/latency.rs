//! Request latency samples
//!
//! [`LatencyBuffer`] is a pre-sized array of microsecond samples shared by
//! every worker. Writers reserve a slot with one atomic fetch-add; a
//! reservation past the end is simply dropped, so the buffer never grows and
//! never overruns no matter how fast completions arrive.
//!
//! [`LatencySummary`] turns exported samples into percentiles with
//! HdrHistogram.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Upper bound on samples kept for a single run.
pub const MAX_LATENCY_SAMPLES: usize = 16 * 1024 * 1024;

/// Sizing estimate for time-bounded runs.
pub const MAX_REQUESTS_PER_SECOND: u64 = 2_000_000;

/// Fixed-capacity, lock-free latency sample store.
#[derive(Debug)]
pub struct LatencyBuffer {
    samples: Box<[AtomicU32]>,
    next: AtomicU64,
}

impl LatencyBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_LATENCY_SAMPLES);
        let samples = (0..capacity).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        Self {
            samples: samples.into_boxed_slice(),
            next: AtomicU64::new(0),
        }
    }

    /// Record one sample in microseconds. Returns false if the buffer is full.
    #[inline]
    pub fn record(&self, micros: u32) -> bool {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        match usize::try_from(index).ok().and_then(|i| self.samples.get(i)) {
            Some(slot) => {
                slot.store(micros, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Samples recorded so far (bounded by capacity).
    pub fn len(&self) -> usize {
        let reserved = self.next.load(Ordering::Acquire);
        usize::try_from(reserved).map_or(self.samples.len(), |r| r.min(self.samples.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completions that found the buffer full.
    pub fn dropped(&self) -> u64 {
        let reserved = self.next.load(Ordering::Acquire);
        reserved.saturating_sub(self.samples.len() as u64)
    }

    /// Copy out the recorded prefix.
    ///
    /// Call after the workers have drained; while writers are active a slot
    /// may be reserved but not yet written.
    pub fn export(&self) -> Vec<u32> {
        self.samples[..self.len()]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }
}

/// Percentile summary of a set of latency samples, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    /// Summarize samples; `None` when there are none.
    pub fn from_samples(samples: &[u32]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        // 1us .. u32::MAX us, 3 significant digits
        let mut histogram = Histogram::<u64>::new_with_bounds(1, u64::from(u32::MAX), 3).ok()?;
        for &sample in samples {
            let _ = histogram.record(u64::from(sample.max(1)));
        }

        Some(Self {
            count: histogram.len(),
            min_us: histogram.min(),
            mean_us: histogram.mean(),
            p50_us: histogram.value_at_percentile(50.0),
            p90_us: histogram.value_at_percentile(90.0),
            p99_us: histogram.value_at_percentile(99.0),
            p999_us: histogram.value_at_percentile(99.9),
            max_us: histogram.max(),
        })
    }
}
