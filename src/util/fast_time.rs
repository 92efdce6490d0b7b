//! Fast monotonic timestamps using direct clock_gettime calls
//!
//! Streams stamp their start time on every request, so the clock read sits
//! on the hot path of each completion.

use std::time::Duration;

/// Monotonic timestamp read with `clock_gettime(CLOCK_MONOTONIC)`.
///
/// Resolution: nanosecond.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FastInstant {
    nanos: u64,
}

impl FastInstant {
    /// Current time from CLOCK_MONOTONIC
    #[inline(always)]
    pub fn now() -> Self {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };

        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }

        Self {
            nanos: (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64),
        }
    }

    /// Duration since an earlier instant (zero if `earlier` is later)
    #[inline(always)]
    pub fn duration_since(&self, earlier: FastInstant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }

    #[inline(always)]
    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }

    /// Whole microseconds elapsed, saturated to `u32` for the latency buffer
    #[inline]
    pub fn elapsed_micros_u32(&self) -> u32 {
        u32::try_from(self.elapsed().as_micros()).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fast_instant_basic() {
        let start = FastInstant::now();
        thread::sleep(Duration::from_millis(10));
        let end = FastInstant::now();

        let elapsed = end.duration_since(start);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_duration_since_saturates() {
        let earlier = FastInstant::now();
        thread::sleep(Duration::from_millis(1));
        let later = FastInstant::now();
        assert_eq!(earlier.duration_since(later), Duration::ZERO);
        assert!(later > earlier);
    }

    #[test]
    fn test_elapsed_micros() {
        let start = FastInstant::now();
        thread::sleep(Duration::from_millis(2));
        assert!(start.elapsed_micros_u32() >= 2_000);
    }
}
