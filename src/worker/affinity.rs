//! CPU affinity binding for worker threads
//!
//! Pinning each worker to its own processor keeps a worker's connections,
//! pools and counters in one core's cache and stops the scheduler from
//! migrating the thread mid-run.
//!
//! CPU affinity is supported on Linux via `sched_setaffinity`.
//!
//! # Example
//!
//! ```no_run
//! use loadpulse::worker::affinity::{parse_cpu_list, set_cpu_affinity};
//!
//! // Bind to CPU cores 0, 2, 4
//! let cores = parse_cpu_list("0,2,4").unwrap();
//! set_cpu_affinity(&cores).unwrap();
//! ```

use crate::Result;
use anyhow::Context;

/// Set CPU affinity for the current thread
///
/// # Errors
///
/// Returns an error if the core list is empty, a core id is out of range,
/// or the syscall fails.
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cores: &[usize]) -> Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_ZERO};
    use std::mem;

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    unsafe {
        let mut cpu_set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut cpu_set);

        for &core in cores {
            if core >= 1024 {
                anyhow::bail!("CPU core ID {} is too large (max 1023)", core);
            }
            CPU_SET(core, &mut cpu_set);
        }

        let result = sched_setaffinity(
            0, // 0 = current thread
            mem::size_of::<cpu_set_t>(),
            &cpu_set,
        );

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("Failed to set CPU affinity to cores {:?}", cores));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cores: &[usize]) -> Result<()> {
    anyhow::bail!("CPU affinity is only supported on Linux")
}

/// Parse a comma-separated list of CPU cores or ranges
///
/// Supports "0,1,2,3", "0-3" and mixed "0,2-4,7". The result is sorted and
/// deduplicated.
///
/// ```
/// use loadpulse::worker::affinity::parse_cpu_list;
///
/// let cores = parse_cpu_list("0,2-4,7").unwrap();
/// assert_eq!(cores, vec![0, 2, 3, 4, 7]);
/// ```
pub fn parse_cpu_list(spec: &str) -> Result<Vec<usize>> {
    let mut cores = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();

        if part.contains('-') {
            let range_parts: Vec<&str> = part.split('-').collect();
            if range_parts.len() != 2 {
                anyhow::bail!("Invalid CPU range format: {}", part);
            }

            let start: usize = range_parts[0]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[0]))?;
            let end: usize = range_parts[1]
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", range_parts[1]))?;

            if start > end {
                anyhow::bail!("Invalid CPU range: start ({}) > end ({})", start, end);
            }

            cores.extend(start..=end);
        } else {
            let core: usize = part
                .parse()
                .with_context(|| format!("Invalid CPU core number: {}", part))?;
            cores.push(core);
        }
    }

    if cores.is_empty() {
        anyhow::bail!("CPU core list cannot be empty");
    }

    cores.sort_unstable();
    cores.dedup();

    Ok(cores)
}

/// Processor a worker should be pinned to.
///
/// With an explicit list, workers take its entries round-robin; otherwise
/// worker `i` maps to processor `i` modulo the system's processor count.
pub fn processor_for_worker(worker: usize, cores: Option<&[usize]>) -> usize {
    match cores {
        Some(list) if !list.is_empty() => list[worker % list.len()],
        _ => worker % num_cpus().max(1),
    }
}

/// Get the number of available CPU cores
pub fn num_cpus() -> usize {
    num_cpus::get()
}

/// Warn when more workers than processors are configured.
///
/// Returns true if the thread count exceeds the CPU count.
pub fn warn_if_oversubscribed(thread_count: usize) -> bool {
    let cpu_count = num_cpus();
    if thread_count > cpu_count {
        log::warn!(
            "worker count ({}) exceeds CPU count ({}); expect context switching overhead",
            thread_count,
            cpu_count
        );
        true
    } else {
        false
    }
}
