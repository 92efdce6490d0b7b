//! Configuration validation
//!
//! Runs before any thread is spawned; the first problem found is reported
//! and the run never starts.

use super::*;
use crate::worker::affinity::parse_cpu_list;

/// Validate complete configuration
pub fn validate_config(config: &ClientConfig) -> Result<(), ConfigError> {
    validate_target(&config.target)?;
    validate_scenario(&config.scenario)?;
    validate_workers(&config.workers)?;
    validate_runtime(&config.runtime)?;

    if config.runtime.print_latency && config.latency_capacity() == 0 {
        return Err(ConfigError::Conflict(
            "latency tracking enabled with a zero-sized sample buffer".to_string(),
        ));
    }

    Ok(())
}

/// Validate target configuration
pub fn validate_target(target: &TargetConfig) -> Result<(), ConfigError> {
    if target.host.trim().is_empty() {
        return Err(ConfigError::invalid("target", "host must not be empty"));
    }
    if target.port == 0 {
        return Err(ConfigError::invalid("port", "must be non-zero"));
    }
    target.cibir_tag()?;
    Ok(())
}

/// Validate scenario configuration
pub fn validate_scenario(scenario: &ScenarioConfig) -> Result<(), ConfigError> {
    if scenario.connections == 0 {
        return Err(ConfigError::invalid("connections", "must be at least 1"));
    }
    if scenario.io_size == 0 {
        return Err(ConfigError::invalid("io_size", "must be at least 1 byte"));
    }
    if scenario.io_size > u64::from(u32::MAX) {
        return Err(ConfigError::invalid(
            "io_size",
            format!("{} exceeds the maximum of {}", scenario.io_size, u32::MAX),
        ));
    }
    if let Some(initial) = scenario.initial_streams {
        if initial > scenario.streams {
            return Err(ConfigError::Conflict(format!(
                "initial_streams ({}) exceeds streams ({})",
                initial, scenario.streams
            )));
        }
    }
    if scenario.requests_per_connection == Some(0) {
        return Err(ConfigError::invalid("requests_per_connection", "must be at least 1"));
    }
    if scenario.total_requests == Some(0) {
        return Err(ConfigError::invalid("total_requests", "must be at least 1"));
    }
    if scenario.streams == 0 && scenario.repeat_streams {
        return Err(ConfigError::Conflict(
            "repeat_streams requires at least one stream per connection".to_string(),
        ));
    }
    if scenario.streams == 0 && (scenario.upload > 0 || scenario.download > 0) {
        return Err(ConfigError::Conflict(
            "upload/download configured with zero streams per connection".to_string(),
        ));
    }
    if scenario.timed && scenario.upload == 0 && scenario.download == 0 {
        return Err(ConfigError::Conflict(
            "timed mode needs a non-zero upload or download duration".to_string(),
        ));
    }
    if scenario.run_time_ms == 0 {
        if scenario.repeat_connections {
            return Err(ConfigError::Conflict("repeat_connections requires run_time".to_string()));
        }
        let bounded = scenario.total_requests.is_some() || scenario.requests_per_connection.is_some();
        if scenario.repeat_streams && !bounded {
            return Err(ConfigError::Conflict(
                "repeat_streams requires run_time, total_requests or requests_per_connection".to_string(),
            ));
        }
    }
    Ok(())
}

/// Validate worker configuration
pub fn validate_workers(workers: &WorkerConfig) -> Result<(), ConfigError> {
    if workers.threads == 0 {
        return Err(ConfigError::invalid("threads", "must be at least 1"));
    }
    if workers.threads > MAX_WORKERS {
        return Err(ConfigError::invalid(
            "threads",
            format!("{} exceeds the maximum of {}", workers.threads, MAX_WORKERS),
        ));
    }
    if let Some(ref cores) = workers.cpu_cores {
        parse_cpu_list(cores).map_err(|e| ConfigError::invalid("cpu_cores", e.to_string()))?;
        if !workers.affinitize {
            log::warn!("cpu_cores is set but affinitize is off; workers will not be pinned");
        }
    }
    if workers.local_addresses.len() > MAX_LOCAL_ADDRESSES {
        return Err(ConfigError::invalid(
            "local_addresses",
            format!(
                "{} exceeds the maximum of {}",
                workers.local_addresses.len(),
                MAX_LOCAL_ADDRESSES
            ),
        ));
    }
    Ok(())
}

/// Check every local address against the resolved target's family.
pub fn validate_local_addresses(workers: &WorkerConfig, target: SocketAddr) -> Result<(), ConfigError> {
    match workers
        .local_addresses
        .iter()
        .find(|local| local.is_ipv4() != target.is_ipv4())
    {
        Some(local) => Err(ConfigError::Conflict(format!(
            "local address {} and target {} are different address families",
            local, target
        ))),
        None => Ok(()),
    }
}

/// Validate runtime configuration
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
    if runtime.latency_samples.is_some() && !runtime.print_latency {
        log::warn!("latency_samples is set but latency tracking is off");
    }
    Ok(())
}
