//! String parsers for CLI values

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};

/// Parse a size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size out of range: {}", s))
}

/// Parse a duration string (e.g., "250ms", "5s", "2m", "1h") to milliseconds
///
/// A bare number is taken as milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("ms") {
        (s.trim_end_matches("ms"), 1u64)
    } else if s.ends_with("min") || s.ends_with('m') {
        (s.trim_end_matches("min").trim_end_matches('m'), 60_000)
    } else if s.ends_with("sec") || s.ends_with('s') {
        (s.trim_end_matches("sec").trim_end_matches('s'), 1_000)
    } else if s.ends_with('h') {
        (s.trim_end_matches('h'), 3_600_000)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {}", s))
}

/// Parse a hex string (e.g., "0a1b2c", optionally "0x"-prefixed) to bytes
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        anyhow::bail!("Hex string must have an even number of digits: {}", s);
    }

    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .with_context(|| format!("Invalid hex digits at offset {} in {}", i, s))
        })
        .collect()
}

/// Parse a comma-separated address list (e.g., "10.0.0.1,10.0.0.2:5000")
///
/// An address without a port binds an ephemeral one.
pub fn parse_local_addresses(s: &str) -> Result<Vec<SocketAddr>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<SocketAddr>()
                .or_else(|_| part.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 0)))
                .with_context(|| format!("Invalid local address: {}", part))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("100b").unwrap(), 100);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("250").unwrap(), 250);
        assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
        assert_eq!(parse_duration_ms("5s").unwrap(), 5_000);
        assert_eq!(parse_duration_ms("5sec").unwrap(), 5_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("2min").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn test_parse_local_addresses() {
        let addrs = parse_local_addresses("10.0.0.1, 10.0.0.2:5000,[fd00::1]:0,fd00::2").unwrap();
        assert_eq!(
            addrs,
            vec![
                "10.0.0.1:0".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:5000".parse().unwrap(),
                "[fd00::1]:0".parse().unwrap(),
                "[fd00::2]:0".parse().unwrap(),
            ]
        );
        assert!(parse_local_addresses("").unwrap().is_empty());
        assert!(parse_local_addresses("10.0.0.1,nowhere").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a1B").unwrap(), vec![0x0a, 0x1b]);
        assert_eq!(parse_hex("0xff00").unwrap(), vec![0xff, 0x00]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
