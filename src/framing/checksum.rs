//! Internet checksum helpers (RFC 1071)
//!
//! Used by the frame builder for the IPv4 header checksum and the UDP/TCP
//! pseudo-header checksums, and by the parser to verify IPv4 headers.

use std::net::IpAddr;

/// Add `data` to a running one's-complement sum as big-endian 16-bit words.
///
/// An odd trailing byte is padded with a zero byte on the right.
#[inline]
fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Fold the carries of a 32-bit sum into 16 bits and return the complement.
#[inline]
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the Internet checksum over `data`.
///
/// The caller zeroes any checksum field inside `data` before computing it.
/// Running the checksum over data that already contains a correct checksum
/// yields zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

/// Compute a UDP or TCP checksum including the IP pseudo-header.
///
/// `segment` is the full transport header plus payload with its checksum
/// field zeroed. Both addresses must be of the same family; a mixed pair is
/// summed as-is since the builder rejects such specs before getting here.
pub fn pseudo_header_checksum(source: IpAddr, destination: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = accumulate(sum, &src.octets());
            sum = accumulate(sum, &dst.octets());
            sum = accumulate(sum, &[0, protocol]);
            sum = accumulate(sum, &(segment.len() as u16).to_be_bytes());
        }
        (src, dst) => {
            sum = accumulate(sum, &ip_octets(src));
            sum = accumulate(sum, &ip_octets(dst));
            sum = accumulate(sum, &(segment.len() as u32).to_be_bytes());
            sum = accumulate(sum, &[0, 0, 0, protocol]);
        }
    }
    finish(accumulate(sum, segment))
}

fn ip_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
