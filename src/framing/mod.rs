//! Raw Ethernet/IP/UDP/TCP framing
//!
//! Pure functions that build and parse link-layer frames for the raw
//! (kernel-bypass) datapath. No I/O and no shared state: the builder writes
//! into a caller-owned buffer and the parser borrows the received frame.
//!
//! # Wire format
//!
//! All multi-byte fields are **big-endian**.
//!
//! ```text
//! +----------------+---------------------------+------------------+---------+
//! | Ethernet (14)  | IPv4 (20) or IPv6 (40)    | UDP (8)/TCP (20) | payload |
//! +----------------+---------------------------+------------------+---------+
//! ```
//!
//! The IP traffic-class/TOS byte carries the DSCP in its high 6 bits and the
//! ECN codepoint in its low 2 bits. Length fields are always computed from the
//! actual payload on build, and validated against the received buffer on
//! parse; a frame that fails any check is rejected as a whole.
//!
//! # Example
//!
//! ```
//! use loadpulse::framing::{encode_frame, parse_frame, Ecn, FrameSpec, L4Header};
//!
//! let spec = FrameSpec {
//!     ecn: Ecn::Ect0,
//!     ..FrameSpec::udp("10.0.0.1:5000".parse().unwrap(), "10.0.0.2:4433".parse().unwrap())
//! };
//! let frame = encode_frame(&spec, b"hello").unwrap();
//! let parsed = parse_frame(&frame).unwrap();
//! assert_eq!(parsed.payload, b"hello");
//! assert_eq!(parsed.ecn, Ecn::Ect0);
//! assert_eq!(parsed.l4, L4Header::Udp);
//! ```

pub mod checksum;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Link-layer (MAC) address.
pub type MacAddr = [u8; 6];

/// Ethernet header length.
pub const ETH_HEADER_LEN: usize = 14;
/// IPv4 header length without options.
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 fixed header length.
pub const IPV6_HEADER_LEN: usize = 40;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;
/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Default TTL / hop limit for built frames.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Mask of the ECN bits inside the TOS/traffic-class byte.
pub const ECN_MASK: u8 = 0x03;

const IPV4_FLAG_DF: u16 = 0x4000;
const IPV4_FLAG_MF: u16 = 0x2000;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;
const TCP_DEFAULT_WINDOW: u16 = 0xffff;

/// Explicit Congestion Notification codepoint (RFC 3168).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ecn {
    /// Not ECN-capable transport
    #[default]
    NonEct,
    /// ECN-capable transport, codepoint 1
    Ect1,
    /// ECN-capable transport, codepoint 0
    Ect0,
    /// Congestion experienced
    Ce,
}

impl Ecn {
    /// The 2-bit codepoint value.
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            Ecn::NonEct => 0b00,
            Ecn::Ect1 => 0b01,
            Ecn::Ect0 => 0b10,
            Ecn::Ce => 0b11,
        }
    }

    /// Extract the codepoint from a TOS/traffic-class byte.
    #[inline]
    pub fn from_tos(tos: u8) -> Self {
        match tos & ECN_MASK {
            0b00 => Ecn::NonEct,
            0b01 => Ecn::Ect1,
            0b10 => Ecn::Ect0,
            _ => Ecn::Ce,
        }
    }
}

/// Replace the ECN bits of a TOS/traffic-class byte, leaving the DSCP intact.
#[inline]
pub fn set_ecn(tos: u8, ecn: Ecn) -> u8 {
    (tos & !ECN_MASK) | ecn.bits()
}

/// Transport protocol carried in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Type {
    Udp,
    Tcp,
}

impl L4Type {
    fn protocol(self) -> u8 {
        match self {
            L4Type::Udp => IPPROTO_UDP,
            L4Type::Tcp => IPPROTO_TCP,
        }
    }

    fn header_len(self) -> usize {
        match self {
            L4Type::Udp => UDP_HEADER_LEN,
            L4Type::Tcp => TCP_HEADER_LEN,
        }
    }
}

/// TCP header state used when the datapath frames packets as TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpState {
    pub sequence: u32,
    pub acknowledgement: u32,
    /// TCP flag byte (ACK = 0x10, PSH = 0x08, ...)
    pub flags: u8,
    pub window: u16,
}

impl Default for TcpState {
    fn default() -> Self {
        Self {
            sequence: 0,
            acknowledgement: 0,
            flags: 0x10,
            window: TCP_DEFAULT_WINDOW,
        }
    }
}

/// Transport header selection for build, and the parsed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Header {
    Udp,
    Tcp(TcpState),
}

impl L4Header {
    /// The transport type of this header.
    pub fn l4_type(&self) -> L4Type {
        match self {
            L4Header::Udp => L4Type::Udp,
            L4Header::Tcp(_) => L4Type::Tcp,
        }
    }
}

/// Errors raised by the frame codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame ends before a header or the declared length is complete
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// A header field is internally inconsistent
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// A well-formed frame this datapath does not handle (ARP, ICMP, fragments)
    #[error("unsupported {layer}: {value:#06x}")]
    Unsupported { layer: &'static str, value: u16 },

    /// The output buffer cannot hold the frame
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Source and destination are of different address families
    #[error("source and destination address families differ")]
    AddressFamilyMismatch,

    /// The payload does not fit in the IP/UDP length fields
    #[error("payload of {0} bytes exceeds the maximum datagram size")]
    PayloadTooLarge(usize),
}

impl FrameError {
    /// Whether this error means the frame was corrupt (as opposed to simply
    /// not addressed to this datapath).
    pub fn is_malformed(&self) -> bool {
        matches!(self, FrameError::Truncated { .. } | FrameError::Malformed(_))
    }
}

/// Everything needed to frame one outgoing datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub ecn: Ecn,
    /// Differentiated services codepoint (6 bits; higher bits are ignored)
    pub dscp: u8,
    pub hop_limit: u8,
    pub l4: L4Header,
}

impl FrameSpec {
    /// A UDP frame spec with zero MACs, no DSCP and no ECN marking.
    pub fn udp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            src_mac: [0; 6],
            dst_mac: [0; 6],
            source,
            destination,
            ecn: Ecn::NonEct,
            dscp: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
            l4: L4Header::Udp,
        }
    }

    /// The TOS/traffic-class byte this spec produces.
    #[inline]
    pub fn tos(&self) -> u8 {
        set_ecn((self.dscp & 0x3f) << 2, self.ecn)
    }

    fn is_ipv4(&self) -> Result<bool, FrameError> {
        match (self.source, self.destination) {
            (SocketAddr::V4(_), SocketAddr::V4(_)) => Ok(true),
            (SocketAddr::V6(_), SocketAddr::V6(_)) => Ok(false),
            _ => Err(FrameError::AddressFamilyMismatch),
        }
    }
}

/// Total frame length for a payload of `payload_len` bytes.
pub fn frame_len(ipv4: bool, l4: L4Type, payload_len: usize) -> usize {
    let ip = if ipv4 { IPV4_HEADER_LEN } else { IPV6_HEADER_LEN };
    ETH_HEADER_LEN + ip + l4.header_len() + payload_len
}

/// Build a frame into `buf`, returning the number of bytes written.
///
/// # Errors
///
/// - [`FrameError::AddressFamilyMismatch`] if source and destination differ in family
/// - [`FrameError::PayloadTooLarge`] if a length field would overflow
/// - [`FrameError::BufferTooSmall`] if `buf` cannot hold the frame
pub fn build_frame(spec: &FrameSpec, payload: &[u8], buf: &mut [u8]) -> Result<usize, FrameError> {
    let ipv4 = spec.is_ipv4()?;
    let l4 = spec.l4.l4_type();
    let segment_len = l4.header_len() + payload.len();
    let ip_header_len = if ipv4 { IPV4_HEADER_LEN } else { IPV6_HEADER_LEN };

    // IPv4 total length covers its own header; IPv6 payload length does not
    let limit_len = if ipv4 { ip_header_len + segment_len } else { segment_len };
    if limit_len > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let total = ETH_HEADER_LEN + ip_header_len + segment_len;
    if buf.len() < total {
        return Err(FrameError::BufferTooSmall {
            needed: total,
            available: buf.len(),
        });
    }
    let frame = &mut buf[..total];

    // Ethernet
    frame[0..6].copy_from_slice(&spec.dst_mac);
    frame[6..12].copy_from_slice(&spec.src_mac);
    let ethertype = if ipv4 { ETHERTYPE_IPV4 } else { ETHERTYPE_IPV6 };
    frame[12..14].copy_from_slice(&ethertype.to_be_bytes());

    let ip_start = ETH_HEADER_LEN;
    let l4_start = ip_start + ip_header_len;
    let tos = spec.tos();

    match (spec.source.ip(), spec.destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            write_ipv4_header(&mut frame[ip_start..l4_start], tos, segment_len, spec.hop_limit, l4, src, dst);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            write_ipv6_header(&mut frame[ip_start..l4_start], tos, segment_len, spec.hop_limit, l4, src, dst);
        }
        _ => return Err(FrameError::AddressFamilyMismatch),
    }

    let segment = &mut frame[l4_start..];
    segment[l4.header_len()..].copy_from_slice(payload);
    segment[0..2].copy_from_slice(&spec.source.port().to_be_bytes());
    segment[2..4].copy_from_slice(&spec.destination.port().to_be_bytes());

    match spec.l4 {
        L4Header::Udp => {
            segment[4..6].copy_from_slice(&(segment_len as u16).to_be_bytes());
            segment[6..8].fill(0);
            let mut csum = checksum::pseudo_header_checksum(
                spec.source.ip(),
                spec.destination.ip(),
                IPPROTO_UDP,
                segment,
            );
            // Zero means "no checksum" for UDP; transmit all ones instead
            if csum == 0 {
                csum = 0xffff;
            }
            segment[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        L4Header::Tcp(tcp) => {
            segment[4..8].copy_from_slice(&tcp.sequence.to_be_bytes());
            segment[8..12].copy_from_slice(&tcp.acknowledgement.to_be_bytes());
            segment[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
            segment[13] = tcp.flags;
            segment[14..16].copy_from_slice(&tcp.window.to_be_bytes());
            segment[16..20].fill(0);
            let csum = checksum::pseudo_header_checksum(
                spec.source.ip(),
                spec.destination.ip(),
                IPPROTO_TCP,
                segment,
            );
            segment[16..18].copy_from_slice(&csum.to_be_bytes());
        }
    }

    Ok(total)
}

/// Build a frame into a newly allocated vector.
pub fn encode_frame(spec: &FrameSpec, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let ipv4 = spec.is_ipv4()?;
    let mut buf = vec![0u8; frame_len(ipv4, spec.l4.l4_type(), payload.len())];
    let written = build_frame(spec, payload, &mut buf)?;
    buf.truncate(written);
    Ok(buf)
}

fn write_ipv4_header(
    header: &mut [u8],
    tos: u8,
    segment_len: usize,
    ttl: u8,
    l4: L4Type,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) {
    header[0] = 0x45;
    header[1] = tos;
    header[2..4].copy_from_slice(&((IPV4_HEADER_LEN + segment_len) as u16).to_be_bytes());
    header[4..6].fill(0);
    header[6..8].copy_from_slice(&IPV4_FLAG_DF.to_be_bytes());
    header[8] = ttl;
    header[9] = l4.protocol();
    header[10..12].fill(0);
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let csum = checksum::internet_checksum(header);
    header[10..12].copy_from_slice(&csum.to_be_bytes());
}

fn write_ipv6_header(
    header: &mut [u8],
    traffic_class: u8,
    segment_len: usize,
    hop_limit: u8,
    l4: L4Type,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) {
    // version(4) | traffic class(8) | flow label(20), flow label left zero
    header[0] = 0x60 | (traffic_class >> 4);
    header[1] = traffic_class << 4;
    header[2] = 0;
    header[3] = 0;
    header[4..6].copy_from_slice(&(segment_len as u16).to_be_bytes());
    header[6] = l4.protocol();
    header[7] = hop_limit;
    header[8..24].copy_from_slice(&src.octets());
    header[24..40].copy_from_slice(&dst.octets());
}

/// A successfully parsed frame, borrowing the payload from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub ecn: Ecn,
    pub dscp: u8,
    pub hop_limit: u8,
    pub l4: L4Header,
    /// Offset of the payload from the start of the frame
    pub payload_offset: usize,
    pub payload: &'a [u8],
}

impl ParsedFrame<'_> {
    /// Whether the frame was carried over IPv4.
    pub fn is_ipv4(&self) -> bool {
        self.source.is_ipv4()
    }
}

struct IpLayer {
    source: IpAddr,
    destination: IpAddr,
    tos: u8,
    hop_limit: u8,
    protocol: u8,
    /// Absolute offsets of the transport segment within the frame
    segment_start: usize,
    segment_end: usize,
}

#[inline]
fn need(frame: &[u8], needed: usize) -> Result<(), FrameError> {
    if frame.len() < needed {
        Err(FrameError::Truncated {
            needed,
            available: frame.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parse a received Ethernet frame.
///
/// Either every layer validates and the full result is returned, or an
/// error is returned and nothing should be forwarded.
///
/// # Errors
///
/// - [`FrameError::Truncated`] when the buffer ends before a header or a declared length
/// - [`FrameError::Malformed`] on inconsistent header fields or a bad IPv4 checksum
/// - [`FrameError::Unsupported`] for non-IP ethertypes, other IP protocols and fragments
pub fn parse_frame(frame: &[u8]) -> Result<ParsedFrame<'_>, FrameError> {
    need(frame, ETH_HEADER_LEN)?;

    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(&frame[0..6]);
    src_mac.copy_from_slice(&frame[6..12]);

    let ethertype = be16(frame, 12);
    let ip = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(frame, ETH_HEADER_LEN)?,
        ETHERTYPE_IPV6 => parse_ipv6(frame, ETH_HEADER_LEN)?,
        other => {
            return Err(FrameError::Unsupported {
                layer: "ethertype",
                value: other,
            })
        }
    };

    let segment = &frame[ip.segment_start..ip.segment_end];
    let (source_port, destination_port, l4, header_len) = match ip.protocol {
        IPPROTO_UDP => parse_udp(segment)?,
        IPPROTO_TCP => parse_tcp(segment)?,
        other => {
            return Err(FrameError::Unsupported {
                layer: "ip protocol",
                value: u16::from(other),
            })
        }
    };

    let payload_offset = ip.segment_start + header_len;
    Ok(ParsedFrame {
        src_mac,
        dst_mac,
        source: SocketAddr::new(ip.source, source_port),
        destination: SocketAddr::new(ip.destination, destination_port),
        ecn: Ecn::from_tos(ip.tos),
        dscp: ip.tos >> 2,
        hop_limit: ip.hop_limit,
        l4,
        payload_offset,
        payload: &frame[payload_offset..ip.segment_end],
    })
}

fn parse_ipv4(frame: &[u8], start: usize) -> Result<IpLayer, FrameError> {
    need(frame, start + IPV4_HEADER_LEN)?;
    let header = &frame[start..];

    if header[0] >> 4 != 4 {
        return Err(FrameError::Malformed("ipv4 version field mismatch"));
    }
    let header_len = usize::from(header[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(FrameError::Malformed("ipv4 header length below minimum"));
    }
    need(frame, start + header_len)?;

    let total_len = usize::from(be16(header, 2));
    if total_len < header_len {
        return Err(FrameError::Malformed("ipv4 total length shorter than header"));
    }
    need(frame, start + total_len)?;

    if checksum::internet_checksum(&header[..header_len]) != 0 {
        return Err(FrameError::Malformed("ipv4 header checksum mismatch"));
    }

    let fragment = be16(header, 6);
    if fragment & IPV4_FLAG_MF != 0 || fragment & IPV4_FRAG_OFFSET_MASK != 0 {
        return Err(FrameError::Unsupported {
            layer: "ipv4 fragment",
            value: fragment,
        });
    }

    let source = Ipv4Addr::new(header[12], header[13], header[14], header[15]);
    let destination = Ipv4Addr::new(header[16], header[17], header[18], header[19]);

    Ok(IpLayer {
        source: IpAddr::V4(source),
        destination: IpAddr::V4(destination),
        tos: header[1],
        hop_limit: header[8],
        protocol: header[9],
        segment_start: start + header_len,
        segment_end: start + total_len,
    })
}

fn parse_ipv6(frame: &[u8], start: usize) -> Result<IpLayer, FrameError> {
    need(frame, start + IPV6_HEADER_LEN)?;
    let header = &frame[start..];

    if header[0] >> 4 != 6 {
        return Err(FrameError::Malformed("ipv6 version field mismatch"));
    }
    let traffic_class = (header[0] << 4) | (header[1] >> 4);
    let payload_len = usize::from(be16(header, 4));
    need(frame, start + IPV6_HEADER_LEN + payload_len)?;

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&header[8..24]);
    dst.copy_from_slice(&header[24..40]);

    Ok(IpLayer {
        source: IpAddr::V6(Ipv6Addr::from(src)),
        destination: IpAddr::V6(Ipv6Addr::from(dst)),
        tos: traffic_class,
        hop_limit: header[7],
        protocol: header[6],
        segment_start: start + IPV6_HEADER_LEN,
        segment_end: start + IPV6_HEADER_LEN + payload_len,
    })
}

fn parse_udp(segment: &[u8]) -> Result<(u16, u16, L4Header, usize), FrameError> {
    need(segment, UDP_HEADER_LEN)?;
    let udp_len = usize::from(be16(segment, 4));
    if udp_len < UDP_HEADER_LEN {
        return Err(FrameError::Malformed("udp length below header size"));
    }
    if udp_len != segment.len() {
        return Err(FrameError::Malformed("udp length disagrees with ip payload length"));
    }
    Ok((be16(segment, 0), be16(segment, 2), L4Header::Udp, UDP_HEADER_LEN))
}

fn parse_tcp(segment: &[u8]) -> Result<(u16, u16, L4Header, usize), FrameError> {
    need(segment, TCP_HEADER_LEN)?;
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < TCP_HEADER_LEN {
        return Err(FrameError::Malformed("tcp data offset below minimum"));
    }
    if data_offset > segment.len() {
        return Err(FrameError::Malformed("tcp data offset beyond segment"));
    }
    let state = TcpState {
        sequence: be32(segment, 4),
        acknowledgement: be32(segment, 8),
        flags: segment[13],
        window: be16(segment, 14),
    };
    Ok((be16(segment, 0), be16(segment, 2), L4Header::Tcp(state), data_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_spec() -> FrameSpec {
        FrameSpec {
            src_mac: [0x02, 0, 0, 0, 0, 0x01],
            dst_mac: [0x02, 0, 0, 0, 0, 0x02],
            ecn: Ecn::Ect0,
            dscp: 0x2e,
            ..FrameSpec::udp("192.168.1.10:50000".parse().unwrap(), "192.168.1.20:4433".parse().unwrap())
        }
    }

    fn v6_spec() -> FrameSpec {
        FrameSpec {
            src_mac: [0x02, 0, 0, 0, 0, 0x03],
            dst_mac: [0x02, 0, 0, 0, 0, 0x04],
            ecn: Ecn::Ce,
            dscp: 0x0a,
            ..FrameSpec::udp("[fd00::1]:50000".parse().unwrap(), "[fd00::2]:4433".parse().unwrap())
        }
    }

    fn assert_matches_spec(parsed: &ParsedFrame<'_>, spec: &FrameSpec, payload: &[u8]) {
        assert_eq!(parsed.src_mac, spec.src_mac);
        assert_eq!(parsed.dst_mac, spec.dst_mac);
        assert_eq!(parsed.source, spec.source);
        assert_eq!(parsed.destination, spec.destination);
        assert_eq!(parsed.ecn, spec.ecn);
        assert_eq!(parsed.dscp, spec.dscp);
        assert_eq!(parsed.hop_limit, spec.hop_limit);
        assert_eq!(parsed.l4, spec.l4);
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_ipv4_udp_layout() {
        let frame = encode_frame(&v4_spec(), b"abcd").unwrap();
        assert_eq!(frame.len(), ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + 4);
        assert_eq!(&frame[0..6], &[0x02, 0, 0, 0, 0, 0x02]);
        assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 0x01]);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(frame[14], 0x45);
        assert_eq!(frame[15], (0x2e << 2) | 0b10);
        // total length = 20 + 8 + 4
        assert_eq!(&frame[16..18], &[0x00, 32]);
        assert_eq!(frame[23], IPPROTO_UDP);
        // header checksum verifies
        assert_eq!(checksum::internet_checksum(&frame[14..34]), 0);
        // ports and udp length
        assert_eq!(&frame[34..36], &50000u16.to_be_bytes());
        assert_eq!(&frame[36..38], &4433u16.to_be_bytes());
        assert_eq!(&frame[38..40], &[0x00, 12]);
        assert_eq!(&frame[42..], b"abcd");
    }

    #[test]
    fn test_ipv6_udp_layout() {
        let frame = encode_frame(&v6_spec(), b"xyz").unwrap();
        assert_eq!(frame.len(), ETH_HEADER_LEN + IPV6_HEADER_LEN + UDP_HEADER_LEN + 3);
        assert_eq!(&frame[12..14], &[0x86, 0xdd]);
        let tc = (0x0a << 2) | 0b11;
        assert_eq!(frame[14], 0x60 | (tc >> 4));
        assert_eq!(frame[15] >> 4, tc & 0x0f);
        assert_eq!(&frame[18..20], &[0x00, 11]);
        assert_eq!(frame[20], IPPROTO_UDP);
        assert_eq!(frame[21], DEFAULT_HOP_LIMIT);
    }

    #[test]
    fn test_udp_checksum_verifies() {
        let spec = v4_spec();
        let frame = encode_frame(&spec, b"payload!").unwrap();
        let segment = &frame[ETH_HEADER_LEN + IPV4_HEADER_LEN..];
        let sum = checksum::pseudo_header_checksum(spec.source.ip(), spec.destination.ip(), IPPROTO_UDP, segment);
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_roundtrip_udp_both_families() {
        for spec in [v4_spec(), v6_spec()] {
            for payload in [&b""[..], &b"q"[..], &[0xa5u8; 1200][..]] {
                let frame = encode_frame(&spec, payload).unwrap();
                let parsed = parse_frame(&frame).unwrap();
                assert_matches_spec(&parsed, &spec, payload);
                assert_eq!(parsed.payload_offset, frame.len() - payload.len());
            }
        }
    }

    #[test]
    fn test_roundtrip_tcp() {
        let tcp = TcpState {
            sequence: 0x0102_0304,
            acknowledgement: 0x0a0b_0c0d,
            flags: 0x18,
            window: 512,
        };
        for base in [v4_spec(), v6_spec()] {
            let spec = FrameSpec {
                l4: L4Header::Tcp(tcp),
                ..base
            };
            let frame = encode_frame(&spec, b"segment data").unwrap();
            let parsed = parse_frame(&frame).unwrap();
            assert_matches_spec(&parsed, &spec, b"segment data");
        }
    }

    #[test]
    fn test_ecn_does_not_disturb_dscp() {
        for base in [v4_spec(), v6_spec()] {
            for dscp in [0u8, 1, 0x2e, 0x3f] {
                let plain = FrameSpec {
                    dscp,
                    ecn: Ecn::NonEct,
                    ..base.clone()
                };
                for ecn in [Ecn::NonEct, Ecn::Ect1, Ecn::Ect0, Ecn::Ce] {
                    let marked = FrameSpec { ecn, ..plain.clone() };
                    assert_eq!(marked.tos() & 0xfc, plain.tos() & 0xfc);
                    let parsed_frame = encode_frame(&marked, b"x").unwrap();
                    let parsed = parse_frame(&parsed_frame).unwrap();
                    assert_eq!(parsed.ecn, ecn);
                    assert_eq!(parsed.dscp, dscp);
                }
            }
        }
    }

    #[test]
    fn test_set_ecn_preserves_high_bits() {
        for tos in 0..=255u8 {
            for ecn in [Ecn::NonEct, Ecn::Ect1, Ecn::Ect0, Ecn::Ce] {
                let out = set_ecn(tos, ecn);
                assert_eq!(out & 0xfc, tos & 0xfc);
                assert_eq!(Ecn::from_tos(out), ecn);
            }
        }
    }

    #[test]
    fn test_truncation_always_rejected() {
        for spec in [
            v4_spec(),
            v6_spec(),
            FrameSpec {
                l4: L4Header::Tcp(TcpState::default()),
                ..v4_spec()
            },
        ] {
            for payload in [&b""[..], &b"some payload bytes"[..]] {
                let frame = encode_frame(&spec, payload).unwrap();
                for cut in 1..=frame.len() {
                    let result = parse_frame(&frame[..frame.len() - cut]);
                    match result {
                        Err(err) => assert!(err.is_malformed(), "cut {cut}: {err}"),
                        Ok(parsed) => panic!("cut {cut} parsed as {parsed:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_ethernet_padding_is_ignored() {
        let spec = v4_spec();
        let mut frame = encode_frame(&spec, b"hi").unwrap();
        // Minimum Ethernet frame size without FCS
        frame.resize(60, 0);
        let parsed = parse_frame(&frame).unwrap();
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn test_corrupt_ipv4_checksum_rejected() {
        let mut frame = encode_frame(&v4_spec(), b"data").unwrap();
        frame[ETH_HEADER_LEN + 8] ^= 0x01;
        assert_eq!(
            parse_frame(&frame),
            Err(FrameError::Malformed("ipv4 header checksum mismatch"))
        );
    }

    #[test]
    fn test_inconsistent_udp_length_rejected() {
        let mut frame = encode_frame(&v6_spec(), b"data").unwrap();
        let udp_len_at = ETH_HEADER_LEN + IPV6_HEADER_LEN + 4;
        frame[udp_len_at..udp_len_at + 2].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(parse_frame(&frame), Err(FrameError::Malformed(_))));

        frame[udp_len_at..udp_len_at + 2].copy_from_slice(&4u16.to_be_bytes());
        assert!(matches!(parse_frame(&frame), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_unsupported_ethertype() {
        let mut frame = encode_frame(&v4_spec(), b"").unwrap();
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        let err = parse_frame(&frame).unwrap_err();
        assert_eq!(
            err,
            FrameError::Unsupported {
                layer: "ethertype",
                value: 0x0806
            }
        );
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_fragment_unsupported() {
        let mut frame = encode_frame(&v4_spec(), b"frag").unwrap();
        let ip = ETH_HEADER_LEN;
        frame[ip + 6..ip + 8].copy_from_slice(&IPV4_FLAG_MF.to_be_bytes());
        frame[ip + 10..ip + 12].fill(0);
        let csum = checksum::internet_checksum(&frame[ip..ip + IPV4_HEADER_LEN]);
        frame[ip + 10..ip + 12].copy_from_slice(&csum.to_be_bytes());
        assert!(matches!(
            parse_frame(&frame),
            Err(FrameError::Unsupported { layer: "ipv4 fragment", .. })
        ));
    }

    #[test]
    fn test_family_mismatch() {
        let spec = FrameSpec::udp("10.0.0.1:1".parse().unwrap(), "[::1]:2".parse().unwrap());
        assert_eq!(encode_frame(&spec, b""), Err(FrameError::AddressFamilyMismatch));
    }

    #[test]
    fn test_buffer_too_small() {
        let mut buf = [0u8; 40];
        let err = build_frame(&v4_spec(), b"abcdef", &mut buf).unwrap_err();
        assert_eq!(
            err,
            FrameError::BufferTooSmall {
                needed: 48,
                available: 40
            }
        );
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; 65_535];
        assert_eq!(
            encode_frame(&v4_spec(), &payload),
            Err(FrameError::PayloadTooLarge(65_535))
        );
    }
}
