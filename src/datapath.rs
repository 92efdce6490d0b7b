//! Raw datapath receive upcall
//!
//! The platform layer hands each received Ethernet frame to
//! [`RawDatapath::parse_ethernet`] together with a receive descriptor. The
//! descriptor is filled in place from the parsed headers, or marked invalid
//! so the caller drops it. Nothing from a rejected frame reaches the
//! transport engine.

use crate::framing::{self, Ecn, FrameError, L4Type, MacAddr, ParsedFrame};
use crate::stats::AlignedCounter;
use std::net::{Ipv4Addr, SocketAddr};

/// Receive descriptor populated by the datapath upcall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvData {
    /// Local (destination) address and port of the received datagram
    pub local: SocketAddr,
    /// Remote (source) address and port
    pub remote: SocketAddr,
    pub local_mac: MacAddr,
    pub remote_mac: MacAddr,
    pub ecn: Ecn,
    /// Full TOS/traffic-class byte
    pub tos: u8,
    pub hop_limit: u8,
    pub l4: Option<L4Type>,
    /// Offset of the payload from the start of the frame
    pub payload_offset: usize,
    pub payload_len: usize,
    /// False when the frame was rejected; all other fields are then unspecified
    pub valid: bool,
}

impl Default for RecvData {
    fn default() -> Self {
        let unspecified = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        Self {
            local: unspecified,
            remote: unspecified,
            local_mac: [0; 6],
            remote_mac: [0; 6],
            ecn: Ecn::NonEct,
            tos: 0,
            hop_limit: 0,
            l4: None,
            payload_offset: 0,
            payload_len: 0,
            valid: false,
        }
    }
}

impl RecvData {
    /// Borrow this descriptor's payload out of the frame it was parsed from.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        if !self.valid {
            return None;
        }
        frame.get(self.payload_offset..self.payload_offset + self.payload_len)
    }

    fn fill(&mut self, parsed: &ParsedFrame<'_>) {
        self.local = parsed.destination;
        self.remote = parsed.source;
        self.local_mac = parsed.dst_mac;
        self.remote_mac = parsed.src_mac;
        self.ecn = parsed.ecn;
        self.tos = (parsed.dscp << 2) | parsed.ecn.bits();
        self.hop_limit = parsed.hop_limit;
        self.l4 = Some(parsed.l4.l4_type());
        self.payload_offset = parsed.payload_offset;
        self.payload_len = parsed.payload.len();
        self.valid = true;
    }
}

/// Receive-side frame classifier with drop accounting.
///
/// Shared by all receive contexts; the counters are cache-line aligned
/// atomics so concurrent upcalls never contend on a lock.
#[derive(Debug, Default)]
pub struct RawDatapath {
    received: AlignedCounter,
    malformed: AlignedCounter,
    unsupported: AlignedCounter,
}

/// Snapshot of [`RawDatapath`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatapathStats {
    pub received: u64,
    pub malformed: u64,
    pub unsupported: u64,
}

impl RawDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `frame` and populate `packet` in place.
    ///
    /// Returns true when the packet is valid and should be forwarded.
    /// Malformed and unsupported frames are counted and the descriptor is
    /// marked invalid.
    pub fn parse_ethernet(&self, packet: &mut RecvData, frame: &[u8]) -> bool {
        match framing::parse_frame(frame) {
            Ok(parsed) => {
                packet.fill(&parsed);
                self.received.add(1);
                true
            }
            Err(err) => {
                packet.valid = false;
                self.record_drop(&err, frame.len());
                false
            }
        }
    }

    fn record_drop(&self, err: &FrameError, len: usize) {
        if err.is_malformed() {
            self.malformed.add(1);
            log::debug!("dropping malformed frame ({} bytes): {}", len, err);
        } else {
            self.unsupported.add(1);
            log::trace!("ignoring frame ({} bytes): {}", len, err);
        }
    }

    pub fn stats(&self) -> DatapathStats {
        DatapathStats {
            received: self.received.get(),
            malformed: self.malformed.get(),
            unsupported: self.unsupported.get(),
        }
    }
}
