//! Shared request payload
//!
//! One buffer is built at startup and every send on every stream posts a
//! slice of it. The first 8 bytes carry the requested download size
//! (big-endian); the rest is filler. `Bytes` slices share the allocation, so
//! the buffer stays alive as long as any in-flight send references it.

use bytes::{BufMut, Bytes, BytesMut};

/// Length of the download-size header.
pub const REQUEST_HEADER_LEN: usize = 8;

/// Download size advertised when the download is bounded by time rather
/// than by bytes; the client aborts the receive side when the time is up.
pub const UNBOUNDED_DOWNLOAD: u64 = u64::MAX;

/// Immutable request payload shared by all streams.
#[derive(Debug, Clone)]
pub struct RequestBuffer {
    bytes: Bytes,
}

impl RequestBuffer {
    /// Build the payload: header announcing `download` bytes followed by
    /// `io_size` filler bytes.
    pub fn new(download: u64, io_size: usize) -> Self {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + io_size);
        buf.put_u64(download);
        for i in 0..io_size {
            buf.put_u8(i as u8);
        }
        Self { bytes: buf.freeze() }
    }

    /// Total length, header included.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A shared slice of the first `len` bytes (clamped to the buffer length).
    #[inline]
    pub fn chunk(&self, len: usize) -> Bytes {
        self.bytes.slice(..len.min(self.bytes.len()))
    }

    /// The download size encoded in the header.
    pub fn download_size(&self) -> u64 {
        let mut header = [0u8; REQUEST_HEADER_LEN];
        header.copy_from_slice(&self.bytes[..REQUEST_HEADER_LEN]);
        u64::from_be_bytes(header)
    }
}
