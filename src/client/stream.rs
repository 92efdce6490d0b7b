//! Stream (request) state machine
//!
//! A stream uploads the request header plus filler, waits for every send
//! to be acknowledged, then reads the download until the peer finishes or
//! the download time runs out.
//!
//! ```text
//! Created -> Sending -> AwaitingCompletion -> ReceivingDownload -> Complete
//! ```

use super::pool::{Handle, Recycle};
use super::request::{RequestBuffer, REQUEST_HEADER_LEN, UNBOUNDED_DOWNLOAD};
use crate::config::ScenarioConfig;
use crate::transport::{ConnectionId, StreamId};
use crate::util::fast_time::FastInstant;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Created,
    Sending,
    AwaitingCompletion,
    ReceivingDownload,
    Complete,
}

/// Upload and download amounts for every request of a run.
///
/// In timed mode `upload` and `download` are milliseconds; otherwise bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPlan {
    pub upload: u64,
    pub download: u64,
    pub timed: bool,
}

impl RequestPlan {
    pub fn from_scenario(scenario: &ScenarioConfig) -> Self {
        Self {
            upload: scenario.upload,
            download: scenario.download,
            timed: scenario.timed,
        }
    }

    /// Bytes to upload in a byte-bounded run; the header always goes out.
    pub fn upload_bytes(&self) -> u64 {
        self.upload.max(REQUEST_HEADER_LEN as u64)
    }

    /// Download size to put in the request header.
    pub fn advertised_download(&self) -> u64 {
        match (self.timed, self.download) {
            (true, 0) => 0,
            (true, _) => UNBOUNDED_DOWNLOAD,
            (false, bytes) => bytes,
        }
    }
}

/// Result of a send completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// More upload remains: post the next chunk
    Continue,
    /// Every upload byte has been acknowledged
    SendDone,
    /// Nothing to do
    Idle,
}

/// Per-stream state owned by one worker.
#[derive(Debug, Default)]
pub struct Stream {
    pub state: StreamState,
    pub connection: Option<Handle>,
    pub connection_id: Option<ConnectionId>,
    pub transport_id: Option<StreamId>,
    pub start: Option<FastInstant>,
    pub bytes_sent: u64,
    pub outstanding_bytes: u64,
    pub bytes_completed: u64,
    /// The final (FIN) send has been posted
    pub upload_done: bool,
    /// Every posted send has completed
    pub send_done: bool,
    pub complete: bool,
    /// Most recent buffer handed to the transport
    pub last_buffer: Option<Bytes>,
}

impl Recycle for Stream {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

impl Stream {
    pub fn begin(&mut self, connection: Handle, connection_id: ConnectionId, now: FastInstant) {
        *self = Self {
            state: StreamState::Sending,
            connection: Some(connection),
            connection_id: Some(connection_id),
            start: Some(now),
            ..Self::default()
        };
    }

    fn elapsed(&self) -> Duration {
        self.start.map(|start| start.elapsed()).unwrap_or_default()
    }

    /// Next upload chunk and whether it carries FIN. `None` once the FIN send
    /// has been posted.
    pub fn next_chunk(&mut self, request: &RequestBuffer, plan: &RequestPlan) -> Option<(Bytes, bool)> {
        if self.upload_done {
            return None;
        }

        let (len, fin) = if plan.timed {
            let fin = self.elapsed() >= Duration::from_millis(plan.upload);
            (request.len() as u64, fin)
        } else {
            let total = plan.upload_bytes();
            let remaining = total.saturating_sub(self.bytes_sent);
            let len = remaining.min(request.len() as u64);
            (len, self.bytes_sent + len >= total)
        };

        let chunk = request.chunk(len as usize);
        self.bytes_sent += len;
        self.outstanding_bytes += len;
        if fin {
            self.upload_done = true;
            self.state = StreamState::AwaitingCompletion;
        }
        self.last_buffer = Some(chunk.clone());
        Some((chunk, fin))
    }

    pub fn on_send_complete(&mut self, buffer: &Bytes, canceled: bool) -> SendProgress {
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(buffer.len() as u64);
        if self
            .last_buffer
            .as_ref()
            .is_some_and(|last| last.as_ptr() == buffer.as_ptr() && last.len() == buffer.len())
        {
            self.last_buffer = None;
        }

        if canceled {
            return SendProgress::Idle;
        }
        if !self.upload_done {
            return SendProgress::Continue;
        }
        if self.outstanding_bytes == 0 && !self.send_done {
            self.send_done = true;
            return SendProgress::SendDone;
        }
        SendProgress::Idle
    }

    /// Account received bytes. Returns true when the download time is up and
    /// the receive side should be aborted.
    pub fn on_receive(&mut self, len: usize, plan: &RequestPlan) -> bool {
        self.bytes_completed += len as u64;
        if self.complete {
            return false;
        }
        self.state = StreamState::ReceivingDownload;

        if plan.timed && plan.download > 0 && self.elapsed() >= Duration::from_millis(plan.download) {
            self.mark_complete();
            return true;
        }
        false
    }

    /// Peer finished sending. Returns false when a byte-bounded download
    /// came up short.
    pub fn on_peer_send_shutdown(&mut self, plan: &RequestPlan) -> bool {
        if plan.timed || self.bytes_completed >= plan.download {
            self.mark_complete();
            true
        } else {
            false
        }
    }

    fn mark_complete(&mut self) {
        self.complete = true;
        self.state = StreamState::Complete;
    }

    /// A request counts only if both directions finished.
    pub fn is_successful(&self) -> bool {
        self.complete && self.send_done
    }

    pub fn latency_micros(&self) -> u32 {
        self.start.map_or(0, |start| start.elapsed_micros_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(upload: u64, download: u64, timed: bool) -> RequestPlan {
        RequestPlan { upload, download, timed }
    }

    fn started() -> Stream {
        let mut stream = Stream::default();
        let handle = {
            let mut pool = crate::client::pool::Pool::<Stream>::with_capacity(1);
            pool.acquire().unwrap().0
        };
        stream.begin(handle, ConnectionId(1), FastInstant::now());
        stream
    }

    #[test]
    fn test_advertised_download() {
        assert_eq!(plan(0, 4096, false).advertised_download(), 4096);
        assert_eq!(plan(0, 100, true).advertised_download(), UNBOUNDED_DOWNLOAD);
        assert_eq!(plan(100, 0, true).advertised_download(), 0);
    }

    #[test]
    fn test_upload_split_into_chunks() {
        let request = RequestBuffer::new(0, 1016); // 1024 bytes total
        let p = plan(2500, 0, false);
        let mut stream = started();

        let (a, fin) = stream.next_chunk(&request, &p).unwrap();
        assert_eq!((a.len(), fin), (1024, false));
        assert_eq!(stream.on_send_complete(&a, false), SendProgress::Continue);

        let (b, fin) = stream.next_chunk(&request, &p).unwrap();
        assert_eq!((b.len(), fin), (1024, false));
        assert_eq!(stream.on_send_complete(&b, false), SendProgress::Continue);

        let (c, fin) = stream.next_chunk(&request, &p).unwrap();
        assert_eq!((c.len(), fin), (452, true));
        assert_eq!(stream.state, StreamState::AwaitingCompletion);
        assert!(stream.next_chunk(&request, &p).is_none());

        assert_eq!(stream.on_send_complete(&c, false), SendProgress::SendDone);
        assert!(stream.send_done);
        assert_eq!(stream.bytes_sent, 2500);
        assert_eq!(stream.outstanding_bytes, 0);
        assert!(stream.last_buffer.is_none());
    }

    #[test]
    fn test_zero_upload_still_sends_header() {
        let request = RequestBuffer::new(64, 100);
        let mut stream = started();
        let (chunk, fin) = stream.next_chunk(&request, &plan(0, 64, false)).unwrap();
        assert_eq!(chunk.len(), REQUEST_HEADER_LEN);
        assert!(fin);
    }

    #[test]
    fn test_canceled_send_does_not_finish() {
        let request = RequestBuffer::new(0, 8);
        let mut stream = started();
        let (chunk, _) = stream.next_chunk(&request, &plan(16, 0, false)).unwrap();
        assert_eq!(stream.on_send_complete(&chunk, true), SendProgress::Idle);
        assert!(!stream.send_done);
        assert_eq!(stream.outstanding_bytes, 0);
    }

    #[test]
    fn test_download_completion() {
        let p = plan(0, 100, false);
        let mut stream = started();
        assert!(!stream.on_receive(60, &p));
        assert_eq!(stream.state, StreamState::ReceivingDownload);
        assert!(!stream.on_peer_send_shutdown(&p));
        assert!(!stream.complete);

        stream.on_receive(40, &p);
        assert!(stream.on_peer_send_shutdown(&p));
        assert!(stream.complete);
        assert_eq!(stream.bytes_completed, 100);
    }

    #[test]
    fn test_timed_download_aborts() {
        let p = plan(0, 1, true);
        let mut stream = started();
        std::thread::sleep(Duration::from_millis(5));
        assert!(stream.on_receive(10, &p));
        assert!(stream.complete);
        // already complete: no second abort
        assert!(!stream.on_receive(10, &p));
    }

    #[test]
    fn test_timed_upload_sends_full_chunks_until_time() {
        let request = RequestBuffer::new(0, 56);
        let p = plan(10_000, 0, true);
        let mut stream = started();
        let (chunk, fin) = stream.next_chunk(&request, &p).unwrap();
        assert_eq!(chunk.len(), 64);
        assert!(!fin);

        let p = plan(0, 0, true);
        let mut stream = started();
        let (_, fin) = stream.next_chunk(&request, &p).unwrap();
        assert!(fin);
    }

    #[test]
    fn test_success_requires_both_directions() {
        let request = RequestBuffer::new(0, 8);
        let p = plan(8, 0, false);
        let mut stream = started();
        assert!(stream.on_peer_send_shutdown(&p));
        assert!(!stream.is_successful());

        let (chunk, _) = stream.next_chunk(&request, &p).unwrap();
        stream.on_send_complete(&chunk, false);
        assert!(stream.is_successful());
    }

    #[test]
    fn test_recycle_clears() {
        let request = RequestBuffer::new(0, 8);
        let mut stream = started();
        stream.next_chunk(&request, &plan(8, 0, false));
        stream.recycle();
        assert_eq!(stream.state, StreamState::Created);
        assert!(stream.start.is_none());
        assert!(stream.last_buffer.is_none());
    }
}
