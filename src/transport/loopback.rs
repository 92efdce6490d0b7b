//! In-process loopback transport engine
//!
//! Implements [`Transport`] without a network: a simulated peer answers
//! every request on the same process. It is used by the CLI when no real
//! engine is linked in, and by the test suite.
//!
//! Events are executed on a small set of executor threads. Every connection
//! is bound to one executor (`id % executors`), which serializes all events
//! of that connection and its streams. Handlers are always invoked with no
//! internal lock held, so they may call back into the transport freely.
//!
//! The simulated peer reads the 8-byte big-endian download size from the
//! start of each stream's upload. Once the client's FIN arrives it sends that
//! many bytes back (forever for `u64::MAX`, until the client aborts the
//! receive side), followed by its own FIN.
//!
//! Connection and stream statistics are kept per entry and parked in a
//! retired table while the final `ShutdownComplete` is delivered.

use super::{
    ConnectTarget, ConnectionEvent, ConnectionHandler, ConnectionId, ConnectionStatistics, Status, StreamEvent,
    StreamHandler, StreamId, StreamStatistics, Transport, TransportError, TransportSettings,
};
use crate::stats::AlignedCounter;
use crate::util::lock;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const DOWNLOAD_HEADER_LEN: usize = 8;

/// Loopback engine options.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Number of executor threads delivering events
    pub executors: usize,
    /// Largest receive chunk the simulated peer delivers per event
    pub chunk_size: usize,
    /// Randomize receive chunk sizes in `1..=chunk_size` with this seed
    pub jitter_seed: Option<u64>,
    /// Fail every handshake with [`TransportError::Refused`]
    pub refuse_connections: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            executors: 2,
            chunk_size: 16 * 1024,
            jitter_seed: None,
            refuse_connections: false,
        }
    }
}

/// Counters kept by the loopback engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connections_opened: u64,
    pub streams_opened: u64,
    /// Bytes the client sent to the peer
    pub bytes_uploaded: u64,
    /// Bytes the peer sent to the client
    pub bytes_downloaded: u64,
    pub connection_statistics_reads: u64,
    pub stream_statistics_reads: u64,
}

enum ExecMsg {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Handshaking,
    Connected,
    Closing,
}

struct ConnEntry {
    handler: Arc<dyn ConnectionHandler>,
    phase: Phase,
    streams: BTreeSet<u64>,
    stats: ConnectionStatistics,
}

struct StreamEntry {
    connection: u64,
    handler: Arc<dyn StreamHandler>,
    started: bool,
    /// Buffers posted but not yet reported back
    pending: VecDeque<Bytes>,
    header: [u8; DOWNLOAD_HEADER_LEN],
    header_len: usize,
    send_closed: bool,
    response_started: bool,
    /// Download bytes the peer still owes
    remaining: u64,
    receive_done: bool,
    stats: StreamStatistics,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<u64, ConnEntry>,
    streams: HashMap<u64, StreamEntry>,
    /// Statistics of entries whose `ShutdownComplete` is being delivered
    retired_connections: HashMap<u64, ConnectionStatistics>,
    retired_streams: HashMap<u64, StreamStatistics>,
}

struct Shared {
    tables: Mutex<Tables>,
    senders: Vec<Sender<ExecMsg>>,
    next_id: AtomicU64,
    options: LoopbackOptions,
    settings: Mutex<Option<TransportSettings>>,
    targets: Mutex<HashMap<SocketAddr, u64>>,
    local_addresses: Mutex<HashMap<SocketAddr, u64>>,
    download_chunk: Vec<u8>,
    rng: Option<Mutex<Xoshiro256PlusPlus>>,
    connections_opened: AlignedCounter,
    streams_opened: AlignedCounter,
    bytes_uploaded: AlignedCounter,
    bytes_downloaded: AlignedCounter,
    connection_statistics_reads: AlignedCounter,
    stream_statistics_reads: AlignedCounter,
}

/// Loopback transport engine. Dropping it stops the executor threads after
/// the events already queued have run.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new(options: LoopbackOptions) -> std::io::Result<Self> {
        let executors = options.executors.max(1);
        let chunk_size = options.chunk_size.max(1);

        let mut senders = Vec::with_capacity(executors);
        let mut receivers = Vec::with_capacity(executors);
        for _ in 0..executors {
            let (tx, rx) = channel::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }

        let shared = Arc::new(Shared {
            tables: Mutex::new(Tables::default()),
            senders,
            next_id: AtomicU64::new(1),
            rng: options
                .jitter_seed
                .map(|seed| Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed))),
            options: LoopbackOptions {
                executors,
                chunk_size,
                ..options
            },
            settings: Mutex::new(None),
            targets: Mutex::new(HashMap::new()),
            local_addresses: Mutex::new(HashMap::new()),
            download_chunk: vec![0u8; chunk_size],
            connections_opened: AlignedCounter::new(),
            streams_opened: AlignedCounter::new(),
            bytes_uploaded: AlignedCounter::new(),
            bytes_downloaded: AlignedCounter::new(),
            connection_statistics_reads: AlignedCounter::new(),
            stream_statistics_reads: AlignedCounter::new(),
        });

        let transport = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(executors)),
        };
        for (index, rx) in receivers.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("loopback-{}", index))
                .spawn(move || executor_loop(index, rx))?;
            lock(&transport.threads).push(handle);
        }

        log::debug!("loopback transport started with {} executors", executors);
        Ok(transport)
    }

    /// Settings applied through [`Transport::configure`], if any.
    pub fn settings(&self) -> Option<TransportSettings> {
        *lock(&self.shared.settings)
    }

    /// Connections currently known to the engine (not yet shut down).
    pub fn open_connections(&self) -> usize {
        lock(&self.shared.tables).connections.len()
    }

    /// How many connections were started towards each address.
    pub fn connections_per_target(&self) -> HashMap<SocketAddr, u64> {
        lock(&self.shared.targets).clone()
    }

    /// How many connections were bound to each requested local address.
    pub fn connections_per_local_address(&self) -> HashMap<SocketAddr, u64> {
        lock(&self.shared.local_addresses).clone()
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            connections_opened: self.shared.connections_opened.get(),
            streams_opened: self.shared.streams_opened.get(),
            bytes_uploaded: self.shared.bytes_uploaded.get(),
            bytes_downloaded: self.shared.bytes_downloaded.get(),
            connection_statistics_reads: self.shared.connection_statistics_reads.get(),
            stream_statistics_reads: self.shared.stream_statistics_reads.get(),
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        for sender in &self.shared.senders {
            let _ = sender.send(ExecMsg::Stop);
        }

        // The last owner may be a handler running on one of our executors
        let current = thread::current().id();
        for handle in lock(&self.threads).drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("loopback executor panicked");
            }
        }

        // Handlers of connections that never shut down would otherwise keep
        // their owners alive through the tables
        let mut tables = lock(&self.shared.tables);
        tables.streams.clear();
        tables.connections.clear();
    }
}

fn executor_loop(index: usize, rx: Receiver<ExecMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            ExecMsg::Run(task) => task(),
            ExecMsg::Stop => break,
        }
    }
    // Drop anything queued behind the stop marker
    while rx.try_recv().is_ok() {}
    log::trace!("loopback executor {} exiting", index);
}

impl Shared {
    fn dispatch<F>(self: &Arc<Self>, connection: u64, task: F)
    where
        F: FnOnce(&Arc<Shared>) + Send + 'static,
    {
        let executor = (connection as usize) % self.senders.len();
        let shared = Arc::clone(self);
        let msg = ExecMsg::Run(Box::new(move || task(&shared)));
        if self.senders[executor].send(msg).is_err() {
            log::debug!("loopback executor {} is gone, dropping event for conn#{}", executor, connection);
        }
    }

    fn next_chunk_len(&self, remaining: u64) -> usize {
        let max = match &self.rng {
            Some(rng) => lock(rng).gen_range(1..=self.options.chunk_size),
            None => self.options.chunk_size,
        };
        remaining.min(max as u64) as usize
    }

    fn stream_handler(&self, stream: u64) -> Option<Arc<dyn StreamHandler>> {
        lock(&self.tables).streams.get(&stream).map(|entry| Arc::clone(&entry.handler))
    }

    fn complete_handshake(self: &Arc<Self>, id: u64) {
        let refuse = self.options.refuse_connections;
        let handler = {
            let mut tables = lock(&self.tables);
            let Some(entry) = tables.connections.get_mut(&id) else {
                return;
            };
            if entry.phase != Phase::Handshaking {
                return;
            }
            entry.phase = if refuse { Phase::Closing } else { Phase::Connected };
            Arc::clone(&entry.handler)
        };

        let connection = ConnectionId(id);
        if refuse {
            handler.on_connection_event(
                connection,
                ConnectionEvent::ShutdownInitiatedByTransport {
                    error: TransportError::Refused,
                },
            );
            self.finish_connection(id);
        } else if handler.on_connection_event(connection, ConnectionEvent::Connected) == Status::Error {
            log::debug!("{} rejected the connected event, closing", connection);
            self.close_connection(id);
        }
    }

    /// Report the oldest outstanding send of `stream` as complete.
    fn complete_send(self: &Arc<Self>, stream: u64, fin: bool) {
        let (handler, buffer) = {
            let mut tables = lock(&self.tables);
            let Some(entry) = tables.streams.get_mut(&stream) else {
                return;
            };
            let Some(buffer) = entry.pending.pop_front() else {
                return;
            };
            (Arc::clone(&entry.handler), buffer)
        };

        let id = StreamId(stream);
        handler.on_stream_event(id, StreamEvent::SendComplete { buffer, canceled: false });
        if fin {
            handler.on_stream_event(id, StreamEvent::SendShutdownComplete { graceful: true });
            self.respond(stream);
        }
        self.try_complete_stream(stream);
    }

    /// Start the simulated response once the request is complete.
    fn respond(self: &Arc<Self>, stream: u64) {
        {
            let mut tables = lock(&self.tables);
            let Some(entry) = tables.streams.get_mut(&stream) else {
                return;
            };
            if entry.response_started {
                return;
            }
            entry.response_started = true;
            entry.remaining = if entry.header_len == DOWNLOAD_HEADER_LEN {
                u64::from_be_bytes(entry.header)
            } else {
                0
            };
        }
        self.pump(stream);
    }

    /// Deliver one download chunk, or the peer FIN when nothing is owed.
    fn pump(self: &Arc<Self>, stream: u64) {
        let (handler, connection, len) = {
            let mut tables = lock(&self.tables);
            let Some(entry) = tables.streams.get_mut(&stream) else {
                return;
            };
            if entry.receive_done {
                return;
            }
            let len = if entry.remaining == 0 {
                entry.receive_done = true;
                None
            } else {
                let len = self.next_chunk_len(entry.remaining);
                entry.remaining -= len as u64;
                entry.stats.receives += 1;
                entry.stats.bytes_received += len as u64;
                Some(len)
            };
            let (handler, connection) = (Arc::clone(&entry.handler), entry.connection);
            if let (Some(len), Some(conn)) = (len, tables.connections.get_mut(&connection)) {
                conn.stats.bytes_received += len as u64;
            }
            (handler, connection, len)
        };

        let id = StreamId(stream);
        match len {
            Some(len) => {
                self.bytes_downloaded.add(len as u64);
                handler.on_stream_event(
                    id,
                    StreamEvent::Receive {
                        data: &self.download_chunk[..len],
                    },
                );
                self.dispatch(connection, move |shared| shared.pump(stream));
            }
            None => {
                handler.on_stream_event(id, StreamEvent::PeerSendShutdown);
                self.try_complete_stream(stream);
            }
        }
    }

    /// Deliver the final stream event once both directions are finished.
    fn try_complete_stream(self: &Arc<Self>, stream: u64) {
        let entry = {
            let mut tables = lock(&self.tables);
            let done = match tables.streams.get(&stream) {
                Some(entry) => entry.send_closed && entry.receive_done && entry.pending.is_empty(),
                None => false,
            };
            if !done {
                return;
            }
            let Some(entry) = tables.streams.remove(&stream) else {
                return;
            };
            if let Some(conn) = tables.connections.get_mut(&entry.connection) {
                conn.streams.remove(&stream);
            }
            tables.retired_streams.insert(stream, entry.stats);
            entry
        };

        entry.handler.on_stream_event(
            StreamId(stream),
            StreamEvent::ShutdownComplete {
                connection_shutdown: false,
            },
        );
        lock(&self.tables).retired_streams.remove(&stream);
    }

    /// Tear down every stream of the connection, then the connection itself.
    fn close_connection(self: &Arc<Self>, id: u64) {
        let streams: Vec<(u64, StreamEntry)> = {
            let mut tables = lock(&self.tables);
            let Some(conn) = tables.connections.get_mut(&id) else {
                return;
            };
            conn.phase = Phase::Closing;
            let ids = std::mem::take(&mut conn.streams);
            let streams: Vec<(u64, StreamEntry)> = ids
                .into_iter()
                .filter_map(|sid| tables.streams.remove(&sid).map(|entry| (sid, entry)))
                .collect();
            for (sid, entry) in &streams {
                tables.retired_streams.insert(*sid, entry.stats);
            }
            streams
        };

        for (sid, entry) in streams {
            let stream = StreamId(sid);
            for buffer in entry.pending {
                entry
                    .handler
                    .on_stream_event(stream, StreamEvent::SendComplete { buffer, canceled: true });
            }
            entry.handler.on_stream_event(
                stream,
                StreamEvent::ShutdownComplete {
                    connection_shutdown: true,
                },
            );
            lock(&self.tables).retired_streams.remove(&sid);
        }

        self.finish_connection(id);
    }

    fn finish_connection(&self, id: u64) {
        let entry = {
            let mut tables = lock(&self.tables);
            let entry = tables.connections.remove(&id);
            if let Some(ref entry) = entry {
                tables.retired_connections.insert(id, entry.stats);
            }
            entry
        };
        if let Some(entry) = entry {
            entry
                .handler
                .on_connection_event(ConnectionId(id), ConnectionEvent::ShutdownComplete);
            lock(&self.tables).retired_connections.remove(&id);
        }
    }
}

impl Transport for LoopbackTransport {
    fn configure(&self, settings: &TransportSettings) -> Result<(), TransportError> {
        log::debug!(
            "loopback settings: encryption={} pacing={} send_buffering={} ecn={}",
            settings.encryption,
            settings.pacing,
            settings.send_buffering,
            settings.ecn
        );
        *lock(&self.shared.settings) = Some(*settings);
        Ok(())
    }

    fn open_connection(&self, handler: Arc<dyn ConnectionHandler>) -> Result<ConnectionId, TransportError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.tables).connections.insert(
            id,
            ConnEntry {
                handler,
                phase: Phase::Idle,
                streams: BTreeSet::new(),
                stats: ConnectionStatistics::default(),
            },
        );
        self.shared.connections_opened.add(1);
        Ok(ConnectionId(id))
    }

    fn start_connection(&self, connection: ConnectionId, target: &ConnectTarget) -> Result<(), TransportError> {
        {
            let mut tables = lock(&self.shared.tables);
            let entry = tables
                .connections
                .get_mut(&connection.0)
                .ok_or(TransportError::UnknownConnection(connection))?;
            if entry.phase != Phase::Idle {
                return Err(TransportError::InvalidState);
            }
            entry.phase = Phase::Handshaking;
            entry.stats.local_address = target.local_address;
        }
        *lock(&self.shared.targets).entry(target.address).or_insert(0) += 1;
        if let Some(local) = target.local_address {
            *lock(&self.shared.local_addresses).entry(local).or_insert(0) += 1;
        }

        let id = connection.0;
        self.shared.dispatch(id, move |shared| shared.complete_handshake(id));
        Ok(())
    }

    fn open_stream(&self, connection: ConnectionId, handler: Arc<dyn StreamHandler>) -> Result<StreamId, TransportError> {
        let mut tables = lock(&self.shared.tables);
        let conn = tables
            .connections
            .get_mut(&connection.0)
            .ok_or(TransportError::UnknownConnection(connection))?;
        if conn.phase != Phase::Connected {
            return Err(TransportError::InvalidState);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        conn.streams.insert(id);
        conn.stats.streams_opened += 1;
        tables.streams.insert(
            id,
            StreamEntry {
                connection: connection.0,
                handler,
                started: false,
                pending: VecDeque::new(),
                header: [0; DOWNLOAD_HEADER_LEN],
                header_len: 0,
                send_closed: false,
                response_started: false,
                remaining: 0,
                receive_done: false,
                stats: StreamStatistics::default(),
            },
        );
        self.shared.streams_opened.add(1);
        Ok(StreamId(id))
    }

    fn start_stream(&self, stream: StreamId) -> Result<(), TransportError> {
        let connection = {
            let mut tables = lock(&self.shared.tables);
            let entry = tables
                .streams
                .get_mut(&stream.0)
                .ok_or(TransportError::UnknownStream(stream))?;
            if entry.started {
                return Err(TransportError::InvalidState);
            }
            entry.started = true;
            entry.connection
        };

        let id = stream.0;
        self.shared.dispatch(connection, move |shared| {
            if let Some(handler) = shared.stream_handler(id) {
                handler.on_stream_event(StreamId(id), StreamEvent::StartComplete { status: Status::Success });
            }
        });
        Ok(())
    }

    fn send(&self, stream: StreamId, buffer: Bytes, fin: bool) -> Result<(), TransportError> {
        let connection = {
            let mut tables = lock(&self.shared.tables);
            let entry = tables
                .streams
                .get_mut(&stream.0)
                .ok_or(TransportError::UnknownStream(stream))?;
            if !entry.started || entry.send_closed {
                return Err(TransportError::InvalidState);
            }

            let take = (DOWNLOAD_HEADER_LEN - entry.header_len).min(buffer.len());
            entry.header[entry.header_len..entry.header_len + take].copy_from_slice(&buffer[..take]);
            entry.header_len += take;
            entry.send_closed = fin;
            entry.stats.sends += 1;
            entry.stats.bytes_sent += buffer.len() as u64;
            self.shared.bytes_uploaded.add(buffer.len() as u64);
            let (connection, len) = (entry.connection, buffer.len() as u64);
            entry.pending.push_back(buffer);
            if let Some(conn) = tables.connections.get_mut(&connection) {
                conn.stats.bytes_sent += len;
            }
            connection
        };

        let id = stream.0;
        self.shared.dispatch(connection, move |shared| shared.complete_send(id, fin));
        Ok(())
    }

    fn abort_receive(&self, stream: StreamId, error_code: u64) -> Result<(), TransportError> {
        let connection = {
            let mut tables = lock(&self.shared.tables);
            let entry = tables
                .streams
                .get_mut(&stream.0)
                .ok_or(TransportError::UnknownStream(stream))?;
            entry.receive_done = true;
            entry.connection
        };
        log::trace!("{} receive aborted with code {}", stream, error_code);

        let id = stream.0;
        self.shared.dispatch(connection, move |shared| shared.try_complete_stream(id));
        Ok(())
    }

    fn shutdown_connection(&self, connection: ConnectionId, error_code: u64) -> Result<(), TransportError> {
        {
            let mut tables = lock(&self.shared.tables);
            let entry = tables
                .connections
                .get_mut(&connection.0)
                .ok_or(TransportError::UnknownConnection(connection))?;
            if entry.phase == Phase::Closing {
                return Ok(());
            }
            entry.phase = Phase::Closing;
        }
        log::trace!("{} shutdown requested with code {}", connection, error_code);

        let id = connection.0;
        self.shared.dispatch(id, move |shared| shared.close_connection(id));
        Ok(())
    }

    fn connection_statistics(&self, connection: ConnectionId) -> Result<ConnectionStatistics, TransportError> {
        let tables = lock(&self.shared.tables);
        let stats = tables
            .connections
            .get(&connection.0)
            .map(|entry| entry.stats)
            .or_else(|| tables.retired_connections.get(&connection.0).copied())
            .ok_or(TransportError::UnknownConnection(connection))?;
        self.shared.connection_statistics_reads.add(1);
        Ok(stats)
    }

    fn stream_statistics(&self, stream: StreamId) -> Result<StreamStatistics, TransportError> {
        let tables = lock(&self.shared.tables);
        let stats = tables
            .streams
            .get(&stream.0)
            .map(|entry| entry.stats)
            .or_else(|| tables.retired_streams.get(&stream.0).copied())
            .ok_or(TransportError::UnknownStream(stream))?;
        self.shared.stream_statistics_reads.add(1);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Conn(ConnectionEvent),
        StartComplete,
        SendComplete { len: usize, canceled: bool },
        Receive(usize),
        PeerSendShutdown,
        SendShutdownComplete,
        StreamShutdown { connection_shutdown: bool },
    }

    struct Recorder {
        tx: Mutex<mpsc::Sender<Seen>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::Receiver<Seen>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }

        fn push(&self, seen: Seen) {
            let _ = self.tx.lock().unwrap().send(seen);
        }
    }

    impl ConnectionHandler for Recorder {
        fn on_connection_event(&self, _connection: ConnectionId, event: ConnectionEvent) -> Status {
            self.push(Seen::Conn(event));
            Status::Success
        }
    }

    impl StreamHandler for Recorder {
        fn on_stream_event(&self, _stream: StreamId, event: StreamEvent<'_>) -> Status {
            self.push(match event {
                StreamEvent::StartComplete { .. } => Seen::StartComplete,
                StreamEvent::SendComplete { buffer, canceled } => Seen::SendComplete {
                    len: buffer.len(),
                    canceled,
                },
                StreamEvent::Receive { data } => Seen::Receive(data.len()),
                StreamEvent::PeerSendShutdown => Seen::PeerSendShutdown,
                StreamEvent::PeerSendAborted { .. } => return Status::Success,
                StreamEvent::SendShutdownComplete { .. } => Seen::SendShutdownComplete,
                StreamEvent::ShutdownComplete { connection_shutdown } => Seen::StreamShutdown { connection_shutdown },
            });
            Status::Success
        }
    }

    fn next(rx: &mpsc::Receiver<Seen>) -> Seen {
        rx.recv_timeout(Duration::from_secs(5)).expect("event not delivered")
    }

    fn target() -> ConnectTarget {
        ConnectTarget::new("127.0.0.1:4433".parse().unwrap())
    }

    fn connect(transport: &LoopbackTransport) -> (ConnectionId, mpsc::Receiver<Seen>) {
        let (recorder, rx) = Recorder::new();
        let conn = transport.open_connection(recorder).unwrap();
        transport.start_connection(conn, &target()).unwrap();
        assert_eq!(next(&rx), Seen::Conn(ConnectionEvent::Connected));
        (conn, rx)
    }

    fn request(download: u64, filler: usize) -> Bytes {
        let mut buf = download.to_be_bytes().to_vec();
        buf.resize(DOWNLOAD_HEADER_LEN + filler, 0xab);
        Bytes::from(buf)
    }

    #[test]
    fn test_request_response_sequence() {
        let transport = LoopbackTransport::new(LoopbackOptions {
            chunk_size: 100,
            ..Default::default()
        })
        .unwrap();
        let (conn, _conn_rx) = connect(&transport);

        let (recorder, rx) = Recorder::new();
        let stream = transport.open_stream(conn, recorder).unwrap();
        transport.start_stream(stream).unwrap();
        transport.send(stream, request(250, 10), true).unwrap();

        assert_eq!(next(&rx), Seen::StartComplete);
        assert_eq!(next(&rx), Seen::SendComplete { len: 18, canceled: false });
        assert_eq!(next(&rx), Seen::SendShutdownComplete);
        assert_eq!(next(&rx), Seen::Receive(100));
        assert_eq!(next(&rx), Seen::Receive(100));
        assert_eq!(next(&rx), Seen::Receive(50));
        assert_eq!(next(&rx), Seen::PeerSendShutdown);
        assert_eq!(next(&rx), Seen::StreamShutdown { connection_shutdown: false });

        let stats = transport.stats();
        assert_eq!(stats.bytes_uploaded, 18);
        assert_eq!(stats.bytes_downloaded, 250);
    }

    #[test]
    fn test_header_split_across_sends() {
        let transport = LoopbackTransport::new(LoopbackOptions::default()).unwrap();
        let (conn, _conn_rx) = connect(&transport);
        let (recorder, rx) = Recorder::new();
        let stream = transport.open_stream(conn, recorder).unwrap();
        transport.start_stream(stream).unwrap();

        let full = request(5, 0);
        transport.send(stream, full.slice(..3), false).unwrap();
        transport.send(stream, full.slice(3..), true).unwrap();

        let mut received = 0;
        loop {
            match next(&rx) {
                Seen::Receive(n) => received += n,
                Seen::StreamShutdown { .. } => break,
                _ => {}
            }
        }
        assert_eq!(received, 5);
    }

    #[test]
    fn test_refused_connection() {
        let transport = LoopbackTransport::new(LoopbackOptions {
            refuse_connections: true,
            ..Default::default()
        })
        .unwrap();
        let (recorder, rx) = Recorder::new();
        let conn = transport.open_connection(recorder).unwrap();
        transport.start_connection(conn, &target()).unwrap();

        assert_eq!(
            next(&rx),
            Seen::Conn(ConnectionEvent::ShutdownInitiatedByTransport {
                error: TransportError::Refused
            })
        );
        assert_eq!(next(&rx), Seen::Conn(ConnectionEvent::ShutdownComplete));
        assert_eq!(transport.open_connections(), 0);
    }

    #[test]
    fn test_shutdown_completes_streams_first() {
        let transport = LoopbackTransport::new(LoopbackOptions::default()).unwrap();
        let (conn, conn_rx) = connect(&transport);
        let (recorder, rx) = Recorder::new();
        let stream = transport.open_stream(conn, recorder).unwrap();
        transport.start_stream(stream).unwrap();
        assert_eq!(next(&rx), Seen::StartComplete);

        transport.shutdown_connection(conn, 0).unwrap();
        assert_eq!(next(&rx), Seen::StreamShutdown { connection_shutdown: true });
        assert_eq!(next(&conn_rx), Seen::Conn(ConnectionEvent::ShutdownComplete));
        assert!(matches!(
            transport.send(stream, request(0, 0), true),
            Err(TransportError::UnknownStream(_))
        ));
    }

    #[test]
    fn test_unbounded_download_until_abort() {
        let transport = LoopbackTransport::new(LoopbackOptions {
            chunk_size: 64,
            jitter_seed: Some(7),
            ..Default::default()
        })
        .unwrap();
        let (conn, _conn_rx) = connect(&transport);
        let (recorder, rx) = Recorder::new();
        let stream = transport.open_stream(conn, recorder).unwrap();
        transport.start_stream(stream).unwrap();
        transport.send(stream, request(u64::MAX, 0), true).unwrap();

        let mut chunks = 0;
        while chunks < 20 {
            if let Seen::Receive(n) = next(&rx) {
                assert!((1..=64).contains(&n));
                chunks += 1;
            }
        }
        transport.abort_receive(stream, 0).unwrap();
        loop {
            match next(&rx) {
                Seen::StreamShutdown { connection_shutdown } => {
                    assert!(!connection_shutdown);
                    break;
                }
                Seen::PeerSendShutdown => panic!("unbounded download must not finish"),
                _ => {}
            }
        }
    }

    #[test]
    fn test_configure_records_settings() {
        let transport = LoopbackTransport::new(LoopbackOptions::default()).unwrap();
        assert_eq!(transport.settings(), None);
        let settings = TransportSettings {
            encryption: false,
            ..Default::default()
        };
        transport.configure(&settings).unwrap();
        assert_eq!(transport.settings(), Some(settings));
    }

    #[derive(Debug, PartialEq, Eq)]
    enum StatsRead {
        Connection(Result<ConnectionStatistics, TransportError>),
        Stream(Result<StreamStatistics, TransportError>),
    }

    /// Reads statistics from inside the final events.
    struct StatsReader {
        transport: std::sync::Weak<LoopbackTransport>,
        tx: Mutex<mpsc::Sender<StatsRead>>,
    }

    impl ConnectionHandler for StatsReader {
        fn on_connection_event(&self, connection: ConnectionId, event: ConnectionEvent) -> Status {
            if event == ConnectionEvent::ShutdownComplete {
                if let Some(transport) = self.transport.upgrade() {
                    let read = StatsRead::Connection(transport.connection_statistics(connection));
                    let _ = self.tx.lock().unwrap().send(read);
                }
            }
            Status::Success
        }
    }

    impl StreamHandler for StatsReader {
        fn on_stream_event(&self, stream: StreamId, event: StreamEvent<'_>) -> Status {
            if let StreamEvent::ShutdownComplete { .. } = event {
                if let Some(transport) = self.transport.upgrade() {
                    let read = StatsRead::Stream(transport.stream_statistics(stream));
                    let _ = self.tx.lock().unwrap().send(read);
                }
            }
            Status::Success
        }
    }

    #[test]
    fn test_statistics_readable_during_shutdown() {
        let transport = Arc::new(
            LoopbackTransport::new(LoopbackOptions {
                chunk_size: 100,
                ..Default::default()
            })
            .unwrap(),
        );
        let (tx, rx) = mpsc::channel();
        let reader = Arc::new(StatsReader {
            transport: Arc::downgrade(&transport),
            tx: Mutex::new(tx),
        });

        let local: SocketAddr = "10.1.1.1:0".parse().unwrap();
        let conn = transport.open_connection(reader.clone()).unwrap();
        let mut target = target();
        target.local_address = Some(local);
        transport.start_connection(conn, &target).unwrap();

        // Streams can only be opened once the handshake has completed
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let stream = loop {
            match transport.open_stream(conn, reader.clone()) {
                Ok(stream) => break stream,
                Err(_) => {
                    assert!(std::time::Instant::now() < deadline, "handshake never completed");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };
        transport.start_stream(stream).unwrap();
        transport.send(stream, request(250, 10), true).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            StatsRead::Stream(Ok(StreamStatistics {
                sends: 1,
                bytes_sent: 18,
                receives: 3,
                bytes_received: 250,
            }))
        );

        transport.shutdown_connection(conn, 0).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            StatsRead::Connection(Ok(ConnectionStatistics {
                local_address: Some(local),
                streams_opened: 1,
                bytes_sent: 18,
                bytes_received: 250,
            }))
        );
        assert_eq!(transport.stats().connection_statistics_reads, 1);
        assert_eq!(transport.stats().stream_statistics_reads, 1);
        assert_eq!(transport.connections_per_local_address().get(&local), Some(&1));

        // Retired once the final event has returned
        assert_eq!(transport.stream_statistics(stream), Err(TransportError::UnknownStream(stream)));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while transport.connection_statistics(conn).is_ok() {
            assert!(std::time::Instant::now() < deadline, "connection statistics never retired");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_stream_requires_connected() {
        let transport = LoopbackTransport::new(LoopbackOptions::default()).unwrap();
        let (recorder, _rx) = Recorder::new();
        let conn = transport.open_connection(recorder.clone()).unwrap();
        assert_eq!(
            transport.open_stream(conn, recorder).err(),
            Some(TransportError::InvalidState)
        );
    }
}
