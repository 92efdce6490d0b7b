//! Worker threads
//!
//! Each worker owns a share of the run's connections. It holds the
//! connection and stream pools for that share plus its counters, and runs a
//! thread that creates queued connections, posts deferred sends and starts
//! the streams of connections whose handshake wait has elapsed.
//!
//! Transport events arrive on the transport's threads through
//! [`ConnectionContext`] and [`StreamContext`]. They update the owning
//! worker's state under its locks, then issue any follow-up transport calls
//! after the locks are released. A connection never changes worker.
//!
//! # Lifecycle
//!
//! 1. **Creation**: `Worker::new()` sizes the pools for the worker's share
//! 2. **Start**: `start()` spawns the thread (pinned when configured)
//! 3. **Work**: `queue_connections()` hands it connections to create
//! 4. **Stop**: `stop()` discards queued connections, flushes deferred sends
//!    and joins the thread

pub mod affinity;

use crate::client::connection::{ConnectionTable, NextStep};
use crate::client::pool::{Handle, Pool};
use crate::client::stream::{SendProgress, Stream};
use crate::client::{ClientError, ClientShared};
use crate::stats::{WorkerCounters, WorkerSnapshot};
use crate::transport::{
    ConnectTarget, ConnectionEvent, ConnectionHandler, ConnectionId, Status, StreamEvent, StreamHandler, StreamId,
};
use crate::util::fast_time::FastInstant;
use crate::util::lock;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Work handed to the worker thread.
#[derive(Debug, Default)]
struct WorkQueue {
    pending_connections: u64,
    deferred_sends: VecDeque<Handle>,
    /// Connections in their handshake wait, in deadline order
    delayed_starts: VecDeque<(Instant, Handle, ConnectionId)>,
    stop: bool,
}

impl WorkQueue {
    fn has_work(&self, flush_delayed: bool, now: Instant) -> bool {
        self.stop
            || self.pending_connections > 0
            || !self.deferred_sends.is_empty()
            || self
                .delayed_starts
                .front()
                .is_some_and(|&(deadline, ..)| flush_delayed || deadline <= now)
    }

    /// Pop every delayed start that is due (all of them when flushing).
    fn take_due_starts(&mut self, flush: bool, now: Instant) -> Vec<(Handle, ConnectionId)> {
        let mut due = Vec::new();
        while let Some(&(deadline, handle, id)) = self.delayed_starts.front() {
            if !flush && deadline > now {
                break;
            }
            self.delayed_starts.pop_front();
            due.push((handle, id));
        }
        due
    }
}

/// State shared between a worker's thread and the transport callbacks.
pub struct WorkerContext {
    pub id: usize,
    pub counters: WorkerCounters,
    queue: Mutex<WorkQueue>,
    wake: Condvar,
    connections: Mutex<ConnectionTable>,
    streams: Mutex<Pool<Stream>>,
    target: ConnectTarget,
    shared: Arc<ClientShared>,
}

/// Connection callback binding: the owning worker plus the pool slot.
struct ConnectionContext {
    worker: Arc<WorkerContext>,
    handle: Handle,
}

impl ConnectionHandler for ConnectionContext {
    fn on_connection_event(&self, connection: ConnectionId, event: ConnectionEvent) -> Status {
        self.worker.on_connection_event(self.handle, connection, event)
    }
}

/// Stream callback binding.
struct StreamContext {
    worker: Arc<WorkerContext>,
    handle: Handle,
}

impl StreamHandler for StreamContext {
    fn on_stream_event(&self, stream: StreamId, event: StreamEvent<'_>) -> Status {
        self.worker.on_stream_event(self.handle, stream, event)
    }
}

impl WorkerContext {
    fn new(
        id: usize,
        target: ConnectTarget,
        shared: Arc<ClientShared>,
        connection_capacity: usize,
        stream_capacity: usize,
    ) -> Self {
        Self {
            id,
            counters: WorkerCounters::default(),
            queue: Mutex::new(WorkQueue::default()),
            wake: Condvar::new(),
            connections: Mutex::new(ConnectionTable::with_capacity(connection_capacity)),
            streams: Mutex::new(Pool::with_capacity(stream_capacity)),
            target,
            shared,
        }
    }

    /// Queue `count` connections for the worker thread to create.
    pub fn queue_connections(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.shared.connections_queued(count);

        let mut queue = lock(&self.queue);
        if queue.stop {
            drop(queue);
            self.shared.connections_closed(count);
            return;
        }
        queue.pending_connections += count;
        self.wake.notify_one();
    }

    /// Transport ids of every connection this worker still owns.
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        lock(&self.connections).transport_ids()
    }

    /// Wake the thread so it notices a change of the run flag.
    pub fn wake(&self) {
        let _queue = lock(&self.queue);
        self.wake.notify_all();
    }

    // ---- worker thread ----

    fn run(self: Arc<Self>) {
        log::debug!("worker {} started", self.id);
        loop {
            let (pending, deferred, due, stop) = {
                let mut queue = lock(&self.queue);
                loop {
                    let flush = !self.shared.is_running();
                    let now = Instant::now();
                    if queue.has_work(flush, now) {
                        break;
                    }
                    queue = match queue.delayed_starts.front() {
                        Some(&(deadline, ..)) => {
                            self.wake
                                .wait_timeout(queue, deadline - now)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0
                        }
                        None => self.wake.wait(queue).unwrap_or_else(PoisonError::into_inner),
                    };
                }
                let flush = queue.stop || !self.shared.is_running();
                let due = queue.take_due_starts(flush, Instant::now());
                (
                    std::mem::take(&mut queue.pending_connections),
                    std::mem::take(&mut queue.deferred_sends),
                    due,
                    queue.stop,
                )
            };

            if stop {
                if pending > 0 {
                    log::debug!("worker {}: discarding {} queued connections", self.id, pending);
                    self.shared.connections_closed(pending);
                }
            } else {
                for _ in 0..pending {
                    self.create_connection();
                }
            }

            for handle in deferred {
                self.post_send(handle);
            }

            for (handle, id) in due {
                self.start_initial_streams(handle, id);
            }

            if stop {
                let queue = lock(&self.queue);
                if queue.deferred_sends.is_empty() && queue.delayed_starts.is_empty() {
                    break;
                }
            }
        }
        log::debug!("worker {} exiting", self.id);
    }

    fn create_connection(self: &Arc<Self>) {
        if !self.shared.is_running() {
            self.shared.connections_closed(1);
            return;
        }

        let Some(handle) = lock(&self.connections).insert(self.id) else {
            log::warn!("worker {}: connection pool exhausted", self.id);
            self.shared.connections_closed(1);
            return;
        };
        self.counters.total_connections.add(1);
        self.counters.active_connections.add(1);

        let transport = &self.shared.transport;
        let handler = Arc::new(ConnectionContext {
            worker: Arc::clone(self),
            handle,
        });
        let id = match transport.open_connection(handler) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("worker {}: failed to open connection: {}", self.id, err);
                self.finish_connection(handle);
                return;
            }
        };

        if let Some(conn) = lock(&self.connections).pool.get_mut(handle) {
            conn.on_start(id);
        }

        if let Err(err) = transport.start_connection(id, &self.target) {
            log::warn!("worker {}: failed to start {}: {}", self.id, id, err);
            if transport.shutdown_connection(id, 0).is_err() {
                self.finish_connection(handle);
            }
        }
    }

    // ---- connection events ----

    fn on_connection_event(self: &Arc<Self>, handle: Handle, id: ConnectionId, event: ConnectionEvent) -> Status {
        match event {
            ConnectionEvent::Connected => self.on_connected(handle, id),
            ConnectionEvent::ShutdownInitiatedByTransport { error } => {
                log::warn!("worker {}: {} shut down by transport: {}", self.id, id, error);
                self.mark_shutting_down(handle);
            }
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => {
                log::debug!("worker {}: {} shut down by peer (0x{:x})", self.id, id, error_code);
                self.mark_shutting_down(handle);
            }
            ConnectionEvent::ShutdownComplete => {
                if self.shared.print_stats {
                    self.log_connection_statistics(id);
                }
                self.finish_connection(handle);
            }
        }
        Status::Success
    }

    fn on_connected(self: &Arc<Self>, handle: Handle, id: ConnectionId) {
        let Some(wait) = self.shared.handshake_wait else {
            self.counters.connected_connections.add(1);
            log::trace!("worker {}: {} connected", self.id, id);
            self.start_initial_streams(handle, id);
            return;
        };

        match lock(&self.connections).pool.get_mut(handle) {
            Some(conn) => conn.on_handshake_complete(),
            None => return,
        }
        self.counters.connected_connections.add(1);
        log::trace!("worker {}: {} connected, waiting {:?}", self.id, id, wait);

        let mut queue = lock(&self.queue);
        if queue.stop {
            drop(queue);
            self.start_initial_streams(handle, id);
            return;
        }
        // Deadlines are taken under the lock so the queue stays ordered
        queue.delayed_starts.push_back((Instant::now() + wait, handle, id));
        self.wake.notify_one();
    }

    fn start_initial_streams(self: &Arc<Self>, handle: Handle, id: ConnectionId) {
        let shared = &self.shared;
        let step = match lock(&self.connections).pool.get_mut(handle) {
            Some(conn) => conn.on_connected(&shared.policy, shared.is_running(), &mut || shared.try_reserve_request()),
            None => return,
        };
        self.apply(step, handle, id);
    }

    fn log_connection_statistics(&self, id: ConnectionId) {
        match self.shared.transport.connection_statistics(id) {
            Ok(stats) => log::info!("worker {}: {} {}", self.id, id, stats),
            Err(err) => log::debug!("worker {}: no statistics for {}: {}", self.id, id, err),
        }
    }

    fn log_stream_statistics(&self, id: StreamId) {
        match self.shared.transport.stream_statistics(id) {
            Ok(stats) => log::info!("worker {}: {} {}", self.id, id, stats),
            Err(err) => log::debug!("worker {}: no statistics for {}: {}", self.id, id, err),
        }
    }

    fn mark_shutting_down(&self, handle: Handle) {
        if let Some(conn) = lock(&self.connections).pool.get_mut(handle) {
            conn.on_shutdown_started();
        }
    }

    fn finish_connection(&self, handle: Handle) {
        let Some((owner, _)) = lock(&self.connections).remove(handle) else {
            return;
        };
        debug_assert_eq!(owner, self.id, "connection closed on a worker that does not own it");

        self.counters.active_connections.sub(1);
        if self.shared.repeat_connections && self.shared.is_running() {
            self.queue_connections(1);
        }
        self.shared.connections_closed(1);
    }

    fn shutdown(&self, id: ConnectionId) {
        if let Err(err) = self.shared.transport.shutdown_connection(id, 0) {
            log::debug!("worker {}: shutdown of {} failed: {}", self.id, id, err);
        }
    }

    fn apply(self: &Arc<Self>, step: NextStep, handle: Handle, id: ConnectionId) {
        match step {
            NextStep::StartStreams(count) => {
                for _ in 0..count {
                    self.start_stream(handle, id);
                }
            }
            NextStep::Shutdown => self.shutdown(id),
            NextStep::Wait => {}
        }
    }

    // ---- streams ----

    fn start_stream(self: &Arc<Self>, connection: Handle, connection_id: ConnectionId) {
        let acquired = lock(&self.streams).acquire().map(|(handle, stream)| {
            stream.begin(connection, connection_id, FastInstant::now());
            handle
        });
        let Some(handle) = acquired else {
            log::warn!("worker {}: stream pool exhausted", self.id);
            self.abandon_stream(connection, connection_id);
            return;
        };

        let transport = &self.shared.transport;
        let handler = Arc::new(StreamContext {
            worker: Arc::clone(self),
            handle,
        });
        let stream_id = match transport.open_stream(connection_id, handler) {
            Ok(id) => id,
            Err(err) => {
                log::debug!("worker {}: failed to open stream on {}: {}", self.id, connection_id, err);
                lock(&self.streams).release(handle);
                self.abandon_stream(connection, connection_id);
                return;
            }
        };

        if let Some(stream) = lock(&self.streams).get_mut(handle) {
            stream.transport_id = Some(stream_id);
        }

        if let Err(err) = transport.start_stream(stream_id) {
            // The stream is completed by the connection shutdown.
            log::debug!("worker {}: failed to start {}: {}", self.id, stream_id, err);
            self.shutdown(connection_id);
            return;
        }
        self.counters.started_requests.add(1);
        self.post_send(handle);
    }

    fn abandon_stream(self: &Arc<Self>, connection: Handle, connection_id: ConnectionId) {
        let step = match lock(&self.connections).pool.get_mut(connection) {
            Some(conn) => conn.on_stream_abandoned(),
            None => return,
        };
        self.apply(step, connection, connection_id);
    }

    /// Post the stream's next upload chunk.
    fn post_send(&self, handle: Handle) {
        let next = {
            let mut streams = lock(&self.streams);
            let Some(stream) = streams.get_mut(handle) else {
                return;
            };
            let (Some(stream_id), Some(connection_id)) = (stream.transport_id, stream.connection_id) else {
                return;
            };
            stream
                .next_chunk(&self.shared.request, &self.shared.plan)
                .map(|(chunk, fin)| (stream_id, connection_id, chunk, fin))
        };
        let Some((stream_id, connection_id, chunk, fin)) = next else {
            return;
        };

        if let Err(err) = self.shared.transport.send(stream_id, chunk, fin) {
            log::debug!("worker {}: send on {} failed: {}", self.id, stream_id, err);
            self.shutdown(connection_id);
        }
    }

    fn defer_send(&self, handle: Handle) {
        let mut queue = lock(&self.queue);
        if queue.stop {
            drop(queue);
            self.post_send(handle);
            return;
        }
        queue.deferred_sends.push_back(handle);
        self.wake.notify_one();
    }

    fn on_stream_event(self: &Arc<Self>, handle: Handle, id: StreamId, event: StreamEvent<'_>) -> Status {
        match event {
            StreamEvent::StartComplete { status } => {
                if status == Status::Error {
                    log::debug!("worker {}: {} failed to start", self.id, id);
                }
            }
            StreamEvent::SendComplete { buffer, canceled } => self.on_send_complete(handle, buffer, canceled),
            StreamEvent::Receive { data } => self.on_receive(handle, id, data.len()),
            StreamEvent::PeerSendShutdown => {
                let finished = match lock(&self.streams).get_mut(handle) {
                    Some(stream) => stream.on_peer_send_shutdown(&self.shared.plan),
                    None => return Status::Success,
                };
                if !finished {
                    log::debug!("worker {}: {} download ended early", self.id, id);
                }
            }
            StreamEvent::PeerSendAborted { error_code } => {
                log::debug!("worker {}: {} send aborted by peer (0x{:x})", self.id, id, error_code);
            }
            StreamEvent::SendShutdownComplete { graceful } => {
                log::trace!("worker {}: {} send shutdown (graceful={})", self.id, id, graceful);
            }
            StreamEvent::ShutdownComplete { connection_shutdown } => {
                if self.shared.print_stream_stats {
                    self.log_stream_statistics(id);
                }
                self.on_stream_shutdown(handle, connection_shutdown);
            }
        }
        Status::Success
    }

    fn on_send_complete(&self, handle: Handle, buffer: Bytes, canceled: bool) {
        let progress = match lock(&self.streams).get_mut(handle) {
            Some(stream) => stream.on_send_complete(&buffer, canceled),
            None => return,
        };
        drop(buffer);

        match progress {
            SendProgress::Continue if self.shared.send_inline => self.post_send(handle),
            SendProgress::Continue => self.defer_send(handle),
            SendProgress::SendDone => self.counters.send_completed_requests.add(1),
            SendProgress::Idle => {}
        }
    }

    fn on_receive(&self, handle: Handle, id: StreamId, len: usize) {
        let abort = match lock(&self.streams).get_mut(handle) {
            Some(stream) => stream.on_receive(len, &self.shared.plan),
            None => return,
        };
        if abort {
            if let Err(err) = self.shared.transport.abort_receive(id, 0) {
                log::debug!("worker {}: abort on {} failed: {}", self.id, id, err);
            }
        }
    }

    fn on_stream_shutdown(self: &Arc<Self>, handle: Handle, connection_shutdown: bool) {
        let finished = {
            let mut streams = lock(&self.streams);
            let Some(stream) = streams.get(handle) else {
                return;
            };
            let latency = stream.is_successful().then(|| stream.latency_micros());
            let owner = stream.connection.zip(stream.connection_id);
            streams.release(handle);
            owner.map(|owner| (owner, latency))
        };
        let Some(((connection, connection_id), latency)) = finished else {
            return;
        };

        if let Some(micros) = latency {
            self.shared.record_latency(micros);
            self.counters.completed_requests.add(1);
        }

        let shared = &self.shared;
        let step = match lock(&self.connections).pool.get_mut(connection) {
            Some(conn) => conn.on_stream_finished(&shared.policy, shared.is_running(), connection_shutdown, &mut || {
                shared.try_reserve_request()
            }),
            None => return,
        };
        self.apply(step, connection, connection_id);
    }
}

/// A worker: its shared context plus the thread driving it.
pub struct Worker {
    context: Arc<WorkerContext>,
    processor: Option<usize>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker sized for `connections` connections.
    pub fn new(
        id: usize,
        target: ConnectTarget,
        shared: Arc<ClientShared>,
        connections: u64,
        processor: Option<usize>,
    ) -> Self {
        let connection_capacity = usize::try_from(connections).unwrap_or(usize::MAX).max(1);
        let stream_capacity = connection_capacity.saturating_mul(shared.policy.limit.max(1) as usize);
        Self {
            context: Arc::new(WorkerContext::new(
                id,
                target,
                shared,
                connection_capacity,
                stream_capacity,
            )),
            processor,
            thread: None,
        }
    }

    pub fn id(&self) -> usize {
        self.context.id
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.context.target
    }

    /// Spawn the worker thread.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.thread.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let id = self.context.id;
        let context = Arc::clone(&self.context);
        let processor = self.processor;

        let thread = thread::Builder::new()
            .name(format!("loadpulse-worker-{}", id))
            .spawn(move || {
                if let Some(cpu) = processor {
                    match affinity::set_cpu_affinity(&[cpu]) {
                        Ok(()) => log::debug!("worker {} pinned to cpu {}", id, cpu),
                        Err(err) => log::warn!("worker {}: {:#}", id, err),
                    }
                }
                context.run();
            })
            .map_err(|source| ClientError::ThreadSpawn { worker: id, source })?;
        self.thread = Some(thread);
        Ok(())
    }

    pub fn queue_connections(&self, count: u64) {
        self.context.queue_connections(count);
    }

    pub fn wake(&self) {
        self.context.wake();
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.context.counters.snapshot(self.context.id)
    }

    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.context.active_connections()
    }

    /// Stop the thread and wait for it. Queued connections are discarded;
    /// deferred sends are flushed first.
    pub fn stop(&mut self) {
        {
            let mut queue = lock(&self.context.queue);
            queue.stop = true;
            self.context.wake.notify_all();
        }

        let Some(thread) = self.thread.take() else {
            // Never started: nothing will drain the queue.
            let pending = std::mem::take(&mut lock(&self.context.queue).pending_connections);
            self.context.shared.connections_closed(pending);
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            log::error!("worker {} thread panicked", self.context.id);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
