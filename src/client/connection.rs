//! Connection state machine
//!
//! ```text
//! Created -> Connecting -> [HandshakeWait] -> Connected <-> (streams active) -> ShuttingDown -> Closed
//! ```
//!
//! The methods here are pure bookkeeping: they decide what should happen
//! next and return it, and the worker performs the transport calls after
//! releasing its connection table lock.

use super::pool::{Handle, Recycle};
use crate::config::ScenarioConfig;
use crate::transport::ConnectionId;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Created,
    Connecting,
    /// Connected, holding off the first streams for the handshake wait
    HandshakeWait,
    Connected,
    ShuttingDown,
    Closed,
}

/// How many streams a connection runs, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Concurrent stream limit
    pub limit: u32,
    /// Streams started on connect; the remaining `limit - initial` start one
    /// per completion
    pub initial: u32,
    /// Streams this connection may ever start
    pub per_connection: Option<u64>,
    /// Replace completed streams while the run is active
    pub repeat: bool,
}

impl StreamPolicy {
    pub fn from_scenario(scenario: &ScenarioConfig) -> Self {
        Self {
            limit: scenario.streams,
            initial: scenario.initial_streams(),
            per_connection: scenario.requests_per_connection,
            repeat: scenario.repeat_streams,
        }
    }
}

/// What the worker should do after a connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Start this many new streams
    StartStreams(u32),
    /// No streams left and none allowed: close the connection
    Shutdown,
    /// Streams are still in flight
    Wait,
}

/// Per-connection state owned by one worker.
#[derive(Debug, Default)]
pub struct Connection {
    pub state: ConnectionState,
    pub transport_id: Option<ConnectionId>,
    /// Owning worker; fixed for the connection's lifetime
    pub worker: usize,
    /// Streams started so far
    pub total_streams: u64,
    pub active_streams: u32,
    /// Delayed streams not started yet
    pub queued_streams: u32,
}

impl Recycle for Connection {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

impl Connection {
    pub fn begin(&mut self, worker: usize) {
        *self = Self {
            worker,
            ..Self::default()
        };
    }

    pub fn on_start(&mut self, id: ConnectionId) {
        self.transport_id = Some(id);
        self.state = ConnectionState::Connecting;
    }

    /// Reserve one more stream if the policy, the run flag and the
    /// process-wide budget (`reserve`) all allow it.
    pub fn try_reserve_stream(
        &mut self,
        policy: &StreamPolicy,
        running: bool,
        reserve: &mut impl FnMut() -> bool,
    ) -> bool {
        if !running || self.state != ConnectionState::Connected {
            return false;
        }
        if self.active_streams >= policy.limit {
            return false;
        }
        if !policy.repeat && self.total_streams >= u64::from(policy.limit) {
            return false;
        }
        if let Some(budget) = policy.per_connection {
            if self.total_streams >= budget {
                return false;
            }
        }
        if !reserve() {
            return false;
        }
        self.total_streams += 1;
        self.active_streams += 1;
        true
    }

    /// Handshake finished but streams wait; `on_connected` follows once the
    /// wait is over.
    pub fn on_handshake_complete(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::HandshakeWait;
        }
    }

    /// Handshake finished (and any handshake wait elapsed): start the
    /// initial streams. A connection already shutting down starts none.
    pub fn on_connected(
        &mut self,
        policy: &StreamPolicy,
        running: bool,
        reserve: &mut impl FnMut() -> bool,
    ) -> NextStep {
        if matches!(self.state, ConnectionState::ShuttingDown | ConnectionState::Closed) {
            return NextStep::Wait;
        }
        self.state = ConnectionState::Connected;
        self.queued_streams = policy.limit.saturating_sub(policy.initial);

        let mut started = 0;
        for _ in 0..policy.initial.min(policy.limit) {
            if !self.try_reserve_stream(policy, running, reserve) {
                break;
            }
            started += 1;
        }
        self.after_starts(started)
    }

    /// A stream finished. Starts a replacement and one delayed stream when
    /// allowed; shuts the connection down once nothing is left to run.
    pub fn on_stream_finished(
        &mut self,
        policy: &StreamPolicy,
        running: bool,
        connection_shutdown: bool,
        reserve: &mut impl FnMut() -> bool,
    ) -> NextStep {
        self.active_streams = self.active_streams.saturating_sub(1);
        if connection_shutdown || self.state != ConnectionState::Connected {
            return NextStep::Wait;
        }

        let mut started = 0;
        if self.try_reserve_stream(policy, running, reserve) {
            started += 1;
        }
        if self.queued_streams > 0 {
            self.queued_streams -= 1;
            if self.try_reserve_stream(policy, running, reserve) {
                started += 1;
            }
        }
        self.after_starts(started)
    }

    /// A reserved stream could not be started (pool or transport failure).
    /// No replacement is attempted.
    pub fn on_stream_abandoned(&mut self) -> NextStep {
        self.active_streams = self.active_streams.saturating_sub(1);
        self.after_starts(0)
    }

    pub fn on_shutdown_started(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::ShuttingDown;
        }
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn after_starts(&mut self, started: u32) -> NextStep {
        if started > 0 {
            NextStep::StartStreams(started)
        } else if self.active_streams == 0 && self.state == ConnectionState::Connected {
            self.state = ConnectionState::ShuttingDown;
            NextStep::Shutdown
        } else {
            NextStep::Wait
        }
    }
}

/// A worker's connections: the pool plus the ordered set of live handles.
pub struct ConnectionTable {
    pub pool: super::pool::Pool<Connection>,
    pub active: BTreeSet<Handle>,
}

impl ConnectionTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: super::pool::Pool::with_capacity(capacity),
            active: BTreeSet::new(),
        }
    }

    /// Allocate and register a connection for `worker`.
    pub fn insert(&mut self, worker: usize) -> Option<Handle> {
        let handle = self.pool.acquire().map(|(handle, conn)| {
            conn.begin(worker);
            handle
        })?;
        self.active.insert(handle);
        Some(handle)
    }

    /// Unregister and release a connection, returning its final state.
    pub fn remove(&mut self, handle: Handle) -> Option<(usize, ConnectionState)> {
        let conn = self.pool.get_mut(handle)?;
        conn.on_closed();
        let owner = (conn.worker, conn.state);
        self.active.remove(&handle);
        self.pool.release(handle);
        Some(owner)
    }

    /// Transport ids of every connection still registered.
    pub fn transport_ids(&self) -> Vec<ConnectionId> {
        self.active
            .iter()
            .filter_map(|handle| self.pool.get(*handle).and_then(|conn| conn.transport_id))
            .collect()
    }
}
