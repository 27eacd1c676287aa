//! Client sessions and the server side session table.
//!
//! A session is created by a Register entry and keyed by that entry's index.
//! It carries the bookkeeping for at-most-once commands (a response cache
//! bounded below by the client acknowledged low-water mark), ordered event
//! delivery (a resend buffer bounded the same way), and queries parked until
//! the command sequence they depend on has been applied.
//!
//! Time here is *log time*: the timestamp of the most recently applied entry.
//! Wall clocks never participate in expiry decisions, so every replica makes
//! the same decision at the same log position.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::QueryResponse;
use crate::AppData;
use crate::AppDataResponse;
use crate::AppEvent;
use crate::SessionId;

/// The lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Closed,
    Expired,
}

/// The channel on which a parked query eventually responds.
pub(crate) type QueryResponder<R> = oneshot::Sender<Result<QueryResponse<R>, ClientError>>;

/// A query waiting for the command sequence it depends on to be applied.
pub(crate) struct ParkedQuery<D: AppData, R: AppDataResponse> {
    /// The log index the query was recorded at (zero for sequential reads).
    pub index: u64,
    pub operation: D,
    pub tx: QueryResponder<R>,
}

/// A single client session.
pub struct Session<D: AppData, R: AppDataResponse, E: AppEvent> {
    id: SessionId,
    connection: u64,
    timeout: u64,
    state: SessionState,

    /// The last log index that touched this session.
    pub(crate) index: u64,
    /// The index of the latest KeepAlive entry for this session.
    pub(crate) keep_alive_index: u64,
    /// The last observed leader clock.
    pub(crate) timestamp: u64,

    /// The highest command sequence that has been applied.
    command_version: u64,
    /// The client acknowledged command sequence; responses at or below it
    /// may be dropped.
    command_low_water: u64,
    /// The highest event sequence assigned.
    event_version: u64,
    /// The client acknowledged event sequence; buffered events at or below
    /// it may be dropped.
    event_low_water: u64,

    /// Cached command results for replay, keyed by sequence. Application
    /// errors are cached too: a replayed command returns the original error.
    responses: BTreeMap<u64, Result<R, String>>,
    /// Buffered events for redelivery, keyed by sequence.
    events: BTreeMap<u64, E>,
    /// Queries parked until the keyed command sequence applies.
    pub(crate) queries: BTreeMap<u64, Vec<ParkedQuery<D, R>>>,

    /// Event sequences queued for delivery, in order.
    outbox: VecDeque<u64>,
    /// Whether a publish for this session is currently on the wire.
    in_flight: bool,
}

impl<D: AppData, R: AppDataResponse, E: AppEvent> Session<D, R, E> {
    fn new(id: SessionId, connection: u64, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            connection,
            timeout,
            state: SessionState::Open,
            index: id,
            keep_alive_index: 0,
            timestamp,
            command_version: 0,
            command_low_water: 0,
            event_version: 0,
            event_low_water: 0,
            responses: BTreeMap::new(),
            events: BTreeMap::new(),
            queries: BTreeMap::new(),
            outbox: VecDeque::new(),
            in_flight: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// The granted session timeout in milliseconds.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn command_version(&self) -> u64 {
        self.command_version
    }

    pub fn command_low_water(&self) -> u64 {
        self.command_low_water
    }

    pub fn event_version(&self) -> u64 {
        self.event_version
    }

    pub fn event_low_water(&self) -> u64 {
        self.event_low_water
    }

    /// Record that the entry at `index` with leader clock `timestamp`
    /// touched this session.
    pub(crate) fn touch(&mut self, index: u64, timestamp: u64) {
        self.index = index;
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Apply a keep-alive: refresh the clock and advance both low-water
    /// marks, dropping state below them.
    pub(crate) fn keep_alive(&mut self, index: u64, timestamp: u64, command_sequence: u64, event_sequence: u64) {
        self.touch(index, timestamp);
        self.keep_alive_index = index;

        let command_ack = command_sequence.min(self.command_version);
        if command_ack > self.command_low_water {
            self.command_low_water = command_ack;
            self.responses = self.responses.split_off(&(command_ack + 1));
        }

        let event_ack = event_sequence.min(self.event_version);
        if event_ack > self.event_low_water {
            self.event_low_water = event_ack;
            self.events = self.events.split_off(&(event_ack + 1));
            self.outbox.retain(|seq| *seq > event_ack);
        }
    }

    /// Look up the cached result for a command at or below the command
    /// version. `None` means the response was already dropped below the
    /// low-water mark and can not be replayed.
    pub(crate) fn replay(&self, sequence: u64) -> Option<Result<R, String>> {
        self.responses.get(&sequence).cloned()
    }

    /// Whether a command with the given sequence has already been applied.
    pub(crate) fn is_applied(&self, sequence: u64) -> bool {
        sequence <= self.command_version
    }

    /// Record the result of a freshly applied command.
    pub(crate) fn record_response(&mut self, sequence: u64, result: Result<R, String>) {
        self.responses.insert(sequence, result);
        if sequence > self.command_version {
            self.command_version = sequence;
        }
    }

    /// Publish an event to this session, assigning the next sequence and
    /// queueing it for delivery.
    pub fn publish(&mut self, event: E) -> u64 {
        self.event_version += 1;
        self.events.insert(self.event_version, event);
        self.outbox.push_back(self.event_version);
        self.event_version
    }

    /// The next event to put on the wire, if none is in flight.
    pub(crate) fn next_publish(&mut self) -> Option<(u64, E)> {
        if self.in_flight {
            return None;
        }
        while let Some(seq) = self.outbox.front().copied() {
            match self.events.get(&seq) {
                Some(event) => {
                    self.in_flight = true;
                    return Some((seq, event.clone()));
                }
                None => {
                    // Dropped below the low-water mark while queued.
                    self.outbox.pop_front();
                }
            }
        }
        None
    }

    /// Handle the outcome of a publish: the client's in-order ack.
    ///
    /// An ack at or above the sent sequence confirms delivery; a lower ack
    /// asks for redelivery of everything after it, in order.
    pub(crate) fn publish_acked(&mut self, sent: u64, ack: u64) {
        self.in_flight = false;
        let ack = ack.min(self.event_version);
        if ack > self.event_low_water {
            self.event_low_water = ack;
            self.events = self.events.split_off(&(ack + 1));
        }
        self.outbox.retain(|seq| *seq > ack);
        if ack < sent {
            // The client is missing events; resend everything it has not
            // confirmed, oldest first.
            self.outbox.clear();
            for seq in (ack + 1)..=self.event_version {
                if self.events.contains_key(&seq) {
                    self.outbox.push_back(seq);
                }
            }
        }
    }

    /// Handle a failed publish: retry the same event later.
    pub(crate) fn publish_failed(&mut self) {
        self.in_flight = false;
    }

    /// Park a query until `sequence` has been applied.
    pub(crate) fn park_query(&mut self, sequence: u64, query: ParkedQuery<D, R>) {
        self.queries.entry(sequence).or_default().push(query);
    }

    /// Take the queries released by the command at `sequence`.
    pub(crate) fn release_queries(&mut self, sequence: u64) -> Vec<ParkedQuery<D, R>> {
        let mut released = Vec::new();
        let pending: Vec<u64> = self.queries.range(..=sequence).map(|(k, _)| *k).collect();
        for seq in pending {
            if let Some(queries) = self.queries.remove(&seq) {
                released.extend(queries);
            }
        }
        released
    }

    fn mark(&mut self, state: SessionState) {
        self.state = state;
    }
}

/// The table of sessions a server maintains, owned by the state machine
/// context so that a single thread observes and mutates it.
pub struct SessionTable<D: AppData, R: AppDataResponse, E: AppEvent> {
    sessions: BTreeMap<SessionId, Session<D, R, E>>,
    connections: HashMap<u64, BTreeSet<SessionId>>,
    expired: BTreeSet<SessionId>,
    closed: BTreeSet<SessionId>,
    default_timeout: u64,
}

impl<D: AppData, R: AppDataResponse, E: AppEvent> SessionTable<D, R, E> {
    pub fn new(default_timeout: u64) -> Self {
        Self {
            sessions: BTreeMap::new(),
            connections: HashMap::new(),
            expired: BTreeSet::new(),
            closed: BTreeSet::new(),
            default_timeout,
        }
    }

    /// Create a session for the Register entry at `index`.
    pub fn register(&mut self, index: u64, connection: u64, requested_timeout: u64, timestamp: u64) -> &Session<D, R, E> {
        let timeout = if requested_timeout == 0 {
            self.default_timeout
        } else {
            requested_timeout
        };
        let session = Session::new(index, connection, timeout, timestamp);
        self.connections.entry(connection).or_default().insert(index);
        self.sessions.insert(index, session);
        self.sessions.get(&index).expect("session was just inserted")
    }

    /// Resolve a session id, distinguishing expired and closed sessions
    /// from ids this cluster never issued.
    pub(crate) fn lookup(&mut self, id: SessionId) -> Result<&mut Session<D, R, E>, ClientError> {
        if self.sessions.contains_key(&id) {
            return Ok(self.sessions.get_mut(&id).expect("session presence was just checked"));
        }
        if self.expired.contains(&id) {
            return Err(ClientError::SessionExpired(id));
        }
        if self.closed.contains(&id) {
            return Err(ClientError::UnknownSession(id));
        }
        Err(ClientError::UnknownSession(id))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session<D, R, E>> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Sessions whose ids map to the given connection.
    pub fn by_connection(&self, connection: u64) -> Vec<SessionId> {
        self.connections.get(&connection).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Close the given session, returning it for lifecycle hooks.
    pub(crate) fn close(&mut self, id: SessionId) -> Result<Session<D, R, E>, ClientError> {
        match self.sessions.remove(&id) {
            Some(mut session) => {
                self.unlink(&session);
                session.mark(SessionState::Closed);
                self.closed.insert(id);
                Ok(session)
            }
            None => {
                if self.expired.contains(&id) {
                    Err(ClientError::SessionExpired(id))
                } else {
                    Err(ClientError::UnknownSession(id))
                }
            }
        }
    }

    /// Remove every open session whose timeout elapsed at log time `now`,
    /// returning them for lifecycle hooks.
    pub(crate) fn expire_stale(&mut self, now: u64) -> Vec<Session<D, R, E>> {
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| now.saturating_sub(s.timestamp) > s.timeout)
            .map(|s| s.id)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(mut session) = self.sessions.remove(&id) {
                self.unlink(&session);
                session.mark(SessionState::Expired);
                self.expired.insert(id);
                removed.push(session);
            }
        }
        removed
    }

    fn unlink(&mut self, session: &Session<D, R, E>) {
        if let Some(ids) = self.connections.get_mut(&session.connection) {
            ids.remove(&session.id);
            if ids.is_empty() {
                self.connections.remove(&session.connection);
            }
        }
    }

    /// Iterate all open sessions mutably (event delivery sweep).
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<D, R, E>> {
        self.sessions.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestTable = SessionTable<String, String, String>;

    #[test]
    fn register_keys_by_index() {
        let mut table: TestTable = SessionTable::new(5_000);
        let s = table.register(7, 1, 0, 100);
        assert_eq!(s.id(), 7);
        assert_eq!(s.timeout(), 5_000);
        assert!(table.contains(7));
        assert_eq!(table.by_connection(1), vec![7]);
    }

    #[test]
    fn replay_hits_cache_without_reapply() {
        let mut table: TestTable = SessionTable::new(5_000);
        table.register(1, 1, 0, 0);
        let s = table.lookup(1).unwrap();
        assert!(!s.is_applied(1));
        s.record_response(1, Ok("one".into()));
        assert!(s.is_applied(1));
        assert_eq!(s.replay(1), Some(Ok("one".into())));
        assert_eq!(s.replay(2), None);
    }

    #[test]
    fn keep_alive_advances_low_water_and_drops_responses() {
        let mut table: TestTable = SessionTable::new(5_000);
        table.register(1, 1, 0, 0);
        let s = table.lookup(1).unwrap();
        s.record_response(1, Ok("one".into()));
        s.record_response(2, Ok("two".into()));
        s.keep_alive(5, 1_000, 1, 0);
        assert_eq!(s.command_low_water(), 1);
        assert_eq!(s.replay(1), None, "acked responses are dropped");
        assert_eq!(s.replay(2), Some(Ok("two".into())));
        assert_eq!(s.keep_alive_index, 5);
        assert_eq!(s.timestamp, 1_000);
    }

    #[test]
    fn low_water_never_exceeds_version() {
        let mut table: TestTable = SessionTable::new(5_000);
        table.register(1, 1, 0, 0);
        let s = table.lookup(1).unwrap();
        s.record_response(1, Ok("one".into()));
        s.keep_alive(5, 0, 9, 9);
        assert_eq!(s.command_low_water(), 1);
        assert_eq!(s.event_low_water(), 0);
    }

    #[test]
    fn events_are_sequenced_and_redelivered_in_order() {
        let mut table: TestTable = SessionTable::new(5_000);
        table.register(1, 1, 0, 0);
        let s = table.lookup(1).unwrap();
        assert_eq!(s.publish("a".into()), 1);
        assert_eq!(s.publish("b".into()), 2);
        assert_eq!(s.publish("c".into()), 3);

        let (seq, event) = s.next_publish().unwrap();
        assert_eq!((seq, event.as_str()), (1, "a"));
        assert!(s.next_publish().is_none(), "one publish in flight at a time");

        // Client only has event 1; 2 and 3 remain queued.
        s.publish_acked(1, 1);
        let (seq, _) = s.next_publish().unwrap();
        assert_eq!(seq, 2);

        // The client reports it is still at 1: resend from 2, in order.
        s.publish_acked(2, 1);
        let (seq, event) = s.next_publish().unwrap();
        assert_eq!((seq, event.as_str()), (2, "b"));
        s.publish_acked(2, 2);
        let (seq, event) = s.next_publish().unwrap();
        assert_eq!((seq, event.as_str()), (3, "c"));
        s.publish_acked(3, 3);
        assert!(s.next_publish().is_none());
        assert_eq!(s.event_low_water(), 3);
    }

    #[test]
    fn expiry_uses_log_time_only() {
        let mut table: TestTable = SessionTable::new(500);
        table.register(1, 1, 0, 0);
        table.register(2, 2, 0, 400);

        assert!(table.expire_stale(500).is_empty(), "within timeout");
        let expired = table.expire_stale(501);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), 1);
        assert_eq!(expired[0].state(), SessionState::Expired);

        assert!(matches!(table.lookup(1), Err(ClientError::SessionExpired(1))));
        assert!(table.contains(2));
        assert!(matches!(table.lookup(9), Err(ClientError::UnknownSession(9))));
    }

    #[test]
    fn keep_alive_staves_off_expiry() {
        let mut table: TestTable = SessionTable::new(500);
        table.register(1, 1, 0, 0);
        table.lookup(1).unwrap().keep_alive(2, 400, 0, 0);
        assert!(table.expire_stale(700).is_empty());
        assert_eq!(table.expire_stale(901).len(), 1);
    }

    #[test]
    fn close_marks_closed() {
        let mut table: TestTable = SessionTable::new(500);
        table.register(1, 1, 0, 0);
        let closed = table.close(1).unwrap();
        assert_eq!(closed.state(), SessionState::Closed);
        assert!(matches!(table.lookup(1), Err(ClientError::UnknownSession(1))));
        assert!(table.by_connection(1).is_empty());
    }
}
