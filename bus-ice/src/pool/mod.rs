
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::connect_spec::ConnectSpec;
use crate::packet_engine::PacketEngine;
use crate::stream::{PacketStream, StreamId};
use shared::error::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Identifies the negotiation that reserved a placeholder entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegotiationId(pub u64);

/// Connection state of a pooled stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StreamConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl StreamConnState {
    fn is_live(self) -> bool {
        matches!(self, StreamConnState::Connecting | StreamConnState::Connected)
    }
}

impl fmt::Display for StreamConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            StreamConnState::Disconnected => "disconnected",
            StreamConnState::Connecting => "connecting",
            StreamConnState::Connected => "connected",
            StreamConnState::Disconnecting => "disconnecting",
        };
        write!(f, "{s}")
    }
}

struct PoolEntry {
    key: ConnectSpec,
    stream: Option<Arc<PacketStream>>,
    ref_count: usize,
    conn_state: StreamConnState,
    disconnecting_since: Option<Instant>,
    owner: Option<NegotiationId>,
    registered: bool,
    pending_accept: bool,
    reaping: bool,
    alarms: Vec<AbortHandle>,
    state_tx: watch::Sender<StreamConnState>,
}

impl PoolEntry {
    fn set_state(&mut self, state: StreamConnState, now: Instant) {
        if self.conn_state == state {
            return;
        }
        self.conn_state = state;
        self.disconnecting_since = if state == StreamConnState::Disconnecting {
            Some(now)
        } else {
            None
        };
        self.state_tx.send_replace(state);
    }

    fn abort_alarms(&mut self) {
        for alarm in self.alarms.drain(..) {
            alarm.abort();
        }
    }

    fn snapshot(&self, id: EntryId) -> EntrySnapshot {
        EntrySnapshot {
            id,
            key: self.key.clone(),
            stream: self.stream.as_ref().map(|s| s.id()),
            ref_count: self.ref_count,
            conn_state: self.conn_state,
            disconnecting_since: self.disconnecting_since,
            pending_accept: self.pending_accept,
        }
    }
}

/// Point-in-time copy of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub key: ConnectSpec,
    pub stream: Option<StreamId>,
    pub ref_count: usize,
    pub conn_state: StreamConnState,
    pub disconnecting_since: Option<Instant>,
    pub pending_accept: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connecting: usize,
    pub connected: usize,
    pub disconnecting: usize,
    pub disconnected: usize,
}

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub torn_down: usize,
    pub removed: usize,
}

#[derive(Default)]
struct PoolInner {
    entries: BTreeMap<EntryId, PoolEntry>,
    next_id: u64,
}

/// Reference-counted table of negotiated streams keyed by connect spec.
///
/// Every lookup, reservation and reference change happens under one lock, so at most one
/// Connecting or Connected entry exists per key. Entries are never destroyed on the release
/// path: a stream whose count reaches zero turns Disconnecting and only [`StreamPool::sweep`]
/// tears it down once the grace interval has passed.
#[derive(Default)]
pub struct StreamPool {
    inner: Mutex<PoolInner>,
}

/// Outcome of [`StreamPool::reserve_placeholder`].
pub enum Reservation {
    /// A placeholder was inserted; the holder must negotiate the stream.
    Reserved(StreamLease),
    /// Another negotiation or an established stream already serves the key.
    Existing(StreamLease),
}

impl StreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lease(self: &Arc<Self>, id: EntryId, entry: &PoolEntry) -> StreamLease {
        StreamLease {
            pool: Arc::clone(self),
            entry: id,
            key: entry.key.clone(),
            state_rx: entry.state_tx.subscribe(),
            released: false,
        }
    }

    fn find_live(inner: &PoolInner, key: &ConnectSpec) -> Option<EntryId> {
        let mut connecting = None;
        for (id, entry) in &inner.entries {
            if entry.reaping || &entry.key != key {
                continue;
            }
            match entry.conn_state {
                StreamConnState::Connected => return Some(*id),
                StreamConnState::Connecting if connecting.is_none() => connecting = Some(*id),
                _ => {}
            }
        }
        connecting
    }

    /// Takes a reference on the entry for `key`, preferring a Connected entry over a
    /// Connecting one. The stream is absent while the entry is still Connecting.
    pub fn acquire_by_key(self: &Arc<Self>, key: &ConnectSpec) -> Option<StreamLease> {
        let mut inner = self.lock();
        let id = Self::find_live(&inner, key)?;
        let entry = inner.entries.get_mut(&id)?;
        entry.ref_count += 1;
        let entry = &*entry;
        Some(self.lease(id, entry))
    }

    /// Takes a reference on the entry owning `stream`. An entry still inside its grace
    /// interval is resurrected back to Connected, unless another live entry already serves
    /// its key.
    pub fn acquire_by_stream(self: &Arc<Self>, stream: StreamId) -> Result<StreamLease> {
        let mut inner = self.lock();
        let found = inner.entries.iter().find(|(_, e)| {
            !e.reaping
                && e.conn_state != StreamConnState::Disconnected
                && e.stream.as_ref().map(|s| s.id()) == Some(stream)
        });
        let Some((&id, entry)) = found else {
            return Err(Error::ErrStreamGone);
        };
        if entry.conn_state == StreamConnState::Disconnecting {
            if let Some(live) = Self::find_live(&inner, &entry.key) {
                log::debug!("{id}: not resurrecting {stream}, {live} already serves {}", entry.key);
                return Err(Error::ErrStreamGone);
            }
        }

        let entry = inner.entries.get_mut(&id).ok_or(Error::ErrStreamGone)?;
        if entry.conn_state == StreamConnState::Disconnecting {
            log::debug!("{id}: resurrecting {} within grace interval", entry.key);
            entry.set_state(StreamConnState::Connected, Instant::now());
        }
        entry.ref_count += 1;
        let entry = &*entry;
        Ok(self.lease(id, entry))
    }

    /// Looks up `key` and, if nothing live serves it, inserts a Connecting placeholder
    /// owned by `owner`. Lookup and insert happen under the same lock.
    pub fn reserve_placeholder(
        self: &Arc<Self>,
        key: &ConnectSpec,
        owner: NegotiationId,
    ) -> Reservation {
        let mut inner = self.lock();
        if let Some(id) = Self::find_live(&inner, key) {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.ref_count += 1;
                let entry = &*entry;
                return Reservation::Existing(self.lease(id, entry));
            }
        }

        inner.next_id += 1;
        let id = EntryId(inner.next_id);
        let (state_tx, _) = watch::channel(StreamConnState::Connecting);
        let entry = PoolEntry {
            key: key.clone(),
            stream: None,
            ref_count: 1,
            conn_state: StreamConnState::Connecting,
            disconnecting_since: None,
            owner: Some(owner),
            registered: false,
            pending_accept: false,
            reaping: false,
            alarms: vec![],
            state_tx,
        };
        let lease = self.lease(id, &entry);
        inner.entries.insert(id, entry);
        log::trace!("{id}: reserved placeholder for {key}");
        Reservation::Reserved(lease)
    }

    /// Puts a negotiated stream into its placeholder. With `awaiting_accept` the entry
    /// stays Connecting and one reference is parked until the packet engine accepts.
    pub fn install(
        &self,
        id: EntryId,
        stream: Arc<PacketStream>,
        awaiting_accept: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&id).ok_or(Error::ErrStreamGone)?;
        if entry.reaping || entry.conn_state != StreamConnState::Connecting {
            return Err(Error::ErrStreamGone);
        }
        entry.stream = Some(stream);
        entry.owner = None;
        if awaiting_accept {
            entry.pending_accept = true;
        } else {
            entry.set_state(StreamConnState::Connected, Instant::now());
        }
        Ok(())
    }

    /// Records that the packet engine reads the entry's stream.
    pub fn set_registered(&self, id: EntryId) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            entry.registered = true;
        }
    }

    /// Ties an alarm task to the entry; it is aborted when the stream is torn down.
    pub fn add_alarm(&self, id: EntryId, alarm: AbortHandle) {
        let mut inner = self.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) if !entry.reaping => entry.alarms.push(alarm),
            _ => alarm.abort(),
        }
    }

    /// Marks a failed negotiation's entry Disconnecting so waiters give up and the
    /// sweep can reclaim it.
    pub fn abandon(&self, id: EntryId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.owner = None;
            entry.pending_accept = false;
            if entry.conn_state != StreamConnState::Disconnected {
                entry.set_state(StreamConnState::Disconnecting, Instant::now());
            }
        }
    }

    fn release_locked(inner: &mut PoolInner, id: EntryId) {
        let Some(entry) = inner.entries.get_mut(&id) else {
            return;
        };
        if entry.ref_count == 0 {
            log::warn!("{id}: release without a matching acquire");
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 && entry.conn_state.is_live() {
            log::debug!("{id}: last reference to {} released", entry.key);
            entry.set_state(StreamConnState::Disconnecting, Instant::now());
        }
    }

    /// Drops one reference. Never destroys the entry.
    pub fn release(&self, id: EntryId) {
        Self::release_locked(&mut self.lock(), id);
    }

    /// Consumes the reference parked by `install(.., true)` and marks the stream
    /// Connected. Returns false when no accept was pending or the stream is not yet
    /// registered with the packet engine.
    pub fn complete_accept(&self, id: EntryId) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        if !entry.pending_accept || !entry.registered {
            return false;
        }
        entry.pending_accept = false;
        entry.set_state(StreamConnState::Connected, Instant::now());
        Self::release_locked(&mut inner, id);
        true
    }

    /// Drops the reference parked for an accept that never came. Returns false when the
    /// accept already completed.
    pub fn expire_accept(&self, id: EntryId) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        if !entry.pending_accept {
            return false;
        }
        entry.pending_accept = false;
        Self::release_locked(&mut inner, id);
        true
    }

    /// Reaps unreferenced streams. Disconnected entries are removed; Disconnecting entries
    /// older than `grace` are unregistered from the packet engine and turned Disconnected,
    /// to be removed by the next sweep. The packet engine is called without the pool lock.
    pub async fn sweep(
        &self,
        now: Instant,
        grace: Duration,
        packet_engine: &dyn PacketEngine,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let doomed = {
            let mut inner = self.lock();
            let before = inner.entries.len();
            inner
                .entries
                .retain(|_, e| !(e.ref_count == 0 && e.conn_state == StreamConnState::Disconnected));
            report.removed = before - inner.entries.len();

            let mut doomed = vec![];
            for (id, entry) in inner.entries.iter_mut() {
                let expired = entry
                    .disconnecting_since
                    .map(|since| now.saturating_duration_since(since) >= grace)
                    .unwrap_or(false);
                if entry.ref_count == 0
                    && !entry.reaping
                    && entry.conn_state == StreamConnState::Disconnecting
                    && expired
                {
                    entry.reaping = true;
                    entry.abort_alarms();
                    doomed.push((*id, entry.stream.clone(), entry.registered));
                }
            }
            doomed
        };

        for (id, stream, registered) in &doomed {
            if let Some(stream) = stream {
                log::debug!("{id}: tearing down {}", stream.id());
                if *registered {
                    packet_engine.remove_stream(stream).await;
                }
                stream.stop();
            }
        }

        let mut inner = self.lock();
        for (id, _, _) in doomed {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.registered = false;
                entry.reaping = false;
                entry.set_state(StreamConnState::Disconnected, now);
                report.torn_down += 1;
            }
        }
        report
    }

    /// Tears down every entry regardless of references. Used at shutdown.
    pub async fn drain(&self, packet_engine: &dyn PacketEngine) {
        let entries = std::mem::take(&mut self.lock().entries);
        for (id, mut entry) in entries {
            entry.abort_alarms();
            if let Some(stream) = &entry.stream {
                log::trace!("{id}: draining {}", stream.id());
                if entry.registered {
                    packet_engine.remove_stream(stream).await;
                }
                stream.stop();
            }
            entry.set_state(StreamConnState::Disconnected, Instant::now());
        }
    }

    pub fn stream(&self, id: EntryId) -> Option<Arc<PacketStream>> {
        self.lock().entries.get(&id).and_then(|e| e.stream.clone())
    }

    pub fn snapshot(&self, id: EntryId) -> Option<EntrySnapshot> {
        self.lock().entries.get(&id).map(|e| e.snapshot(id))
    }

    pub fn entries_for_key(&self, key: &ConnectSpec) -> Vec<EntrySnapshot> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| &e.key == key)
            .map(|(id, e)| e.snapshot(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of negotiated streams still waiting for the peer's data-layer connect.
    pub fn pending_accepts(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.pending_accept)
            .count()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let mut stats = PoolStats::default();
        for entry in inner.entries.values() {
            match entry.conn_state {
                StreamConnState::Connecting => stats.connecting += 1,
                StreamConnState::Connected => stats.connected += 1,
                StreamConnState::Disconnecting => stats.disconnecting += 1,
                StreamConnState::Disconnected => stats.disconnected += 1,
            }
        }
        stats
    }
}

/// One counted reference on a pool entry. Dropping the lease releases it.
pub struct StreamLease {
    pool: Arc<StreamPool>,
    entry: EntryId,
    key: ConnectSpec,
    state_rx: watch::Receiver<StreamConnState>,
    released: bool,
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("entry", &self.entry)
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl StreamLease {
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn key(&self) -> &ConnectSpec {
        &self.key
    }

    pub fn conn_state(&self) -> StreamConnState {
        *self.state_rx.borrow()
    }

    pub fn stream(&self) -> Option<Arc<PacketStream>> {
        self.pool.stream(self.entry)
    }

    /// Waits until the entry is Connected and returns its stream. Fails with
    /// `ErrStreamGone` once the entry leaves the live states.
    pub async fn wait_connected(&mut self) -> Result<Arc<PacketStream>> {
        loop {
            let state = *self.state_rx.borrow_and_update();
            match state {
                StreamConnState::Connected => {
                    return self.stream().ok_or(Error::ErrStreamGone);
                }
                StreamConnState::Connecting => {}
                StreamConnState::Disconnecting | StreamConnState::Disconnected => {
                    return Err(Error::ErrStreamGone);
                }
            }
            if self.state_rx.changed().await.is_err() {
                return Err(Error::ErrStreamGone);
            }
        }
    }

    /// Hands this reference over to the pending accept parked by `install`.
    pub(crate) fn into_pending_accept(mut self) -> EntryId {
        self.released = true;
        self.entry
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.entry);
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.do_release();
    }
}
