use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, CandidateType, IceCredentials, PeerCandidates};
use crate::connect_spec::ConnectSpec;
use crate::endpoint::{Endpoint, EndpointId};
use crate::ice_engine::{DatagramSocket, IceEngine, IceSession, SessionParams, SessionState};
use crate::packet_engine::{BoxedChannel, PacketDest, PacketEngine, PacketEngineListener};
use crate::signaling::{RelayCredentials, Signaling};
use crate::stream::{PacketStream, StreamId};
use crate::transport::TransportListener;
use shared::error::*;

pub(crate) const CHANNEL_BUFFER: usize = 64 * 1024;

pub(crate) fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub(crate) fn host(a: &str) -> Candidate {
    Candidate::host(addr(a))
}

pub(crate) fn srflx(a: &str, base: &str) -> Candidate {
    Candidate::server_reflexive(addr(a), addr(base))
}

pub(crate) fn relay(a: &str, base: &str) -> Candidate {
    Candidate::relay(addr(a), addr(base))
}

pub(crate) fn relay_credentials(recv_time: Instant, expiry: Duration) -> RelayCredentials {
    RelayCredentials {
        stun_server: addr("198.51.100.1:3478"),
        relay_server: Some(addr("198.51.100.1:3478")),
        username: "user".to_owned(),
        password: "pass".to_owned(),
        recv_time,
        expiry,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// Ordered record of collaborator calls shared between mocks.
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub(crate) fn push(&self, call: impl Into<String>) {
        lock(&self.0).push(call.into());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub(crate) fn position(&self, call: &str) -> Option<usize> {
        lock(&self.0).iter().position(|c| c == call)
    }
}

pub(crate) struct MockSignaling {
    local_guid: String,
    log: CallLog,
    credentials: Mutex<Option<RelayCredentials>>,
    refreshed: Mutex<Option<RelayCredentials>>,
    inbox: Mutex<HashMap<String, PeerCandidates>>,
    inbox_changed: Notify,
    peer: Mutex<Option<Weak<MockSignaling>>>,
    sent: Mutex<Vec<(String, Vec<Candidate>)>>,
    abandoned: Mutex<Vec<String>>,
    pub(crate) refreshes: AtomicUsize,
}

impl MockSignaling {
    pub(crate) fn new(local_guid: &str, log: CallLog) -> Arc<Self> {
        let fresh = relay_credentials(Instant::now(), Duration::from_secs(600));
        Arc::new(Self {
            local_guid: local_guid.to_owned(),
            log,
            credentials: Mutex::new(Some(fresh.clone())),
            refreshed: Mutex::new(Some(fresh)),
            inbox: Mutex::new(HashMap::new()),
            inbox_changed: Notify::new(),
            peer: Mutex::new(None),
            sent: Mutex::new(vec![]),
            abandoned: Mutex::new(vec![]),
            refreshes: AtomicUsize::new(0),
        })
    }

    /// Connects two signaling mocks so candidates sent by one arrive at the other.
    pub(crate) fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Some(Arc::downgrade(b));
        *lock(&b.peer) = Some(Arc::downgrade(a));
    }

    pub(crate) fn set_credentials(&self, credentials: Option<RelayCredentials>) {
        *lock(&self.credentials) = credentials;
    }

    pub(crate) fn set_refreshed(&self, credentials: Option<RelayCredentials>) {
        *lock(&self.refreshed) = credentials;
    }

    pub(crate) fn deliver(&self, from: &str, candidates: PeerCandidates) {
        lock(&self.inbox).insert(from.to_owned(), candidates);
        self.inbox_changed.notify_one();
    }

    pub(crate) fn sent_to(&self, peer: &str) -> Vec<Vec<Candidate>> {
        lock(&self.sent)
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn abandoned(&self) -> Vec<String> {
        lock(&self.abandoned).clone()
    }
}

#[async_trait]
impl Signaling for MockSignaling {
    async fn get_relay_credentials(&self, _peer: &str) -> Result<RelayCredentials> {
        self.log.push("get_relay_credentials");
        lock(&self.credentials).clone().ok_or(Error::ErrNoStunInfo)
    }

    async fn refresh_relay_credentials(&self, _peer: &str) -> Result<RelayCredentials> {
        self.log.push("refresh_relay_credentials");
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let refreshed = lock(&self.refreshed).clone();
        if let Some(credentials) = &refreshed {
            *lock(&self.credentials) = Some(credentials.clone());
        }
        refreshed.ok_or(Error::ErrCredentialsExpired)
    }

    async fn send_candidates(
        &self,
        peer: &str,
        candidates: &[Candidate],
        credentials: &IceCredentials,
    ) -> Result<()> {
        self.log.push("send_candidates");
        lock(&self.sent).push((peer.to_owned(), candidates.to_vec()));
        let linked = lock(&self.peer).as_ref().and_then(Weak::upgrade);
        if let Some(linked) = linked {
            linked.deliver(
                &self.local_guid,
                PeerCandidates {
                    candidates: candidates.to_vec(),
                    credentials: credentials.clone(),
                },
            );
        }
        Ok(())
    }

    async fn recv_peer_candidates(&self, peer: &str) -> Result<PeerCandidates> {
        loop {
            if let Some(candidates) = lock(&self.inbox).remove(peer) {
                self.log.push("recv_peer_candidates");
                return Ok(candidates);
            }
            self.inbox_changed.notified().await;
        }
    }

    async fn abandon(&self, peer: &str) {
        self.log.push("abandon");
        lock(&self.abandoned).push(peer.to_owned());
    }
}

/// Which pair a mock session reports once checks succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairSelector {
    First,
    ByType(CandidateType, CandidateType),
    Nothing,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionScript {
    pub(crate) local_candidates: Vec<Candidate>,
    pub(crate) gather_outcome: SessionState,
    pub(crate) checks_succeed: bool,
    pub(crate) selector: PairSelector,
}

impl SessionScript {
    pub(crate) fn with_candidates(local_candidates: Vec<Candidate>) -> Self {
        Self {
            local_candidates,
            gather_outcome: SessionState::CandidatesGathered,
            checks_succeed: true,
            selector: PairSelector::First,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SocketStats {
    pub(crate) keepalives: AtomicUsize,
    pub(crate) refreshes: AtomicUsize,
}

pub(crate) struct MockSocket {
    local: SocketAddr,
    remote: SocketAddr,
    stats: Arc<SocketStats>,
}

#[async_trait]
impl DatagramSocket for MockSocket {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }

    async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
        std::future::pending().await
    }

    async fn send_keepalive(&self) -> Result<()> {
        self.stats.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_relay(&self, _credentials: &RelayCredentials) -> Result<()> {
        self.stats.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockIceEngine {
    script: Mutex<SessionScript>,
    log: CallLog,
    pub(crate) allocated: AtomicUsize,
    pub(crate) deallocated: AtomicUsize,
    sockets: Arc<Mutex<Vec<Arc<SocketStats>>>>,
    roles: Mutex<Vec<SessionParams>>,
}

impl MockIceEngine {
    pub(crate) fn new(script: SessionScript, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            log,
            allocated: AtomicUsize::new(0),
            deallocated: AtomicUsize::new(0),
            sockets: Arc::new(Mutex::new(vec![])),
            roles: Mutex::new(vec![]),
        })
    }

    pub(crate) fn set_script(&self, script: SessionScript) {
        *lock(&self.script) = script;
    }

    pub(crate) fn sockets(&self) -> Vec<Arc<SocketStats>> {
        lock(&self.sockets).clone()
    }

    pub(crate) fn sessions(&self) -> Vec<SessionParams> {
        lock(&self.roles).clone()
    }
}

#[async_trait]
impl IceEngine for MockIceEngine {
    async fn allocate_session(&self, params: SessionParams) -> Result<Box<dyn IceSession>> {
        self.log.push("allocate_session");
        self.allocated.fetch_add(1, Ordering::SeqCst);
        lock(&self.roles).push(params.clone());
        let (state_tx, _) = watch::channel(SessionState::New);
        Ok(Box::new(MockIceSession {
            controlling: params.role.is_controlling(),
            script: lock(&self.script).clone(),
            state_tx,
            remote: vec![],
            socket_taken: false,
            log: self.log.clone(),
            sockets: Arc::clone(&self.sockets),
        }))
    }

    async fn deallocate_session(&self, _session: Box<dyn IceSession>) {
        self.log.push("deallocate_session");
        self.deallocated.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockIceSession {
    controlling: bool,
    script: SessionScript,
    state_tx: watch::Sender<SessionState>,
    remote: Vec<Candidate>,
    socket_taken: bool,
    log: CallLog,
    sockets: Arc<Mutex<Vec<Arc<SocketStats>>>>,
}

#[async_trait]
impl IceSession for MockIceSession {
    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn gather_candidates(&mut self) -> Result<()> {
        self.log.push("gather_candidates");
        self.state_tx.send_replace(SessionState::Gathering);
        self.state_tx.send_replace(self.script.gather_outcome);
        Ok(())
    }

    fn local_candidates(&self) -> (Vec<Candidate>, IceCredentials) {
        (
            self.script.local_candidates.clone(),
            IceCredentials::new("ufrag", "pwd"),
        )
    }

    async fn start_checks(&mut self, peer: &PeerCandidates) -> Result<()> {
        self.log.push("start_checks");
        self.remote = peer.candidates.clone();
        self.state_tx.send_replace(SessionState::ChecksRunning);
        self.state_tx.send_replace(if self.script.checks_succeed {
            SessionState::ChecksSucceeded
        } else {
            SessionState::ChecksFailed
        });
        Ok(())
    }

    fn selected_pairs(&self) -> Vec<CandidatePair> {
        let local = &self.script.local_candidates;
        let pick = match self.script.selector {
            PairSelector::Nothing => None,
            PairSelector::First => local.first().zip(self.remote.first()),
            PairSelector::ByType(l, r) => local
                .iter()
                .find(|c| c.candidate_type == l)
                .zip(self.remote.iter().find(|c| c.candidate_type == r)),
        };
        pick.map(|(l, r)| CandidatePair::new(l.clone(), r.clone(), self.controlling))
            .into_iter()
            .collect()
    }

    fn disable_listener(&mut self, _pair: &CandidatePair) {
        self.log.push("disable_listener");
    }

    fn take_socket(&mut self, pair: &CandidatePair) -> Result<Box<dyn DatagramSocket>> {
        if self.socket_taken {
            return Err(Error::ErrStreamGone);
        }
        self.socket_taken = true;
        self.log.push("take_socket");
        let stats = Arc::new(SocketStats::default());
        lock(&self.sockets).push(Arc::clone(&stats));
        Ok(Box::new(MockSocket {
            local: pair.local.address,
            remote: pair.remote.address,
            stats,
        }))
    }
}

pub(crate) struct MockPacketEngine {
    local_guid: String,
    log: CallLog,
    listener: Mutex<Option<Weak<dyn PacketEngineListener>>>,
    streams: Mutex<Vec<Arc<PacketStream>>>,
    stream_added: Notify,
    peer: Mutex<Option<Weak<MockPacketEngine>>>,
    remote_ends: Mutex<Vec<DuplexStream>>,
    fail_add: AtomicBool,
    add_delay: Mutex<Option<Duration>>,
    pub(crate) added: AtomicUsize,
    pub(crate) removed: AtomicUsize,
}

impl MockPacketEngine {
    pub(crate) fn new(local_guid: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            local_guid: local_guid.to_owned(),
            log,
            listener: Mutex::new(None),
            streams: Mutex::new(vec![]),
            stream_added: Notify::new(),
            peer: Mutex::new(None),
            remote_ends: Mutex::new(vec![]),
            fail_add: AtomicBool::new(false),
            add_delay: Mutex::new(None),
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        })
    }

    /// Connects two engines so a connect on one is accepted by the other's transport.
    pub(crate) fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Some(Arc::downgrade(b));
        *lock(&b.peer) = Some(Arc::downgrade(a));
    }

    pub(crate) fn fail_add_stream(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    /// Makes `add_stream` take `delay` before it answers.
    pub(crate) fn delay_add_stream(&self, delay: Duration) {
        *lock(&self.add_delay) = Some(delay);
    }

    pub(crate) fn streams(&self) -> Vec<Arc<PacketStream>> {
        lock(&self.streams).clone()
    }

    fn stream_for(&self, peer_guid: &str) -> Option<Arc<PacketStream>> {
        lock(&self.streams)
            .iter()
            .find(|s| s.key().peer_guid() == peer_guid)
            .cloned()
    }

    fn listener(&self) -> Option<Arc<dyn PacketEngineListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    /// Remote halves of connects made without a linked peer.
    pub(crate) fn take_remote_end(&self) -> Option<DuplexStream> {
        lock(&self.remote_ends).pop()
    }

    /// Plays a peer's data-layer connect over the stream negotiated with `peer_guid`.
    /// Returns the peer's half of the channel if the transport accepted.
    pub(crate) fn inbound_connect(&self, peer_guid: &str) -> Option<DuplexStream> {
        let stream = self.stream_for(peer_guid)?;
        let listener = self.listener()?;
        let (ours, theirs) = tokio::io::duplex(CHANNEL_BUFFER);
        let dest = PacketDest {
            peer_guid: peer_guid.to_owned(),
            remote_addr: stream.selected_pair().remote.address,
        };
        if listener.should_accept(stream.id(), &dest, Box::new(ours)) {
            Some(theirs)
        } else {
            None
        }
    }

    pub(crate) fn simulate_disconnect(&self, stream: StreamId) {
        if let Some(listener) = self.listener() {
            let dest = PacketDest {
                peer_guid: String::new(),
                remote_addr: addr("0.0.0.0:0"),
            };
            listener.on_disconnect(stream, &dest);
        }
    }
}

#[async_trait]
impl PacketEngine for MockPacketEngine {
    fn set_listener(&self, listener: Weak<dyn PacketEngineListener>) {
        *lock(&self.listener) = Some(listener);
    }

    async fn add_stream(&self, stream: &Arc<PacketStream>) -> Result<()> {
        self.log.push("add_stream");
        let delay = *lock(&self.add_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(Error::Other("add_stream refused".to_owned()));
        }
        self.added.fetch_add(1, Ordering::SeqCst);
        lock(&self.streams).push(Arc::clone(stream));
        self.stream_added.notify_waiters();
        Ok(())
    }

    async fn remove_stream(&self, stream: &Arc<PacketStream>) {
        self.log.push("remove_stream");
        self.removed.fetch_add(1, Ordering::SeqCst);
        lock(&self.streams).retain(|s| s.id() != stream.id());
    }

    async fn connect(
        &self,
        stream: &Arc<PacketStream>,
        _dest: &PacketDest,
    ) -> Result<BoxedChannel> {
        self.log.push("connect");
        let peer = lock(&self.peer).as_ref().and_then(Weak::upgrade);
        let Some(peer) = peer else {
            let (ours, theirs) = tokio::io::duplex(CHANNEL_BUFFER);
            lock(&self.remote_ends).push(theirs);
            return Ok(Box::new(ours));
        };

        let remote_stream = loop {
            let added = peer.stream_added.notified();
            if let Some(remote_stream) = peer.stream_for(&self.local_guid) {
                break remote_stream;
            }
            added.await;
        };
        let listener = peer.listener().ok_or(Error::ErrChannelClosed)?;
        let (ours, theirs) = tokio::io::duplex(CHANNEL_BUFFER);
        let dest = PacketDest {
            peer_guid: self.local_guid.clone(),
            remote_addr: stream.selected_pair().local.address,
        };
        if listener.should_accept(remote_stream.id(), &dest, Box::new(theirs)) {
            Ok(Box::new(ours))
        } else {
            Err(Error::Other("connection refused".to_owned()))
        }
    }
}

/// Records what the transport reports.
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub(crate) started: Mutex<Vec<Arc<Endpoint>>>,
    pub(crate) data: Mutex<Vec<(EndpointId, Bytes)>>,
    pub(crate) lost: Mutex<Vec<ConnectSpec>>,
}

impl RecordingListener {
    pub(crate) fn started(&self) -> Vec<Arc<Endpoint>> {
        lock(&self.started).clone()
    }

    pub(crate) fn received(&self) -> Vec<u8> {
        lock(&self.data)
            .iter()
            .flat_map(|(_, d)| d.iter().copied())
            .collect()
    }

    pub(crate) fn lost(&self) -> Vec<ConnectSpec> {
        lock(&self.lost).clone()
    }
}

/// Forwards to a shared `RecordingListener` so tests keep a handle after registering.
pub(crate) struct SharedListener(pub(crate) Arc<RecordingListener>);

impl TransportListener for SharedListener {
    fn on_endpoint_started(&self, endpoint: &Arc<Endpoint>) {
        lock(&self.0.started).push(Arc::clone(endpoint));
    }

    fn on_data(&self, endpoint: EndpointId, _spec: &ConnectSpec, data: Bytes) {
        lock(&self.0.data).push((endpoint, data));
    }

    fn on_connection_lost(&self, spec: &ConnectSpec) {
        lock(&self.0.lost).push(spec.clone());
    }
}

/// Polls `cond` every 10ms of (possibly paused) time until it holds or 60s pass.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..6000 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A started stream over a host-to-host pair, for tests that bypass negotiation.
pub(crate) fn test_stream(key: &ConnectSpec) -> Arc<PacketStream> {
    let pair = CandidatePair::new(host("10.0.0.1:5000"), host("10.0.0.2:6000"), true);
    stream_over(key, pair).0
}

/// A started stream over `pair` and the counters of its socket.
pub(crate) fn stream_over(
    key: &ConnectSpec,
    pair: CandidatePair,
) -> (Arc<PacketStream>, Arc<SocketStats>) {
    let stats = Arc::new(SocketStats::default());
    let socket = MockSocket {
        local: pair.local.address,
        remote: pair.remote.address,
        stats: Arc::clone(&stats),
    };
    let stream = Arc::new(PacketStream::new(key.clone(), pair, Box::new(socket)));
    stream.start();
    (stream, stats)
}
