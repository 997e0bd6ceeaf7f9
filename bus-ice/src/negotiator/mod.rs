
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::alarm;
use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, IceCredentials};
use crate::config::ResolvedConfig;
use crate::connect_spec::ConnectSpec;
use crate::ice_engine::{IceEngine, IceSession, Role, SessionParams, SessionState};
use crate::packet_engine::PacketEngine;
use crate::pool::{EntryId, NegotiationId, Reservation, StreamLease, StreamPool};
use crate::signaling::{RelayCredentials, Signaling};
use crate::stream::PacketStream;
use shared::error::*;

/// Runs `fut` until it resolves, `deadline` passes, or `stop` fires, whichever is first.
pub(crate) async fn wait_for<T, F>(fut: F, deadline: Instant, stop: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(Error::ErrStopping),
        _ = tokio::time::sleep_until(deadline) => Err(Error::ErrTimeout),
        res = fut => res,
    }
}

async fn session_reaches(
    states: &mut watch::Receiver<SessionState>,
    target: SessionState,
) -> Result<()> {
    loop {
        let current = *states.borrow_and_update();
        if current == target {
            return Ok(());
        }
        if let Some(err) = current.failure() {
            return Err(err);
        }
        if states.changed().await.is_err() {
            return Err(target.failure().unwrap_or(Error::ErrChecksFailed));
        }
    }
}

/// Per-attempt record, dropped with the attempt.
#[derive(Debug)]
struct NegotiationState {
    id: NegotiationId,
    role: Role,
    deadline: Instant,
    local_candidates: Vec<Candidate>,
    local_credentials: IceCredentials,
    selected_pair: Option<CandidatePair>,
}

/// Drives one ICE negotiation per call and installs the resulting stream in the pool.
pub(crate) struct SessionNegotiator {
    config: Arc<ResolvedConfig>,
    pool: Arc<StreamPool>,
    signaling: Arc<dyn Signaling>,
    ice_engine: Arc<dyn IceEngine>,
    packet_engine: Arc<dyn PacketEngine>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl SessionNegotiator {
    pub(crate) fn new(
        config: Arc<ResolvedConfig>,
        pool: Arc<StreamPool>,
        signaling: Arc<dyn Signaling>,
        ice_engine: Arc<dyn IceEngine>,
        packet_engine: Arc<dyn PacketEngine>,
        wake: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            pool,
            signaling,
            ice_engine,
            packet_engine,
            wake,
            shutdown,
            next_id: AtomicU64::new(1),
        }
    }

    /// Outbound negotiation. Returns a lease on a Connected entry, either one this call
    /// negotiated or one another attempt for the same peer produced.
    pub(crate) async fn connect(
        &self,
        key: &ConnectSpec,
        stop: &CancellationToken,
    ) -> Result<StreamLease> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let id = NegotiationId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let lease = match self.pool.reserve_placeholder(key, id) {
            Reservation::Existing(mut lease) => {
                log::debug!("{key}: joining existing {}", lease.entry());
                wait_for(lease.wait_connected(), deadline, stop).await?;
                return Ok(lease);
            }
            Reservation::Reserved(lease) => lease,
        };

        let mut state = NegotiationState::new(id, Role::Initiator, deadline);
        match self.negotiate(key, lease.entry(), &mut state, stop).await {
            Ok(_) => Ok(lease),
            Err(err) => {
                self.fail(key, lease.entry(), &err).await;
                Err(err)
            }
        }
    }

    /// Inbound negotiation for an incoming session request. On success the stream is
    /// registered with the packet engine and waits, under the accept timeout, for the
    /// peer's data-layer connect.
    pub(crate) async fn accept(
        &self,
        key: &ConnectSpec,
        stop: &CancellationToken,
    ) -> Result<EntryId> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let id = NegotiationId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let lease = match self.pool.reserve_placeholder(key, id) {
            Reservation::Existing(lease) => {
                log::info!(
                    "{key}: dropping session request, {} already serves it",
                    lease.entry()
                );
                return Err(Error::ErrNegotiationInProgress);
            }
            Reservation::Reserved(lease) => lease,
        };

        let mut state = NegotiationState::new(id, Role::Responder, deadline);
        if let Err(err) = self.negotiate(key, lease.entry(), &mut state, stop).await {
            self.fail(key, lease.entry(), &err).await;
            return Err(err);
        }

        let entry = lease.into_pending_accept();
        let alarm = alarm::spawn_accept_timeout(
            Arc::clone(&self.pool),
            entry,
            self.config.accept_timeout,
            Arc::clone(&self.wake),
            self.shutdown.clone(),
        );
        self.pool.add_alarm(entry, alarm.abort_handle());
        Ok(entry)
    }

    async fn fail(&self, key: &ConnectSpec, entry: EntryId, err: &Error) {
        if err.is_cancellation() {
            log::info!("{key}: negotiation abandoned: {err}");
        } else {
            log::warn!("{key}: negotiation failed: {err}");
        }
        self.signaling.abandon(key.peer_guid()).await;
        self.pool.abandon(entry);
    }

    async fn negotiate(
        &self,
        key: &ConnectSpec,
        entry: EntryId,
        state: &mut NegotiationState,
        stop: &CancellationToken,
    ) -> Result<Arc<PacketStream>> {
        let peer = key.peer_guid();
        let relay = self.relay_credentials(peer, state.deadline, stop).await?;

        let params = SessionParams {
            role: state.role,
            peer_guid: peer.to_owned(),
            relay,
        };
        let mut session = wait_for(
            self.ice_engine.allocate_session(params),
            state.deadline,
            stop,
        )
        .await?;
        log::debug!("{key}: allocated ICE session as {}", state.role);

        let result = self.run_session(key, session.as_mut(), state, stop).await;

        // The session must be gone before the packet engine starts reading the socket.
        self.ice_engine.deallocate_session(session).await;
        let stream = result?;

        self.install(key, entry, stream, state, stop).await
    }

    async fn relay_credentials(
        &self,
        peer: &str,
        deadline: Instant,
        stop: &CancellationToken,
    ) -> Result<RelayCredentials> {
        let credentials = wait_for(self.signaling.get_relay_credentials(peer), deadline, stop)
            .await
            .map_err(|err| match err {
                Error::ErrNotFound => Error::ErrNoStunInfo,
                err => err,
            })?;
        if !credentials.is_expired(Instant::now()) {
            return Ok(credentials);
        }

        log::debug!("{peer}: relay credentials expired, refreshing");
        let refreshed = wait_for(
            self.signaling.refresh_relay_credentials(peer),
            deadline,
            stop,
        )
        .await?;
        if refreshed.is_expired(Instant::now()) {
            return Err(Error::ErrCredentialsExpired);
        }
        Ok(refreshed)
    }

    async fn run_session(
        &self,
        key: &ConnectSpec,
        session: &mut dyn IceSession,
        state: &mut NegotiationState,
        stop: &CancellationToken,
    ) -> Result<Arc<PacketStream>> {
        let peer = key.peer_guid();
        let mut states = session.subscribe();

        wait_for(session.gather_candidates(), state.deadline, stop).await?;
        wait_for(
            session_reaches(&mut states, SessionState::CandidatesGathered),
            state.deadline,
            stop,
        )
        .await?;

        let (candidates, credentials) = session.local_candidates();
        if candidates.is_empty() {
            return Err(Error::ErrNoCandidates);
        }
        log::debug!("{key}: gathered {} local candidates", candidates.len());
        state.local_candidates = candidates;
        state.local_credentials = credentials;

        wait_for(
            self.signaling
                .send_candidates(peer, &state.local_candidates, &state.local_credentials),
            state.deadline,
            stop,
        )
        .await?;

        let remote = wait_for(self.signaling.recv_peer_candidates(peer), state.deadline, stop)
            .await?;
        if remote.candidates.is_empty() {
            return Err(Error::ErrNoCandidates);
        }
        log::debug!("{key}: received {} peer candidates", remote.candidates.len());

        wait_for(session.start_checks(&remote), state.deadline, stop).await?;
        wait_for(
            session_reaches(&mut states, SessionState::ChecksSucceeded),
            state.deadline,
            stop,
        )
        .await?;

        let pair = session
            .selected_pairs()
            .into_iter()
            .max_by_key(|p| p.priority())
            .ok_or(Error::ErrNoSelectedPair)?;
        log::info!("{key}: selected pair {pair}");
        state.selected_pair = Some(pair.clone());

        let settle = self.config.settle_delay;
        wait_for(
            async {
                tokio::time::sleep(settle).await;
                Ok(())
            },
            state.deadline,
            stop,
        )
        .await?;

        session.disable_listener(&pair);
        let socket = session.take_socket(&pair)?;
        let stream = Arc::new(PacketStream::new(key.clone(), pair, socket));
        stream.start();
        Ok(stream)
    }

    async fn install(
        &self,
        key: &ConnectSpec,
        entry: EntryId,
        stream: Arc<PacketStream>,
        state: &NegotiationState,
        stop: &CancellationToken,
    ) -> Result<Arc<PacketStream>> {
        // A responder parks its entry before registering, so an accept arriving as soon
        // as the packet engine reads the stream finds it. An initiator entry turns
        // Connected on install and must not do so before the stream is registered.
        let responder = state.role == Role::Responder;
        if responder {
            if let Err(err) = self.pool.install(entry, Arc::clone(&stream), true) {
                stream.stop();
                return Err(err);
            }
        }

        if let Err(err) = wait_for(
            self.packet_engine.add_stream(&stream),
            state.deadline,
            stop,
        )
        .await
        {
            stream.stop();
            return Err(err);
        }

        if !responder {
            if let Err(err) = self.pool.install(entry, Arc::clone(&stream), false) {
                self.packet_engine.remove_stream(&stream).await;
                stream.stop();
                return Err(err);
            }
        }
        self.pool.set_registered(entry);

        if let Some(alarm) = alarm::spawn_keepalive(
            Arc::clone(&stream),
            &self.config.keepalive,
            Arc::clone(&self.signaling),
            self.shutdown.clone(),
        ) {
            self.pool.add_alarm(entry, alarm.abort_handle());
        }

        if let Some(pair) = &state.selected_pair {
            log::info!(
                "{key}: {} installed as {entry} for negotiation {} over {} pair",
                stream.id(),
                state.id.0,
                pair.class()
            );
        }
        Ok(stream)
    }
}

impl NegotiationState {
    fn new(id: NegotiationId, role: Role, deadline: Instant) -> Self {
        Self {
            id,
            role,
            deadline,
            local_candidates: vec![],
            local_credentials: IceCredentials::default(),
            selected_pair: None,
        }
    }
}
