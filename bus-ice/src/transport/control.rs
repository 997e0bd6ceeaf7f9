
use arc_swap::ArcSwapOption;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{AdmissionCounters, TransportInner, TransportListener};
use crate::config::ResolvedConfig;
use crate::connect_spec::ConnectSpec;
use crate::endpoint::{AuthState, Endpoint, EndpointState};
use crate::negotiator::SessionNegotiator;
use crate::packet_engine::PacketEngine;
use crate::pool::{EntryId, StreamPool, SweepReport};
use crate::stream::StreamId;
use shared::error::*;

/// Work handed to the control loop by the public API, the packet engine and the
/// discovery service.
pub(crate) enum ControlEvent {
    IncomingSession(ConnectSpec),
    Purge {
        peer_guid: String,
        names: Vec<String>,
    },
    /// Accepted by the packet engine; still has to authenticate.
    PassiveEndpoint(Arc<Endpoint>),
    /// Authenticated and started by a local connect.
    AdoptEndpoint(Arc<Endpoint>),
    StreamDisconnected(StreamId),
    Disconnect {
        key: ConnectSpec,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Admission rule for inbound session requests.
pub(crate) fn admission_allows(
    config: &ResolvedConfig,
    authenticating: usize,
    negotiating: usize,
    running: usize,
) -> bool {
    let incomplete = authenticating + negotiating;
    incomplete < config.max_incomplete_connections
        && incomplete + running < config.max_completed_connections
}

type NegotiationOutcome = (ConnectSpec, Result<EntryId>);

/// Single task owning the endpoint lists and the inbound request queue. It wakes on
/// events, explicit wake-ups and the periodic alarm, and on every wake-up admits
/// requests, reaps endpoints and sweeps the pool.
pub(crate) struct ControlLoop {
    config: Arc<ResolvedConfig>,
    pool: Arc<StreamPool>,
    negotiator: Arc<SessionNegotiator>,
    packet_engine: Arc<dyn PacketEngine>,
    listener: Arc<ArcSwapOption<Box<dyn TransportListener>>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    sudden_shutdown: Arc<AtomicBool>,
    counters: Arc<AdmissionCounters>,
    events: mpsc::UnboundedReceiver<ControlEvent>,

    pending: VecDeque<ConnectSpec>,
    authenticating: Vec<Arc<Endpoint>>,
    running: Vec<Arc<Endpoint>>,
    negotiations: JoinSet<NegotiationOutcome>,
}

impl ControlLoop {
    pub(crate) fn new(
        inner: &Arc<TransportInner>,
        events: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Self {
        Self {
            config: Arc::clone(&inner.config),
            pool: Arc::clone(&inner.pool),
            negotiator: Arc::clone(&inner.negotiator),
            packet_engine: Arc::clone(&inner.packet_engine),
            listener: Arc::clone(&inner.listener),
            wake: Arc::clone(&inner.wake),
            shutdown: inner.shutdown.clone(),
            sudden_shutdown: Arc::clone(&inner.sudden_shutdown),
            counters: Arc::clone(&inner.counters),
            events,
            pending: VecDeque::new(),
            authenticating: vec![],
            running: vec![],
            negotiations: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut alarm = tokio::time::interval(self.config.schedule_interval);
        alarm.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        log::debug!("transport dropped; control loop exiting");
                        break;
                    }
                },
                Some(joined) = self.negotiations.join_next() => self.negotiation_finished(joined),
                _ = self.wake.notified() => {}
                _ = alarm.tick() => {}
            }

            while let Ok(event) = self.events.try_recv() {
                self.handle_event(event).await;
            }
            self.run_once().await;
        }

        self.shutdown_all().await;
    }

    pub(crate) async fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::IncomingSession(key) => {
                if !self.pending.contains(&key) {
                    self.pending.push_back(key);
                }
            }
            ControlEvent::Purge { peer_guid, names } => {
                let before = self.pending.len();
                self.pending.retain(|key| key.peer_guid() != peer_guid);
                let mut stopped = 0;
                for endpoint in &self.authenticating {
                    if endpoint.spec().peer_guid() == peer_guid && endpoint.stop(false) {
                        stopped += 1;
                    }
                }
                log::info!(
                    "purged {peer_guid} ({} names): dropped {} requests, stopped {stopped} endpoints",
                    names.len(),
                    before - self.pending.len()
                );
            }
            ControlEvent::PassiveEndpoint(endpoint) => {
                if let Err(err) = endpoint.authenticate().await {
                    log::warn!("{}: cannot authenticate: {err}", endpoint.id());
                    let _ = endpoint.mark_failed();
                }
                self.authenticating.push(endpoint);
            }
            ControlEvent::AdoptEndpoint(endpoint) => self.running.push(endpoint),
            ControlEvent::StreamDisconnected(stream) => {
                for endpoint in self.authenticating.iter().chain(self.running.iter()) {
                    if endpoint.stream_id() == stream {
                        endpoint.stop(true);
                    }
                }
            }
            ControlEvent::Disconnect { key, reply } => {
                let mut found = false;
                for endpoint in &self.running {
                    if endpoint.spec() == &key {
                        found = true;
                        endpoint.stop(false);
                    }
                }
                let _ = reply.send(if found { Ok(()) } else { Err(Error::ErrNotFound) });
            }
        }
    }

    fn negotiation_finished(&self, joined: std::result::Result<NegotiationOutcome, JoinError>) {
        match joined {
            Ok((key, Ok(entry))) => log::debug!("{key}: inbound negotiation completed as {entry}"),
            Ok((key, Err(err))) => log::debug!("{key}: inbound negotiation ended: {err}"),
            Err(err) => log::error!("inbound negotiation task failed: {err}"),
        }
    }

    pub(crate) async fn run_once(&mut self) {
        self.admit_pending();

        let mut retired = vec![];
        self.sweep_authenticating(&mut retired).await;
        self.sweep_running(&mut retired).await;
        for endpoint in retired {
            self.retire(endpoint);
        }

        let report = self
            .pool
            .sweep(
                Instant::now(),
                self.config.stream_grace,
                self.packet_engine.as_ref(),
            )
            .await;
        if report != SweepReport::default() {
            log::debug!(
                "pool sweep: {} torn down, {} removed",
                report.torn_down,
                report.removed
            );
        }

        self.publish_counters();
    }

    /// Inbound attempts not yet represented by an endpoint: running negotiations and
    /// negotiated streams waiting for the peer's data-layer connect.
    fn in_flight(&self) -> usize {
        self.negotiations.len() + self.pool.pending_accepts()
    }

    fn admit_pending(&mut self) {
        while let Some(key) = self.pending.pop_front() {
            let in_flight = self.in_flight();
            if !admission_allows(
                &self.config,
                self.authenticating.len(),
                in_flight,
                self.running.len(),
            ) {
                log::warn!(
                    "{key}: {} ({} authenticating, {in_flight} in flight, {} running)",
                    Error::ErrAdmissionRejected,
                    self.authenticating.len(),
                    self.running.len()
                );
                continue;
            }

            let negotiator = Arc::clone(&self.negotiator);
            let stop = self.shutdown.child_token();
            self.negotiations.spawn(async move {
                let res = negotiator.accept(&key, &stop).await;
                (key, res)
            });
        }
    }

    async fn sweep_authenticating(&mut self, retired: &mut Vec<Arc<Endpoint>>) {
        let now = Instant::now();
        let mut remaining = Vec::with_capacity(self.authenticating.len());

        for endpoint in std::mem::take(&mut self.authenticating) {
            match endpoint.auth_state() {
                AuthState::Failed => {
                    if let Err(err) = endpoint.auth_join().await {
                        log::error!("{}: auth join failed: {err}", endpoint.id());
                    }
                    retired.push(endpoint);
                }
                AuthState::Succeeded => {
                    if let Err(err) = endpoint.start() {
                        log::warn!("{}: cannot start: {err}", endpoint.id());
                    }
                    self.running.push(endpoint);
                }
                AuthState::Initialized | AuthState::Authenticating => {
                    let since = endpoint.auth_started().unwrap_or_else(|| endpoint.created_at());
                    if now.saturating_duration_since(since) >= self.config.auth_timeout
                        && endpoint.stop(false)
                    {
                        log::warn!(
                            "{}: authentication with {} timed out",
                            endpoint.id(),
                            endpoint.spec()
                        );
                    }
                    remaining.push(endpoint);
                }
                AuthState::Done => retired.push(endpoint),
            }
        }
        self.authenticating = remaining;
    }

    async fn sweep_running(&mut self, retired: &mut Vec<Arc<Endpoint>>) {
        let mut remaining = Vec::with_capacity(self.running.len());

        for endpoint in std::mem::take(&mut self.running) {
            if endpoint.auth_state() == AuthState::Succeeded {
                if let Err(err) = endpoint.auth_join().await {
                    log::error!("{}: auth join failed: {err}", endpoint.id());
                }
            }
            match endpoint.endpoint_state() {
                EndpointState::Failed | EndpointState::Done => retired.push(endpoint),
                EndpointState::Stopping => {
                    if let Err(err) = endpoint.join().await {
                        log::error!("{}: join failed: {err}", endpoint.id());
                    }
                    retired.push(endpoint);
                }
                EndpointState::Initialized | EndpointState::Started => remaining.push(endpoint),
            }
        }
        self.running = remaining;
    }

    fn retire(&self, endpoint: Arc<Endpoint>) {
        if endpoint.endpoint_state() == EndpointState::Done && endpoint.sudden_disconnect() {
            log::info!("{}: lost connection to {}", endpoint.id(), endpoint.spec());
            if let Some(listener) = &*self.listener.load() {
                listener.on_connection_lost(endpoint.spec());
            }
        }
        endpoint.release_stream();
        log::debug!("{}: retired", endpoint.id());
    }

    fn publish_counters(&self) {
        let counters = &self.counters;
        counters
            .authenticating
            .store(self.authenticating.len(), Ordering::SeqCst);
        counters.running.store(self.running.len(), Ordering::SeqCst);
        counters.negotiating.store(self.in_flight(), Ordering::SeqCst);
        counters.queued.store(self.pending.len(), Ordering::SeqCst);
    }

    async fn shutdown_all(mut self) {
        self.shutdown.cancel();
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            match event {
                ControlEvent::PassiveEndpoint(endpoint) => self.authenticating.push(endpoint),
                ControlEvent::AdoptEndpoint(endpoint) => self.running.push(endpoint),
                ControlEvent::Disconnect { reply, .. } => {
                    let _ = reply.send(Err(Error::ErrTransportStopping));
                }
                _ => {}
            }
        }
        self.pending.clear();

        let sudden = self.sudden_shutdown.load(Ordering::SeqCst);
        for endpoint in &self.authenticating {
            endpoint.stop(false);
        }
        for endpoint in &self.running {
            endpoint.stop(sudden);
        }

        while let Some(joined) = self.negotiations.join_next().await {
            self.negotiation_finished(joined);
        }

        let mut retired = vec![];
        let mut errs = vec![];
        for endpoint in std::mem::take(&mut self.authenticating)
            .into_iter()
            .chain(std::mem::take(&mut self.running))
        {
            if let Err(err) = endpoint.auth_join().await {
                errs.push(err);
            }
            if let Err(err) = endpoint.join().await {
                errs.push(err);
            }
            retired.push(endpoint);
        }
        if let Err(err) = flatten_errs(errs) {
            log::error!("joining endpoints at shutdown: {err}");
        }
        for endpoint in retired {
            self.retire(endpoint);
        }

        self.pool.drain(self.packet_engine.as_ref()).await;
        self.publish_counters();
        log::info!("ice transport control loop stopped");
    }
}
