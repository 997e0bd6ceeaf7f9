
pub(crate) mod control;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ResolvedConfig, TransportConfig};
use crate::connect_spec::ConnectSpec;
use crate::endpoint::handshake::{Authenticator, PreambleAuthenticator};
use crate::endpoint::{Endpoint, EndpointHooks, EndpointId, EndpointSide};
use crate::ice_engine::IceEngine;
use crate::negotiator::{wait_for, SessionNegotiator};
use crate::packet_engine::{BoxedChannel, PacketDest, PacketEngine, PacketEngineListener};
use crate::pool::{PoolStats, StreamPool};
use crate::signaling::Signaling;
use crate::stream::StreamId;
use control::{ControlEvent, ControlLoop};
use shared::error::*;

/// Receives endpoint events from the transport. All methods have empty defaults.
pub trait TransportListener: Send + Sync {
    fn on_endpoint_started(&self, _endpoint: &Arc<Endpoint>) {}

    fn on_data(&self, _endpoint: EndpointId, _spec: &ConnectSpec, _data: Bytes) {}

    /// A started endpoint went away without a local disconnect request.
    fn on_connection_lost(&self, _spec: &ConnectSpec) {}
}

/// Counts published by the control loop after every pass.
#[derive(Debug, Default)]
pub(crate) struct AdmissionCounters {
    pub(crate) authenticating: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) negotiating: AtomicUsize,
    pub(crate) queued: AtomicUsize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub authenticating: usize,
    pub running: usize,
    pub negotiating: usize,
    pub queued: usize,
    pub pool: PoolStats,
}

pub(crate) struct TransportInner {
    pub(crate) config: Arc<ResolvedConfig>,
    pub(crate) pool: Arc<StreamPool>,
    pub(crate) negotiator: Arc<SessionNegotiator>,
    pub(crate) packet_engine: Arc<dyn PacketEngine>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) listener: Arc<ArcSwapOption<Box<dyn TransportListener>>>,
    pub(crate) events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) sudden_shutdown: Arc<AtomicBool>,
    started: AtomicBool,
    pub(crate) counters: Arc<AdmissionCounters>,
    control_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransportInner {
    pub(crate) fn hooks(&self) -> EndpointHooks {
        EndpointHooks {
            wake: Arc::clone(&self.wake),
            listener: Arc::clone(&self.listener),
        }
    }

    fn take_events_rx(&self) -> Option<mpsc::UnboundedReceiver<ControlEvent>> {
        match self.events_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl PacketEngineListener for TransportInner {
    fn should_accept(&self, stream: StreamId, dest: &PacketDest, channel: BoxedChannel) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let lease = match self.pool.acquire_by_stream(stream) {
            Ok(lease) => lease,
            Err(err) => {
                log::warn!("{stream}: refusing connect from {}: {err}", dest.peer_guid);
                return false;
            }
        };
        if lease.key().peer_guid() != dest.peer_guid {
            log::warn!(
                "{stream}: connect from {} over a stream negotiated with {}",
                dest.peer_guid,
                lease.key()
            );
            return false;
        }
        if !self.pool.complete_accept(lease.entry()) {
            log::debug!("{stream}: accepting without a pending accept");
        }

        let endpoint = Endpoint::new(
            EndpointSide::Passive,
            lease,
            stream,
            channel,
            Arc::clone(&self.authenticator),
            self.hooks(),
            self.shutdown.child_token(),
        );
        self.events_tx
            .send(ControlEvent::PassiveEndpoint(endpoint))
            .is_ok()
    }

    fn on_disconnect(&self, stream: StreamId, dest: &PacketDest) {
        log::debug!("{stream}: packet engine lost {}", dest.peer_guid);
        let _ = self.events_tx.send(ControlEvent::StreamDisconnected(stream));
    }
}

/// ICE transport of the bus daemon: negotiates peer-to-peer streams, pools them, and runs
/// the endpoints carried over them.
#[derive(Clone)]
pub struct IceTransport {
    inner: Arc<TransportInner>,
}

impl IceTransport {
    pub fn new(
        config: TransportConfig,
        signaling: Arc<dyn Signaling>,
        ice_engine: Arc<dyn IceEngine>,
        packet_engine: Arc<dyn PacketEngine>,
    ) -> Self {
        let authenticator = Arc::new(PreambleAuthenticator::new(config.local_guid.clone()));
        Self::with_authenticator(config, signaling, ice_engine, packet_engine, authenticator)
    }

    pub fn with_authenticator(
        config: TransportConfig,
        signaling: Arc<dyn Signaling>,
        ice_engine: Arc<dyn IceEngine>,
        packet_engine: Arc<dyn PacketEngine>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let config = Arc::new(config.init_with_defaults());
        let pool = Arc::new(StreamPool::new());
        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let negotiator = Arc::new(SessionNegotiator::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            signaling,
            ice_engine,
            Arc::clone(&packet_engine),
            Arc::clone(&wake),
            shutdown.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TransportInner {
            config,
            pool,
            negotiator,
            packet_engine,
            authenticator,
            listener: Arc::new(ArcSwapOption::empty()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            wake,
            shutdown,
            sudden_shutdown: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            counters: Arc::new(AdmissionCounters::default()),
            control_task: tokio::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener: Weak<dyn PacketEngineListener> = weak;
        inner.packet_engine.set_listener(listener);

        Self { inner }
    }

    /// Normalizes a connect spec to its canonical `ice:guid=<peer>` form.
    pub fn normalize_connect_spec(spec: &str) -> Result<String> {
        Ok(ConnectSpec::parse(spec)?.to_string())
    }

    pub fn set_listener(&self, listener: Box<dyn TransportListener>) {
        self.inner.listener.store(Some(Arc::new(listener)));
    }

    /// Spawns the control loop.
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ErrTransportStopping);
        }
        let events_rx = self.inner.take_events_rx().ok_or(Error::ErrAlreadyStarted)?;
        let control = ControlLoop::new(&self.inner, events_rx);
        *self.inner.control_task.lock().await = Some(tokio::spawn(control.run()));
        self.inner.started.store(true, Ordering::SeqCst);
        log::info!("ice transport {} started", self.inner.config.local_guid);
        Ok(())
    }

    /// Requests shutdown; endpoints are stopped without the sudden-disconnect flag.
    pub fn stop(&self) {
        self.shutdown(false);
    }

    /// Requests shutdown, flagging every running endpoint as suddenly disconnected when
    /// `sudden` is set.
    pub fn shutdown(&self, sudden: bool) {
        if sudden {
            self.inner.sudden_shutdown.store(true, Ordering::SeqCst);
        }
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
    }

    /// Waits until the control loop has stopped every endpoint and drained the pool.
    pub async fn join(&self) -> Result<()> {
        let task = self.inner.control_task.lock().await.take();
        if let Some(task) = task {
            task.await
                .map_err(|err| Error::Other(format!("control loop: {err}")))?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ErrTransportStopping);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::ErrTransportNotStarted);
        }
        Ok(())
    }

    /// Opens an authenticated, started endpoint to the peer named by `spec`.
    pub async fn connect(&self, spec: &str) -> Result<Arc<Endpoint>> {
        self.ensure_running()?;
        let key = ConnectSpec::parse(spec)?;
        let inner = &self.inner;
        let stop = inner.shutdown.child_token();

        let lease = inner.negotiator.connect(&key, &stop).await?;
        let stream = lease.stream().ok_or(Error::ErrStreamGone)?;
        let deadline = Instant::now() + inner.config.connect_timeout;
        let channel = wait_for(
            inner.packet_engine.connect(&stream, &stream.dest()),
            deadline,
            &stop,
        )
        .await?;

        let endpoint = Endpoint::new(
            EndpointSide::Active,
            lease,
            stream.id(),
            channel,
            Arc::clone(&inner.authenticator),
            inner.hooks(),
            stop.clone(),
        );
        if let Err(err) = wait_for(endpoint.authenticate(), deadline, &stop).await {
            // A handshake cut short by the deadline leaves auth in Authenticating.
            if endpoint.mark_failed().is_ok() {
                log::warn!("{}: handshake with {key} abandoned: {err}", endpoint.id());
            }
            endpoint.release_stream();
            return Err(err);
        }
        if let Err(err) = endpoint.start() {
            endpoint.release_stream();
            return Err(err);
        }

        if inner
            .events_tx
            .send(ControlEvent::AdoptEndpoint(Arc::clone(&endpoint)))
            .is_err()
        {
            endpoint.stop(false);
            let _ = endpoint.join().await;
            endpoint.release_stream();
            return Err(Error::ErrTransportStopping);
        }
        Ok(endpoint)
    }

    /// Stops every running endpoint to `spec` without the sudden-disconnect flag.
    pub async fn disconnect(&self, spec: &str) -> Result<()> {
        self.ensure_running()?;
        let key = ConnectSpec::parse(spec)?;
        let (reply, done) = oneshot::channel();
        self.inner
            .events_tx
            .send(ControlEvent::Disconnect { key, reply })
            .map_err(|_| Error::ErrTransportStopping)?;
        done.await.map_err(|_| Error::ErrTransportStopping)?
    }

    /// Queues an inbound session request from `peer_guid`; admission happens on the next
    /// control loop pass.
    pub fn queue_incoming_session_request(&self, peer_guid: &str) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ErrTransportStopping);
        }
        let key = ConnectSpec::for_peer(peer_guid);
        self.inner
            .events_tx
            .send(ControlEvent::IncomingSession(key))
            .map_err(|_| Error::ErrTransportStopping)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Drops queued requests from a peer the discovery service no longer knows and stops
    /// its authenticating endpoints.
    pub fn purge(&self, peer_guid: &str, names: &[String]) -> Result<()> {
        self.inner
            .events_tx
            .send(ControlEvent::Purge {
                peer_guid: peer_guid.to_owned(),
                names: names.to_vec(),
            })
            .map_err(|_| Error::ErrTransportStopping)
    }

    pub fn stats(&self) -> TransportStats {
        let counters = &self.inner.counters;
        TransportStats {
            authenticating: counters.authenticating.load(Ordering::SeqCst),
            running: counters.running.load(Ordering::SeqCst),
            negotiating: counters.negotiating.load(Ordering::SeqCst),
            queued: counters.queued.load(Ordering::SeqCst),
            pool: self.inner.pool.stats(),
        }
    }

    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.inner.pool
    }
}
