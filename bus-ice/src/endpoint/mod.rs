
pub mod handshake;
pub mod state;

use arc_swap::ArcSwapOption;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connect_spec::ConnectSpec;
use crate::packet_engine::BoxedChannel;
use crate::pool::StreamLease;
use crate::stream::StreamId;
use crate::transport::TransportListener;
use handshake::Authenticator;
use shared::error::*;
pub use state::{AuthState, EndpointState};

const RECEIVE_BUFFER_SIZE: usize = 8192;
const OUTBOUND_QUEUE_SIZE: usize = 64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Set inside the tasks an endpoint spawns, so it can refuse to join itself.
    static ENDPOINT_TASK: EndpointId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Which side opened the data-layer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointSide {
    /// Created by a local connect; authenticates inline.
    Active,
    /// Created when the packet engine accepted a peer's connect; authenticates on a task.
    Passive,
}

impl fmt::Display for EndpointSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            EndpointSide::Active => "active",
            EndpointSide::Passive => "passive",
        };
        write!(f, "{s}")
    }
}

/// Transport resources an endpoint reports to.
#[derive(Clone)]
pub(crate) struct EndpointHooks {
    pub(crate) wake: Arc<Notify>,
    pub(crate) listener: Arc<ArcSwapOption<Box<dyn TransportListener>>>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    auth: AuthState,
    state: EndpointState,
    auth_started: Option<Instant>,
    stop_requested: bool,
    sudden_disconnect: bool,
    remote_guid: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One authenticated bus connection to a peer, carried over a pooled stream.
pub struct Endpoint {
    id: EndpointId,
    side: EndpointSide,
    spec: ConnectSpec,
    stream: StreamId,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    lease: Mutex<Option<StreamLease>>,
    channel: Mutex<Option<BoxedChannel>>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    auth_task: Mutex<Option<JoinHandle<()>>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
    authenticator: Arc<dyn Authenticator>,
    hooks: EndpointHooks,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = lock(&self.lifecycle);
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("spec", &self.spec)
            .field("stream", &self.stream)
            .field("lifecycle", &*lifecycle)
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(
        side: EndpointSide,
        lease: StreamLease,
        stream: StreamId,
        channel: BoxedChannel,
        authenticator: Arc<dyn Authenticator>,
        hooks: EndpointHooks,
        stop: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::SeqCst)),
            side,
            spec: lease.key().clone(),
            stream,
            created_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle::default()),
            lease: Mutex::new(Some(lease)),
            channel: Mutex::new(Some(channel)),
            outbound: Mutex::new(None),
            auth_task: Mutex::new(None),
            io_tasks: Mutex::new(vec![]),
            stop,
            authenticator,
            hooks,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn side(&self) -> EndpointSide {
        self.side
    }

    pub fn spec(&self) -> &ConnectSpec {
        &self.spec
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn auth_state(&self) -> AuthState {
        lock(&self.lifecycle).auth
    }

    pub fn endpoint_state(&self) -> EndpointState {
        lock(&self.lifecycle).state
    }

    pub fn auth_started(&self) -> Option<Instant> {
        lock(&self.lifecycle).auth_started
    }

    pub fn remote_guid(&self) -> Option<String> {
        lock(&self.lifecycle).remote_guid.clone()
    }

    pub fn sudden_disconnect(&self) -> bool {
        lock(&self.lifecycle).sudden_disconnect
    }

    /// Starts authentication. A passive endpoint runs it on its own task and returns at
    /// once; an active endpoint runs it inline and returns its outcome.
    pub async fn authenticate(self: &Arc<Self>) -> Result<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.auth.transition(AuthState::Authenticating)?;
            lifecycle.auth_started = Some(Instant::now());
        }

        let Some(channel) = lock(&self.channel).take() else {
            self.mark_failed()?;
            return Err(Error::ErrHandshakeFailed);
        };

        match self.side {
            EndpointSide::Passive => {
                let endpoint = Arc::clone(self);
                let task = tokio::spawn(ENDPOINT_TASK.scope(self.id, async move {
                    let _ = endpoint.run_handshake(channel).await;
                }));
                *lock(&self.auth_task) = Some(task);
                Ok(())
            }
            EndpointSide::Active => self.run_handshake(channel).await,
        }
    }

    async fn run_handshake(&self, mut channel: BoxedChannel) -> Result<()> {
        let result = tokio::select! {
            _ = self.stop.cancelled() => Err(Error::ErrStopping),
            res = self.authenticator.authenticate(&mut channel, self.side, &self.spec) => res,
        };

        let outcome = match result {
            Ok(remote_guid) => {
                log::debug!("{}: authenticated {remote_guid}", self.id);
                *lock(&self.channel) = Some(channel);
                lock(&self.lifecycle).remote_guid = Some(remote_guid);
                self.mark_succeeded()
            }
            Err(err) => {
                log::warn!("{}: {} handshake with {} failed: {err}", self.id, self.side, self.spec);
                self.mark_failed().and(Err(err))
            }
        };
        self.hooks.wake.notify_one();
        outcome
    }

    /// Reports a successful handshake. Nothing on the handshake path touches the
    /// endpoint after this.
    pub fn mark_succeeded(&self) -> Result<()> {
        lock(&self.lifecycle).auth.transition(AuthState::Succeeded)
    }

    pub fn mark_failed(&self) -> Result<()> {
        lock(&self.lifecycle).auth.transition(AuthState::Failed)
    }

    /// Spawns the send and receive tasks. Only valid once authentication succeeded.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let lifecycle = lock(&self.lifecycle);
            if lifecycle.auth != AuthState::Succeeded {
                return Err(Error::ErrIllegalTransition(format!(
                    "start with auth {}",
                    lifecycle.auth
                )));
            }
            if !lifecycle.state.can_transition_to(EndpointState::Started) {
                return Err(Error::ErrIllegalTransition(format!(
                    "endpoint {} -> {}",
                    lifecycle.state,
                    EndpointState::Started
                )));
            }
        }

        let channel = if self.stop.is_cancelled() {
            None
        } else {
            lock(&self.channel).take()
        };
        let Some(channel) = channel else {
            lock(&self.lifecycle).state.transition(EndpointState::Failed)?;
            return Err(Error::ErrTaskStartFailed);
        };

        let (reader, writer) = tokio::io::split(channel);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        *lock(&self.outbound) = Some(tx);
        lock(&self.lifecycle).state.transition(EndpointState::Started)?;

        let receiver = tokio::spawn(
            ENDPOINT_TASK.scope(self.id, Arc::clone(self).receive_loop(reader)),
        );
        let sender = tokio::spawn(
            ENDPOINT_TASK.scope(self.id, Arc::clone(self).send_loop(writer, rx)),
        );
        lock(&self.io_tasks).extend([receiver, sender]);

        log::info!("{}: started {} endpoint to {}", self.id, self.side, self.spec);
        if let Some(listener) = &*self.hooks.listener.load() {
            listener.on_endpoint_started(self);
        }
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedChannel>) {
        let mut buf = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);
        let sudden = loop {
            buf.reserve(RECEIVE_BUFFER_SIZE);
            tokio::select! {
                _ = self.stop.cancelled() => break false,
                res = reader.read_buf(&mut buf) => match res {
                    Ok(0) => {
                        log::debug!("{}: peer closed the channel", self.id);
                        break true;
                    }
                    Ok(_) => {
                        let data = buf.split().freeze();
                        if let Some(listener) = &*self.hooks.listener.load() {
                            listener.on_data(self.id, &self.spec, data);
                        }
                    }
                    Err(err) => {
                        log::warn!("{}: receive failed: {err}", self.id);
                        break true;
                    }
                }
            }
        };
        self.task_exit(sudden);
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: WriteHalf<BoxedChannel>,
        mut outbound: mpsc::Receiver<Bytes>,
    ) {
        let sudden = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break false,
                msg = outbound.recv() => match msg {
                    Some(data) => {
                        let res = async {
                            writer.write_all(&data).await?;
                            writer.flush().await
                        }
                        .await;
                        if let Err(err) = res {
                            log::warn!("{}: send failed: {err}", self.id);
                            break true;
                        }
                    }
                    None => break false,
                }
            }
        };
        let _ = writer.shutdown().await;
        self.task_exit(sudden);
    }

    /// Called by the send and receive tasks as they finish.
    fn task_exit(&self, sudden: bool) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == EndpointState::Started {
                lifecycle.state = EndpointState::Stopping;
            }
            if sudden && !lifecycle.stop_requested {
                lifecycle.sudden_disconnect = true;
            }
        }
        self.stop.cancel();
        self.hooks.wake.notify_one();
    }

    /// Queues `data` for the send task.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        let tx = lock(&self.outbound).clone().ok_or(Error::ErrChannelClosed)?;
        tx.send(data).await.map_err(|_| Error::ErrChannelClosed)
    }

    /// Asks the endpoint to stop. Returns false if a stop was already requested.
    pub fn stop(&self, sudden: bool) -> bool {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.stop_requested {
                return false;
            }
            lifecycle.stop_requested = true;
            if sudden {
                lifecycle.sudden_disconnect = true;
            }
        }
        log::debug!("{}: stop requested (sudden: {sudden})", self.id);
        self.stop.cancel();
        true
    }

    pub fn is_stop_requested(&self) -> bool {
        lock(&self.lifecycle).stop_requested
    }

    fn guard_self_join(&self) -> Result<()> {
        let own_task = ENDPOINT_TASK.try_with(|id| *id == self.id).unwrap_or(false);
        if own_task {
            return Err(Error::ErrSelfJoin);
        }
        Ok(())
    }

    /// Waits for the send and receive tasks. A Stopping endpoint becomes Done.
    pub async fn join(&self) -> Result<()> {
        self.guard_self_join()?;
        let tasks = std::mem::take(&mut *lock(&self.io_tasks));
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    log::error!("{}: endpoint task panicked", self.id);
                }
            }
        }
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == EndpointState::Stopping {
            lifecycle.state.transition(EndpointState::Done)?;
        }
        Ok(())
    }

    /// Waits for the handshake task, then moves a settled authentication to Done.
    pub async fn auth_join(&self) -> Result<()> {
        self.guard_self_join()?;
        let task = lock(&self.auth_task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    log::error!("{}: handshake task panicked", self.id);
                }
            }
        }
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.auth {
            AuthState::Succeeded | AuthState::Failed => lifecycle.auth.transition(AuthState::Done),
            _ => Ok(()),
        }
    }

    /// True once nothing of the endpoint runs: it never started and its authentication
    /// is settled, or it started and was joined.
    pub fn is_terminal(&self) -> bool {
        let lifecycle = lock(&self.lifecycle);
        let auth_joined = lock(&self.auth_task).is_none();
        match lifecycle.state {
            EndpointState::Done | EndpointState::Failed => true,
            EndpointState::Initialized => {
                auth_joined && matches!(lifecycle.auth, AuthState::Failed | AuthState::Done)
            }
            EndpointState::Started | EndpointState::Stopping => false,
        }
    }

    /// Drops the endpoint's reference on its pooled stream.
    pub(crate) fn release_stream(&self) {
        if let Some(lease) = lock(&self.lease).take() {
            lease.release();
        }
    }
}
