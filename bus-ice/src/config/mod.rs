
use std::time::Duration;

use crate::candidate::candidate_pair::PairClass;

/// How long an accepted endpoint may stay in the authenticating state.
pub(crate) const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Ceiling on authenticating endpoints plus in-flight inbound negotiations.
pub(crate) const DEFAULT_MAX_INCOMPLETE_CONNECTIONS: usize = 10;

/// Ceiling on all inbound work: authenticating, negotiating and running.
pub(crate) const DEFAULT_MAX_COMPLETED_CONNECTIONS: usize = 50;

/// Period of the reaper alarm.
pub(crate) const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline shared by every wait of one negotiation attempt.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cool-down between a stream reaching zero references and its teardown.
pub(crate) const DEFAULT_STREAM_GRACE: Duration = Duration::from_secs(10);

/// How long a responder waits for the data-layer connect after ICE completes.
pub(crate) const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after checks succeed before the socket is handed over.
pub(crate) const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

pub(crate) const DEFAULT_REFLEXIVE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_RELAY_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// TURN allocations default to a 10 minute lifetime; refresh well ahead of it.
pub(crate) const DEFAULT_RELAY_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// Per pair-class NAT keepalive and relay refresh intervals. `None` disables the alarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub host_pair: Option<Duration>,
    pub reflexive_pair: Option<Duration>,
    pub relayed_pair: Option<Duration>,
    pub relay_refresh: Option<Duration>,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            host_pair: None,
            reflexive_pair: Some(DEFAULT_REFLEXIVE_KEEPALIVE_INTERVAL),
            relayed_pair: Some(DEFAULT_RELAY_KEEPALIVE_INTERVAL),
            relay_refresh: Some(DEFAULT_RELAY_REFRESH_INTERVAL),
        }
    }
}

impl KeepalivePolicy {
    pub fn keepalive_interval(&self, class: PairClass) -> Option<Duration> {
        match class {
            PairClass::HostToHost => self.host_pair,
            PairClass::Reflexive => self.reflexive_pair,
            PairClass::Relayed => self.relayed_pair,
        }
        .filter(|d| !d.is_zero())
    }

    pub fn relay_refresh_interval(&self, class: PairClass) -> Option<Duration> {
        if class == PairClass::Relayed {
            self.relay_refresh.filter(|d| !d.is_zero())
        } else {
            None
        }
    }
}

/// Collects the arguments to `IceTransport` construction into a single structure, for
/// future-proofness of the interface. Unset fields fall back to the `DEFAULT_*` values.
#[derive(Debug, Default, Clone)]
pub struct TransportConfig {
    /// Guid this daemon presents during the endpoint handshake.
    pub local_guid: String,

    /// Time an endpoint may spend authenticating before it is asked to stop.
    pub auth_timeout: Option<Duration>,

    /// Maximum of authenticating endpoints plus in-flight inbound negotiations.
    pub max_incomplete_connections: Option<usize>,

    /// Maximum of authenticating, negotiating and running endpoints together.
    pub max_completed_connections: Option<usize>,

    /// Period of the maintenance alarm driving the reaper.
    pub schedule_interval: Option<Duration>,

    /// Fixed deadline applied to every negotiation attempt.
    pub connect_timeout: Option<Duration>,

    /// Grace interval an unreferenced stream stays disconnecting before teardown.
    pub stream_grace: Option<Duration>,

    /// Responder-side wait for the packet engine accept after ICE completes.
    pub accept_timeout: Option<Duration>,

    /// Pause between checks succeeding and socket hand-over.
    pub settle_delay: Option<Duration>,

    pub keepalive: KeepalivePolicy,
}

impl TransportConfig {
    /// Resolves unset fields to their defaults.
    pub(crate) fn init_with_defaults(&self) -> ResolvedConfig {
        ResolvedConfig {
            local_guid: self.local_guid.clone(),
            auth_timeout: self.auth_timeout.unwrap_or(DEFAULT_AUTH_TIMEOUT),
            max_incomplete_connections: self
                .max_incomplete_connections
                .unwrap_or(DEFAULT_MAX_INCOMPLETE_CONNECTIONS),
            max_completed_connections: self
                .max_completed_connections
                .unwrap_or(DEFAULT_MAX_COMPLETED_CONNECTIONS),
            schedule_interval: match self.schedule_interval {
                Some(d) if !d.is_zero() => d,
                _ => DEFAULT_SCHEDULE_INTERVAL,
            },
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            stream_grace: self.stream_grace.unwrap_or(DEFAULT_STREAM_GRACE),
            accept_timeout: self.accept_timeout.unwrap_or(DEFAULT_ACCEPT_TIMEOUT),
            settle_delay: self.settle_delay.unwrap_or(DEFAULT_SETTLE_DELAY),
            keepalive: self.keepalive.clone(),
        }
    }
}

/// `TransportConfig` with every default applied. Fields won't change after construction.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) local_guid: String,
    pub(crate) auth_timeout: Duration,
    pub(crate) max_incomplete_connections: usize,
    pub(crate) max_completed_connections: usize,
    pub(crate) schedule_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) stream_grace: Duration,
    pub(crate) accept_timeout: Duration,
    pub(crate) settle_delay: Duration,
    pub(crate) keepalive: KeepalivePolicy,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        TransportConfig::default().init_with_defaults()
    }
}

#[derive(Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_guid(mut self, guid: impl Into<String>) -> Self {
        self.config.local_guid = guid.into();
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = Some(timeout);
        self
    }

    /// with_connection_limits sets the incomplete and completed admission ceilings.
    pub fn with_connection_limits(mut self, max_incomplete: usize, max_completed: usize) -> Self {
        self.config.max_incomplete_connections = Some(max_incomplete);
        self.config.max_completed_connections = Some(max_completed);
        self
    }

    pub fn with_schedule_interval(mut self, interval: Duration) -> Self {
        self.config.schedule_interval = Some(interval);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn with_stream_grace(mut self, grace: Duration) -> Self {
        self.config.stream_grace = Some(grace);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = Some(timeout);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = Some(delay);
        self
    }

    pub fn with_keepalive_policy(mut self, keepalive: KeepalivePolicy) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    pub fn build(self) -> TransportConfig {
        self.config
    }
}
