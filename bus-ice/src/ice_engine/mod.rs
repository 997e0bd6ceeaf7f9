use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::watch;

use crate::candidate::candidate_pair::CandidatePair;
use crate::candidate::{Candidate, IceCredentials, PeerCandidates};
use crate::signaling::RelayCredentials;
use shared::error::{Error, Result};

/// Which side of the negotiation we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// We called connect; the controlling ICE agent.
    Initiator,
    /// We answer an incoming session request; the controlled ICE agent.
    Responder,
}

impl Role {
    pub fn is_controlling(self) -> bool {
        self == Role::Initiator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        };
        write!(f, "{s}")
    }
}

/// State notifications published by an ICE session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    New,
    Gathering,
    CandidatesGathered,
    GatheringFailed,
    ChecksRunning,
    ChecksSucceeded,
    ChecksFailed,
}

impl SessionState {
    /// Maps a failure state to the negotiation error it causes.
    pub(crate) fn failure(self) -> Option<Error> {
        match self {
            SessionState::GatheringFailed => Some(Error::ErrNoCandidates),
            SessionState::ChecksFailed => Some(Error::ErrChecksFailed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SessionState::New => "new",
            SessionState::Gathering => "gathering",
            SessionState::CandidatesGathered => "candidates-gathered",
            SessionState::GatheringFailed => "gathering-failed",
            SessionState::ChecksRunning => "checks-running",
            SessionState::ChecksSucceeded => "checks-succeeded",
            SessionState::ChecksFailed => "checks-failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub role: Role,
    pub peer_guid: String,
    pub relay: RelayCredentials,
}

/// Allocates ICE sessions (candidate gathering, connectivity checks, STUN/TURN clients).
#[async_trait]
pub trait IceEngine: Send + Sync {
    async fn allocate_session(&self, params: SessionParams) -> Result<Box<dyn IceSession>>;

    /// Releases every engine resource of the session. Must run before another reader
    /// is attached to the socket taken from it.
    async fn deallocate_session(&self, session: Box<dyn IceSession>);
}

#[async_trait]
pub trait IceSession: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<SessionState>;

    /// Starts gathering; completion is published as `CandidatesGathered`.
    async fn gather_candidates(&mut self) -> Result<()>;

    fn local_candidates(&self) -> (Vec<Candidate>, IceCredentials);

    /// Starts connectivity checks; the outcome is published as `ChecksSucceeded` or
    /// `ChecksFailed`.
    async fn start_checks(&mut self, peer: &PeerCandidates) -> Result<()>;

    fn selected_pairs(&self) -> Vec<CandidatePair>;

    /// Stops the session's internal listener on the pair's socket.
    fn disable_listener(&mut self, pair: &CandidatePair);

    /// Detaches the pair's socket from the session; the session no longer closes it.
    fn take_socket(&mut self, pair: &CandidatePair) -> Result<Box<dyn DatagramSocket>>;
}

/// The raw socket behind a selected pair, once ICE has handed it over.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;

    fn remote_addr(&self) -> SocketAddr;

    async fn send(&self, buf: &[u8]) -> Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Sends a NAT binding keepalive towards the remote address.
    async fn send_keepalive(&self) -> Result<()>;

    /// Refreshes the TURN allocation behind a relayed pair.
    async fn refresh_relay(&self, credentials: &RelayCredentials) -> Result<()>;
}
