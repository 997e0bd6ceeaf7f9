use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

use crate::candidate::{Candidate, IceCredentials, PeerCandidates};
use shared::error::Result;

/// STUN/TURN server information and credentials the discovery service holds for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub stun_server: SocketAddr,
    pub relay_server: Option<SocketAddr>,
    pub username: String,
    pub password: String,
    /// When the credentials were received from the discovery service.
    pub recv_time: Instant,
    /// Lifetime granted with the credentials.
    pub expiry: Duration,
}

impl RelayCredentials {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.recv_time + self.expiry < now
    }
}

/// Out-of-band channel exchanging candidates and relay credentials with peers.
///
/// Inbound session requests and purges flow the other way: the service calls
/// [`IceTransport::queue_incoming_session_request`](crate::transport::IceTransport::queue_incoming_session_request)
/// and [`IceTransport::purge`](crate::transport::IceTransport::purge).
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Returns the relay credentials currently held for `peer`.
    async fn get_relay_credentials(&self, peer: &str) -> Result<RelayCredentials>;

    /// Requests fresh relay credentials and resolves once they are renewed.
    async fn refresh_relay_credentials(&self, peer: &str) -> Result<RelayCredentials>;

    async fn send_candidates(
        &self,
        peer: &str,
        candidates: &[Candidate],
        credentials: &IceCredentials,
    ) -> Result<()>;

    /// Resolves once the peer's candidates and credentials have arrived.
    async fn recv_peer_candidates(&self, peer: &str) -> Result<PeerCandidates>;

    /// Tells the service the attempt with `peer` is abandoned.
    async fn abandon(&self, peer: &str);
}
