use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::stream::{PacketStream, StreamId};
use shared::error::Result;

/// Where a packet engine connection goes: the peer and the remote address of the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketDest {
    pub peer_guid: String,
    pub remote_addr: SocketAddr,
}

/// A reliable logical stream delivered by the packet engine.
pub trait AsyncChannel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedChannel = Box<dyn AsyncChannel>;

/// Multiplexes reliable logical streams over negotiated datagram streams.
#[async_trait]
pub trait PacketEngine: Send + Sync {
    /// Registers the listener receiving accept and disconnect callbacks.
    fn set_listener(&self, listener: Weak<dyn PacketEngineListener>);

    /// Starts reading the stream's socket.
    async fn add_stream(&self, stream: &Arc<PacketStream>) -> Result<()>;

    /// Stops reading the stream's socket and forgets it.
    async fn remove_stream(&self, stream: &Arc<PacketStream>);

    /// Performs the data-layer connect over an established stream.
    async fn connect(&self, stream: &Arc<PacketStream>, dest: &PacketDest)
        -> Result<BoxedChannel>;
}

/// Callbacks the packet engine invokes on the transport.
pub trait PacketEngineListener: Send + Sync {
    /// A remote peer completed a data-layer connect over `stream`. Returning `false`
    /// refuses the connection.
    fn should_accept(&self, stream: StreamId, dest: &PacketDest, channel: BoxedChannel) -> bool;

    fn on_disconnect(&self, stream: StreamId, dest: &PacketDest);
}
