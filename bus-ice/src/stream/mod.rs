use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::candidate::candidate_pair::{CandidatePair, PairClass};
use crate::connect_spec::ConnectSpec;
use crate::ice_engine::DatagramSocket;
use crate::packet_engine::PacketDest;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A negotiated datagram stream: the socket of the selected pair, owned by the transport
/// once ICE detached it.
pub struct PacketStream {
    id: StreamId,
    key: ConnectSpec,
    selected_pair: CandidatePair,
    socket: Arc<dyn DatagramSocket>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketStream")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("selected_pair", &self.selected_pair.to_string())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl PacketStream {
    pub fn new(
        key: ConnectSpec,
        selected_pair: CandidatePair,
        socket: Box<dyn DatagramSocket>,
    ) -> Self {
        Self {
            id: StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst)),
            key,
            selected_pair,
            socket: Arc::from(socket),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn key(&self) -> &ConnectSpec {
        &self.key
    }

    pub fn selected_pair(&self) -> &CandidatePair {
        &self.selected_pair
    }

    pub fn pair_class(&self) -> PairClass {
        self.selected_pair.class()
    }

    pub fn socket(&self) -> &Arc<dyn DatagramSocket> {
        &self.socket
    }

    /// Destination handed to the packet engine for this stream.
    pub fn dest(&self) -> PacketDest {
        PacketDest {
            peer_guid: self.key.peer_guid().to_owned(),
            remote_addr: self.selected_pair.remote.address,
        }
    }

    pub fn start(&self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.started.store(true, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }
}
