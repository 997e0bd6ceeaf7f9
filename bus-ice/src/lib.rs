#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub(crate) mod alarm;
pub mod candidate;
pub mod config;
pub mod connect_spec;
pub mod endpoint;
pub mod ice_engine;
pub(crate) mod negotiator;
pub mod packet_engine;
pub mod pool;
pub mod signaling;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{KeepalivePolicy, TransportConfig, TransportConfigBuilder};
pub use connect_spec::ConnectSpec;
pub use endpoint::{Endpoint, EndpointId, EndpointSide};
pub use transport::{IceTransport, TransportListener, TransportStats};
