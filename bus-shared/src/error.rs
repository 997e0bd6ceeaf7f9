#![allow(dead_code)]

use std::io;
use std::net;
use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // Negotiation outcomes
    #[error("deadline exceeded")]
    ErrTimeout,
    #[error("attempt abandoned: task is stopping")]
    ErrStopping,
    #[error("no STUN/TURN server information for peer")]
    ErrNoStunInfo,
    #[error("relay credentials expired and could not be refreshed")]
    ErrCredentialsExpired,
    #[error("empty local or peer candidate list")]
    ErrNoCandidates,
    #[error("ICE connectivity checks failed")]
    ErrChecksFailed,
    #[error("connectivity checks succeeded without a selected candidate pair")]
    ErrNoSelectedPair,

    // Admission and pooling
    #[error("admission rejected: connection limits exceeded")]
    ErrAdmissionRejected,
    #[error("pooled stream disappeared")]
    ErrStreamGone,
    #[error("a negotiation with this peer is already in progress")]
    ErrNegotiationInProgress,

    // Endpoint lifecycle
    #[error("peer handshake failed")]
    ErrHandshakeFailed,
    #[error("unexpected preamble byte {0:#04x}")]
    ErrBadPreamble(u8),
    #[error("remote guid {actual} does not match expected {expected}")]
    ErrGuidMismatch { expected: String, actual: String },
    #[error("send/receive tasks could not be started")]
    ErrTaskStartFailed,
    #[error("illegal state transition: {0}")]
    ErrIllegalTransition(String),
    #[error("task cannot join itself")]
    ErrSelfJoin,

    // Transport
    #[error("invalid connect spec: {0}")]
    ErrInvalidConnectSpec(String),
    #[error("transport not started")]
    ErrTransportNotStarted,
    #[error("transport already started")]
    ErrAlreadyStarted,
    #[error("transport is stopping")]
    ErrTransportStopping,
    #[error("not found")]
    ErrNotFound,
    #[error("channel closed")]
    ErrChannelClosed,

    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Reports whether the error ends a negotiation attempt because of the deadline or a
    /// stop request rather than a protocol failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::ErrTimeout | Error::ErrStopping)
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::ErrTimeout
        } else {
            Error::Io(IoError(e))
        }
    }
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
