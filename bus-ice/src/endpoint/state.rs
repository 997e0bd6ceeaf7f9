use std::fmt;

use shared::error::{Error, Result};

/// Authentication progress of an endpoint.
///
/// `Initialized -> Authenticating -> {Succeeded | Failed} -> Done`. An endpoint that fails
/// before authentication starts may go straight from `Initialized` to `Failed`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Initialized,
    Authenticating,
    Succeeded,
    Failed,
    Done,
}

impl AuthState {
    pub fn can_transition_to(self, next: AuthState) -> bool {
        use AuthState::*;
        matches!(
            (self, next),
            (Initialized, Authenticating)
                | (Initialized, Failed)
                | (Authenticating, Succeeded)
                | (Authenticating, Failed)
                | (Succeeded, Done)
                | (Failed, Done)
        )
    }

    pub(crate) fn transition(&mut self, next: AuthState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::ErrIllegalTransition(format!("auth {self} -> {next}")));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AuthState::Initialized => "initialized",
            AuthState::Authenticating => "authenticating",
            AuthState::Succeeded => "succeeded",
            AuthState::Failed => "failed",
            AuthState::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Run state of an endpoint's send/receive tasks.
///
/// `Initialized -> {Failed | Started}`, then `Started -> Stopping -> Done`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    #[default]
    Initialized,
    Started,
    Failed,
    Stopping,
    Done,
}

impl EndpointState {
    pub fn can_transition_to(self, next: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, next),
            (Initialized, Started) | (Initialized, Failed) | (Started, Stopping) | (Stopping, Done)
        )
    }

    pub(crate) fn transition(&mut self, next: EndpointState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::ErrIllegalTransition(format!(
                "endpoint {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            EndpointState::Initialized => "initialized",
            EndpointState::Started => "started",
            EndpointState::Failed => "failed",
            EndpointState::Stopping => "stopping",
            EndpointState::Done => "done",
        };
        write!(f, "{s}")
    }
}
