
pub mod candidate_pair;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Indicates that the candidate carries the bus data component.
pub(crate) const COMPONENT_DATA: u16 = 1;

/// Represents the type of candidate `CandidateType` enum.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

// String makes CandidateType printable
impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "Unknown candidate type",
        };
        write!(f, "{s}")
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 5.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | CandidateType::Unspecified => 0,
        }
    }
}

/// One local or remote address considered during negotiation.
///
/// Serializable because candidates travel to the peer through the signaling service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    pub related_address: Option<SocketAddr>,
    pub component: u16,
    pub foundation: String,
    pub priority: u32,
}

impl Candidate {
    /// Builds a candidate with the RFC 8445 priority for its type.
    pub fn new(candidate_type: CandidateType, address: SocketAddr) -> Self {
        Self {
            candidate_type,
            address,
            related_address: None,
            component: COMPONENT_DATA,
            foundation: format!("{}{}", candidate_type, address.ip()),
            priority: compute_priority(candidate_type, DEFAULT_LOCAL_PREFERENCE, COMPONENT_DATA),
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address)
    }

    pub fn server_reflexive(address: SocketAddr, base: SocketAddr) -> Self {
        Self {
            related_address: Some(base),
            ..Self::new(CandidateType::ServerReflexive, address)
        }
    }

    pub fn relay(address: SocketAddr, base: SocketAddr) -> Self {
        Self {
            related_address: Some(base),
            ..Self::new(CandidateType::Relay, address)
        }
    }
}

// String makes Candidate printable
impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(related_address) = &self.related_address {
            write!(
                f,
                "{} {} related {}",
                self.candidate_type, self.address, related_address
            )
        } else {
            write!(f, "{} {}", self.candidate_type, self.address)
        }
    }
}

/// RFC 8445 5.1.2.1: priority = 2^24 * type pref + 2^8 * local pref + (256 - component)
pub(crate) fn compute_priority(
    candidate_type: CandidateType,
    local_preference: u16,
    component: u16,
) -> u32 {
    (1 << 24) * u32::from(candidate_type.preference())
        + (1 << 8) * u32::from(local_preference)
        + (256 - u32::from(component.min(256)))
}

/// Short-lived credential fragment/password pair authenticating one ICE session.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }
}

/// What the peer sends back through the signaling channel.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidates {
    pub candidates: Vec<Candidate>,
    pub credentials: IceCredentials,
}
