use serde::{Deserialize, Serialize};
use std::fmt;

use super::*;

/// Coarse classification of a selected pair, used to pick keepalive and relay-refresh
/// intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairClass {
    /// Both ends are host candidates; no NAT binding needs to be kept open.
    HostToHost,
    /// At least one end is server or peer reflexive, none relayed.
    Reflexive,
    /// At least one end is a TURN relay allocation.
    Relayed,
}

impl fmt::Display for PairClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::HostToHost => "host-to-host",
            Self::Reflexive => "reflexive",
            Self::Relayed => "relayed",
        };
        write!(f, "{s}")
    }
}

/// Represents a combination of a local and remote candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    pub(crate) ice_role_controlling: bool,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority,
            self.local,
            self.remote,
            self.remote.priority,
        )
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(local: Candidate, remote: Candidate, ice_role_controlling: bool) -> Self {
        Self {
            local,
            remote,
            ice_role_controlling,
        }
    }

    /// RFC 8445 - 6.1.2.3.  Computing Pair Priority and Ordering Pairs
    /// Let G be the priority for the candidate provided by the controlling
    /// agent.  Let D be the priority for the candidate provided by the
    /// controlled agent.
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.ice_role_controlling {
            (self.local.priority, self.remote.priority)
        } else {
            (self.remote.priority, self.local.priority)
        };

        // 1<<32 overflows uint32; and if both g && d are
        // maxUint32, this result would overflow uint64
        ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    pub fn class(&self) -> PairClass {
        let types = [self.local.candidate_type, self.remote.candidate_type];
        if types.contains(&CandidateType::Relay) {
            PairClass::Relayed
        } else if types.iter().all(|t| *t == CandidateType::Host) {
            PairClass::HostToHost
        } else {
            PairClass::Reflexive
        }
    }
}
