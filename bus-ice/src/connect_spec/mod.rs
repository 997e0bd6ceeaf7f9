
use std::fmt;

use shared::error::*;

pub(crate) const TRANSPORT_PREFIX: &str = "ice";
pub(crate) const GUID_KEY: &str = "guid";

/// Canonical key identifying "reach peer X via ICE".
///
/// Always of the form `ice:guid=<peer-id>`, so concurrent attempts to the same peer
/// converge on one key regardless of how the caller spelled the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectSpec {
    canonical: String,
    guid_offset: usize,
}

impl ConnectSpec {
    /// Normalizes a connect spec such as `ice:foo=bar,guid=1234` into `ice:guid=1234`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (prefix, args) = spec
            .split_once(':')
            .ok_or_else(|| Error::ErrInvalidConnectSpec(spec.to_owned()))?;
        if prefix.trim() != TRANSPORT_PREFIX {
            return Err(Error::ErrInvalidConnectSpec(spec.to_owned()));
        }

        let mut guid = None;
        for arg in args.split(',') {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            if key.trim() == GUID_KEY {
                if guid.is_some() {
                    return Err(Error::ErrInvalidConnectSpec(spec.to_owned()));
                }
                guid = Some(value.trim());
            }
        }

        match guid {
            Some(guid) if !guid.is_empty() => Ok(Self::for_peer(guid)),
            _ => Err(Error::ErrInvalidConnectSpec(spec.to_owned())),
        }
    }

    /// Builds the canonical spec for a peer guid.
    pub fn for_peer(guid: &str) -> Self {
        let canonical = format!("{TRANSPORT_PREFIX}:{GUID_KEY}={guid}");
        let guid_offset = canonical.len() - guid.len();
        Self {
            canonical,
            guid_offset,
        }
    }

    pub fn peer_guid(&self) -> &str {
        &self.canonical[self.guid_offset..]
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

impl std::str::FromStr for ConnectSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
