use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::EndpointSide;
use crate::connect_spec::ConnectSpec;
use crate::packet_engine::BoxedChannel;
use shared::error::*;

/// First byte an active endpoint writes on a fresh channel.
pub(crate) const PREAMBLE: u8 = 0;

/// Authenticates the peer on a freshly connected channel.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Runs the exchange for `side` and returns the remote guid.
    async fn authenticate(
        &self,
        channel: &mut BoxedChannel,
        side: EndpointSide,
        spec: &ConnectSpec,
    ) -> Result<String>;
}

/// Nul preamble followed by a guid exchange: the active side writes the preamble and its
/// guid, the passive side answers with its own. Each side checks the guid it receives
/// against the peer named in the connect spec.
#[derive(Debug, Clone)]
pub struct PreambleAuthenticator {
    local_guid: String,
}

impl PreambleAuthenticator {
    pub fn new(local_guid: impl Into<String>) -> Self {
        Self {
            local_guid: local_guid.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PreambleAuthenticator {
    async fn authenticate(
        &self,
        channel: &mut BoxedChannel,
        side: EndpointSide,
        spec: &ConnectSpec,
    ) -> Result<String> {
        match side {
            EndpointSide::Active => {
                channel.write_u8(PREAMBLE).await?;
                write_guid(channel, &self.local_guid).await?;
                channel.flush().await?;
                let remote = read_guid(channel).await?;
                verify_guid(spec, remote)
            }
            EndpointSide::Passive => {
                let preamble = channel.read_u8().await?;
                if preamble != PREAMBLE {
                    return Err(Error::ErrBadPreamble(preamble));
                }
                let remote = verify_guid(spec, read_guid(channel).await?)?;
                write_guid(channel, &self.local_guid).await?;
                channel.flush().await?;
                Ok(remote)
            }
        }
    }
}

async fn write_guid(channel: &mut BoxedChannel, guid: &str) -> Result<()> {
    let len = u8::try_from(guid.len()).map_err(|_| Error::ErrHandshakeFailed)?;
    channel.write_u8(len).await?;
    channel.write_all(guid.as_bytes()).await?;
    Ok(())
}

async fn read_guid(channel: &mut BoxedChannel) -> Result<String> {
    let len = channel.read_u8().await?;
    let mut buf = vec![0u8; usize::from(len)];
    channel.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| Error::ErrHandshakeFailed)
}

fn verify_guid(spec: &ConnectSpec, remote: String) -> Result<String> {
    if remote != spec.peer_guid() {
        return Err(Error::ErrGuidMismatch {
            expected: spec.peer_guid().to_owned(),
            actual: remote,
        });
    }
    Ok(remote)
}
