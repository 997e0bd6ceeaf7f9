
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::KeepalivePolicy;
use crate::pool::{EntryId, StreamPool};
use crate::signaling::{RelayCredentials, Signaling};
use crate::stream::PacketStream;
use shared::error::Result;

/// Spawns the NAT keepalive and TURN refresh alarm of a stream, if its pair class needs
/// either. The task ends when the stream stops, the pool aborts it, or `shutdown` fires.
pub(crate) fn spawn_keepalive(
    stream: Arc<PacketStream>,
    policy: &KeepalivePolicy,
    signaling: Arc<dyn Signaling>,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let class = stream.pair_class();
    let keepalive = policy.keepalive_interval(class);
    let refresh = policy.relay_refresh_interval(class);
    if keepalive.is_none() && refresh.is_none() {
        log::trace!("{}: no keepalive needed for {class} pair", stream.id());
        return None;
    }

    Some(tokio::spawn(async move {
        let mut keepalive_ticker = ticker(keepalive);
        let mut refresh_ticker = ticker(refresh);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = keepalive_ticker.tick(), if keepalive.is_some() => {
                    if !stream.is_running() {
                        break;
                    }
                    if let Err(err) = stream.socket().send_keepalive().await {
                        log::warn!("{}: keepalive failed: {err}", stream.id());
                    }
                }
                _ = refresh_ticker.tick(), if refresh.is_some() => {
                    if !stream.is_running() {
                        break;
                    }
                    if let Err(err) = refresh_relay(&stream, signaling.as_ref()).await {
                        log::warn!("{}: relay refresh failed: {err}", stream.id());
                    }
                }
            }
        }
        log::trace!("{}: keepalive alarm exited", stream.id());
    }))
}

fn ticker(period: Option<Duration>) -> tokio::time::Interval {
    // A disabled ticker is never polled; any period works.
    let period = period.unwrap_or(Duration::from_secs(3600));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn refresh_relay(stream: &PacketStream, signaling: &dyn Signaling) -> Result<()> {
    let peer = stream.key().peer_guid();
    let mut credentials: RelayCredentials = signaling.get_relay_credentials(peer).await?;
    if credentials.is_expired(Instant::now()) {
        credentials = signaling.refresh_relay_credentials(peer).await?;
    }
    stream.socket().refresh_relay(&credentials).await
}

/// Spawns the responder-side accept timeout. When it fires before the packet engine
/// accepted, the parked reference is dropped and the control loop woken.
pub(crate) fn spawn_accept_timeout(
    pool: Arc<StreamPool>,
    entry: EntryId,
    timeout: Duration,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                if pool.expire_accept(entry) {
                    log::warn!("{entry}: no data-layer connect within {timeout:?}");
                    wake.notify_one();
                }
            }
        }
    })
}
