//! Heartbeat ping/pong liveness monitoring.
//!
//! Server side of the dead-connection detector. One boolean per connection:
//! a probe clears it, a pong sets it. A probe still unanswered at the next
//! tick means the peer is gone, which bounds detection latency to two
//! intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::network::connection::ConnectionShared;
use crate::network::protocol::WireMessage;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer missed a probe; the connection should be force-closed.
    TimedOut,
    /// The connection closed normally while the loop was running.
    Cancelled,
}

/// Run heartbeat probes for one connection.
///
/// Every `interval`: if the previous probe went unanswered the loop returns
/// [`HeartbeatResult::TimedOut`] and the caller force-closes the transport
/// with no close handshake. Otherwise the alive flag is cleared and a `ping`
/// frame is sent; the read loop re-arms the flag when a pong arrives.
///
/// The first probe fires one full interval after the connection is admitted,
/// so a fresh connection is never reaped before 2x `interval`.
pub async fn run_heartbeat(
    connection: Arc<ConnectionShared>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut probe_interval = time::interval_at(Instant::now() + interval, interval);
    probe_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = probe_interval.tick() => {
                if !connection.take_alive() {
                    return HeartbeatResult::TimedOut;
                }
                connection.send(WireMessage::Ping).await;
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
