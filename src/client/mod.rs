//! Game Client
//!
//! Reconnecting WebSocket client. Maintains one link to the server at a
//! time, announces its identity on every (re)connect, and watches for the
//! server's heartbeat probes. A missed probe window drops the link without
//! a close handshake; the client then retries forever until shut down.
//!
//! Every link attempt gets a fresh generation number. Outbound frames are
//! tagged with the generation current when they were queued, and a frame
//! tagged for a previous link is dropped instead of leaking onto the new
//! one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::network::protocol::{ProtocolError, WireMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL.
    pub url: String,
    /// Identity announced on every connect.
    pub username: String,
    /// Expected gap between server heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Grace allowed on top of the probe interval before the link is
    /// considered dead.
    pub max_latency: Duration,
    /// Pause between reconnect attempts.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            username: "Digitalis".to_string(),
            heartbeat_interval: Duration::from_millis(crate::HEARTBEAT_INTERVAL_MS),
            max_latency: Duration::from_millis(crate::MAX_LATENCY_MS),
            retry_delay: Duration::from_millis(crate::RETRY_DELAY_MS),
        }
    }
}

/// Observable state of the client's link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected and not trying.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Link up, identity announced.
    Connected,
    /// Link lost; waiting out the retry delay.
    ReconnectWait,
}

/// Why a link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// No probe arrived within `heartbeat_interval + max_latency`.
    HeartbeatTimeout,
    /// The server closed the transport.
    TransportClosed,
    /// The transport failed mid-link.
    TransportError,
    /// The client was shut down.
    Shutdown,
}

/// Handle to a running client task.
///
/// Dropping the handle does not stop the client; call
/// [`ClientHandle::shutdown`] for that.
pub struct ClientHandle {
    state_rx: watch::Receiver<LinkState>,
    outbound_tx: mpsc::Sender<(u64, WireMessage)>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    /// Spawn the client task and return a handle to it.
    pub fn spawn(config: ClientConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let generation = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_client(
            config,
            state_tx,
            outbound_tx.clone(),
            outbound_rx,
            generation.clone(),
            shutdown.clone(),
        ));

        Self {
            state_rx,
            outbound_tx,
            generation,
            shutdown,
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch every link state change.
    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Queue a frame for the server.
    ///
    /// Returns false if the link is not up. Frames queued against a link
    /// that dies before they are written are dropped, never replayed onto
    /// the next link.
    pub async fn send(&self, msg: WireMessage) -> bool {
        if self.state() != LinkState::Connected {
            return false;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.outbound_tx.send((generation, msg)).await.is_ok()
    }

    /// Stop the client for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Connect-retry loop. Runs until shutdown.
///
/// Holds its own clone of the outbound sender so the channel stays open
/// even after every [`ClientHandle`] is dropped; only the shutdown token
/// stops the loop.
async fn run_client(
    config: ClientConfig,
    state_tx: watch::Sender<LinkState>,
    _outbound_tx: mpsc::Sender<(u64, WireMessage)>,
    mut outbound_rx: mpsc::Receiver<(u64, WireMessage)>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let link_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = state_tx.send(LinkState::Connecting);

        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, generation = link_generation, "link established");
                let _ = state_tx.send(LinkState::Connected);

                let reason = run_link(
                    ws_stream,
                    &config,
                    link_generation,
                    &mut outbound_rx,
                    &shutdown,
                )
                .await;
                info!(?reason, "link closed");

                if reason == CloseReason::Shutdown {
                    break;
                }
            }
            Err(e) => {
                warn!(url = %config.url, "connect failed: {}", e);
            }
        }

        let _ = state_tx.send(LinkState::ReconnectWait);
        tokio::select! {
            _ = sleep(config.retry_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    let _ = state_tx.send(LinkState::Disconnected);
}

/// Drive one established link until it ends.
async fn run_link<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    config: &ClientConfig,
    link_generation: u64,
    outbound_rx: &mut mpsc::Receiver<(u64, WireMessage)>,
    shutdown: &CancellationToken,
) -> CloseReason
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Announce identity before anything else.
    if write_frame(
        &mut ws_sender,
        &WireMessage::JoinGame {
            username: config.username.clone(),
        },
    )
    .await
    .is_err()
    {
        return CloseReason::TransportError;
    }

    let probe_window = config.heartbeat_interval + config.max_latency;
    let mut deadline = Instant::now() + probe_window;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match WireMessage::from_json(&text) {
                            Ok(WireMessage::Ping) => {
                                deadline = Instant::now() + probe_window;
                                if write_frame(&mut ws_sender, &WireMessage::Pong)
                                    .await
                                    .is_err()
                                {
                                    return CloseReason::TransportError;
                                }
                            }
                            Ok(WireMessage::Error { error }) => {
                                error!(%error, "server reported an error");
                            }
                            Ok(other) => {
                                debug!(?other, "unroutable server frame");
                                let _ = write_frame(
                                    &mut ws_sender,
                                    &WireMessage::error(ProtocolError::UnhandledMessage),
                                )
                                .await;
                            }
                            Err(e) => {
                                debug!(error = %e, raw = %text, "malformed server frame");
                                let _ = write_frame(
                                    &mut ws_sender,
                                    &WireMessage::error(ProtocolError::MalformedMessage),
                                )
                                .await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Transport-level probe counts as liveness too.
                        deadline = Instant::now() + probe_window;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return CloseReason::TransportClosed;
                    }
                    Some(Err(e)) => {
                        debug!("websocket error: {}", e);
                        return CloseReason::TransportError;
                    }
                    _ => {}
                }
            }
            _ = sleep_until(deadline) => {
                // Drop the transport outright, no close handshake.
                warn!(
                    generation = link_generation,
                    "no probe within the heartbeat window, dropping link"
                );
                return CloseReason::HeartbeatTimeout;
            }
            queued = outbound_rx.recv() => {
                match queued {
                    Some((tagged, msg)) if tagged == link_generation => {
                        if write_frame(&mut ws_sender, &msg).await.is_err() {
                            return CloseReason::TransportError;
                        }
                    }
                    Some((tagged, _)) => {
                        debug!(tagged, "dropping frame tagged for a previous link");
                    }
                    None => return CloseReason::Shutdown,
                }
            }
            _ = shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                return CloseReason::Shutdown;
            }
        }
    }
}

async fn write_frame<S>(
    ws_sender: &mut S,
    msg: &WireMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = msg
        .to_json()
        .map_err(|e| tokio_tungstenite::tungstenite::Error::Io(std::io::Error::other(e)))?;
    ws_sender.send(Message::Text(text)).await
}
