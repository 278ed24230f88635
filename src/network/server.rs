//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections. Admits transports,
//! routes frames to the session protocol, and supervises per-connection
//! heartbeats. Phase scheduling runs elsewhere; the server only owns
//! connection-scoped state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::network::connection::{ConnectionHandle, ConnectionTable};
use crate::network::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::network::protocol::{ProtocolError, WireMessage};
use crate::network::registry::{JoinOutcome, SessionRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Heartbeat probe interval.
    pub heartbeat_interval: Duration,
    /// Duration of each game phase.
    pub phase_duration: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 1000,
            heartbeat_interval: Duration::from_millis(crate::HEARTBEAT_INTERVAL_MS),
            phase_duration: Duration::from_millis(crate::PHASE_DURATION_MS),
        }
    }
}

impl ServerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable: `PORT`, `MAX_CONNECTIONS`,
    /// `HEARTBEAT_INTERVAL_MS`, `PHASE_DURATION_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = read_env_var::<u16>("PORT") {
            config.bind_addr.set_port(port);
        }
        if let Some(max) = read_env_var::<usize>("MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(ms) = read_env_var::<u64>("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env_var::<u64>("PHASE_DURATION_MS") {
            config.phase_duration = Duration::from_millis(ms);
        }

        config
    }
}

fn read_env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(name, value, "ignoring unparseable environment variable");
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Player identities.
    registry: Arc<Mutex<SessionRegistry>>,
    /// Live connections.
    connections: Arc<Mutex<ConnectionTable>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry: Arc::new(Mutex::new(SessionRegistry::new())),
            connections: Arc::new(Mutex::new(ConnectionTable::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let connection_count = self.connections.lock().await.len();
                            if connection_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<WireMessage>(64);

            // Register connection
            let mut handle = connections.lock().await.register(msg_tx);
            let shared = handle.shared();
            let cancel = shared.cancel_token();

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Spawn heartbeat supervision
            let heartbeat_task = {
                let shared = shared.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result =
                        run_heartbeat(shared.clone(), heartbeat_interval, cancel).await;
                    if result == HeartbeatResult::TimedOut {
                        warn!(connection = shared.id, "missed heartbeat, terminating");
                        shared.force_close();
                    }
                })
            };

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::route_frame(&text, &mut handle, &registry, &connections)
                                    .await;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                handle.mark_alive();
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = cancel.cancelled() => {
                        // Forced close: drop the transport, no close handshake.
                        debug!("Client {} terminated", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            cancel.cancel();
            let _ = heartbeat_task.await;
            sender_task.abort();

            // Release the player binding, if any, before retiring the slot.
            registry.lock().await.leave_game(&mut handle);
            connections.lock().await.retire(handle.id());

            info!("Client {} cleaned up", addr);
        });
    }

    /// Route one inbound text frame for a connection.
    async fn route_frame(
        text: &str,
        conn: &mut ConnectionHandle,
        registry: &Arc<Mutex<SessionRegistry>>,
        connections: &Arc<Mutex<ConnectionTable>>,
    ) {
        let msg = match WireMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = conn.id(), error = %e, raw = text, "malformed frame");
                conn.send(WireMessage::error(ProtocolError::MalformedMessage))
                    .await;
                return;
            }
        };

        // A bound connection intercepts leave_game and error reports ahead
        // of the default router.
        if let Some(username) = conn.bound_username().map(str::to_owned) {
            match &msg {
                WireMessage::LeaveGame => {
                    registry.lock().await.leave_game(conn);
                    return;
                }
                WireMessage::Error { error } => {
                    registry.lock().await.log_peer_error(&username, *error);
                    return;
                }
                _ => {}
            }
        }

        match msg {
            WireMessage::JoinGame { username } => {
                let outcome = {
                    let mut registry = registry.lock().await;
                    let table = connections.lock().await;
                    registry.join_game(&table, conn, &username)
                };
                if let JoinOutcome::Rejected(error) = outcome {
                    conn.send(WireMessage::error(error)).await;
                }
            }
            WireMessage::Ping => {
                conn.send(WireMessage::Pong).await;
            }
            WireMessage::Pong => {
                conn.mark_alive();
            }
            _ => {
                // Keep the raw payload for offline analysis.
                warn!(connection = conn.id(), raw = text, "unhandled message");
                conn.send(WireMessage::error(ProtocolError::UnhandledMessage))
                    .await;
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Number of player identities ever created.
    pub async fn player_count(&self) -> usize {
        self.registry.lock().await.player_count()
    }

    /// Number of identities currently bound to a connection.
    pub async fn active_player_count(&self) -> usize {
        self.registry.lock().await.active_player_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(config: ServerConfig) -> (Arc<GameServer>, SocketAddr) {
        let server = Arc::new(GameServer::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server2 = server.clone();
        tokio::spawn(async move { server2.serve(listener).await });
        (server, addr)
    }

    fn quiet_heartbeat_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    async fn ws_connect(addr: SocketAddr) -> WsStream {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send_msg(ws: &mut WsStream, msg: &WireMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    async fn recv_msg(ws: &mut WsStream) -> WireMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return WireMessage::from_json(&text).expect("undecodable frame");
            }
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10_000));
        assert_eq!(config.phase_duration, Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(quiet_heartbeat_config());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_rejects_duplicate_username() {
        let (server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws_a = ws_connect(addr).await;
        send_msg(
            &mut ws_a,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;

        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 1 }
        })
        .await;

        let mut ws_b = ws_connect(addr).await;
        send_msg(
            &mut ws_b,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;

        assert_eq!(
            recv_msg(&mut ws_b).await,
            WireMessage::error(ProtocolError::UsernameInUse)
        );
        // First binding untouched.
        assert_eq!(server.active_player_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_then_rejoin_preserves_identity() {
        let (server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws_a = ws_connect(addr).await;
        send_msg(
            &mut ws_a,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 1 }
        })
        .await;

        send_msg(&mut ws_a, &WireMessage::LeaveGame).await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 0 }
        })
        .await;

        let mut ws_b = ws_connect(addr).await;
        send_msg(
            &mut ws_b,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 1 }
        })
        .await;

        // Same identity resumed, not a second record.
        assert_eq!(server.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_frees_username_for_rejoin() {
        let (server, addr) = start_server(quiet_heartbeat_config()).await;

        let ws_a = ws_connect(addr).await;
        let mut ws_a = ws_a;
        send_msg(
            &mut ws_a,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 1 }
        })
        .await;

        drop(ws_a);
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.connection_count().await == 0 }
        })
        .await;

        let mut ws_b = ws_connect(addr).await;
        send_msg(
            &mut ws_b,
            &WireMessage::JoinGame {
                username: "ada".into(),
            },
        )
        .await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.active_player_count().await == 1 }
        })
        .await;
        assert_eq!(server.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_blank_username_rejected() {
        let (server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws = ws_connect(addr).await;
        send_msg(
            &mut ws,
            &WireMessage::JoinGame {
                username: "".into(),
            },
        )
        .await;

        assert_eq!(
            recv_msg(&mut ws).await,
            WireMessage::error(ProtocolError::BlankUsername)
        );
        assert_eq!(server.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_connection_survives() {
        let (_server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws = ws_connect(addr).await;
        ws.send(Message::Text("not json{".into())).await.unwrap();

        assert_eq!(
            recv_msg(&mut ws).await,
            WireMessage::error(ProtocolError::MalformedMessage)
        );

        // Connection still open and routable.
        send_msg(&mut ws, &WireMessage::Ping).await;
        assert_eq!(recv_msg(&mut ws).await, WireMessage::Pong);
    }

    #[tokio::test]
    async fn test_unroutable_frame_gets_unhandled_error() {
        let (_server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws = ws_connect(addr).await;
        // leave_game with no binding routes nowhere.
        send_msg(&mut ws, &WireMessage::LeaveGame).await;

        assert_eq!(
            recv_msg(&mut ws).await,
            WireMessage::error(ProtocolError::UnhandledMessage)
        );
    }

    #[tokio::test]
    async fn test_connection_cap_refuses_admission_when_full() {
        let config = ServerConfig {
            max_connections: 1,
            ..quiet_heartbeat_config()
        };
        let (server, addr) = start_server(config).await;

        let mut ws_a = ws_connect(addr).await;
        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.connection_count().await == 1 }
        })
        .await;

        // The table is full: the next transport is dropped before the
        // handshake completes.
        assert!(connect_async(format!("ws://{}", addr)).await.is_err());
        assert_eq!(server.connection_count().await, 1);

        // The admitted connection is unaffected and still routable.
        send_msg(&mut ws_a, &WireMessage::Ping).await;
        assert_eq!(recv_msg(&mut ws_a).await, WireMessage::Pong);
    }

    #[tokio::test]
    async fn test_silent_client_is_reaped() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let (_server, addr) = start_server(config).await;

        let mut ws = ws_connect(addr).await;

        // First frame is the probe.
        assert_eq!(recv_msg(&mut ws).await, WireMessage::Ping);

        // Never answer: the transport must be torn down by the server.
        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "server never dropped the silent client");
    }

    #[tokio::test]
    async fn test_answered_probes_keep_client_connected() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let (server, addr) = start_server(config).await;

        let mut ws = ws_connect(addr).await;

        // Answer five probes; the connection must survive all of them.
        for _ in 0..5 {
            assert_eq!(recv_msg(&mut ws).await, WireMessage::Ping);
            send_msg(&mut ws, &WireMessage::Pong).await;
        }
        assert_eq!(server.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addr) = start_server(quiet_heartbeat_config()).await;

        let mut ws = ws_connect(addr).await;
        send_msg(&mut ws, &WireMessage::Ping).await;
        assert_eq!(recv_msg(&mut ws).await, WireMessage::Pong);

        server.shutdown();

        let server2 = server.clone();
        wait_until(|| {
            let server = server2.clone();
            async move { server.connection_count().await == 0 }
        })
        .await;
    }
}
