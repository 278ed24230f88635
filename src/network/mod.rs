//! Network Layer
//!
//! WebSocket server for real-time multiplayer communication: connection
//! admission, the session/identity protocol, and heartbeat liveness.

pub mod connection;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionShared, ConnectionTable};
pub use heartbeat::{run_heartbeat, HeartbeatResult};
pub use protocol::{ProtocolError, WireMessage};
pub use registry::{JoinOutcome, Player, SessionRegistry};
pub use server::{GameServer, GameServerError, ServerConfig};
