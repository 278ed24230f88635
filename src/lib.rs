//! # Portfall Game Server
//!
//! Real-time multiplayer backend for Portfall: a WebSocket session layer
//! with username identities, heartbeat liveness on both ends of the wire,
//! and a timer-driven shopping/combat phase clock built on a generic event
//! dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PORTFALL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  dispatch/       - Typed event dispatcher                    │
//! │  └── mod.rs      - Handlers, effects, guarded events         │
//! │                                                              │
//! │  game/           - Game flow                                 │
//! │  └── phase.rs    - Shopping/combat phase clock               │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server and frame router         │
//! │  ├── protocol.rs - Wire message types                        │
//! │  ├── connection.rs - Per-connection shared state             │
//! │  ├── registry.rs - Player identities and session bindings    │
//! │  └── heartbeat.rs - Dead-connection detection                │
//! │                                                              │
//! │  client/         - Reconnecting client                       │
//! │  └── mod.rs      - Link loop, probe watchdog, retry          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Liveness Contract
//!
//! The server probes every connection once per heartbeat interval and
//! reaps a peer that misses a probe, bounding dead-connection detection
//! to two intervals. The client mirrors this: if no probe arrives within
//! the interval plus a latency allowance, it drops the link and
//! reconnects under a fresh generation, so frames queued against a dead
//! link can never leak onto a new one.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod dispatch;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use client::{ClientConfig, ClientHandle, LinkState};
pub use dispatch::{Dispatcher, Effect, Event, Transition};
pub use game::phase::{Phase, PhaseController, PhaseEvent, PhaseState};
pub use network::protocol::{ProtocolError, WireMessage};
pub use network::server::{GameServer, GameServerError, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default heartbeat probe interval (ms)
pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Default grace the client allows on top of the probe interval (ms)
pub const MAX_LATENCY_MS: u64 = 1_000;

/// Default pause between client reconnect attempts (ms)
pub const RETRY_DELAY_MS: u64 = 3_000;

/// Default duration of each game phase (ms)
pub const PHASE_DURATION_MS: u64 = 10_000;
