//! Game Logic Module
//!
//! Time-scheduled game flow, driven by the event dispatcher.
//!
//! ## Module Structure
//!
//! - `phase`: Shopping/combat phase timeline

pub mod phase;

// Re-export key types
pub use phase::{Phase, PhaseController, PhaseEvent, PhaseState};
