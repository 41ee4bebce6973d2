//! Core engine for a round-based multiplayer reflex game played with
//! wireless motion-sensor bands.
//!
//! Three subsystems carry the game: a per-peer serialized command queue
//! over a one-operation-in-flight link, a clock-sync negotiation that
//! elects one band as the shared time base, and the round scheduler that
//! announces gestures, collects hits and ranks players. Screen, audio
//! and the native gesture classifier live outside this crate; the core
//! talks to them through [`domain::classifier`] and [`CoreEvent`]s.

pub mod domain;
pub mod engine;
pub mod infrastructure;

pub use domain::game::{GameError, GameState};
pub use domain::models::{CoreEvent, PeerId, PlayerId, UsageSlot};
pub use engine::{build, Command, Engine, EngineHandle};
