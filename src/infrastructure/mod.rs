//! Infrastructure Module
//!
//! Everything that talks to (or stands in for) the wireless link.
//!
//! ## Modules
//!
//! - [`transport`] - Link abstraction implemented by real deployments
//! - [`queue`] - Per-peer serialized command pipeline
//! - [`timesync`] - Clock synchronization session state
//! - [`band`] - One connected band peer
//! - [`manager`] - Peer registry and master-election bookkeeping
//! - [`logging`] - Tracing initialisation

pub mod band;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod timesync;
pub mod transport;

pub use manager::BandManager;
