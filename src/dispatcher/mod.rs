//! Command dispatch
//!
//! The dispatchers are the only place that maps real-world events onto
//! protocol messages. Each runs one serialized loop over its event sources,
//! so the current connection and the current recognition session are only
//! ever touched from that loop.
//!
//! Controller: `Advertising → PeerConnected → Listening → TriggerFired →
//! CommandSent → PeerConnected`, with a peer disconnect returning to
//! `Advertising` from any connected phase.
//!
//! Companion: `Browsing → Connecting → Connected`, back to `Browsing` when
//! the connection ends or a connect attempt fails.

mod companion;
mod controller;

pub use companion::{Companion, CompanionHandle, CompanionPhase};
pub use controller::{Controller, ControllerHandle, ControllerOptions, ControllerPhase};
