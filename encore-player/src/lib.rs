//! Playback session daemon
//!
//! Owns the authoritative playback session for a terminal music player:
//! a pure reducer over transport actions, crash-safe debounced
//! persistence, an external audio-process adapter with detach/reattach,
//! and a WebSocket channel that keeps every connected observer on the
//! same state.

pub mod api;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod reattach;
pub mod retry;
pub mod session;

pub use error::{Error, Result};
