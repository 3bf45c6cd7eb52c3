//! # Encore Common Library
//!
//! Shared code for the Encore playback session orchestrator:
//! - Data model (Track, Session, RepeatMode)
//! - Wire protocol types (TransportAction, ClientMessage, ServerMessage)
//! - Bootstrap configuration loading
//! - Common error types

pub mod config;
pub mod error;
pub mod model;
pub mod protocol;

pub use error::{Error, Result};
pub use model::{RepeatMode, Session, Track};
