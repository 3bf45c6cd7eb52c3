//! Command/state channel over HTTP + WebSocket

pub mod server;
pub mod ws;

pub use server::{router, run, AppContext};
