//! Wire protocol for the command/state channel
//!
//! Observers (local UI, remote clients) and the player exchange JSON
//! messages over a persistent message-oriented transport. Client messages
//! carry transport actions; server messages carry authentication results
//! and full session snapshots.
//!
//! `TransportAction` is also the reducer's action vocabulary: the exact
//! same variants drive local input and remote commands, so there is only
//! one set of transition rules.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Session, Track};

/// Typed transport action applied through the session reducer.
///
/// Serialized with a `type` tag and optional `payload`, e.g.
/// `{"type":"SET_VOLUME","payload":75}` or `{"type":"PAUSE"}`.
///
/// Unrecognized tags deserialize to [`TransportAction::Unknown`], which the
/// reducer treats as a no-op. Commands from newer or older clients are
/// absorbed rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportAction {
    /// Load and play a track
    Play(Track),
    Pause,
    Resume,
    Stop,
    Next,
    Previous,
    /// Seek to an absolute position in seconds
    Seek(u64),
    /// Set volume percent; out-of-range values are clamped, never rejected
    SetVolume(i64),
    VolumeUp,
    VolumeDown,
    VolumeFineUp,
    VolumeFineDown,
    /// Set playback speed multiplier; clamped to 0.25..=4.0
    SetSpeed(f64),
    ToggleShuffle,
    ToggleRepeat,
    /// Replace the queue; resets the position to 0
    SetQueue(Vec<Track>),
    AddToQueue(Track),
    /// Remove by index; out-of-range indices are ignored
    RemoveFromQueue(usize),
    ClearQueue,
    /// Jump to an index; out-of-range requests are ignored
    SetQueuePosition(usize),
    /// Authoritative progress report (seconds), clamped to the duration
    UpdateProgress(u64),
    SetDuration(u64),
    /// Advance progress by one second while playing (timer fallback)
    Tick,
    SetLoading(bool),
    SetError(Option<String>),
    /// Atomic bulk replace; playback is always restored paused
    RestoreState(Session),
    /// Any action tag this build does not know; reducer no-op
    #[serde(other)]
    Unknown,
}

/// Message sent by an observer to the player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Apply a transport action through the reducer
    Command { action: TransportAction },
    /// Partial configuration update (forwarded to the config consumer)
    ConfigUpdate { config: Map<String, Value> },
    /// Stop observing the audio process but leave it running
    Detach,
}

/// Message sent by the player to an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full session snapshot; sent on connect and after every transition
    StateUpdate { state: Session },
    /// Authentication result; sent exactly once, before any state update
    Auth {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}
