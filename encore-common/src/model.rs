//! Core data model for the playback session
//!
//! `Session` is the single authoritative description of queue and transport
//! state. It is owned exclusively by the player's session store; everything
//! else (persistence, observers, the audio backend) works from clones or
//! read projections. All mutation goes through the reducer in the player
//! crate, which keeps the invariants documented on each field.

use serde::{Deserialize, Serialize};

/// Volume bounds and steps (percent scale)
pub const VOLUME_MAX: u8 = 100;
/// Coarse volume step used by VOLUME_UP / VOLUME_DOWN
pub const VOLUME_STEP: u8 = 10;
/// Fine volume step used by VOLUME_FINE_UP / VOLUME_FINE_DOWN
pub const VOLUME_FINE_STEP: u8 = 1;

/// Playback speed bounds
pub const SPEED_MIN: f64 = 0.25;
pub const SPEED_MAX: f64 = 4.0;

/// A single playable track.
///
/// Immutable value type; identity is the `id` field (catalog identifier),
/// never the metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Catalog identifier (also the source reference handed to the backend)
    pub id: String,
    /// Display title
    pub title: String,
    /// Artist names, possibly empty
    #[serde(default)]
    pub artists: Vec<String>,
    /// Album name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Duration in whole seconds, when known up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

impl PartialEq for Track {
    /// Track identity is the id; metadata differences do not matter.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Track {}

impl Track {
    /// Create a track with just an id and a title (CLI seeding, tests).
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artists: Vec::new(),
            album: None,
            duration_seconds: None,
        }
    }
}

/// Repeat mode, cycled by TOGGLE_REPEAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    /// Cycle off → all → one → off.
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

/// Authoritative in-memory playback/queue state.
///
/// Invariants (maintained by the reducer, relied on everywhere else):
/// - `queue_position < queue.len()` whenever the queue is non-empty
/// - `current_track` matches `queue[queue_position]` outside of in-flight
///   transitions
/// - `progress_seconds <= duration_seconds` once the duration is known
/// - `volume` within 0..=100 and `speed` within 0.25..=4.0, clamped on
///   every mutation rather than rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Track currently loaded into the backend (None when stopped)
    pub current_track: Option<Track>,
    /// Ordered playback queue
    #[serde(default)]
    pub queue: Vec<Track>,
    /// Index into `queue` of the current track
    #[serde(default)]
    pub queue_position: usize,
    /// Transport state; false covers both paused and stopped
    #[serde(default)]
    pub is_playing: bool,
    /// Seconds elapsed in the current track
    #[serde(default)]
    pub progress_seconds: u64,
    /// Duration of the current track in seconds; 0 = not yet known
    #[serde(default)]
    pub duration_seconds: u64,
    /// Volume percent, 0..=100
    pub volume: u8,
    /// Playback speed multiplier, 0.25..=4.0
    pub speed: f64,
    /// Shuffle mode for NEXT selection
    #[serde(default)]
    pub shuffle: bool,
    /// Repeat mode
    #[serde(default)]
    pub repeat: RepeatMode,
    /// True while a PLAY is in flight against the backend
    #[serde(default)]
    pub loading: bool,
    /// Last playback failure surfaced to observers; cleared by the next
    /// successful PLAY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            current_track: None,
            queue: Vec::new(),
            queue_position: 0,
            is_playing: false,
            progress_seconds: 0,
            duration_seconds: 0,
            volume: VOLUME_MAX,
            speed: 1.0,
            shuffle: false,
            repeat: RepeatMode::Off,
            loading: false,
            last_error: None,
        }
    }
}

impl Session {
    /// True when there is something in the queue.
    pub fn has_queue(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The track at the current queue position, if any.
    pub fn queued_current(&self) -> Option<&Track> {
        self.queue.get(self.queue_position)
    }

    /// Clamp a requested volume into the valid percent range.
    pub fn clamp_volume(raw: i64) -> u8 {
        raw.clamp(0, VOLUME_MAX as i64) as u8
    }

    /// Clamp a requested speed into the valid multiplier range.
    pub fn clamp_speed(raw: f64) -> f64 {
        if raw.is_nan() {
            1.0
        } else {
            raw.clamp(SPEED_MIN, SPEED_MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_mode_cycles() {
        assert_eq!(RepeatMode::Off.cycle(), RepeatMode::All);
        assert_eq!(RepeatMode::All.cycle(), RepeatMode::One);
        assert_eq!(RepeatMode::One.cycle(), RepeatMode::Off);
    }

    #[test]
    fn track_identity_is_id() {
        let a = Track::new("abc", "Title A");
        let mut b = Track::new("abc", "Different Title");
        b.artists = vec!["Someone".into()];
        assert_eq!(a, b);

        let c = Track::new("xyz", "Title A");
        assert_ne!(a, c);
    }

    #[test]
    fn default_session_is_stopped() {
        let s = Session::default();
        assert!(!s.is_playing);
        assert!(s.current_track.is_none());
        assert!(s.queue.is_empty());
        assert_eq!(s.volume, 100);
        assert_eq!(s.speed, 1.0);
        assert_eq!(s.repeat, RepeatMode::Off);
    }

    #[test]
    fn volume_and_speed_clamps() {
        assert_eq!(Session::clamp_volume(150), 100);
        assert_eq!(Session::clamp_volume(-5), 0);
        assert_eq!(Session::clamp_volume(42), 42);
        assert_eq!(Session::clamp_speed(10.0), 4.0);
        assert_eq!(Session::clamp_speed(0.0), 0.25);
        assert_eq!(Session::clamp_speed(1.5), 1.5);
    }

    #[test]
    fn session_serializes_camel_case() {
        let s = Session::default();
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("queuePosition").is_some());
        assert!(json.get("isPlaying").is_some());
        assert!(json.get("progressSeconds").is_some());
        // Transient None fields are omitted
        assert!(json.get("lastError").is_none());
    }
}
