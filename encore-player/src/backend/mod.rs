//! Audio backend adapter
//!
//! The orchestrator never talks to an audio process directly; it depends on
//! the narrow [`AudioBackend`] trait. The real implementation drives an mpv
//! child process over its JSON IPC socket ([`mpv::MpvBackend`]); tests use
//! the scriptable [`mock::MockBackend`].
//!
//! Transport state only changes after a backend call resolves or an event
//! arrives on the backend stream; completion is never assumed synchronous.

pub mod mock;
pub mod mpv;

use axum::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::reattach::BackgroundSessionHandle;

/// Asynchronous event pushed by the audio backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Track duration became known (seconds)
    Duration(u64),
    /// Playback position report (seconds, sub-second precision)
    TimePosition(f64),
    /// The current source finished playing
    EndOfStream,
    /// Pause state flipped (true = paused)
    Paused(bool),
    /// The backend process went away
    Exited,
}

/// Options applied when starting playback of a source.
#[derive(Debug, Clone, Copy)]
pub struct PlayOptions {
    /// Volume percent, 0..=100
    pub volume: u8,
    /// Speed multiplier
    pub speed: f64,
}

/// What a detached session must look like for reattachment to adopt it.
#[derive(Debug, Clone)]
pub struct ReattachExpectation {
    /// Track identity the handle was recorded for
    pub track_id: String,
    /// Source reference the backend should currently be playing
    pub source: String,
}

/// Control surface of the external audio process.
///
/// All methods resolve once the backend acknowledged the request, not once
/// the audible effect happened; progress/duration/pause changes arrive on
/// the event stream.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Load and start playing a source.
    async fn play(&self, source: &str, opts: PlayOptions) -> Result<()>;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Seek to an absolute position in seconds.
    async fn seek(&self, seconds: u64) -> Result<()>;

    async fn set_volume(&self, percent: u8) -> Result<()>;
    async fn set_speed(&self, speed: f64) -> Result<()>;

    /// Identifier of the source currently loaded, empty string when idle.
    async fn current_track_id(&self) -> String;

    /// Take ownership of a previously detached backend session instead of
    /// starting a new one. Fails when the process is gone or plays
    /// something other than expected.
    async fn reattach(
        &self,
        handle: &BackgroundSessionHandle,
        expected: &ReattachExpectation,
    ) -> Result<()>;

    /// Take the backend event stream. Yields the receiver exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<BackendEvent>>;

    /// Tear down the backend. With `detach = true` the audio process is
    /// left running and its control socket path is returned so a
    /// background-session handle can be recorded.
    async fn shutdown(&self, detach: bool) -> Result<Option<PathBuf>>;
}
