//! Scriptable backend test double
//!
//! Records every control call and lets tests script play/reattach results
//! (including artificial latency, to exercise supersession) and inject
//! backend events by hand.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use axum::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::reattach::BackgroundSessionHandle;

use super::{AudioBackend, BackendEvent, PlayOptions, ReattachExpectation};

/// Scripted outcome for one `play` call.
#[derive(Debug, Clone)]
pub struct PlayScript {
    /// Artificial latency before the call resolves
    pub delay: Duration,
    /// Error message to fail with, or None for success
    pub error: Option<String>,
}

impl PlayScript {
    pub fn ok() -> Self {
        Self {
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            error: Some(message.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub struct MockBackend {
    calls: Mutex<Vec<String>>,
    play_script: Mutex<VecDeque<PlayScript>>,
    reattach_error: Mutex<Option<String>>,
    current_id: Mutex<String>,
    event_tx: mpsc::Sender<BackendEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            play_script: Mutex::new(VecDeque::new()),
            reattach_error: Mutex::new(None),
            current_id: Mutex::new(String::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Queue scripted outcomes for upcoming `play` calls. Unscripted calls
    /// succeed immediately.
    pub fn script_play(&self, scripts: impl IntoIterator<Item = PlayScript>) {
        self.play_script.lock().unwrap().extend(scripts);
    }

    /// Make the next `reattach` call fail with the given message.
    pub fn fail_reattach(&self, message: &str) {
        *self.reattach_error.lock().unwrap() = Some(message.to_string());
    }

    /// Inject a backend event as if the audio process pushed it.
    pub async fn emit(&self, event: BackendEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Every recorded control call, in order (e.g. `"play:abc"`).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of `play` calls recorded so far.
    pub fn play_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("play:"))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioBackend for MockBackend {
    async fn play(&self, source: &str, _opts: PlayOptions) -> Result<()> {
        self.record(format!("play:{source}"));
        let script = self.play_script.lock().unwrap().pop_front();
        match script {
            Some(script) => {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                match script.error {
                    Some(message) => Err(Error::Backend(message)),
                    None => {
                        *self.current_id.lock().unwrap() = source.to_string();
                        Ok(())
                    }
                }
            }
            None => {
                *self.current_id.lock().unwrap() = source.to_string();
                Ok(())
            }
        }
    }

    async fn pause(&self) -> Result<()> {
        self.record("pause".into());
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.record("resume".into());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop".into());
        self.current_id.lock().unwrap().clear();
        Ok(())
    }

    async fn seek(&self, seconds: u64) -> Result<()> {
        self.record(format!("seek:{seconds}"));
        Ok(())
    }

    async fn set_volume(&self, percent: u8) -> Result<()> {
        self.record(format!("volume:{percent}"));
        Ok(())
    }

    async fn set_speed(&self, speed: f64) -> Result<()> {
        self.record(format!("speed:{speed}"));
        Ok(())
    }

    async fn current_track_id(&self) -> String {
        self.current_id.lock().unwrap().clone()
    }

    async fn reattach(
        &self,
        handle: &BackgroundSessionHandle,
        _expected: &ReattachExpectation,
    ) -> Result<()> {
        self.record(format!("reattach:{}", handle.source));
        match self.reattach_error.lock().unwrap().take() {
            Some(message) => Err(Error::Reattach(message)),
            None => {
                *self.current_id.lock().unwrap() = handle.source.clone();
                Ok(())
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    async fn shutdown(&self, detach: bool) -> Result<Option<PathBuf>> {
        self.record(format!("shutdown:detach={detach}"));
        if detach {
            Ok(Some(PathBuf::from("/tmp/mock-backend.sock")))
        } else {
            Ok(None)
        }
    }
}
