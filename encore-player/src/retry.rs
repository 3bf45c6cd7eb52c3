//! Bounded retry for play attempts
//!
//! Starting playback talks to an external process and can fail
//! transiently, so each play request runs as a spawned attempt loop with a
//! fixed retry budget. Every loop carries the store generation it was
//! started under; the orchestrator drops outcomes whose generation is no
//! longer current, so a superseded loop can keep failing in the background
//! without ever touching state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{AudioBackend, PlayOptions};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never zero.
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Result of one play attempt loop, tagged with its generation.
#[derive(Debug)]
pub struct PlayOutcome {
    pub generation: u64,
    /// Ok carries the attempt number that succeeded (1-based);
    /// Err carries the last backend error.
    pub result: Result<u32, String>,
}

/// Run the attempt loop for one source in the background. The outcome is
/// reported exactly once over `outcome_tx`.
pub fn spawn_play(
    backend: Arc<dyn AudioBackend>,
    source: String,
    opts: PlayOptions,
    policy: RetryPolicy,
    generation: u64,
    outcome_tx: mpsc::Sender<PlayOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_error = String::new();
        for attempt in 1..=policy.attempts {
            match backend.play(&source, opts).await {
                Ok(()) => {
                    debug!(%source, attempt, "playback started");
                    let _ = outcome_tx
                        .send(PlayOutcome {
                            generation,
                            result: Ok(attempt),
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == 1 {
                        info!(%source, "play attempt failed, retrying: {last_error}");
                    } else {
                        debug!(%source, attempt, "play attempt failed: {last_error}");
                    }
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.delay).await;
                    }
                }
            }
        }

        warn!(%source, attempts = policy.attempts, "giving up on playback: {last_error}");
        let _ = outcome_tx
            .send(PlayOutcome {
                generation,
                result: Err(last_error),
            })
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, PlayScript};

    fn opts() -> PlayOptions {
        PlayOptions {
            volume: 100,
            speed: 1.0,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let backend = Arc::new(MockBackend::new());
        backend.script_play([PlayScript::ok()]);
        let (tx, mut rx) = mpsc::channel(4);

        spawn_play(
            backend.clone(),
            "s1".into(),
            opts(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            7,
            tx,
        );

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.generation, 7);
        assert_eq!(outcome.result, Ok(1));
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let backend = Arc::new(MockBackend::new());
        backend.script_play([
            PlayScript::fail("network down"),
            PlayScript::fail("network down"),
            PlayScript::ok(),
        ]);
        let (tx, mut rx) = mpsc::channel(4);

        spawn_play(
            backend.clone(),
            "s1".into(),
            opts(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            1,
            tx,
        );

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.result, Ok(3));
        assert_eq!(backend.play_count(), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_reports_last_error() {
        let backend = Arc::new(MockBackend::new());
        backend.script_play((0..3).map(|_| PlayScript::fail("no such file")));
        let (tx, mut rx) = mpsc::channel(4);

        spawn_play(
            backend.clone(),
            "s1".into(),
            opts(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            2,
            tx,
        );

        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(ref e) if e.contains("no such file")));
        assert_eq!(backend.play_count(), 3);
    }
}
