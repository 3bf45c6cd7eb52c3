//! Session coordinator
//!
//! Single-owner event loop around the session store. Observer commands,
//! backend events, playback retry outcomes and the fallback ticker all
//! arrive on channels folded into one `select!` loop, so state transitions
//! are strictly serialized: reduce, publish the new snapshot, schedule
//! persistence, then run transport side effects against the backend.
//!
//! Backend side effects are fire-and-forget from the reducer's point of
//! view: a failing pause/seek/volume call is logged and the optimistic
//! state stands. Only `play` gets the full retry treatment, because that
//! is the one transition whose failure the user must see (`last_error`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use encore_common::model::RepeatMode;
use encore_common::protocol::{ServerMessage, TransportAction};
use encore_common::{Session, Track};

use crate::backend::{AudioBackend, BackendEvent, PlayOptions, ReattachExpectation};
use crate::hub::StateBroadcaster;
use crate::persistence::{SaveKind, SessionPersistence};
use crate::reattach::{BackgroundSessionHandle, HandleStore};
use crate::retry::{self, PlayOutcome, RetryPolicy};
use crate::session::SessionStore;

/// Position reports older than this make the 1 s ticker take over
/// progress advancement.
const POSITION_STALE_AFTER: Duration = Duration::from_secs(2);

/// Minimum wall-clock spacing between progress broadcasts. Whole-second
/// deduplication alone is not enough: at speeds above 1.0 the track
/// second rolls over more than once per wall-clock second.
const PROGRESS_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Input accepted by the coordinator loop.
#[derive(Debug)]
pub enum CoordinatorMsg {
    /// Transport action from an observer or CLI seeding
    Command(TransportAction),
    /// Partial runtime configuration update
    ConfigUpdate(Map<String, Value>),
    /// Persist any pending snapshot immediately
    Flush,
    /// Stop observing the audio process, leave it playing and record a
    /// background-session handle for later reattachment
    Detach,
    /// Tear down: optional detach, final flush, loop exit
    Shutdown,
}

/// Everything the coordinator needs to run.
pub struct CoordinatorOptions {
    pub initial: Session,
    pub backend: Arc<dyn AudioBackend>,
    pub persistence: SessionPersistence,
    pub hub: StateBroadcaster,
    /// Shared read view for HTTP handlers and new observers
    pub snapshot: Arc<RwLock<Session>>,
    pub handles: HandleStore,
    pub retry: RetryPolicy,
    pub pause_suppression: Duration,
    pub detach_on_exit: bool,
}

pub struct SessionCoordinator {
    store: SessionStore,
    backend: Arc<dyn AudioBackend>,
    persistence: SessionPersistence,
    hub: StateBroadcaster,
    snapshot: Arc<RwLock<Session>>,
    handles: HandleStore,
    retry: RetryPolicy,
    pause_suppression: Duration,
    detach_on_exit: bool,

    msg_rx: Option<mpsc::Receiver<CoordinatorMsg>>,
    outcome_tx: mpsc::Sender<PlayOutcome>,
    outcome_rx: Option<mpsc::Receiver<PlayOutcome>>,

    /// Detached-session handle found at startup; consumed by the first
    /// matching play, in both the success and the failure case.
    pending_handle: Option<BackgroundSessionHandle>,
    last_position_report: Option<Instant>,
    last_progress_broadcast: Option<Instant>,
    suppress_pause_until: Option<Instant>,
}

impl SessionCoordinator {
    pub fn new(opts: CoordinatorOptions) -> (Self, mpsc::Sender<CoordinatorMsg>) {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = mpsc::channel(16);
        let pending_handle = opts.handles.take();
        if let Some(handle) = &pending_handle {
            info!(track = %handle.track_id, "found background session handle");
        }

        let coordinator = Self {
            store: SessionStore::new(opts.initial),
            backend: opts.backend,
            persistence: opts.persistence,
            hub: opts.hub,
            snapshot: opts.snapshot,
            handles: opts.handles,
            retry: opts.retry,
            pause_suppression: opts.pause_suppression,
            detach_on_exit: opts.detach_on_exit,
            msg_rx: Some(msg_rx),
            outcome_tx,
            outcome_rx: Some(outcome_rx),
            pending_handle,
            last_position_report: None,
            last_progress_broadcast: None,
            suppress_pause_until: None,
        };
        (coordinator, msg_tx)
    }

    pub async fn run(mut self) {
        *self.snapshot.write().await = self.store.session().clone();

        let mut msg_rx = self.msg_rx.take().expect("coordinator run() called twice");
        let mut outcome_rx = self.outcome_rx.take().expect("coordinator run() called twice");
        let mut events = self.backend.take_events();

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the first tick resolves immediately

        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(CoordinatorMsg::Command(action)) => self.handle_command(action).await,
                    Some(CoordinatorMsg::ConfigUpdate(map)) => self.apply_config_update(map),
                    Some(CoordinatorMsg::Flush) => self.persistence.flush_sync(),
                    Some(CoordinatorMsg::Detach) => self.detach().await,
                    Some(CoordinatorMsg::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(outcome) = recv_some(&mut outcome_rx) => {
                    self.handle_play_outcome(outcome).await;
                }
                event = recv_event(&mut events), if events.is_some() => match event {
                    Some(event) => self.handle_backend_event(event).await,
                    None => events = None,
                },
                _ = ticker.tick() => self.handle_tick().await,
            }
        }
        info!("session coordinator stopped");
    }

    /// Reduce, publish and schedule persistence for one action.
    async fn apply(&mut self, action: &TransportAction) {
        let session = self.store.apply(action).clone();
        *self.snapshot.write().await = session.clone();
        self.hub.broadcast_lossy(ServerMessage::StateUpdate {
            state: session.clone(),
        });
        if let Some(kind) = persistence_kind(action) {
            self.persistence.save(&session, kind).await;
        }
    }

    async fn handle_command(&mut self, action: TransportAction) {
        match action {
            TransportAction::Play(ref track) => {
                let track = track.clone();
                self.apply(&action).await;
                self.start_play(&track).await;
            }
            TransportAction::Pause => {
                log_backend_error("pause", self.backend.pause().await);
                self.apply(&action).await;
            }
            TransportAction::Stop => {
                log_backend_error("stop", self.backend.stop().await);
                self.apply(&action).await;
            }
            TransportAction::Resume => {
                self.apply(&action).await;
                let session = self.store.session();
                if !session.is_playing {
                    return;
                }
                let Some(track) = session.current_track.clone() else {
                    return;
                };
                // After a restored session the backend holds nothing yet;
                // the first resume actually has to load the track.
                if self.backend.current_track_id().await == track.id {
                    log_backend_error("resume", self.backend.resume().await);
                } else {
                    self.apply(&TransportAction::SetLoading(true)).await;
                    self.start_play(&track).await;
                }
            }
            TransportAction::Seek(_) => {
                self.apply(&action).await;
                let position = self.store.session().progress_seconds;
                log_backend_error("seek", self.backend.seek(position).await);
            }
            TransportAction::SetVolume(_)
            | TransportAction::VolumeUp
            | TransportAction::VolumeDown
            | TransportAction::VolumeFineUp
            | TransportAction::VolumeFineDown => {
                self.apply(&action).await;
                let volume = self.store.session().volume;
                log_backend_error("set_volume", self.backend.set_volume(volume).await);
            }
            TransportAction::SetSpeed(_) => {
                self.apply(&action).await;
                let speed = self.store.session().speed;
                log_backend_error("set_speed", self.backend.set_speed(speed).await);
            }
            TransportAction::Next
            | TransportAction::Previous
            | TransportAction::SetQueue(_)
            | TransportAction::SetQueuePosition(_)
            | TransportAction::RemoveFromQueue(_) => {
                let before_id = current_id(self.store.session());
                let before_progress = self.store.session().progress_seconds;
                self.apply(&action).await;
                self.follow_current_change(before_id, before_progress).await;
            }
            _ => self.apply(&action).await,
        }
    }

    /// After a queue-navigation action, line the backend up with whatever
    /// track the reducer landed on.
    async fn follow_current_change(&mut self, before_id: Option<String>, before_progress: u64) {
        let session = self.store.session();
        let after_id = current_id(session);

        if after_id == before_id {
            // PREVIOUS past the restart threshold rewinds the same track
            if after_id.is_some() && session.progress_seconds == 0 && before_progress > 0 {
                log_backend_error("seek", self.backend.seek(0).await);
            }
            return;
        }

        if after_id.is_none() {
            log_backend_error("stop", self.backend.stop().await);
            return;
        }

        if session.is_playing {
            if let Some(track) = session.current_track.clone() {
                self.apply(&TransportAction::SetLoading(true)).await;
                self.start_play(&track).await;
            }
        }
    }

    /// Kick off playback of `track`, preferring reattachment to a detached
    /// session when a matching handle exists.
    async fn start_play(&mut self, track: &Track) {
        let generation = self.store.begin_play();
        let session = self.store.session();
        let opts = PlayOptions {
            volume: session.volume,
            speed: session.speed,
        };

        if let Some(handle) = self.pending_handle.take() {
            if handle.track_id == track.id {
                // Consume-once: the recorded handle goes away whether
                // reattachment works or not.
                self.handles.clear();
                let expected = ReattachExpectation {
                    track_id: track.id.clone(),
                    source: handle.source.clone(),
                };
                match self.backend.reattach(&handle, &expected).await {
                    Ok(()) => {
                        self.apply(&TransportAction::SetLoading(false)).await;
                        return;
                    }
                    Err(e) => warn!("reattachment failed, starting fresh: {e}"),
                }
            } else {
                debug!(
                    handle = %handle.track_id,
                    requested = %track.id,
                    "background session handle does not match, discarding"
                );
            }
        }

        retry::spawn_play(
            Arc::clone(&self.backend),
            track.id.clone(),
            opts,
            self.retry,
            generation,
            self.outcome_tx.clone(),
        );
    }

    async fn handle_play_outcome(&mut self, outcome: PlayOutcome) {
        if outcome.generation != self.store.generation() {
            debug!(
                generation = outcome.generation,
                current = self.store.generation(),
                "discarding superseded play outcome"
            );
            return;
        }
        match outcome.result {
            Ok(attempt) => {
                if attempt > 1 {
                    info!(attempt, "playback recovered after retry");
                }
                self.apply(&TransportAction::SetLoading(false)).await;
            }
            Err(message) => {
                let text = format!(
                    "Could not start playback after {} attempts: {message}",
                    self.retry.attempts
                );
                self.apply(&TransportAction::SetError(Some(text))).await;
                self.apply(&TransportAction::SetLoading(false)).await;
                self.apply(&TransportAction::Pause).await;
            }
        }
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Duration(seconds) => {
                self.apply(&TransportAction::SetDuration(seconds)).await;
            }
            BackendEvent::TimePosition(position) => {
                self.last_position_report = Some(Instant::now());
                let seconds = position.max(0.0) as u64;
                // Position pushes arrive faster than once a second; only
                // whole-second changes go out, at most one per wall-clock
                // second regardless of playback speed.
                let throttled = self
                    .last_progress_broadcast
                    .is_some_and(|at| at.elapsed() < PROGRESS_BROADCAST_INTERVAL);
                if seconds != self.store.session().progress_seconds && !throttled {
                    self.last_progress_broadcast = Some(Instant::now());
                    self.apply(&TransportAction::UpdateProgress(seconds)).await;
                }
            }
            BackendEvent::EndOfStream => {
                self.suppress_pause_until = Some(Instant::now() + self.pause_suppression);
                self.advance_after_stream_end().await;
            }
            BackendEvent::Paused(true) => {
                if self
                    .suppress_pause_until
                    .is_some_and(|until| Instant::now() < until)
                {
                    debug!("dropping pause report inside the post-track suppression window");
                } else if self.store.session().is_playing {
                    self.apply(&TransportAction::Pause).await;
                }
            }
            BackendEvent::Paused(false) => {
                let session = self.store.session();
                if !session.is_playing && session.current_track.is_some() {
                    self.apply(&TransportAction::Resume).await;
                }
            }
            BackendEvent::Exited => {
                warn!("audio process exited unexpectedly");
                self.apply(&TransportAction::SetError(Some(
                    "Audio process exited unexpectedly".into(),
                )))
                .await;
                self.apply(&TransportAction::SetLoading(false)).await;
                self.apply(&TransportAction::Pause).await;
            }
        }
    }

    /// The current track finished on its own. Repeat-one restarts it;
    /// otherwise advance, and pause at the end of the queue.
    async fn advance_after_stream_end(&mut self) {
        let session = self.store.session();
        if session.repeat == RepeatMode::One {
            if let Some(track) = session.current_track.clone() {
                self.apply(&TransportAction::Play(track.clone())).await;
                self.start_play(&track).await;
            }
            return;
        }

        let before_id = current_id(session);
        self.apply(&TransportAction::Next).await;

        let session = self.store.session();
        if current_id(session) == before_id {
            let duration = session.duration_seconds;
            self.apply(&TransportAction::UpdateProgress(duration)).await;
            self.apply(&TransportAction::Pause).await;
        } else if let Some(track) = session.current_track.clone() {
            self.apply(&TransportAction::SetLoading(true)).await;
            self.start_play(&track).await;
        }
    }

    /// Timer fallback: only advances progress when the backend has gone
    /// quiet, so live position reports never get double-counted.
    async fn handle_tick(&mut self) {
        let session = self.store.session();
        if !session.is_playing || session.loading {
            return;
        }
        let stale = self
            .last_position_report
            .map_or(true, |at| at.elapsed() > POSITION_STALE_AFTER);
        if stale {
            self.apply(&TransportAction::Tick).await;
        }
    }

    fn apply_config_update(&mut self, map: Map<String, Value>) {
        for (key, value) in map {
            match key.as_str() {
                "retryAttempts" => {
                    if let Some(n) = value.as_u64() {
                        self.retry.attempts = (n as u32).max(1);
                    }
                }
                "retryDelayMs" => {
                    if let Some(ms) = value.as_u64() {
                        self.retry.delay = Duration::from_millis(ms);
                    }
                }
                "pauseSuppressionMs" => {
                    if let Some(ms) = value.as_u64() {
                        self.pause_suppression = Duration::from_millis(ms);
                    }
                }
                "detachOnExit" => {
                    if let Some(flag) = value.as_bool() {
                        self.detach_on_exit = flag;
                    }
                }
                other => debug!("ignoring unknown config key '{other}'"),
            }
        }
    }

    /// Stop observing the audio process without stopping it. The handle is
    /// recorded on disk and kept in memory, so the next matching play
    /// (this run or a later one) reattaches instead of double-starting
    /// the track.
    async fn detach(&mut self) {
        let Some(track) = self.store.session().current_track.clone() else {
            warn!("nothing to detach, no current track");
            return;
        };
        let source = self.backend.current_track_id().await;
        let source = if source.is_empty() { track.id.clone() } else { source };

        match self.backend.shutdown(true).await {
            Ok(Some(socket_path)) => {
                let handle = BackgroundSessionHandle::new(socket_path, source, track.id);
                if let Err(e) = self.handles.store(&handle) {
                    warn!("could not record background session handle: {e}");
                }
                self.pending_handle = Some(handle);
                self.apply(&TransportAction::Pause).await;
                self.apply(&TransportAction::SetLoading(false)).await;
                info!("detached, the audio process keeps playing in the background");
            }
            Ok(None) => warn!("backend had no session to detach"),
            Err(e) => warn!("detach failed: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        let session = self.store.session();
        let detach =
            self.detach_on_exit && session.is_playing && session.current_track.is_some();
        let detached_track = session.current_track.clone();

        match self.backend.shutdown(detach).await {
            Ok(Some(socket_path)) => {
                if let Some(track) = detached_track {
                    let source = self.backend.current_track_id().await;
                    let source = if source.is_empty() { track.id.clone() } else { source };
                    let handle = BackgroundSessionHandle::new(socket_path, source, track.id);
                    if let Err(e) = self.handles.store(&handle) {
                        warn!("could not record background session handle: {e}");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("backend shutdown failed: {e}"),
        }

        self.persistence.flush_sync();
    }
}

fn current_id(session: &Session) -> Option<String> {
    session.current_track.as_ref().map(|t| t.id.clone())
}

/// Progress-only actions ride the debounce; presentation-only actions are
/// never persisted at all.
fn persistence_kind(action: &TransportAction) -> Option<SaveKind> {
    match action {
        TransportAction::UpdateProgress(_)
        | TransportAction::Tick
        | TransportAction::Seek(_)
        | TransportAction::SetDuration(_) => Some(SaveKind::Progress),
        TransportAction::SetLoading(_)
        | TransportAction::SetError(_)
        | TransportAction::Unknown => None,
        _ => Some(SaveKind::Structural),
    }
}

fn log_backend_error(what: &str, result: crate::error::Result<()>) {
    if let Err(e) = result {
        warn!("backend {what} failed: {e}");
    }
}

async fn recv_some<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    rx.recv().await
}

async fn recv_event(
    events: &mut Option<mpsc::Receiver<BackendEvent>>,
) -> Option<BackendEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, PlayScript};
    use tempfile::TempDir;

    struct Rig {
        tx: mpsc::Sender<CoordinatorMsg>,
        snapshot: Arc<RwLock<Session>>,
        backend: Arc<MockBackend>,
        _dir: TempDir,
    }

    fn start(backend: Arc<MockBackend>, initial: Session, detach_on_exit: bool) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        start_in(backend, initial, detach_on_exit, dir)
    }

    fn start_in(
        backend: Arc<MockBackend>,
        initial: Session,
        detach_on_exit: bool,
        dir: TempDir,
    ) -> Rig {
        let snapshot = Arc::new(RwLock::new(initial.clone()));
        let opts = CoordinatorOptions {
            initial,
            backend: backend.clone(),
            persistence: SessionPersistence::new(
                dir.path().join("session.json"),
                Duration::from_millis(50),
            ),
            hub: StateBroadcaster::new(32),
            snapshot: snapshot.clone(),
            handles: HandleStore::new(dir.path().join("background.json")),
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            pause_suppression: Duration::from_millis(200),
            detach_on_exit,
        };
        let (coordinator, tx) = SessionCoordinator::new(opts);
        tokio::spawn(coordinator.run());
        Rig {
            tx,
            snapshot,
            backend,
            _dir: dir,
        }
    }

    fn track(id: &str) -> Track {
        Track::new(id, id.to_uppercase())
    }

    fn playing(ids: &[&str]) -> Session {
        let queue: Vec<Track> = ids.iter().map(|id| track(id)).collect();
        Session {
            current_track: queue.first().cloned(),
            queue,
            is_playing: true,
            duration_seconds: 180,
            ..Session::default()
        }
    }

    async fn wait_for(
        snapshot: &Arc<RwLock<Session>>,
        what: &str,
        pred: impl Fn(&Session) -> bool,
    ) -> Session {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let session = snapshot.read().await.clone();
            if pred(&session) {
                return session;
            }
            assert!(
                Instant::now() < deadline,
                "never reached '{what}'; last state: {session:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn exhausted_play_reports_attempt_count() {
        let backend = Arc::new(MockBackend::new());
        backend.script_play((0..3).map(|_| PlayScript::fail("unreachable")));
        let rig = start(backend.clone(), Session::default(), false);

        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("a"))))
            .await
            .unwrap();

        let session = wait_for(&rig.snapshot, "play failure surfaced", |s| {
            s.last_error.is_some() && !s.loading
        })
        .await;
        let error = session.last_error.unwrap();
        assert!(error.contains('3'), "error should name the budget: {error}");
        assert!(!session.is_playing);
        assert_eq!(backend.play_count(), 3);
    }

    #[tokio::test]
    async fn superseding_play_discards_the_stale_outcome() {
        let backend = Arc::new(MockBackend::new());
        // First request fails slowly, second succeeds right away.
        backend.script_play([
            PlayScript::fail("slow failure").after(Duration::from_millis(30)),
            PlayScript::fail("slow failure").after(Duration::from_millis(30)),
            PlayScript::fail("slow failure").after(Duration::from_millis(30)),
            PlayScript::ok(),
        ]);
        let rig = start(backend.clone(), Session::default(), false);

        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("a"))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("b"))))
            .await
            .unwrap();

        let session = wait_for(&rig.snapshot, "second play settled", |s| {
            !s.loading && s.current_track.as_ref().is_some_and(|t| t.id == "b")
        })
        .await;
        // Give the stale attempt loop time to finish failing.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let session = rig.snapshot.read().await.clone();
        assert!(session.last_error.is_none(), "stale failure leaked: {session:?}");
        assert!(session.is_playing);
    }

    #[tokio::test]
    async fn end_of_stream_advances_and_suppresses_spurious_pause() {
        let backend = Arc::new(MockBackend::new());
        let rig = start(backend.clone(), playing(&["a", "b"]), false);

        backend.emit(BackendEvent::EndOfStream).await;
        backend.emit(BackendEvent::Paused(true)).await;

        let session = wait_for(&rig.snapshot, "advanced to b", |s| {
            s.current_track.as_ref().is_some_and(|t| t.id == "b")
        })
        .await;
        assert!(session.is_playing, "suppressed pause flipped the transport");
        assert_eq!(session.queue_position, 1);
    }

    #[tokio::test]
    async fn end_of_queue_parks_at_full_duration() {
        let backend = Arc::new(MockBackend::new());
        let rig = start(backend.clone(), playing(&["a"]), false);

        backend.emit(BackendEvent::EndOfStream).await;

        let session = wait_for(&rig.snapshot, "parked", |s| !s.is_playing).await;
        assert_eq!(session.progress_seconds, session.duration_seconds);
        assert_eq!(session.queue_position, 0);
    }

    #[tokio::test]
    async fn repeat_one_restarts_the_same_track() {
        let backend = Arc::new(MockBackend::new());
        let mut initial = playing(&["a", "b"]);
        initial.repeat = RepeatMode::One;
        let rig = start(backend.clone(), initial, false);

        backend.emit(BackendEvent::EndOfStream).await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.play_count() == 0 {
            assert!(Instant::now() < deadline, "track was never restarted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let session = wait_for(&rig.snapshot, "restart settled", |s| !s.loading).await;
        assert!(session.is_playing);
        assert!(session.current_track.as_ref().is_some_and(|t| t.id == "a"));
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn matching_handle_is_reattached_instead_of_played() {
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let handles = HandleStore::new(dir.path().join("background.json"));
        handles
            .store(&BackgroundSessionHandle::new(
                "/tmp/old.sock".into(),
                "a".into(),
                "a".into(),
            ))
            .unwrap();

        let rig = start_in(backend.clone(), Session::default(), false, dir);
        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("a"))))
            .await
            .unwrap();

        wait_for(&rig.snapshot, "reattached", |s| s.is_playing && !s.loading).await;
        assert_eq!(backend.play_count(), 0);
        assert!(rig.backend.calls().iter().any(|c| c.starts_with("reattach:")));
    }

    #[tokio::test]
    async fn failed_reattachment_falls_back_to_fresh_play() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_reattach("process is gone");
        let dir = tempfile::tempdir().unwrap();
        let handles = HandleStore::new(dir.path().join("background.json"));
        handles
            .store(&BackgroundSessionHandle::new(
                "/tmp/old.sock".into(),
                "a".into(),
                "a".into(),
            ))
            .unwrap();

        let rig = start_in(backend.clone(), Session::default(), false, dir);
        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("a"))))
            .await
            .unwrap();

        wait_for(&rig.snapshot, "played fresh", |s| s.is_playing && !s.loading).await;
        assert_eq!(backend.play_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_with_detach_records_a_handle() {
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let handle_path = dir.path().join("background.json");
        let rig = start_in(backend.clone(), playing(&["a"]), true, dir);

        rig.tx.send(CoordinatorMsg::Shutdown).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle_path.exists() {
            assert!(Instant::now() < deadline, "handle file never appeared");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let handle: BackgroundSessionHandle =
            serde_json::from_str(&std::fs::read_to_string(&handle_path).unwrap()).unwrap();
        assert_eq!(handle.track_id, "a");
        assert!(rig
            .backend
            .calls()
            .contains(&"shutdown:detach=true".to_string()));
    }

    #[tokio::test]
    async fn detach_command_records_handle_and_stops_observing() {
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let handle_path = dir.path().join("background.json");
        let rig = start_in(backend.clone(), playing(&["a"]), false, dir);

        rig.tx.send(CoordinatorMsg::Detach).await.unwrap();

        let session = wait_for(&rig.snapshot, "detached", |s| !s.is_playing).await;
        assert_eq!(session.current_track.as_ref().unwrap().id, "a");
        let handle: BackgroundSessionHandle =
            serde_json::from_str(&std::fs::read_to_string(&handle_path).unwrap()).unwrap();
        assert_eq!(handle.track_id, "a");
        assert!(rig
            .backend
            .calls()
            .contains(&"shutdown:detach=true".to_string()));
    }

    #[tokio::test]
    async fn play_after_detach_reattaches_and_consumes_the_handle() {
        let backend = Arc::new(MockBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let handle_path = dir.path().join("background.json");
        let rig = start_in(backend.clone(), playing(&["a"]), false, dir);

        rig.tx.send(CoordinatorMsg::Detach).await.unwrap();
        wait_for(&rig.snapshot, "detached", |s| !s.is_playing).await;

        rig.tx
            .send(CoordinatorMsg::Command(TransportAction::Play(track("a"))))
            .await
            .unwrap();
        wait_for(&rig.snapshot, "reattached", |s| s.is_playing && !s.loading).await;

        assert_eq!(backend.play_count(), 0);
        assert!(rig.backend.calls().iter().any(|c| c.starts_with("reattach:")));
        assert!(!handle_path.exists(), "handle must be consumed once");
    }

    #[tokio::test]
    async fn fast_position_reports_broadcast_at_most_once_per_second() {
        let backend = Arc::new(MockBackend::new());
        let rig = start(backend.clone(), playing(&["a"]), false);

        // Reports arriving faster than wall-clock seconds, as they do at
        // elevated playback speed.
        backend.emit(BackendEvent::TimePosition(1.2)).await;
        backend.emit(BackendEvent::TimePosition(2.4)).await;
        backend.emit(BackendEvent::TimePosition(3.6)).await;

        wait_for(&rig.snapshot, "first report applied", |s| {
            s.progress_seconds == 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rig.snapshot.read().await.progress_seconds, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        backend.emit(BackendEvent::TimePosition(4.8)).await;
        wait_for(&rig.snapshot, "gate reopened", |s| s.progress_seconds == 4).await;
    }

    #[tokio::test]
    async fn backend_exit_surfaces_error_and_pauses() {
        let backend = Arc::new(MockBackend::new());
        let rig = start(backend.clone(), playing(&["a"]), false);

        backend.emit(BackendEvent::Exited).await;

        let session = wait_for(&rig.snapshot, "exit surfaced", |s| !s.is_playing).await;
        assert!(session
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("exited")));
    }

    #[tokio::test]
    async fn duration_and_position_reports_update_state() {
        let backend = Arc::new(MockBackend::new());
        let rig = start(backend.clone(), playing(&["a"]), false);

        backend.emit(BackendEvent::Duration(240)).await;
        backend.emit(BackendEvent::TimePosition(12.7)).await;

        let session = wait_for(&rig.snapshot, "position applied", |s| {
            s.progress_seconds == 12
        })
        .await;
        assert_eq!(session.duration_seconds, 240);
    }
}
