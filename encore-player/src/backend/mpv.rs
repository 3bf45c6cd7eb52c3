//! mpv child-process adapter
//!
//! Drives an mpv process over its JSON IPC socket. mpv is spawned lazily on
//! the first `play` with `--idle=yes` and a private `--input-ipc-server`
//! socket; all control goes through numbered IPC commands, and state comes
//! back as property-change pushes (`time-pos`, `duration`, `pause`,
//! `path`) plus `end-file` events. No polling.
//!
//! Detach leaves the process running and hands back the socket path, which
//! is what the reattachment protocol later connects to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reattach::BackgroundSessionHandle;

use super::{AudioBackend, BackendEvent, PlayOptions, ReattachExpectation};

// Property observation ids (echoed back in property-change events)
const OBS_TIME_POS: u64 = 1;
const OBS_DURATION: u64 = 2;
const OBS_PAUSE: u64 = 3;
const OBS_PATH: u64 = 4;

/// How long to wait for mpv to answer one IPC command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to keep retrying the socket connect after spawning mpv.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Value>>>>;

struct MpvConnection {
    socket_path: PathBuf,
    /// Our own child process; None when attached to a foreign session.
    child: Option<Child>,
    writer: OwnedWriteHalf,
    pending: PendingMap,
    next_request: u64,
    reader: JoinHandle<()>,
    detached: Arc<AtomicBool>,
}

impl MpvConnection {
    /// Issue one IPC command; returns the receiver for its response.
    async fn send(&mut self, args: Value) -> Result<oneshot::Receiver<Value>> {
        self.next_request += 1;
        let request_id = self.next_request;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("mpv pending lock")
            .insert(request_id, tx);

        let line = serde_json::to_string(&json!({
            "command": args,
            "request_id": request_id,
        }))?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Backend(format!("mpv socket write: {e}")))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Backend(format!("mpv socket write: {e}")))?;
        Ok(rx)
    }
}

impl Drop for MpvConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// mpv-backed [`AudioBackend`] implementation.
pub struct MpvBackend {
    binary: String,
    conn: Mutex<Option<MpvConnection>>,
    event_tx: mpsc::Sender<BackendEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<BackendEvent>>>,
    current_id: Arc<StdMutex<String>>,
}

impl MpvBackend {
    pub fn new() -> Self {
        Self::with_binary("mpv")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            binary: binary.into(),
            conn: Mutex::new(None),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            current_id: Arc::new(StdMutex::new(String::new())),
        }
    }

    /// Run one command against the live connection.
    async fn command(&self, args: Value) -> Result<Value> {
        let rx = {
            let mut guard = self.conn.lock().await;
            let conn = guard
                .as_mut()
                .ok_or_else(|| Error::Backend("no audio process".into()))?;
            conn.send(args).await?
        };
        await_response(rx).await
    }

    async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.command(json!(["set_property", name, value]))
            .await
            .map(|_| ())
    }

    /// Spawn mpv and connect, unless a connection already exists.
    async fn ensure_connection(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let socket_path =
            std::env::temp_dir().join(format!("encore-mpv-{}.sock", std::process::id()));
        // A stale socket from a crashed run would make mpv refuse to bind.
        let _ = std::fs::remove_file(&socket_path);

        let child = Command::new(&self.binary)
            .arg("--idle=yes")
            .arg("--no-video")
            .arg("--no-terminal")
            .arg("--really-quiet")
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::Backend(format!("could not spawn {}: {e}", self.binary)))?;
        info!(socket = %socket_path.display(), "spawned audio process");

        let stream = connect_with_retry(&socket_path).await?;
        let mut conn = self.build_connection(stream, socket_path, Some(child));
        observe_properties(&mut conn).await?;
        *guard = Some(conn);
        Ok(())
    }

    fn build_connection(
        &self,
        stream: UnixStream,
        socket_path: PathBuf,
        child: Option<Child>,
    ) -> MpvConnection {
        let (read_half, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let detached = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(
            read_half,
            Arc::clone(&pending),
            self.event_tx.clone(),
            Arc::clone(&self.current_id),
            Arc::clone(&detached),
        );
        MpvConnection {
            socket_path,
            child,
            writer,
            pending,
            next_request: 0,
            reader,
            detached,
        }
    }
}

impl Default for MpvBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioBackend for MpvBackend {
    async fn play(&self, source: &str, opts: PlayOptions) -> Result<()> {
        self.ensure_connection().await?;
        self.command(json!(["loadfile", source, "replace"])).await?;
        self.set_property("volume", json!(opts.volume)).await?;
        self.set_property("speed", json!(opts.speed)).await?;
        self.set_property("pause", json!(false)).await?;
        *self.current_id.lock().expect("current id lock") = source.to_string();
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.set_property("pause", json!(true)).await
    }

    async fn resume(&self) -> Result<()> {
        self.set_property("pause", json!(false)).await
    }

    async fn stop(&self) -> Result<()> {
        self.current_id.lock().expect("current id lock").clear();
        self.command(json!(["stop"])).await.map(|_| ())
    }

    async fn seek(&self, seconds: u64) -> Result<()> {
        self.command(json!(["seek", seconds, "absolute"]))
            .await
            .map(|_| ())
    }

    async fn set_volume(&self, percent: u8) -> Result<()> {
        self.set_property("volume", json!(percent)).await
    }

    async fn set_speed(&self, speed: f64) -> Result<()> {
        self.set_property("speed", json!(speed)).await
    }

    async fn current_track_id(&self) -> String {
        self.current_id.lock().expect("current id lock").clone()
    }

    async fn reattach(
        &self,
        handle: &BackgroundSessionHandle,
        expected: &ReattachExpectation,
    ) -> Result<()> {
        let stream = UnixStream::connect(&handle.socket_path).await.map_err(|e| {
            Error::Reattach(format!(
                "detached session socket {} unreachable: {e}",
                handle.socket_path.display()
            ))
        })?;

        let mut conn = self.build_connection(stream, handle.socket_path.clone(), None);

        // Verify the process still plays what the handle was recorded for
        // before adopting it.
        let rx = conn.send(json!(["get_property", "path"])).await?;
        let response = await_response(rx).await?;
        let playing = response.as_str().unwrap_or_default();
        if playing != expected.source {
            return Err(Error::Reattach(format!(
                "detached session plays '{playing}', expected '{}'",
                expected.source
            )));
        }

        observe_properties(&mut conn).await?;
        *self.current_id.lock().expect("current id lock") = expected.source.clone();
        *self.conn.lock().await = Some(conn);
        info!(track = %expected.track_id, "reattached to detached audio session");
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<BackendEvent>> {
        self.event_rx.lock().expect("event rx lock").take()
    }

    async fn shutdown(&self, detach: bool) -> Result<Option<PathBuf>> {
        let mut guard = self.conn.lock().await;
        let Some(mut conn) = guard.take() else {
            return Ok(None);
        };

        if detach {
            conn.detached.store(true, Ordering::SeqCst);
            let socket = conn.socket_path.clone();
            // Dropping the connection closes our socket only; the process
            // keeps playing.
            drop(conn);
            info!(socket = %socket.display(), "detached from audio process");
            return Ok(Some(socket));
        }

        conn.detached.store(true, Ordering::SeqCst);
        if let Ok(rx) = conn.send(json!(["quit"])).await {
            let _ = await_response(rx).await;
        }
        if let Some(mut child) = conn.child.take() {
            let _ = child.kill().await;
        }
        Ok(None)
    }
}

async fn await_response(rx: oneshot::Receiver<Value>) -> Result<Value> {
    let response = tokio::time::timeout(COMMAND_TIMEOUT, rx)
        .await
        .map_err(|_| Error::Backend("mpv command timed out".into()))?
        .map_err(|_| Error::Backend("mpv connection closed".into()))?;

    match response.get("error").and_then(Value::as_str) {
        Some("success") => Ok(response.get("data").cloned().unwrap_or(Value::Null)),
        Some(other) => Err(Error::Backend(format!("mpv: {other}"))),
        None => Err(Error::Backend("mpv: malformed response".into())),
    }
}

async fn connect_with_retry(socket_path: &PathBuf) -> Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::Backend(format!(
                        "mpv socket {} never came up: {e}",
                        socket_path.display()
                    )));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn observe_properties(conn: &mut MpvConnection) -> Result<()> {
    for (id, name) in [
        (OBS_TIME_POS, "time-pos"),
        (OBS_DURATION, "duration"),
        (OBS_PAUSE, "pause"),
        (OBS_PATH, "path"),
    ] {
        let rx = conn.send(json!(["observe_property", id, name])).await?;
        await_response(rx).await?;
    }
    Ok(())
}

fn spawn_reader(
    read_half: tokio::net::unix::OwnedReadHalf,
    pending: PendingMap,
    event_tx: mpsc::Sender<BackendEvent>,
    current_id: Arc<StdMutex<String>>,
    detached: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("unparseable mpv message: {e}");
                    continue;
                }
            };

            // Command responses carry the request id we assigned.
            if let Some(id) = msg.get("request_id").and_then(Value::as_u64) {
                let waiter = pending.lock().expect("mpv pending lock").remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                }
                continue;
            }

            let Some(event) = msg.get("event").and_then(Value::as_str) else {
                continue;
            };
            match event {
                "property-change" => {
                    let data = msg.get("data");
                    match msg.get("id").and_then(Value::as_u64) {
                        Some(OBS_TIME_POS) => {
                            if let Some(pos) = data.and_then(Value::as_f64) {
                                let _ = event_tx.send(BackendEvent::TimePosition(pos)).await;
                            }
                        }
                        Some(OBS_DURATION) => {
                            if let Some(secs) = data.and_then(Value::as_f64) {
                                let _ = event_tx
                                    .send(BackendEvent::Duration(secs.round() as u64))
                                    .await;
                            }
                        }
                        Some(OBS_PAUSE) => {
                            if let Some(paused) = data.and_then(Value::as_bool) {
                                let _ = event_tx.send(BackendEvent::Paused(paused)).await;
                            }
                        }
                        Some(OBS_PATH) => {
                            if let Some(path) = data.and_then(Value::as_str) {
                                *current_id.lock().expect("current id lock") = path.to_string();
                            }
                        }
                        _ => {}
                    }
                }
                "end-file" => {
                    let reason = msg.get("reason").and_then(Value::as_str).unwrap_or("");
                    if reason == "eof" {
                        let _ = event_tx.send(BackendEvent::EndOfStream).await;
                    }
                }
                _ => {}
            }
        }

        if !detached.load(Ordering::SeqCst) {
            warn!("audio process connection closed");
            let _ = event_tx.send(BackendEvent::Exited).await;
        }
    })
}
