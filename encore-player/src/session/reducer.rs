//! Pure session reducer
//!
//! `reduce(state, action) -> state'` is the only place session state
//! changes. It is total (unknown actions are no-ops), deterministic apart
//! from shuffle's random index draw, and never panics: out-of-range
//! requests are absorbed rather than rejected, because a remote observer
//! may race a queue mutation made by another observer.
//!
//! Side effects (backend calls, persistence, broadcast) happen in the
//! coordinator, strictly after the reducer returns.

use encore_common::model::{RepeatMode, Session, VOLUME_FINE_STEP, VOLUME_STEP};
use encore_common::protocol::TransportAction;
use rand::Rng;

/// PREVIOUS restarts the current track instead of moving back once this
/// many seconds have played, guarding against accidental double-skips
/// right after a track starts.
pub const PREVIOUS_RESTART_SECS: u64 = 3;

/// Apply one transport action to a session, producing the next session.
pub fn reduce(mut state: Session, action: &TransportAction) -> Session {
    use TransportAction::*;

    match action {
        Play(track) => {
            // Playing a track that is already queued realigns the position;
            // PLAY never implicitly enqueues.
            if let Some(pos) = state.queue.iter().position(|t| t.id == track.id) {
                state.queue_position = pos;
            }
            state.duration_seconds = track.duration_seconds.unwrap_or(0);
            state.current_track = Some(track.clone());
            state.progress_seconds = 0;
            state.is_playing = true;
            state.loading = true;
            state.last_error = None;
        }

        Pause => state.is_playing = false,

        Resume => {
            if state.current_track.is_some() {
                state.is_playing = true;
            }
        }

        Stop => {
            state.is_playing = false;
            state.loading = false;
            state.current_track = None;
            state.progress_seconds = 0;
            state.duration_seconds = 0;
        }

        Next => return advance(state),
        Previous => return retreat(state),

        Seek(pos) => {
            state.progress_seconds = clamp_progress(*pos, state.duration_seconds);
        }

        SetVolume(v) => state.volume = Session::clamp_volume(*v),
        VolumeUp => {
            state.volume = Session::clamp_volume(state.volume as i64 + VOLUME_STEP as i64)
        }
        VolumeDown => {
            state.volume = Session::clamp_volume(state.volume as i64 - VOLUME_STEP as i64)
        }
        VolumeFineUp => {
            state.volume = Session::clamp_volume(state.volume as i64 + VOLUME_FINE_STEP as i64)
        }
        VolumeFineDown => {
            state.volume = Session::clamp_volume(state.volume as i64 - VOLUME_FINE_STEP as i64)
        }

        SetSpeed(s) => state.speed = Session::clamp_speed(*s),

        ToggleShuffle => state.shuffle = !state.shuffle,
        ToggleRepeat => state.repeat = state.repeat.cycle(),

        SetQueue(tracks) => {
            state.queue = tracks.clone();
            state.queue_position = 0;
            if let Some(first) = state.queue.first() {
                let same = state
                    .current_track
                    .as_ref()
                    .map(|c| c.id == first.id)
                    .unwrap_or(false);
                if !same {
                    state.duration_seconds = first.duration_seconds.unwrap_or(0);
                    state.current_track = Some(first.clone());
                    state.progress_seconds = 0;
                }
            }
        }

        AddToQueue(track) => {
            state.queue.push(track.clone());
            // First entry of a fresh queue also becomes the current track
            // (not playing yet) so position and current stay coherent.
            if state.queue.len() == 1 && state.current_track.is_none() {
                state.queue_position = 0;
                state.duration_seconds = track.duration_seconds.unwrap_or(0);
                state.current_track = Some(track.clone());
                state.progress_seconds = 0;
            }
        }

        RemoveFromQueue(idx) => return remove_from_queue(state, *idx),

        ClearQueue => {
            state.queue.clear();
            state.queue_position = 0;
            // The current track keeps playing; only the queue is gone.
        }

        SetQueuePosition(idx) => {
            // Ignored when out of range: another observer may have just
            // shrunk the queue.
            if *idx < state.queue.len() && *idx != state.queue_position {
                return jump_to(state, *idx);
            }
        }

        UpdateProgress(pos) => {
            state.progress_seconds = clamp_progress(*pos, state.duration_seconds);
        }

        SetDuration(d) => {
            state.duration_seconds = *d;
            state.progress_seconds = clamp_progress(state.progress_seconds, *d);
        }

        Tick => {
            if state.is_playing && state.current_track.is_some() {
                state.progress_seconds += 1;
                if state.duration_seconds > 0 && state.progress_seconds >= state.duration_seconds
                {
                    state.progress_seconds = state.duration_seconds;
                    state.is_playing = false;
                }
            }
        }

        SetLoading(flag) => state.loading = *flag,
        SetError(err) => state.last_error = err.clone(),

        RestoreState(snapshot) => return restore(snapshot.clone()),

        Unknown => {}
    }

    state
}

/// NEXT: shuffle draws a different index, sequential advances, repeat=all
/// wraps at the end, otherwise the last track stays current.
fn advance(state: Session) -> Session {
    if state.queue.is_empty() {
        return state;
    }
    let len = state.queue.len();

    let next_pos = if state.shuffle && len > 1 {
        // Uniform over indices != current. Rejection sampling terminates:
        // len > 1 guarantees at least one other index.
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(0..len);
            if candidate != state.queue_position {
                break candidate;
            }
        }
    } else if state.queue_position + 1 < len {
        state.queue_position + 1
    } else if state.repeat == RepeatMode::All {
        0
    } else {
        return state;
    };

    jump_to(state, next_pos)
}

/// PREVIOUS: restart the current track when it has played a few seconds,
/// otherwise step back one queue entry if one exists.
fn retreat(mut state: Session) -> Session {
    if state.progress_seconds > PREVIOUS_RESTART_SECS && state.current_track.is_some() {
        state.progress_seconds = 0;
        return state;
    }
    if !state.queue.is_empty() && state.queue_position > 0 {
        let pos = state.queue_position - 1;
        return jump_to(state, pos);
    }
    state
}

fn remove_from_queue(mut state: Session, idx: usize) -> Session {
    if idx >= state.queue.len() {
        return state;
    }
    state.queue.remove(idx);

    if state.queue.is_empty() {
        state.queue_position = 0;
        return state;
    }
    if idx < state.queue_position {
        state.queue_position -= 1;
    } else if idx == state.queue_position {
        if state.queue_position >= state.queue.len() {
            state.queue_position = state.queue.len() - 1;
        }
        let replacement = state.queue[state.queue_position].clone();
        let same = state
            .current_track
            .as_ref()
            .map(|c| c.id == replacement.id)
            .unwrap_or(false);
        if !same {
            state.duration_seconds = replacement.duration_seconds.unwrap_or(0);
            state.current_track = Some(replacement);
            state.progress_seconds = 0;
        }
    }
    state
}

/// Move to a queue index and make that entry the current track.
fn jump_to(mut state: Session, pos: usize) -> Session {
    state.queue_position = pos;
    let track = state.queue[pos].clone();
    state.duration_seconds = track.duration_seconds.unwrap_or(0);
    state.current_track = Some(track);
    state.progress_seconds = 0;
    state
}

/// RESTORE_STATE: wholesale replace, normalized. Playback never resumes
/// unattended after a restart.
fn restore(mut snapshot: Session) -> Session {
    snapshot.is_playing = false;
    snapshot.loading = false;
    snapshot.volume = Session::clamp_volume(snapshot.volume as i64);
    snapshot.speed = Session::clamp_speed(snapshot.speed);
    if snapshot.queue.is_empty() {
        snapshot.queue_position = 0;
    } else if snapshot.queue_position >= snapshot.queue.len() {
        snapshot.queue_position = 0;
    }
    snapshot.progress_seconds =
        clamp_progress(snapshot.progress_seconds, snapshot.duration_seconds);
    snapshot
}

fn clamp_progress(pos: u64, duration: u64) -> u64 {
    if duration > 0 {
        pos.min(duration)
    } else {
        pos
    }
}
