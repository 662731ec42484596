//! Change notifications.
//!
//! State changes are reported through a per-player callback, but never from
//! the thread that caused them: producers queue a tagged value on a bounded
//! channel and a dedicated notifier thread invokes the callback. Each field
//! keeps a last-reported snapshot on the player so a pass only reports real
//! movement; position and gain additionally require a minimum delta before
//! they count as moved.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::config;
use crate::player::Player;
use std::sync::atomic::Ordering;

/// Which player property a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyField {
    Transport,
    Position,
    Gain,
    Loop,
    LoopStart,
    LoopEnd,
    TrackA,
    TrackB,
    Quality,
    Debug,
}

/// Callback invoked with (handle, field, value) on the notifier thread.
pub type NotifyCallback = Arc<dyn Fn(usize, NotifyField, f32) + Send + Sync>;

pub(crate) struct NotifyEvent {
    pub handle: usize,
    pub field: NotifyField,
    pub value: f32,
    pub callback: NotifyCallback,
}

/// Start the thread that delivers queued notifications. It exits when every
/// sender is gone.
pub(crate) fn spawn_notifier(rx: Receiver<NotifyEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            (event.callback)(event.handle, event.field, event.value);
        }
    })
}

/// Compare current state against the last-reported snapshots and queue one
/// notification per changed field. `only` restricts the pass to a single
/// field; snapshots update either way, so a targeted report also counts as
/// delivered for the periodic pass.
pub(crate) fn run_pass(
    player: &Player,
    only: Option<NotifyField>,
    output_rate: u32,
    debug: bool,
    tx: &Sender<NotifyEvent>,
) {
    if !player.is_open() {
        return;
    }
    let callback = player.callback.lock().unwrap().clone();
    let handle = player.handle();
    let want = |field: NotifyField| only.is_none() || only == Some(field);
    let emit = |field: NotifyField, value: f32| {
        let Some(cb) = callback.as_ref() else { return };
        let event = NotifyEvent {
            handle,
            field,
            value,
            callback: Arc::clone(cb),
        };
        if tx.try_send(event).is_err() {
            tracing::warn!(handle, ?field, "notification queue full; dropping update");
        }
    };

    // Snapshots move with an atomic swap (or compare-exchange for the
    // delta-gated fields) so that when the worker pass and a targeted pass
    // race, only one of them observes the transition and reports it.
    if want(NotifyField::Transport) {
        let state = player.play_state() as u8;
        if player.last_play_state.swap(state, Ordering::Relaxed) != state {
            emit(NotifyField::Transport, state as f32);
        }
    }

    if want(NotifyField::Position) {
        let seconds = if output_rate > 0 {
            player.position_out() as f32 / output_rate as f32
        } else {
            0.0
        };
        let last_bits = player.last_position_bits.load(Ordering::Relaxed);
        if (seconds - f32::from_bits(last_bits)).abs() >= player.position_delta()
            && player
                .last_position_bits
                .compare_exchange(last_bits, seconds.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            emit(NotifyField::Position, seconds);
        }
    }

    if want(NotifyField::Gain) {
        let gain = player.gain();
        let last_bits = player.last_gain_bits.load(Ordering::Relaxed);
        if (gain - f32::from_bits(last_bits)).abs() >= config::GAIN_NOTIFY_TOLERANCE
            && player
                .last_gain_bits
                .compare_exchange(last_bits, gain.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            emit(NotifyField::Gain, gain);
        }
    }

    if want(NotifyField::Loop) {
        let looping = player.loop_enabled() as u8;
        if player.last_loop.swap(looping, Ordering::Relaxed) != looping {
            emit(NotifyField::Loop, looping as f32);
        }
    }

    // Loop points are tracked in native frames but reported in seconds.
    let native_rate = player.native_rate();
    if want(NotifyField::LoopStart) {
        let start = player.loop_start_native();
        if player.last_loop_start_native.swap(start, Ordering::Relaxed) != start
            && native_rate > 0
        {
            emit(NotifyField::LoopStart, start as f32 / native_rate as f32);
        }
    }

    if want(NotifyField::LoopEnd) {
        let end = player.loop_end_native();
        if player.last_loop_end_native.swap(end, Ordering::Relaxed) != end && native_rate > 0 {
            emit(NotifyField::LoopEnd, end as f32 / native_rate as f32);
        }
    }

    if want(NotifyField::TrackA) {
        let track = player.track_a.load(Ordering::Relaxed);
        if player.last_track_a.swap(track, Ordering::Relaxed) != track {
            emit(NotifyField::TrackA, track as f32);
        }
    }

    if want(NotifyField::TrackB) {
        let track = player.track_b.load(Ordering::Relaxed);
        if player.last_track_b.swap(track, Ordering::Relaxed) != track {
            emit(NotifyField::TrackB, track as f32);
        }
    }

    if want(NotifyField::Quality) {
        let quality = player.quality.load(Ordering::Relaxed);
        if player.last_quality.swap(quality, Ordering::Relaxed) != quality {
            emit(NotifyField::Quality, quality as f32);
        }
    }

    if want(NotifyField::Debug) {
        let flag = debug as u8;
        if player.last_debug.swap(flag, Ordering::Relaxed) != flag {
            emit(NotifyField::Debug, flag as f32);
        }
    }
}
