//! Realtime output and MIDI paths.
//!
//! Everything here runs inside the transport's process callback, so it
//! never blocks, allocates or logs: ring reads, atomic state moves and a
//! single try-lock to clone the ring handles. Unplayable situations (no
//! player, no file, worker mid-seek) degrade to silence for the period.

use std::sync::atomic::Ordering;

use crate::config;
use crate::engine::Engine;
use crate::midi::{self, MidiEvent};
use crate::player::{PlayState, ReadState};
use crate::ring::SampleRing;

pub(crate) fn process_player(engine: &Engine, handle: usize, out_a: &mut [f32], out_b: &mut [f32]) {
    let mut emitted = 0usize;

    if let Some(player) = engine.occupied_open(handle) {
        if let Some(legs) = player.try_legs() {
            let frames = out_a.len().min(out_b.len());
            let seeking = player.read_state() == ReadState::Seeking;
            if seeking {
                // Flush stale audio so the worker can refill from the new
                // position; this period plays silence.
                legs.a.reset();
                legs.b.reset();
            } else if player.play_state() == PlayState::Starting {
                player.set_play_state(PlayState::Playing);
            }

            let state = player.play_state();
            if !seeking && (state == PlayState::Playing || state == PlayState::Stopping) {
                let pitch = player.pitch_ratio();
                let drained;
                if pitch != 1.0 {
                    let (e, d) = varispeed_read(
                        &legs.a,
                        &legs.b,
                        &mut out_a[..frames],
                        &mut out_b[..frames],
                        pitch,
                    );
                    emitted = e;
                    drained = d;
                } else {
                    let want = legs
                        .a
                        .available_to_read()
                        .min(legs.b.available_to_read())
                        .min(frames);
                    let got_a = legs.a.read(&mut out_a[..want]);
                    let got_b = legs.b.read(&mut out_b[..want]);
                    emitted = got_a.min(got_b);
                    drained = emitted;
                }

                let gain = player.gain();
                for s in &mut out_a[..emitted] {
                    *s *= gain;
                }
                for s in &mut out_b[..emitted] {
                    *s *= gain;
                }

                let pos = player.position_out() + drained as u64;
                player.set_position_out(pos);

                let ended = player.read_state() == ReadState::Idle
                    && legs.a.is_empty()
                    && legs.b.is_empty();
                if player.loop_enabled() {
                    let start = player.loop_start_out();
                    let end = player.loop_end_out();
                    if (end > start && pos >= end) || ended {
                        let span = end.saturating_sub(start);
                        let wrapped = if span > 0 && pos > start {
                            start + (pos - start) % span
                        } else {
                            start
                        };
                        player.set_position_out(wrapped);
                        player.set_loop_loaded(false);
                        player.set_read_state(ReadState::Looping);
                    }
                } else if pos >= player.frames_out() || ended {
                    player.set_position_out(0);
                    player.set_play_state(PlayState::Stopping);
                    player.set_read_state(ReadState::Seeking);
                }
            }

            if player.play_state() == PlayState::Stopping {
                fade_out(&mut out_a[..emitted], &mut out_b[..emitted]);
                player.set_play_state(PlayState::Stopped);
            }
        }
    }

    for s in &mut out_a[emitted..] {
        *s = 0.0;
    }
    for s in &mut out_b[emitted..] {
        *s = 0.0;
    }
}

/// Read both legs at a fractional rate. Each source sample is held for
/// `ratio` output samples: the emit cursor copies the current ring front
/// without consuming it, then source samples are dropped until the span
/// they cover catches up with the cursor. Returns (frames emitted, frames
/// drained); the caller advances the play position by the drained count.
/// Stops early if either ring empties.
pub(crate) fn varispeed_read(
    ring_a: &SampleRing,
    ring_b: &SampleRing,
    out_a: &mut [f32],
    out_b: &mut [f32],
    ratio: f32,
) -> (usize, usize) {
    let frames = out_a.len().min(out_b.len());
    let mut emitted = 0usize;
    let mut drained = 0usize;
    let mut covered = 0.0f32;
    let mut sa = [0.0f32];
    let mut sb = [0.0f32];
    'fill: while emitted < frames {
        if ring_a.peek(&mut sa) == 0 || ring_b.peek(&mut sb) == 0 {
            break;
        }
        out_a[emitted] = sa[0];
        out_b[emitted] = sb[0];
        while covered < emitted as f32 {
            covered += ratio;
            if ring_a.read(&mut sa) == 0 || ring_b.read(&mut sb) == 0 {
                emitted += 1;
                break 'fill;
            }
            drained += 1;
        }
        emitted += 1;
    }
    (emitted, drained)
}

/// Linear fade applied to the final period before a player stops.
pub(crate) fn fade_out(a: &mut [f32], b: &mut [f32]) {
    let n = a.len().min(b.len());
    for i in 0..n {
        let g = 1.0 - i as f32 / n as f32;
        a[i] *= g;
        b[i] *= g;
    }
}

pub(crate) fn process_midi(engine: &Engine, bytes: &[u8]) {
    let Some(event) = MidiEvent::parse(bytes) else {
        return;
    };
    let handle = event.channel() as usize;
    let Some(player) = engine.occupied_open(handle) else {
        return;
    };
    match event {
        MidiEvent::NoteOn { note, .. } => {
            player.set_pitch_ratio(midi::note_to_ratio(note));
            player.set_position_out(player.loop_start_out());
            player.set_read_state(ReadState::Seeking);
            if let Some(legs) = player.try_legs() {
                legs.a.reset();
                legs.b.reset();
            }
            player.last_note.store(note, Ordering::Relaxed);
            player.set_play_state(PlayState::Starting);
        }
        MidiEvent::NoteOff { note, .. } => {
            // Only the note that started playback may stop it.
            if player.last_note.load(Ordering::Relaxed) == note {
                if player.play_state() != PlayState::Stopped {
                    player.set_play_state(PlayState::Stopping);
                }
                player.set_pitch_ratio(1.0);
                player.last_note.store(config::NO_NOTE, Ordering::Relaxed);
            }
        }
        MidiEvent::PitchBend { value, .. } => {
            player.pitch_bend.store(value, Ordering::Relaxed);
        }
        #[cfg(feature = "midi-cc")]
        MidiEvent::ControlChange {
            controller, value, ..
        } => control_change(engine, handle, controller, value),
        #[cfg(not(feature = "midi-cc"))]
        MidiEvent::ControlChange { .. } => {}
    }
}

/// CC control surface, scaled the way the hardware-facing build expects:
/// continuous controllers sweep the whole file, CC7 maps 0..=127 onto
/// 0.0..=1.27 gain, and the two switches act on the 63/64 boundary.
#[cfg(feature = "midi-cc")]
fn control_change(engine: &Engine, handle: usize, controller: u8, value: u8) {
    let sweep = value as f32 / 127.0;
    match controller {
        1 => engine.set_position(handle, sweep * engine.duration(handle)),
        2 => engine.set_loop_start(handle, sweep * engine.duration(handle)),
        3 => engine.set_loop_end(handle, sweep * engine.duration(handle)),
        7 => {
            engine.set_gain(handle, value as f32 / 100.0);
        }
        68 => {
            if value > 63 {
                engine.start_playback(handle);
            } else {
                engine.stop_playback(handle);
            }
        }
        69 => engine.enable_loop(handle, value > 63),
        _ => {}
    }
}
