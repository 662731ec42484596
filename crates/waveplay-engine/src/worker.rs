//! Per-file worker thread.
//!
//! One worker owns a player's decoder and resampler for the lifetime of a
//! loaded file. It opens the stream, publishes its geometry, then loops:
//! honor a pending seek or loop rewind, decode a block, convert it to the
//! output rate, split it across the two output legs and push it into the
//! rings, throttled by ring space. Every iteration ends with a notification
//! pass and a short sleep, so change reports ride on the worker's cadence.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::config;
use crate::decode::AudioFileReader;
use crate::engine::Engine;
use crate::player::{FileState, Legs, PlayState, Player, ReadState};
use crate::resample::{BlockResampler, Quality};

pub(crate) fn run(engine: Arc<Engine>, handle: usize) {
    let player = engine.slot(handle);
    let path = player.filename.lock().unwrap().clone();

    let mut reader = match AudioFileReader::open(Path::new(&path)) {
        Ok(reader) => reader,
        Err(err) => {
            tracing::error!(handle, file = %path, %err, "failed to open file");
            player.set_file_state(FileState::Closed);
            return;
        }
    };

    let channels = reader.channels();
    player.set_channels(channels as u32);
    player.set_native_rate(reader.sample_rate());
    player.set_frames_native(reader.frames());
    *player.codec.lock().unwrap() = reader.codec().to_string();

    // Fresh stream geometry: position at the head, loop spanning the file.
    player.set_position_out(0);
    player.set_loop_start_native(0);
    player.set_loop_end_native(reader.frames());
    player.set_loop_loaded(false);
    player.set_position_delta(config::DEFAULT_POSITION_DELTA);
    player.set_pitch_ratio(1.0);
    player
        .pitch_bend
        .store(config::PITCH_BEND_CENTRE, Ordering::Relaxed);
    player.set_read_state(ReadState::Seeking);
    player.arm_notify_snapshots();

    let mut ratio = engine.output_rate() as f64 / reader.sample_rate() as f64;
    if ratio <= 0.0 {
        ratio = 1.0;
    }
    player.apply_ratio(ratio);

    let block_frames = player.buffer_frames.load(Ordering::Relaxed) as usize;
    let out_block = ((block_frames as f64 * ratio) as usize).max(1);
    let ring_capacity = out_block * player.buffer_count.load(Ordering::Relaxed) as usize;
    let legs = Arc::new(Legs {
        a: crate::ring::SampleRing::new(ring_capacity),
        b: crate::ring::SampleRing::new(ring_capacity),
    });
    *player.legs.lock().unwrap() = Some(Arc::clone(&legs));
    player.set_file_state(FileState::Open);
    tracing::info!(
        handle,
        file = %path,
        channels,
        rate = reader.sample_rate(),
        frames = reader.frames(),
        codec = reader.codec(),
        "file open"
    );

    let mut converter = Converter::default();
    let mut read_pos: u64 = 0;
    let mut in_buf: Vec<f32> = Vec::new();
    let mut converted: Vec<f32> = Vec::new();
    let mut leg_a: Vec<f32> = Vec::new();
    let mut leg_b: Vec<f32> = Vec::new();

    loop {
        if player.file_state() != FileState::Open {
            break;
        }

        match player.read_state() {
            ReadState::Seeking => {
                // The realtime side discards ring content while we hold this
                // state; wait until both legs are drained before refilling.
                if !wait_for_drain(&engine, player, &legs) {
                    continue;
                }
                player.set_loop_loaded(false);
                let ratio = player.ratio();
                let target =
                    ((player.position_out() as f64 / ratio) as u64).min(reader.frames());
                if let Err(err) = reader.seek(target) {
                    tracing::warn!(handle, target, %err, "seek failed");
                }
                read_pos = target;
                if !converter.prepare(player, channels, block_frames) {
                    continue;
                }
                player.set_read_state(ReadState::Loading);
            }
            ReadState::Looping => {
                let start = player.loop_start_native();
                if let Err(err) = reader.seek(start) {
                    tracing::warn!(handle, start, %err, "loop seek failed");
                }
                read_pos = start;
                player.set_loop_loaded(true);
                if !converter.prepare(player, channels, block_frames) {
                    continue;
                }
                player.set_read_state(ReadState::Loading);
            }
            _ => {}
        }

        if player.read_state() == ReadState::Loading {
            let mut max = block_frames as u64;
            if player.loop_enabled() {
                let end = player.loop_end_native();
                max = max.min(end.saturating_sub(read_pos));
            }
            let got = reader.read_block(max as usize, &mut in_buf);
            read_pos += got as u64;

            if got > 0 {
                converted.clear();
                let samples: &[f32] = match converter.resampler.as_mut() {
                    Some(rs) => {
                        if let Err(err) = rs.process(&in_buf, &mut converted) {
                            tracing::error!(handle, %err, "resampler failed");
                            player.set_file_state(FileState::Closed);
                            continue;
                        }
                        &converted
                    }
                    None => &in_buf,
                };
                demux(
                    samples,
                    channels,
                    player.track_a.load(Ordering::Relaxed),
                    player.track_b.load(Ordering::Relaxed),
                    &mut leg_a,
                    &mut leg_b,
                );
                if !write_legs(&engine, player, &legs, &leg_a, &leg_b) {
                    continue;
                }
            } else {
                // End of the readable span. Flush the converter tail first so
                // the last grains of the file reach the rings.
                if let Some(rs) = converter.resampler.as_mut() {
                    converted.clear();
                    match rs.drain(&mut converted) {
                        Ok(()) if !converted.is_empty() => {
                            demux(
                                &converted,
                                channels,
                                player.track_a.load(Ordering::Relaxed),
                                player.track_b.load(Ordering::Relaxed),
                                &mut leg_a,
                                &mut leg_b,
                            );
                            if !write_legs(&engine, player, &legs, &leg_a, &leg_b) {
                                continue;
                            }
                        }
                        Ok(()) => {}
                        Err(err) => tracing::warn!(handle, %err, "resampler flush failed"),
                    }
                }
                if player.loop_enabled() && !player.loop_loaded() {
                    player.set_read_state(ReadState::Looping);
                } else {
                    player.set_read_state(ReadState::Idle);
                }
            }
        }

        if engine.debug() {
            tracing::debug!(
                handle,
                read_state = ?player.read_state(),
                play_state = ?player.play_state(),
                position = player.position_out(),
                buffered = legs.a.available_to_read(),
                "worker pass"
            );
        }
        engine.notify_all(player);
        thread::sleep(config::POLL_INTERVAL);
    }

    // Unload or open failure past this point: return the slot to its
    // closed shape. A transient ring clone on the realtime side keeps the
    // buffers alive until its period ends.
    player.set_play_state(PlayState::Stopped);
    player.set_read_state(ReadState::Idle);
    player.set_position_out(0);
    *player.callback.lock().unwrap() = None;
    *player.legs.lock().unwrap() = None;
    *player.filename.lock().unwrap() = String::new();
    *player.codec.lock().unwrap() = String::new();
    tracing::info!(handle, file = %path, "file closed");
}

#[derive(Default)]
struct Converter {
    resampler: Option<BlockResampler>,
    ratio: f64,
    quality: u8,
}

impl Converter {
    /// Make the converter match the player's current ratio and quality:
    /// unity ratio drops it, a changed setting rebuilds it, otherwise the
    /// existing filter state is reset for the new stream position. Returns
    /// false after marking the player closed when a rebuild fails.
    fn prepare(&mut self, player: &Player, channels: usize, chunk_frames: usize) -> bool {
        let ratio = player.ratio();
        let quality = player.quality.load(Ordering::Relaxed);
        if ratio == 1.0 {
            self.resampler = None;
        } else if self.resampler.is_none() || self.ratio != ratio || self.quality != quality {
            let level = Quality::from_index(quality).unwrap_or_default();
            match BlockResampler::new(ratio, channels, chunk_frames, level) {
                Ok(rs) => self.resampler = Some(rs),
                Err(err) => {
                    tracing::error!(handle = player.handle(), %err, "cannot build resampler");
                    player.set_file_state(FileState::Closed);
                    return false;
                }
            }
        } else if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
        self.ratio = ratio;
        self.quality = quality;
        true
    }
}

/// Block until the realtime side has discarded both legs, keeping the
/// notification cadence alive. False when the file closed mid-wait.
fn wait_for_drain(engine: &Engine, player: &Player, legs: &Legs) -> bool {
    while !(legs.a.is_empty() && legs.b.is_empty()) {
        if player.file_state() != FileState::Open {
            return false;
        }
        engine.notify_all(player);
        thread::sleep(config::POLL_INTERVAL);
    }
    true
}

/// Push matched sample runs into both legs, waiting out back-pressure.
/// Gives up when the file closes; a pending seek abandons the rest of the
/// block since the flush would discard it anyway.
fn write_legs(engine: &Engine, player: &Player, legs: &Legs, a: &[f32], b: &[f32]) -> bool {
    let mut off = 0;
    let total = a.len().min(b.len());
    while off < total {
        if player.file_state() != FileState::Open {
            return false;
        }
        if player.read_state() == ReadState::Seeking {
            return true;
        }
        let room = legs.a.available_to_write().min(legs.b.available_to_write());
        let n = room.min(total - off);
        if n == 0 {
            engine.notify_all(player);
            thread::sleep(config::POLL_INTERVAL);
            continue;
        }
        let wrote_a = legs.a.write(&a[off..off + n]);
        let wrote_b = legs.b.write(&b[off..off + n]);
        if wrote_a < n || wrote_b < n {
            // Cannot happen with a single producer and the room check above.
            tracing::warn!(
                handle = player.handle(),
                want = n,
                wrote_a,
                wrote_b,
                "short ring write; block truncated"
            );
            return true;
        }
        off += n;
    }
    true
}

/// Split interleaved frames into the two output legs. Mono is halved into
/// both; otherwise a non-negative track picks that channel and a negative
/// track averages the even (leg A) or odd (leg B) channels.
fn demux(
    samples: &[f32],
    channels: usize,
    track_a: i32,
    track_b: i32,
    leg_a: &mut Vec<f32>,
    leg_b: &mut Vec<f32>,
) {
    leg_a.clear();
    leg_b.clear();
    if channels <= 1 {
        for &s in samples {
            let half = s * 0.5;
            leg_a.push(half);
            leg_b.push(half);
        }
        return;
    }
    for frame in samples.chunks_exact(channels) {
        leg_a.push(mix_leg(frame, track_a, 0));
        leg_b.push(mix_leg(frame, track_b, 1));
    }
}

fn mix_leg(frame: &[f32], track: i32, parity: usize) -> f32 {
    if track < 0 {
        let mut sum = 0.0;
        let mut count = 0u32;
        let mut ch = parity;
        while ch < frame.len() {
            sum += frame[ch];
            count += 1;
            ch += 2;
        }
        if count > 0 { sum / count as f32 } else { 0.0 }
    } else {
        frame.get(track as usize).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_splits_half_into_each_leg() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        demux(&[0.8, -0.4], 1, -1, -1, &mut a, &mut b);
        assert_eq!(a, vec![0.4, -0.2]);
        assert_eq!(b, vec![0.4, -0.2]);
    }

    #[test]
    fn four_channels_average_by_parity() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        demux(&[0.1, 0.2, 0.3, 0.4], 4, -1, -1, &mut a, &mut b);
        assert!((a[0] - 0.2).abs() < 1e-6);
        assert!((b[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn three_channels_average_what_exists() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        demux(&[0.3, 0.5, 0.9], 3, -1, -1, &mut a, &mut b);
        assert!((a[0] - 0.6).abs() < 1e-6);
        assert!((b[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn explicit_tracks_pick_single_channels() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        demux(&[0.1, 0.2, 0.3, 0.4], 4, 3, 0, &mut a, &mut b);
        assert_eq!(a, vec![0.4]);
        assert_eq!(b, vec![0.1]);
    }

    #[test]
    fn out_of_range_track_yields_silence() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        demux(&[0.1, 0.2], 2, 7, -1, &mut a, &mut b);
        assert_eq!(a, vec![0.0]);
        assert_eq!(b, vec![0.2]);
    }
}
