//! Per-slot player state.
//!
//! A [`Player`] is a bundle of atomics shared by three parties: the control
//! API, the file worker that decodes and resamples, and the realtime
//! callback that drains the rings. Scalar fields use relaxed ordering; the
//! three state machines use acquire/release so a state transition publishes
//! the field writes made before it. Floats travel as their bit patterns.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config;
use crate::notify::NotifyCallback;
use crate::resample::Quality;
use crate::ring::SampleRing;

/// Whether a file is attached to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileState {
    Closed = 0,
    Opening = 1,
    Open = 2,
}

impl FileState {
    pub fn from_u8(v: u8) -> FileState {
        match v {
            1 => FileState::Opening,
            2 => FileState::Open,
            _ => FileState::Closed,
        }
    }
}

/// Transport state advanced by the realtime callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayState {
    Stopped = 0,
    Starting = 1,
    Playing = 2,
    Stopping = 3,
}

impl PlayState {
    pub fn from_u8(v: u8) -> PlayState {
        match v {
            1 => PlayState::Starting,
            2 => PlayState::Playing,
            3 => PlayState::Stopping,
            _ => PlayState::Stopped,
        }
    }
}

/// What the file worker is doing, or has been asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadState {
    Idle = 0,
    Seeking = 1,
    Loading = 2,
    Looping = 3,
}

impl ReadState {
    pub fn from_u8(v: u8) -> ReadState {
        match v {
            1 => ReadState::Seeking,
            2 => ReadState::Loading,
            3 => ReadState::Looping,
            _ => ReadState::Idle,
        }
    }
}

/// The two output rings a playing file feeds.
pub(crate) struct Legs {
    pub a: SampleRing,
    pub b: SampleRing,
}

pub struct Player {
    handle: usize,
    pub(crate) occupied: AtomicBool,
    file_state: AtomicU8,
    play_state: AtomicU8,
    read_state: AtomicU8,

    /// Play position in output frames.
    position_out: AtomicU64,
    gain_bits: AtomicU32,
    pitch_bits: AtomicU32,
    pub(crate) pitch_bend: AtomicU16,
    pub(crate) last_note: AtomicU8,

    /// Stream geometry, valid while a file is open.
    channels: AtomicU32,
    native_rate: AtomicU32,
    frames_native: AtomicU64,
    frames_out: AtomicU64,
    ratio_bits: AtomicU64,

    pub(crate) quality: AtomicU8,
    pub(crate) track_a: AtomicI32,
    pub(crate) track_b: AtomicI32,
    pub(crate) buffer_frames: AtomicU32,
    pub(crate) buffer_count: AtomicU32,

    loop_enabled: AtomicBool,
    loop_loaded: AtomicBool,
    loop_start_native: AtomicU64,
    loop_end_native: AtomicU64,
    loop_start_out: AtomicU64,
    loop_end_out: AtomicU64,

    pos_delta_bits: AtomicU32,

    // Last values reported through the notification callback.
    pub(crate) last_play_state: AtomicU8,
    pub(crate) last_position_bits: AtomicU32,
    pub(crate) last_gain_bits: AtomicU32,
    pub(crate) last_loop: AtomicU8,
    pub(crate) last_loop_start_native: AtomicU64,
    pub(crate) last_loop_end_native: AtomicU64,
    pub(crate) last_track_a: AtomicI32,
    pub(crate) last_track_b: AtomicI32,
    pub(crate) last_quality: AtomicU8,
    pub(crate) last_debug: AtomicU8,

    pub(crate) filename: Mutex<String>,
    pub(crate) codec: Mutex<String>,
    pub(crate) legs: Mutex<Option<Arc<Legs>>>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) callback: Mutex<Option<NotifyCallback>>,
}

impl Player {
    pub(crate) fn new(handle: usize) -> Player {
        Player {
            handle,
            occupied: AtomicBool::new(false),
            file_state: AtomicU8::new(FileState::Closed as u8),
            play_state: AtomicU8::new(PlayState::Stopped as u8),
            read_state: AtomicU8::new(ReadState::Idle as u8),
            position_out: AtomicU64::new(0),
            gain_bits: AtomicU32::new(config::DEFAULT_GAIN.to_bits()),
            pitch_bits: AtomicU32::new(1.0f32.to_bits()),
            pitch_bend: AtomicU16::new(config::PITCH_BEND_CENTRE),
            last_note: AtomicU8::new(config::NO_NOTE),
            channels: AtomicU32::new(0),
            native_rate: AtomicU32::new(0),
            frames_native: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            ratio_bits: AtomicU64::new(1.0f64.to_bits()),
            quality: AtomicU8::new(Quality::default().index()),
            track_a: AtomicI32::new(0),
            track_b: AtomicI32::new(0),
            buffer_frames: AtomicU32::new(config::DEFAULT_BUFFER_FRAMES),
            buffer_count: AtomicU32::new(config::DEFAULT_BUFFER_COUNT),
            loop_enabled: AtomicBool::new(false),
            loop_loaded: AtomicBool::new(false),
            loop_start_native: AtomicU64::new(0),
            loop_end_native: AtomicU64::new(config::DEFAULT_BUFFER_FRAMES as u64),
            loop_start_out: AtomicU64::new(0),
            loop_end_out: AtomicU64::new(config::DEFAULT_BUFFER_FRAMES as u64),
            pos_delta_bits: AtomicU32::new(config::DEFAULT_POSITION_DELTA.to_bits()),
            last_play_state: AtomicU8::new(u8::MAX),
            last_position_bits: AtomicU32::new((-1.0f32).to_bits()),
            last_gain_bits: AtomicU32::new((-1.0f32).to_bits()),
            last_loop: AtomicU8::new(u8::MAX),
            last_loop_start_native: AtomicU64::new(u64::MAX),
            last_loop_end_native: AtomicU64::new(u64::MAX),
            last_track_a: AtomicI32::new(i32::MIN),
            last_track_b: AtomicI32::new(i32::MIN),
            last_quality: AtomicU8::new(u8::MAX),
            last_debug: AtomicU8::new(u8::MAX),
            filename: Mutex::new(String::new()),
            codec: Mutex::new(String::new()),
            legs: Mutex::new(None),
            worker: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    /// Restore creation defaults for a slot being handed out again.
    pub(crate) fn reset_defaults(&self) {
        self.set_file_state(FileState::Closed);
        self.set_play_state(PlayState::Stopped);
        self.set_read_state(ReadState::Idle);
        self.set_position_out(0);
        self.set_gain(config::DEFAULT_GAIN);
        self.set_pitch_ratio(1.0);
        self.pitch_bend
            .store(config::PITCH_BEND_CENTRE, Ordering::Relaxed);
        self.last_note.store(config::NO_NOTE, Ordering::Relaxed);
        self.channels.store(0, Ordering::Relaxed);
        self.native_rate.store(0, Ordering::Relaxed);
        self.frames_native.store(0, Ordering::Relaxed);
        self.frames_out.store(0, Ordering::Relaxed);
        self.ratio_bits.store(1.0f64.to_bits(), Ordering::Relaxed);
        self.quality
            .store(Quality::default().index(), Ordering::Relaxed);
        self.track_a.store(0, Ordering::Relaxed);
        self.track_b.store(0, Ordering::Relaxed);
        self.buffer_frames
            .store(config::DEFAULT_BUFFER_FRAMES, Ordering::Relaxed);
        self.buffer_count
            .store(config::DEFAULT_BUFFER_COUNT, Ordering::Relaxed);
        self.loop_enabled.store(false, Ordering::Relaxed);
        self.loop_loaded.store(false, Ordering::Relaxed);
        self.loop_start_native.store(0, Ordering::Relaxed);
        // Placeholder span until a file defines the real end point.
        self.loop_end_native
            .store(config::DEFAULT_BUFFER_FRAMES as u64, Ordering::Relaxed);
        self.loop_start_out.store(0, Ordering::Relaxed);
        self.loop_end_out
            .store(config::DEFAULT_BUFFER_FRAMES as u64, Ordering::Relaxed);
        self.pos_delta_bits
            .store(config::DEFAULT_POSITION_DELTA.to_bits(), Ordering::Relaxed);
        self.arm_notify_snapshots();
        *self.filename.lock().unwrap() = String::new();
        *self.codec.lock().unwrap() = String::new();
    }

    /// Forget every reported value so the next notification pass reports
    /// all fields once.
    pub(crate) fn arm_notify_snapshots(&self) {
        self.last_play_state.store(u8::MAX, Ordering::Relaxed);
        self.last_position_bits
            .store((-1.0f32).to_bits(), Ordering::Relaxed);
        self.last_gain_bits
            .store((-1.0f32).to_bits(), Ordering::Relaxed);
        self.last_loop.store(u8::MAX, Ordering::Relaxed);
        self.last_loop_start_native
            .store(u64::MAX, Ordering::Relaxed);
        self.last_loop_end_native.store(u64::MAX, Ordering::Relaxed);
        self.last_track_a.store(i32::MIN, Ordering::Relaxed);
        self.last_track_b.store(i32::MIN, Ordering::Relaxed);
        self.last_quality.store(u8::MAX, Ordering::Relaxed);
        self.last_debug.store(u8::MAX, Ordering::Relaxed);
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn file_state(&self) -> FileState {
        FileState::from_u8(self.file_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_file_state(&self, state: FileState) {
        self.file_state.store(state as u8, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.file_state() == FileState::Open
    }

    pub fn play_state(&self) -> PlayState {
        PlayState::from_u8(self.play_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_play_state(&self, state: PlayState) {
        self.play_state.store(state as u8, Ordering::Release);
    }

    pub fn read_state(&self) -> ReadState {
        ReadState::from_u8(self.read_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_read_state(&self, state: ReadState) {
        self.read_state.store(state as u8, Ordering::Release);
    }

    pub fn position_out(&self) -> u64 {
        self.position_out.load(Ordering::Relaxed)
    }

    pub(crate) fn set_position_out(&self, frames: u64) {
        self.position_out.store(frames, Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn pitch_ratio(&self) -> f32 {
        f32::from_bits(self.pitch_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_pitch_ratio(&self, ratio: f32) {
        self.pitch_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    pub fn channels(&self) -> u32 {
        self.channels.load(Ordering::Relaxed)
    }

    pub(crate) fn set_channels(&self, channels: u32) {
        self.channels.store(channels, Ordering::Relaxed);
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn set_native_rate(&self, rate: u32) {
        self.native_rate.store(rate, Ordering::Relaxed);
    }

    /// Stream length in native frames.
    pub fn frames_native(&self) -> u64 {
        self.frames_native.load(Ordering::Relaxed)
    }

    pub(crate) fn set_frames_native(&self, frames: u64) {
        self.frames_native.store(frames, Ordering::Relaxed);
    }

    /// Stream length in output frames, at the current ratio.
    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn ratio(&self) -> f64 {
        f64::from_bits(self.ratio_bits.load(Ordering::Relaxed))
    }

    /// Install a new output/native rate ratio and rescale every output-side
    /// quantity derived from native frames.
    pub(crate) fn apply_ratio(&self, ratio: f64) {
        self.ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
        self.frames_out.store(
            (self.frames_native() as f64 * ratio) as u64,
            Ordering::Relaxed,
        );
        self.recompute_loop_out();
    }

    pub(crate) fn recompute_loop_out(&self) {
        let ratio = self.ratio();
        self.loop_start_out.store(
            (self.loop_start_native() as f64 * ratio) as u64,
            Ordering::Relaxed,
        );
        self.loop_end_out.store(
            (self.loop_end_native() as f64 * ratio) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_loop_enabled(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn loop_loaded(&self) -> bool {
        self.loop_loaded.load(Ordering::Relaxed)
    }

    pub(crate) fn set_loop_loaded(&self, loaded: bool) {
        self.loop_loaded.store(loaded, Ordering::Relaxed);
    }

    pub fn loop_start_native(&self) -> u64 {
        self.loop_start_native.load(Ordering::Relaxed)
    }

    pub(crate) fn set_loop_start_native(&self, frames: u64) {
        self.loop_start_native.store(frames, Ordering::Relaxed);
    }

    pub fn loop_end_native(&self) -> u64 {
        self.loop_end_native.load(Ordering::Relaxed)
    }

    pub(crate) fn set_loop_end_native(&self, frames: u64) {
        self.loop_end_native.store(frames, Ordering::Relaxed);
    }

    pub fn loop_start_out(&self) -> u64 {
        self.loop_start_out.load(Ordering::Relaxed)
    }

    pub fn loop_end_out(&self) -> u64 {
        self.loop_end_out.load(Ordering::Relaxed)
    }

    pub fn position_delta(&self) -> f32 {
        f32::from_bits(self.pos_delta_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_position_delta(&self, seconds: f32) {
        self.pos_delta_bits.store(seconds.to_bits(), Ordering::Relaxed);
    }

    /// Clone the ring pair without blocking. `None` when no file is loaded
    /// or the slot is mid-handover.
    pub(crate) fn try_legs(&self) -> Option<Arc<Legs>> {
        self.legs
            .try_lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_player_holds_creation_defaults() {
        let p = Player::new(3);
        p.reset_defaults();
        assert_eq!(p.handle(), 3);
        assert_eq!(p.file_state(), FileState::Closed);
        assert_eq!(p.play_state(), PlayState::Stopped);
        assert_eq!(p.read_state(), ReadState::Idle);
        assert_eq!(p.gain(), 1.0);
        assert_eq!(p.pitch_ratio(), 1.0);
        assert_eq!(p.quality.load(Ordering::Relaxed), 2);
        assert_eq!(p.buffer_frames.load(Ordering::Relaxed), 48_000);
        assert_eq!(p.buffer_count.load(Ordering::Relaxed), 5);
        assert_eq!(p.loop_start_native(), 0);
        assert_eq!(p.loop_end_native(), 48_000);
        assert!(!p.loop_enabled());
        assert_eq!(p.pitch_bend.load(Ordering::Relaxed), 0x2000);
        assert_eq!(p.last_note.load(Ordering::Relaxed), crate::config::NO_NOTE);
        assert!(p.try_legs().is_none());
    }

    #[test]
    fn apply_ratio_rescales_output_side_quantities() {
        let p = Player::new(0);
        p.reset_defaults();
        p.set_frames_native(1000);
        p.set_loop_start_native(100);
        p.set_loop_end_native(900);
        p.apply_ratio(2.0);
        assert_eq!(p.frames_out(), 2000);
        assert_eq!(p.loop_start_out(), 200);
        assert_eq!(p.loop_end_out(), 1800);
        p.apply_ratio(0.5);
        assert_eq!(p.frames_out(), 500);
        assert_eq!(p.loop_start_out(), 50);
        assert_eq!(p.loop_end_out(), 450);
    }

    #[test]
    fn state_encodings_round_trip_with_fallbacks() {
        assert_eq!(FileState::from_u8(FileState::Open as u8), FileState::Open);
        assert_eq!(FileState::from_u8(200), FileState::Closed);
        assert_eq!(
            PlayState::from_u8(PlayState::Stopping as u8),
            PlayState::Stopping
        );
        assert_eq!(PlayState::from_u8(9), PlayState::Stopped);
        assert_eq!(
            ReadState::from_u8(ReadState::Looping as u8),
            ReadState::Looping
        );
        assert_eq!(ReadState::from_u8(77), ReadState::Idle);
    }

    #[test]
    fn transitions_are_visible_through_typed_accessors() {
        let p = Player::new(0);
        p.set_file_state(FileState::Opening);
        assert_eq!(p.file_state(), FileState::Opening);
        assert!(!p.is_open());
        p.set_file_state(FileState::Open);
        assert!(p.is_open());
        p.set_play_state(PlayState::Starting);
        p.set_read_state(ReadState::Seeking);
        assert_eq!(p.play_state(), PlayState::Starting);
        assert_eq!(p.read_state(), ReadState::Seeking);
    }
}
