//! The engine facade: a fixed pool of players and their control surface.
//!
//! Handles index the pool directly and double as MIDI channels. Control
//! calls on a handle with no player, or one with no file where a file is
//! required, are silent no-ops for setters and return zero-ish defaults
//! from getters; only creation, loading and the file helpers report errors.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use crossbeam_channel::Sender;

use crate::config;
use crate::notify::{self, NotifyCallback, NotifyEvent, NotifyField};
use crate::player::{FileState, PlayState, Player, ReadState};
use crate::process;
use crate::resample::Quality;
use crate::worker;

pub struct Engine {
    players: Box<[Player]>,
    output_rate: AtomicU32,
    debug: AtomicBool,
    notify_tx: Sender<NotifyEvent>,
}

impl Engine {
    /// Stand up an engine with an empty pool and a running notifier thread.
    /// The notifier exits on its own once the engine is dropped.
    pub fn new() -> Arc<Engine> {
        let (tx, rx) = crossbeam_channel::bounded(config::NOTIFY_QUEUE_DEPTH);
        let _ = notify::spawn_notifier(rx);
        Arc::new(Engine {
            players: (0..config::MAX_PLAYERS).map(Player::new).collect(),
            output_rate: AtomicU32::new(config::DEFAULT_OUTPUT_RATE),
            debug: AtomicBool::new(false),
            notify_tx: tx,
        })
    }

    pub(crate) fn slot(&self, handle: usize) -> &Player {
        &self.players[handle]
    }

    fn player(&self, handle: usize) -> Option<&Player> {
        self.players
            .get(handle)
            .filter(|p| p.occupied.load(Ordering::Acquire))
    }

    pub(crate) fn occupied_open(&self, handle: usize) -> Option<&Player> {
        self.player(handle).filter(|p| p.is_open())
    }

    /// Claim a pool slot. Fails when the handle is out of range or already
    /// in use.
    pub fn create_player(&self, handle: usize) -> Result<()> {
        let Some(player) = self.players.get(handle) else {
            bail!(
                "player handle {handle} out of range (0..{})",
                config::MAX_PLAYERS
            );
        };
        if player.occupied.swap(true, Ordering::AcqRel) {
            bail!("player {handle} already exists");
        }
        player.reset_defaults();
        tracing::debug!(handle, "player created");
        Ok(())
    }

    /// Release a slot, unloading any file first. Safe to call repeatedly.
    pub fn destroy_player(&self, handle: usize) {
        let Some(player) = self.player(handle) else {
            return;
        };
        self.unload(handle);
        player.occupied.store(false, Ordering::Release);
        tracing::debug!(handle, "player destroyed");
    }

    /// Number of slots currently claimed.
    pub fn player_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.occupied.load(Ordering::Relaxed))
            .count()
    }

    /// Unload every player and release the pool. All workers have been
    /// joined when this returns.
    pub fn shutdown(&self) {
        for handle in 0..self.players.len() {
            self.destroy_player(handle);
        }
    }

    /// Attach a file to a player, replacing whatever was loaded before.
    ///
    /// Blocks until the worker has probed the file. On success the stream
    /// geometry is readable, the worker is filling the rings and `callback`
    /// starts receiving change reports; on failure the player is back in
    /// its closed state.
    pub fn load(
        self: &Arc<Self>,
        handle: usize,
        path: &Path,
        callback: Option<NotifyCallback>,
    ) -> Result<()> {
        if self.player(handle).is_none() {
            bail!("no player at handle {handle}");
        }
        self.unload(handle);

        let player = self.slot(handle);
        player.track_a.store(0, Ordering::Relaxed);
        player.track_b.store(0, Ordering::Relaxed);
        *player.filename.lock().unwrap() = path.display().to_string();
        *player.callback.lock().unwrap() = None;
        player.set_file_state(FileState::Opening);

        let engine = Arc::clone(self);
        let join = match thread::Builder::new()
            .name(format!("waveplay-file-{handle}"))
            .spawn(move || worker::run(engine, handle))
        {
            Ok(join) => join,
            Err(err) => {
                player.set_file_state(FileState::Closed);
                return Err(err).context("spawn file worker");
            }
        };
        *player.worker.lock().unwrap() = Some(join);

        while player.file_state() == FileState::Opening {
            thread::sleep(config::POLL_INTERVAL);
        }
        if player.is_open() {
            *player.callback.lock().unwrap() = callback;
            Ok(())
        } else {
            let worker = player.worker.lock().unwrap().take();
            if let Some(join) = worker {
                let _ = join.join();
            }
            bail!("failed to open {}", path.display());
        }
    }

    /// Detach the current file, if any, and join its worker.
    pub fn unload(&self, handle: usize) {
        let Some(player) = self.player(handle) else {
            return;
        };
        if player.file_state() == FileState::Closed {
            return;
        }
        self.stop_playback(handle);
        player.set_file_state(FileState::Closed);
        let worker = player.worker.lock().unwrap().take();
        if let Some(join) = worker {
            let _ = join.join();
        }
        *player.callback.lock().unwrap() = None;
        *player.filename.lock().unwrap() = String::new();
    }

    /// Writing the loaded file back out is not implemented; always reports
    /// failure.
    pub fn save(&self, _handle: usize, _path: &Path) -> bool {
        false
    }

    pub fn start_playback(&self, handle: usize) {
        let Some(player) = self.player(handle) else {
            return;
        };
        if player.is_open() && player.play_state() != PlayState::Playing {
            player.set_play_state(PlayState::Starting);
            self.notify_field(player, NotifyField::Transport);
        }
    }

    pub fn stop_playback(&self, handle: usize) {
        let Some(player) = self.player(handle) else {
            return;
        };
        if player.play_state() != PlayState::Stopped {
            player.set_play_state(PlayState::Stopping);
            self.notify_field(player, NotifyField::Transport);
        }
    }

    pub fn playback_state(&self, handle: usize) -> PlayState {
        self.occupied_open(handle)
            .map(|p| p.play_state())
            .unwrap_or(PlayState::Stopped)
    }

    /// Current play position in seconds of output time.
    pub fn position(&self, handle: usize) -> f32 {
        let Some(player) = self.occupied_open(handle) else {
            return 0.0;
        };
        let rate = self.output_rate();
        if rate == 0 {
            return 0.0;
        }
        player.position_out() as f32 / rate as f32
    }

    /// Jump to `seconds`. The target is clamped into the loop while looping,
    /// or to the last frame otherwise; the realtime side flushes buffered
    /// audio and the worker refills from the new spot.
    pub fn set_position(&self, handle: usize, seconds: f32) {
        let Some(player) = self.occupied_open(handle) else {
            return;
        };
        let rate = self.output_rate() as f64;
        let mut frames = (seconds.max(0.0) as f64 * rate) as u64;
        if player.loop_enabled() {
            frames = frames.clamp(player.loop_start_out(), player.loop_end_out());
        } else {
            frames = frames.min(player.frames_out().saturating_sub(1));
        }
        player.set_position_out(frames);
        player.set_read_state(ReadState::Seeking);
        self.notify_field(player, NotifyField::Position);
    }

    /// Turn looping on or off. Enabling pulls the position inside the loop
    /// and wakes an idle worker so the loop span is buffered.
    pub fn enable_loop(&self, handle: usize, enable: bool) {
        let Some(player) = self.player(handle) else {
            return;
        };
        player.set_loop_enabled(enable);
        if enable {
            if player.is_open() {
                let rate = self.output_rate().max(1) as f32;
                let pos = player.position_out();
                if pos < player.loop_start_out() {
                    self.set_position(handle, player.loop_start_out() as f32 / rate);
                } else if pos > player.loop_end_out() {
                    self.set_position(handle, player.loop_end_out() as f32 / rate);
                }
            }
            if player.read_state() == ReadState::Idle {
                player.set_read_state(ReadState::Looping);
            }
        }
        self.notify_field(player, NotifyField::Loop);
    }

    pub fn is_looping(&self, handle: usize) -> bool {
        self.player(handle)
            .map(|p| p.loop_enabled())
            .unwrap_or(false)
    }

    /// Loop start in seconds of native file time, clamped to leave at least
    /// one frame of span before the loop end.
    pub fn set_loop_start(&self, handle: usize, seconds: f32) {
        let Some(player) = self.player(handle) else {
            return;
        };
        let rate = player.native_rate() as f64;
        let mut frames = (seconds.max(0.0) as f64 * rate) as u64;
        frames = frames.min(player.loop_end_native().saturating_sub(1));
        player.set_loop_start_native(frames);
        player.recompute_loop_out();
        if player.is_open() && player.position_out() < player.loop_start_out() {
            self.set_position(handle, self.position(handle));
        }
    }

    pub fn loop_start(&self, handle: usize) -> f32 {
        let Some(player) = self.player(handle) else {
            return 0.0;
        };
        let rate = player.native_rate();
        if rate == 0 {
            return 0.0;
        }
        player.loop_start_native() as f32 / rate as f32
    }

    /// Loop end in seconds of native file time, clamped between one frame
    /// past the loop start and the end of the file.
    pub fn set_loop_end(&self, handle: usize, seconds: f32) {
        let Some(player) = self.player(handle) else {
            return;
        };
        let rate = player.native_rate() as f64;
        let mut frames = (seconds.max(0.0) as f64 * rate) as u64;
        frames = frames.max(player.loop_start_native() + 1);
        let total = player.frames_native();
        if total > 0 {
            frames = frames.min(total);
        }
        player.set_loop_end_native(frames);
        player.recompute_loop_out();
        if player.is_open() && player.position_out() > player.loop_end_out() {
            self.set_position(handle, self.position(handle));
        }
    }

    pub fn loop_end(&self, handle: usize) -> f32 {
        let Some(player) = self.player(handle) else {
            return 0.0;
        };
        let rate = player.native_rate();
        if rate == 0 {
            return 0.0;
        }
        player.loop_end_native() as f32 / rate as f32
    }

    /// Set the player gain. Values outside 0.0..=2.0 are rejected.
    pub fn set_gain(&self, handle: usize, gain: f32) -> bool {
        let Some(player) = self.occupied_open(handle) else {
            return false;
        };
        if !(0.0..=2.0).contains(&gain) {
            return false;
        }
        player.set_gain(gain);
        self.notify_field(player, NotifyField::Gain);
        true
    }

    pub fn gain(&self, handle: usize) -> f32 {
        self.occupied_open(handle).map(|p| p.gain()).unwrap_or(0.0)
    }

    /// Source channel for leg A: an index below the file's channel count,
    /// or negative to average the even channels. Triggers a refill so the
    /// change takes effect from the current position.
    pub fn set_track_a(&self, handle: usize, track: i32) {
        let Some(player) = self.occupied_open(handle) else {
            return;
        };
        if track < player.channels() as i32 {
            let track = if player.channels() == 1 { 0 } else { track };
            player.track_a.store(track, Ordering::Relaxed);
            self.set_position(handle, self.position(handle));
            self.notify_field(player, NotifyField::TrackA);
        }
    }

    /// Source channel for leg B; negative averages the odd channels.
    pub fn set_track_b(&self, handle: usize, track: i32) {
        let Some(player) = self.occupied_open(handle) else {
            return;
        };
        if track < player.channels() as i32 {
            let track = if player.channels() == 1 { 0 } else { track };
            player.track_b.store(track, Ordering::Relaxed);
            self.set_position(handle, self.position(handle));
            self.notify_field(player, NotifyField::TrackB);
        }
    }

    pub fn track_a(&self, handle: usize) -> i32 {
        self.occupied_open(handle)
            .map(|p| p.track_a.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn track_b(&self, handle: usize) -> i32 {
        self.occupied_open(handle)
            .map(|p| p.track_b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read block size in frames. Adjustable only while no file is open,
    /// since the rings are sized from it at load time.
    pub fn set_buffer_size(&self, handle: usize, frames: u32) {
        let Some(player) = self.player(handle) else {
            return;
        };
        if player.file_state() == FileState::Closed && frames > 0 {
            player.buffer_frames.store(frames, Ordering::Relaxed);
        }
    }

    pub fn buffer_size(&self, handle: usize) -> u32 {
        self.player(handle)
            .map(|p| p.buffer_frames.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Ring depth in read blocks; at least two so the worker can stay a
    /// block ahead of the output.
    pub fn set_buffer_count(&self, handle: usize, count: u32) {
        let Some(player) = self.player(handle) else {
            return;
        };
        if player.file_state() == FileState::Closed && count > 1 {
            player.buffer_count.store(count, Ordering::Relaxed);
        }
    }

    pub fn buffer_count(&self, handle: usize) -> u32 {
        self.player(handle)
            .map(|p| p.buffer_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Resampler quality for subsequent conversions; 0 is best, 4 cheapest.
    /// The worker adopts the level at its next refill.
    pub fn set_src_quality(&self, handle: usize, quality: u8) -> bool {
        let Some(player) = self.occupied_open(handle) else {
            return false;
        };
        if Quality::from_index(quality).is_none() {
            return false;
        }
        player.quality.store(quality, Ordering::Relaxed);
        self.notify_field(player, NotifyField::Quality);
        true
    }

    pub fn src_quality(&self, handle: usize) -> u8 {
        self.occupied_open(handle)
            .map(|p| p.quality.load(Ordering::Relaxed))
            .unwrap_or(Quality::default().index())
    }

    /// Minimum position movement, in seconds, before a position
    /// notification goes out.
    pub fn set_position_notify_delta(&self, handle: usize, seconds: f32) {
        if let Some(player) = self.player(handle) {
            player.set_position_delta(seconds);
        }
    }

    /// Duration of the loaded file in seconds of native time.
    pub fn duration(&self, handle: usize) -> f32 {
        let Some(player) = self.occupied_open(handle) else {
            return 0.0;
        };
        let rate = player.native_rate();
        if rate == 0 {
            return 0.0;
        }
        player.frames_native() as f32 / rate as f32
    }

    pub fn filename(&self, handle: usize) -> String {
        self.occupied_open(handle)
            .map(|p| p.filename.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Codec label of the loaded stream, e.g. "PCM_S16" or "FLAC".
    pub fn codec(&self, handle: usize) -> String {
        self.occupied_open(handle)
            .map(|p| p.codec.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn channels(&self, handle: usize) -> u32 {
        self.occupied_open(handle)
            .map(|p| p.channels())
            .unwrap_or(0)
    }

    /// Length of the loaded file in native frames.
    pub fn frames(&self, handle: usize) -> u64 {
        self.occupied_open(handle)
            .map(|p| p.frames_native())
            .unwrap_or(0)
    }

    /// Native rate of the loaded file, or the engine output rate when
    /// nothing is loaded.
    pub fn sample_rate(&self, handle: usize) -> u32 {
        match self.occupied_open(handle) {
            Some(player) => player.native_rate(),
            None => self.output_rate(),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate.load(Ordering::Relaxed)
    }

    /// Adopt a new output rate, rescaling every open player's conversion
    /// ratio and output-side bounds. Workers pick the ratio up at their
    /// next refill.
    pub fn set_output_rate(&self, rate: u32) {
        if rate == 0 {
            return;
        }
        self.output_rate.store(rate, Ordering::Relaxed);
        for player in self.players.iter() {
            if !player.occupied.load(Ordering::Relaxed) || !player.is_open() {
                continue;
            }
            let native = player.native_rate();
            if native == 0 {
                continue;
            }
            player.apply_ratio(rate as f64 / native as f64);
        }
    }

    /// Extra per-iteration state traces from the workers. The flag is
    /// engine-wide; each player reports the change through its callback.
    pub fn set_debug(&self, enable: bool) {
        self.debug.store(enable, Ordering::Relaxed);
        tracing::info!(enable, "debug traces toggled");
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Render one period for a player into its two output legs. Realtime
    /// safe.
    pub fn process_player(&self, handle: usize, out_a: &mut [f32], out_b: &mut [f32]) {
        process::process_player(self, handle, out_a, out_b);
    }

    /// React to one raw MIDI message, routed by channel. Realtime safe.
    pub fn process_midi(&self, bytes: &[u8]) {
        process::process_midi(self, bytes);
    }

    pub(crate) fn notify_all(&self, player: &Player) {
        notify::run_pass(player, None, self.output_rate(), self.debug(), &self.notify_tx);
    }

    pub(crate) fn notify_field(&self, player: &Player, field: NotifyField) {
        notify::run_pass(
            player,
            Some(field),
            self.output_rate(),
            self.debug(),
            &self.notify_tx,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn write_wav(
        dir: &tempfile::TempDir,
        name: &str,
        channels: u16,
        rate: u32,
        frames: u32,
        sample: impl Fn(u32, u16) -> i16,
    ) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            for c in 0..channels {
                writer.write_sample(sample(i, c)).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Pump periods until the worker has settled in `Idle`, letting the
    /// realtime side service any pending seek flush.
    fn settle(engine: &Engine, handle: usize) {
        let mut a = vec![0.0f32; 256];
        let mut b = vec![0.0f32; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.slot(handle).read_state() != ReadState::Idle {
            assert!(Instant::now() < deadline, "worker never settled");
            engine.process_player(handle, &mut a, &mut b);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn pool_creation_and_destruction() {
        let engine = Engine::new();
        assert_eq!(engine.player_count(), 0);
        engine.create_player(0).unwrap();
        engine.create_player(16).unwrap();
        assert!(engine.create_player(0).is_err());
        assert!(engine.create_player(17).is_err());
        assert_eq!(engine.player_count(), 2);
        engine.destroy_player(0);
        engine.destroy_player(0);
        assert_eq!(engine.player_count(), 1);
        engine.shutdown();
        assert_eq!(engine.player_count(), 0);
    }

    #[test]
    fn load_exposes_stream_info_and_unload_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 44_100, 4410, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();

        assert_eq!(engine.channels(0), 2);
        assert_eq!(engine.frames(0), 4410);
        assert_eq!(engine.sample_rate(0), 44_100);
        assert!((engine.duration(0) - 0.1).abs() < 1e-3);
        assert_eq!(engine.codec(0), "PCM_S16");
        assert_eq!(engine.filename(0), path.display().to_string());

        engine.unload(0);
        assert_eq!(engine.filename(0), "");
        assert_eq!(engine.channels(0), 0);
        assert_eq!(engine.playback_state(0), PlayState::Stopped);
        assert!(engine.slot(0).try_legs().is_none());
        assert!(engine.slot(0).worker.lock().unwrap().is_none());

        // Unloading again is a no-op.
        engine.unload(0);
        assert_eq!(engine.playback_state(0), PlayState::Stopped);
        engine.shutdown();
    }

    #[test]
    fn load_failure_leaves_player_closed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        assert!(engine.load(0, &dir.path().join("missing.wav"), None).is_err());
        assert_eq!(engine.playback_state(0), PlayState::Stopped);
        assert!(engine.slot(0).worker.lock().unwrap().is_none());
        assert!(engine.load(3, &dir.path().join("missing.wav"), None).is_err());
        engine.shutdown();
    }

    #[test]
    fn gain_round_trips_and_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 1, 44_100, 500, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();

        // Closed player: setter rejected, getter reports zero.
        assert!(!engine.set_gain(0, 0.8));
        assert_eq!(engine.gain(0), 0.0);

        engine.load(0, &path, None).unwrap();
        assert_eq!(engine.gain(0), 1.0);
        assert!(engine.set_gain(0, 0.8));
        assert_eq!(engine.gain(0), 0.8);
        assert!(!engine.set_gain(0, 2.5));
        assert!(!engine.set_gain(0, -0.1));
        assert_eq!(engine.gain(0), 0.8);
        assert!(engine.set_gain(0, 2.0));
        engine.shutdown();
    }

    #[test]
    fn playback_runs_to_the_end_then_fades_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        // Constant half-scale signal so the fade envelope is visible.
        let path = write_wav(&dir, "a.wav", 2, 44_100, 1000, |_, _| 16_384);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();
        settle(&engine, 0);

        engine.start_playback(0);
        assert_eq!(engine.playback_state(0), PlayState::Starting);

        let mut a = vec![0.0f32; 256];
        let mut b = vec![0.0f32; 256];
        let mut fade_seen = false;
        for period in 0..8 {
            engine.process_player(0, &mut a, &mut b);
            if engine.playback_state(0) == PlayState::Stopped {
                // The final period carries the fade: full scale in front,
                // ramping toward silence, zero padding after the stream.
                assert!(period <= 5, "stopped too late");
                assert!((a[0] - 0.5).abs() < 1e-3);
                let tail = 1000 - 256 * period;
                assert!(a[tail - 1].abs() < 0.01);
                assert_eq!(a[tail], 0.0);
                assert!(a[tail / 2] < 0.35);
                fade_seen = true;
                break;
            }
            assert_eq!(engine.playback_state(0), PlayState::Playing);
            for &s in a.iter() {
                assert!((s - 0.5).abs() < 1e-3);
            }
            assert_eq!(a, b);
        }
        assert!(fade_seen, "playback never reached the end");
        assert_eq!(engine.position(0), 0.0);
        engine.shutdown();
    }

    #[test]
    fn looping_wraps_position_and_keeps_playing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 8000, 2000, |i, _| i as i16);
        let engine = Engine::new();
        engine.set_output_rate(8000);
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();

        engine.set_loop_start(0, 0.05);
        engine.set_loop_end(0, 0.15);
        engine.enable_loop(0, true);
        assert!(engine.is_looping(0));
        assert!((engine.loop_start(0) - 0.05).abs() < 1e-3);
        assert!((engine.loop_end(0) - 0.15).abs() < 1e-3);
        settle(&engine, 0);

        // Position was pulled up into the loop span.
        assert!(engine.slot(0).position_out() >= 400);

        engine.start_playback(0);
        let mut a = vec![0.0f32; 256];
        let mut b = vec![0.0f32; 256];
        let mut wraps = 0;
        let mut last_pos = engine.slot(0).position_out();
        for _ in 0..40 {
            engine.process_player(0, &mut a, &mut b);
            let pos = engine.slot(0).position_out();
            assert!(pos >= 400 && pos <= 1200, "position {pos} left the loop");
            if pos < last_pos {
                wraps += 1;
            }
            last_pos = pos;
            assert_ne!(engine.playback_state(0), PlayState::Stopped);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(wraps >= 2, "loop never wrapped (wraps={wraps})");
        engine.shutdown();
    }

    #[test]
    fn track_selection_remixes_multichannel_files() {
        let dir = tempfile::tempdir().unwrap();
        // Per-channel constants: 0.25, -0.25, 0.5, -0.5.
        let levels = [8192i16, -8192, 16_384, -16_384];
        let path = write_wav(&dir, "quad.wav", 4, 44_100, 600, |_, c| levels[c as usize]);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();

        // Fresh loads route channel 0 to both legs.
        assert_eq!(engine.track_a(0), 0);
        assert_eq!(engine.track_b(0), 0);
        settle(&engine, 0);

        engine.set_track_a(0, -1);
        engine.set_track_b(0, -1);
        settle(&engine, 0);
        engine.start_playback(0);
        let mut a = vec![0.0f32; 128];
        let mut b = vec![0.0f32; 128];
        engine.process_player(0, &mut a, &mut b);
        assert!((a[64] - 0.375).abs() < 1e-3, "leg A {}", a[64]);
        assert!((b[64] + 0.375).abs() < 1e-3, "leg B {}", b[64]);
        engine.stop_playback(0);
        engine.process_player(0, &mut a, &mut b);
        wait_until("player stopped", || {
            engine.playback_state(0) == PlayState::Stopped
        });

        engine.set_track_a(0, 2);
        assert_eq!(engine.track_a(0), 2);
        settle(&engine, 0);
        engine.start_playback(0);
        engine.process_player(0, &mut a, &mut b);
        assert!((a[64] - 0.5).abs() < 1e-3, "leg A {}", a[64]);

        // Out-of-range selections are ignored.
        engine.set_track_a(0, 4);
        assert_eq!(engine.track_a(0), 2);
        engine.shutdown();
    }

    #[test]
    fn midi_notes_trigger_and_release_pitched_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 44_100, 2000, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();
        settle(&engine, 0);

        // Octave above middle C: half ratio, double speed. The trigger
        // flushes the rings itself, so the worker refills without help
        // from the output side; pumping before the refill settles would
        // drain frames and shift the position checks below.
        engine.process_midi(&[0x90, 72, 100]);
        assert_eq!(engine.slot(0).pitch_ratio(), 0.5);
        assert_eq!(engine.playback_state(0), PlayState::Starting);
        assert_eq!(engine.slot(0).position_out(), 0);
        wait_until("refill after trigger", || {
            engine.slot(0).read_state() == ReadState::Idle
        });

        let mut a = vec![0.0f32; 256];
        let mut b = vec![0.0f32; 256];
        engine.process_player(0, &mut a, &mut b);
        assert_eq!(engine.playback_state(0), PlayState::Playing);
        // 256 output frames drain two source frames each after the first.
        assert_eq!(engine.slot(0).position_out(), 510);

        // A release for some other note changes nothing.
        engine.process_midi(&[0x80, 60, 0]);
        assert_eq!(engine.playback_state(0), PlayState::Playing);

        engine.process_midi(&[0x80, 72, 0]);
        assert_eq!(engine.playback_state(0), PlayState::Stopping);
        assert_eq!(engine.slot(0).pitch_ratio(), 1.0);
        engine.process_player(0, &mut a, &mut b);
        assert_eq!(engine.playback_state(0), PlayState::Stopped);

        // An octave below holds each source frame for two output frames.
        engine.process_midi(&[0x90, 48, 100]);
        assert_eq!(engine.slot(0).pitch_ratio(), 2.0);
        wait_until("refill after retrigger", || {
            engine.slot(0).read_state() == ReadState::Idle
        });
        engine.process_player(0, &mut a, &mut b);
        assert_eq!(engine.slot(0).position_out(), 128);

        // Pitch bend is recorded but does not steer playback.
        engine.process_midi(&[0xE0, 0x7F, 0x7F]);
        assert_eq!(engine.slot(0).pitch_bend.load(Ordering::Relaxed), 0x3FFF);
        engine.shutdown();
    }

    #[cfg(feature = "midi-cc")]
    #[test]
    fn midi_cc_drives_transport_gain_and_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 44_100, 2000, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();
        settle(&engine, 0);

        engine.process_midi(&[0xB0, 68, 127]);
        assert_eq!(engine.playback_state(0), PlayState::Starting);
        engine.process_midi(&[0xB0, 68, 0]);
        assert_eq!(engine.playback_state(0), PlayState::Stopping);

        engine.process_midi(&[0xB0, 7, 100]);
        assert_eq!(engine.gain(0), 1.0);
        engine.process_midi(&[0xB0, 7, 50]);
        assert_eq!(engine.gain(0), 0.5);

        engine.process_midi(&[0xB0, 69, 127]);
        assert!(engine.is_looping(0));
        engine.process_midi(&[0xB0, 69, 0]);
        assert!(!engine.is_looping(0));
        engine.shutdown();
    }

    #[test]
    fn seek_clamps_to_the_stream_and_reports_the_new_spot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 8000, 2000, |i, _| i as i16);
        let engine = Engine::new();
        engine.set_output_rate(8000);
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();
        settle(&engine, 0);

        engine.set_position(0, 0.1);
        assert_eq!(engine.slot(0).position_out(), 800);
        settle(&engine, 0);

        // Past the end: clamped to the final frame.
        engine.set_position(0, 99.0);
        assert_eq!(engine.slot(0).position_out(), 1999);
        settle(&engine, 0);

        engine.set_position(0, -3.0);
        assert_eq!(engine.slot(0).position_out(), 0);
        engine.shutdown();
    }

    #[test]
    fn loop_bounds_clamp_to_keep_a_valid_span() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 8000, 2000, |i, _| i as i16);
        let engine = Engine::new();
        engine.set_output_rate(8000);
        engine.create_player(0).unwrap();
        engine.load(0, &path, None).unwrap();

        // End beyond the file clamps to its length (0.25 s).
        engine.set_loop_end(0, 99.0);
        assert!((engine.loop_end(0) - 0.25).abs() < 1e-3);

        // Start cannot reach the end.
        engine.set_loop_start(0, 99.0);
        assert_eq!(engine.slot(0).loop_start_native(), 1999);

        // End cannot drop below start + 1.
        engine.set_loop_end(0, 0.0);
        assert_eq!(engine.slot(0).loop_end_native(), 2000);

        engine.set_loop_start(0, 0.0);
        engine.set_loop_end(0, 0.1);
        assert_eq!(engine.slot(0).loop_start_native(), 0);
        assert_eq!(engine.slot(0).loop_end_native(), 800);
        engine.shutdown();
    }

    #[test]
    fn buffer_geometry_is_fixed_while_a_file_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 1, 44_100, 500, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();

        engine.set_buffer_size(0, 1024);
        engine.set_buffer_count(0, 3);
        assert_eq!(engine.buffer_size(0), 1024);
        assert_eq!(engine.buffer_count(0), 3);
        engine.set_buffer_size(0, 0);
        engine.set_buffer_count(0, 1);
        assert_eq!(engine.buffer_size(0), 1024);
        assert_eq!(engine.buffer_count(0), 3);

        engine.load(0, &path, None).unwrap();
        engine.set_buffer_size(0, 2048);
        assert_eq!(engine.buffer_size(0), 1024);
        engine.unload(0);
        engine.set_buffer_size(0, 2048);
        assert_eq!(engine.buffer_size(0), 2048);
        engine.shutdown();
    }

    #[test]
    fn repeated_load_unload_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 44_100, 3000, |i, _| i as i16);
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        // Small rings so some cycles unload while the worker is still
        // blocked on ring space.
        engine.set_buffer_size(0, 256);
        engine.set_buffer_count(0, 2);

        for cycle in 0..10 {
            engine.load(0, &path, None).unwrap();
            assert!(engine.channels(0) > 0, "cycle {cycle}");
            if cycle % 2 == 0 {
                engine.start_playback(0);
            }
            engine.unload(0);
            assert!(engine.slot(0).worker.lock().unwrap().is_none());
            assert!(engine.slot(0).try_legs().is_none());
            assert_eq!(engine.playback_state(0), PlayState::Stopped);
        }
        assert_eq!(engine.player_count(), 1);
        engine.shutdown();
    }

    #[test]
    fn transport_notifications_follow_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 2, 44_100, 1000, |_, _| 8000);
        let engine = Engine::new();
        engine.create_player(0).unwrap();

        let seen: Arc<Mutex<Vec<(NotifyField, f32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: NotifyCallback = Arc::new(move |_, field, value| {
            sink.lock().unwrap().push((field, value));
        });
        engine.load(0, &path, Some(callback)).unwrap();
        settle(&engine, 0);

        let transports = |seen: &Arc<Mutex<Vec<(NotifyField, f32)>>>| -> Vec<f32> {
            seen.lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| *f == NotifyField::Transport)
                .map(|(_, v)| *v)
                .collect()
        };

        engine.start_playback(0);
        wait_until("starting report", || transports(&seen).contains(&1.0));

        let mut a = vec![0.0f32; 128];
        let mut b = vec![0.0f32; 128];
        engine.process_player(0, &mut a, &mut b);
        wait_until("playing report", || transports(&seen).contains(&2.0));

        engine.stop_playback(0);
        wait_until("stopping report", || transports(&seen).contains(&3.0));
        engine.process_player(0, &mut a, &mut b);
        wait_until("stopped report", || transports(&seen).contains(&0.0));

        // A redundant stop adds nothing.
        let before = transports(&seen).len();
        engine.stop_playback(0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(transports(&seen).len(), before);

        let order = transports(&seen);
        let tail: Vec<f32> = order.iter().copied().skip_while(|v| *v == 0.0).collect();
        assert_eq!(tail, vec![1.0, 2.0, 3.0, 0.0]);
        engine.shutdown();
    }

    #[test]
    fn save_is_not_supported() {
        let engine = Engine::new();
        engine.create_player(0).unwrap();
        assert!(!engine.save(0, Path::new("/tmp/out.wav")));
        engine.shutdown();
    }
}
