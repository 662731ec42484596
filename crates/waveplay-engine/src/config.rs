//! Engine-wide constants and per-player defaults.

use std::time::Duration;

/// Number of player slots the engine manages. Slot indices double as the
/// MIDI channel a player listens on: one slot per channel plus a spare
/// for channel-agnostic tooling.
pub const MAX_PLAYERS: usize = 17;

/// Frames decoded per read block before resampling.
pub const DEFAULT_BUFFER_FRAMES: u32 = 48_000;

/// Ring depth, expressed in output-side read blocks.
pub const DEFAULT_BUFFER_COUNT: u32 = 5;

/// Output sample rate assumed until a transport reports the real one.
pub const DEFAULT_OUTPUT_RATE: u32 = 44_100;

/// Sleep between file worker iterations and blocking polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Gain applied to freshly created players.
pub const DEFAULT_GAIN: f32 = 1.0;

/// Minimum gain movement that triggers a change notification.
pub const GAIN_NOTIFY_TOLERANCE: f32 = 0.01;

/// Default minimum position movement, in seconds, that triggers a change
/// notification.
pub const DEFAULT_POSITION_DELTA: f32 = 0.1;

/// 14-bit pitch-bend centre value.
pub const PITCH_BEND_CENTRE: u16 = 0x2000;

/// Depth of the queue between state changes and the notifier thread.
/// Updates beyond this are dropped rather than blocking the producer.
pub const NOTIFY_QUEUE_DEPTH: usize = 256;

/// Sentinel for "no note is holding this player".
pub const NO_NOTE: u8 = 0xFF;
