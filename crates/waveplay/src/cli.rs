use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "waveplay", version)]
pub struct Args {
    /// Audio file to play
    pub path: PathBuf,

    /// Print stream details and metadata tags, then exit without playing
    #[arg(long)]
    pub info: bool,

    /// Print only the duration in seconds, then exit without playing
    #[arg(long)]
    pub duration: bool,

    /// JACK client name
    #[arg(long, default_value = "waveplay")]
    pub client_name: String,

    /// Playback gain (0.0..=2.0)
    #[arg(long, default_value_t = 1.0)]
    pub gain: f32,

    /// Repeat between the loop markers instead of stopping at the end
    #[arg(long = "loop")]
    pub looping: bool,

    /// Loop start in seconds
    #[arg(long, default_value_t = 0.0)]
    pub loop_start: f32,

    /// Loop end in seconds; defaults to the end of the file
    #[arg(long)]
    pub loop_end: Option<f32>,

    /// Source channel for output A; negative mixes the even channels
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub track_a: i32,

    /// Source channel for output B; negative mixes the odd channels
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub track_b: i32,

    /// Resampler quality, 0 (best) to 4 (cheapest)
    #[arg(long, default_value_t = 2)]
    pub quality: u8,

    /// File read block size in frames
    #[arg(long)]
    pub buffer_size: Option<u32>,

    /// Buffer depth in read blocks (minimum 2)
    #[arg(long)]
    pub buffer_count: Option<u32>,

    /// Log worker state every polling interval
    #[arg(long)]
    pub debug: bool,
}
