//! `waveplay` — play an audio file through JACK.
//!
//! ## Pipeline
//! 1. **Decode**: a background worker uses Symphonia to decode the file into
//!    interleaved `f32`.
//! 2. **Resample**: the same worker uses Rubato to convert to the JACK
//!    sample rate and splits the result into two output legs.
//! 3. **Playback**: the JACK callback drains the legs without blocking.
//!
//! The engine drives a pool of 17 players addressable over MIDI; this
//! utility claims player 0 and plays a single file on it.

mod cli;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use waveplay_engine::decode::{self, FileTag};
use waveplay_engine::engine::Engine;
use waveplay_engine::notify::NotifyCallback;
use waveplay_engine::player::PlayState;
use waveplay_engine::transport::Transport;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,waveplay=info")),
        )
        .init();

    if args.duration {
        println!("{:.3}", decode::file_duration(&args.path)?);
        return Ok(());
    }
    if args.info {
        return print_info(&args.path);
    }

    let engine = Engine::new();
    engine.set_debug(args.debug);
    engine.create_player(0).context("claim player slot")?;
    if let Some(frames) = args.buffer_size {
        engine.set_buffer_size(0, frames);
    }
    if let Some(count) = args.buffer_count {
        engine.set_buffer_count(0, count);
    }

    // The transport must be up first so the file is converted to the
    // server's actual rate.
    let transport = Transport::start(Arc::clone(&engine), &args.client_name)?;

    let callback: NotifyCallback = Arc::new(|handle, field, value| {
        tracing::debug!(handle, ?field, value, "player update");
    });
    engine.load(0, &args.path, Some(callback))?;
    tracing::info!(
        file = %args.path.display(),
        codec = %engine.codec(0),
        channels = engine.channels(0),
        rate = engine.sample_rate(0),
        duration = format!("{:.3}s", engine.duration(0)),
        "loaded"
    );

    engine.set_gain(0, args.gain);
    engine.set_track_a(0, args.track_a);
    engine.set_track_b(0, args.track_b);
    engine.set_src_quality(0, args.quality);
    if args.looping {
        engine.set_loop_start(0, args.loop_start);
        let end = args.loop_end.unwrap_or_else(|| engine.duration(0));
        engine.set_loop_end(0, end);
        engine.enable_loop(0, true);
    }

    engine.start_playback(0);

    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    });

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                tracing::info!("interrupted");
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if engine.playback_state(0) == PlayState::Stopped {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.stop_playback(0);
    // Leave the callback a few periods to render the stop fade.
    thread::sleep(Duration::from_millis(200));
    engine.shutdown();
    drop(transport);
    Ok(())
}

fn print_info(path: &Path) -> Result<()> {
    let duration = decode::file_duration(path)?;
    println!("file       {}", path.display());
    println!("duration   {duration:.3} s");

    let tags = [
        ("title", FileTag::Title),
        ("artist", FileTag::Artist),
        ("album", FileTag::Album),
        ("genre", FileTag::Genre),
        ("track", FileTag::TrackNumber),
        ("date", FileTag::Date),
        ("comment", FileTag::Comment),
        ("copyright", FileTag::Copyright),
        ("software", FileTag::Software),
        ("license", FileTag::License),
    ];
    for (label, tag) in tags {
        let value = decode::file_info(path, tag)?;
        if !value.is_empty() {
            println!("{label:<10} {value}");
        }
    }
    println!("supported  {}", decode::supported_extensions());
    Ok(())
}
