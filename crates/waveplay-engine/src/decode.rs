//! File decoding on top of symphonia.
//!
//! [`AudioFileReader`] is a pull-style reader: the file worker asks for a
//! bounded number of frames at a time and gets interleaved `f32` samples at
//! the file's native rate. Container probing, codec selection and seeking
//! all live here; the worker never touches symphonia types directly.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecType, Decoder, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::{Hint, ProbeResult};
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};

/// Metadata fields that can be queried from a file without loading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTag {
    Title,
    Artist,
    Album,
    Comment,
    Date,
    Copyright,
    /// Encoder software, when the container records it.
    Software,
    License,
    TrackNumber,
    Genre,
}

impl FileTag {
    fn standard_key(self) -> StandardTagKey {
        match self {
            FileTag::Title => StandardTagKey::TrackTitle,
            FileTag::Artist => StandardTagKey::Artist,
            FileTag::Album => StandardTagKey::Album,
            FileTag::Comment => StandardTagKey::Comment,
            FileTag::Date => StandardTagKey::Date,
            FileTag::Copyright => StandardTagKey::Copyright,
            FileTag::Software => StandardTagKey::Encoder,
            FileTag::License => StandardTagKey::License,
            FileTag::TrackNumber => StandardTagKey::TrackNumber,
            FileTag::Genre => StandardTagKey::Genre,
        }
    }
}

pub struct AudioFileReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    frames: u64,
    codec: String,
    /// Decoded interleaved samples not yet handed to the caller.
    leftover: Vec<f32>,
}

impl AudioFileReader {
    /// Probe `path` and stand up a decoder for its default audio track.
    pub fn open(path: &Path) -> Result<AudioFileReader> {
        let probed = probe_file(path)?;
        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("{}: no default audio track", path.display()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let channels = params.channels.map(|c| c.count()).unwrap_or(0);
        if channels == 0 {
            bail!("{}: no audio channels", path.display());
        }
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| anyhow!("{}: unknown sample rate", path.display()))?;
        let frames = params
            .n_frames
            .ok_or_else(|| anyhow!("{}: unknown stream length", path.display()))?;

        let decoder = get_codecs()
            .make(&params, &DecoderOptions::default())
            .with_context(|| format!("{}: unsupported codec", path.display()))?;

        Ok(AudioFileReader {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            frames,
            codec: codec_label(params.codec),
            leftover: Vec::new(),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total frames in the stream, at the native rate.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// Seek to an absolute frame offset. Samples buffered from before the
    /// seek are discarded.
    pub fn seek(&mut self, frame: u64) -> Result<()> {
        let rate = self.sample_rate as u64;
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .with_context(|| format!("seek to frame {frame}"))?;
        self.decoder.reset();
        self.leftover.clear();
        Ok(())
    }

    /// Decode up to `max_frames` frames into `out` (cleared first), returning
    /// the frame count. A short or zero count means end of stream. Corrupt
    /// packets are skipped.
    pub fn read_block(&mut self, max_frames: usize, out: &mut Vec<f32>) -> usize {
        out.clear();
        let want = max_frames * self.channels;
        if want == 0 {
            return 0;
        }

        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(want);
            out.extend(self.leftover.drain(..take));
        }

        while out.len() < want {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                // End of stream, or a container error nothing recovers from.
                Err(_) => break,
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut buf =
                        SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
                    buf.copy_interleaved_ref(decoded);
                    let samples = buf.samples();
                    let take = samples.len().min(want - out.len());
                    out.extend_from_slice(&samples[..take]);
                    self.leftover.extend_from_slice(&samples[take..]);
                }
                Err(err) => {
                    tracing::warn!(%err, "skipping undecodable packet");
                }
            }
        }
        out.len() / self.channels
    }
}

/// Duration of `path` in seconds, from a brief probe without decoding.
pub fn file_duration(path: &Path) -> Result<f32> {
    let probed = probe_file(path)?;
    let track = probed
        .format
        .default_track()
        .ok_or_else(|| anyhow!("{}: no default audio track", path.display()))?;
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("{}: unknown sample rate", path.display()))?;
    let frames = track
        .codec_params
        .n_frames
        .ok_or_else(|| anyhow!("{}: unknown stream length", path.display()))?;
    Ok(frames as f32 / rate as f32)
}

/// Look up one metadata tag from `path`. Returns an empty string when the
/// file carries no such tag.
pub fn file_info(path: &Path, tag: FileTag) -> Result<String> {
    let mut probed = probe_file(path)?;
    let key = tag.standard_key();
    if let Some(value) = tag_value(probed.format.metadata().current(), key) {
        return Ok(value);
    }
    let value = probed
        .metadata
        .get()
        .as_ref()
        .and_then(|m| tag_value(m.current(), key));
    Ok(value.unwrap_or_default())
}

fn tag_value(
    revision: Option<&symphonia::core::meta::MetadataRevision>,
    key: StandardTagKey,
) -> Option<String> {
    revision?
        .tags()
        .iter()
        .find(|t| t.std_key == Some(key))
        .map(|t| t.value.to_string())
}

/// Comma-separated list of file extensions the enabled format readers and
/// codecs cover.
pub fn supported_extensions() -> &'static str {
    "aac,aif,aiff,flac,m4a,mp3,mp4,oga,ogg,wav"
}

fn probe_file(path: &Path) -> Result<ProbeResult> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {}", path.display()))
}

fn codec_label(codec: CodecType) -> String {
    use symphonia::core::codecs::*;
    let name = match codec {
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_U8 => "PCM_U8",
        CODEC_TYPE_PCM_S8 => "PCM_S8",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        CODEC_TYPE_PCM_F64LE | CODEC_TYPE_PCM_F64BE => "PCM_F64",
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_NULL => "NONE",
        _ => "UNKNOWN",
    };
    name.to_string()
}
