//! Sample-rate conversion between a file's native rate and the output rate.
//!
//! Wraps a rubato sinc resampler behind a block-oriented API: the file
//! worker feeds whole decoded blocks in and collects however many output
//! frames the converter yields. The converter consumes fixed-size input
//! chunks, so a partial block is staged until enough samples arrive or the
//! stream ends and [`BlockResampler::drain`] flushes the remainder.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Conversion quality levels, ordered best to cheapest. The numeric values
/// form the wire representation used by setters and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Quality {
    Best = 0,
    Medium = 1,
    Fastest = 2,
    ZeroOrderHold = 3,
    Linear = 4,
}

impl Quality {
    pub fn from_index(index: u8) -> Option<Quality> {
        match index {
            0 => Some(Quality::Best),
            1 => Some(Quality::Medium),
            2 => Some(Quality::Fastest),
            3 => Some(Quality::ZeroOrderHold),
            4 => Some(Quality::Linear),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Sinc length, oversampling factor and interpolation for each level.
    /// The zero-order-hold and linear levels keep a short sinc so their
    /// cost stays close to the classic non-sinc converters they stand for.
    fn sinc(self) -> (usize, usize, SincInterpolationType) {
        match self {
            Quality::Best => (256, 256, SincInterpolationType::Cubic),
            Quality::Medium => (128, 256, SincInterpolationType::Cubic),
            Quality::Fastest => (64, 128, SincInterpolationType::Cubic),
            Quality::ZeroOrderHold => (16, 64, SincInterpolationType::Nearest),
            Quality::Linear => (16, 64, SincInterpolationType::Linear),
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Fastest
    }
}

pub struct BlockResampler {
    inner: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    /// Interleaved input waiting for a full chunk.
    staged: Vec<f32>,
    scratch: Vec<f32>,
}

impl BlockResampler {
    /// Build a converter producing `ratio` output frames per input frame.
    pub fn new(ratio: f64, channels: usize, chunk_frames: usize, quality: Quality) -> Result<Self> {
        let (sinc_len, oversampling_factor, interpolation) = quality.sinc();
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation,
            oversampling_factor,
            window,
        };
        let inner = Async::<f32>::new_sinc(ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
            .context("create sinc resampler")?;
        let scratch = vec![0.0; inner.output_frames_max() * channels];
        Ok(BlockResampler {
            inner,
            channels,
            chunk_frames,
            staged: Vec::with_capacity(chunk_frames * channels),
            scratch,
        })
    }

    /// Feed interleaved input and append whatever full chunks convert to
    /// onto `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.staged.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        while self.staged.len() >= chunk_samples {
            let input_adapter =
                InterleavedSlice::new(&self.staged[..chunk_samples], self.channels, self.chunk_frames)?;
            let max_frames = self.scratch.len() / self.channels;
            let mut output_adapter =
                InterleavedSlice::new_mut(&mut self.scratch, self.channels, max_frames)?;
            let indexing = Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            };
            let (consumed, produced) = self.inner.process_into_buffer(
                &input_adapter,
                &mut output_adapter,
                Some(&indexing),
            )?;
            out.extend_from_slice(&self.scratch[..produced * self.channels]);
            self.staged.drain(..consumed * self.channels);
        }
        Ok(())
    }

    /// Flush the staged partial chunk and the converter's delay line at end
    /// of stream. The converter must be [`reset`](Self::reset) before reuse.
    pub fn drain(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let tail_frames = self.staged.len() / self.channels;
        let input_adapter = InterleavedSlice::new(&self.staged, self.channels, tail_frames)?;
        let max_frames = self.scratch.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.scratch, self.channels, max_frames)?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: Some(tail_frames),
        };
        let (_, produced) =
            self.inner
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))?;
        out.extend_from_slice(&self.scratch[..produced * self.channels]);
        self.staged.clear();
        Ok(())
    }

    /// Drop staged input and internal filter state, ready for a new stream
    /// position.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_all(ratio: f64, channels: usize, input: &[f32]) -> Vec<f32> {
        let mut rs = BlockResampler::new(ratio, channels, 512, Quality::Fastest).unwrap();
        let mut out = Vec::new();
        for block in input.chunks(700 * channels) {
            rs.process(block, &mut out).unwrap();
        }
        rs.drain(&mut out).unwrap();
        out
    }

    #[test]
    fn upsampling_doubles_the_frame_count() {
        let input: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = convert_all(2.0, 1, &input);
        let frames = out.len() as i64;
        assert!((frames - 4096).abs() < 300, "got {frames} frames");
    }

    #[test]
    fn downsampling_halves_the_frame_count() {
        let input: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = convert_all(0.5, 1, &input);
        let frames = out.len() as i64;
        assert!((frames - 1024).abs() < 200, "got {frames} frames");
    }

    #[test]
    fn stereo_channels_stay_separated() {
        let mut input = Vec::new();
        for _ in 0..2048 {
            input.push(0.25);
            input.push(-0.25);
        }
        let out = convert_all(2.0, 2, &input);
        assert!(out.len() > 2000);
        // Skip the filter's start-up transient, then every frame should keep
        // the constants on its own channels.
        for frame in out.chunks_exact(2).skip(200).take(1000) {
            assert!((frame[0] - 0.25).abs() < 0.05, "left {}", frame[0]);
            assert!((frame[1] + 0.25).abs() < 0.05, "right {}", frame[1]);
        }
    }

    #[test]
    fn reset_clears_state_for_reuse() {
        let input: Vec<f32> = (0..1024).map(|i| i as f32 * 1e-4).collect();
        let mut rs = BlockResampler::new(2.0, 1, 512, Quality::Medium).unwrap();
        let mut first = Vec::new();
        rs.process(&input, &mut first).unwrap();
        rs.drain(&mut first).unwrap();
        rs.reset();
        let mut second = Vec::new();
        rs.process(&input, &mut second).unwrap();
        rs.drain(&mut second).unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn quality_indices_round_trip() {
        for index in 0..=4u8 {
            assert_eq!(Quality::from_index(index).unwrap().index(), index);
        }
        assert_eq!(Quality::from_index(5), None);
        assert_eq!(Quality::default(), Quality::Fastest);
    }
}
