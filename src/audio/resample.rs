//! Sample-rate conversion with rubato.
//!
//! Two shapes of input need converting:
//! - the microphone, one endless mono signal arriving in arbitrary slices
//!   ([`StreamResampler`])
//! - a playback chunk, a self-contained buffer that must fill an exact span of
//!   output frames so the next chunk starts right where it ends
//!   ([`resample_exact`])

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Input frames handed to rubato per call on the streaming path.
const STREAM_CHUNK_FRAMES: usize = 256;

/// Copies of the edge samples placed around a one-shot buffer, enough to cover
/// the septic interpolation window so no zeros leak into the chunk edges.
const EDGE_PAD_FRAMES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resampling failed: {0}")]
pub struct ResampleError(String);

impl From<rubato::ResamplerConstructionError> for ResampleError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        ResampleError(err.to_string())
    }
}

impl From<rubato::ResampleError> for ResampleError {
    fn from(err: rubato::ResampleError) -> Self {
        ResampleError(err.to_string())
    }
}

fn fixed_in(
    from_rate: u32,
    to_rate: u32,
    chunk_frames: usize,
    channels: usize,
) -> Result<FastFixedIn<f32>, ResampleError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(ResampleError(format!("invalid rates {}Hz -> {}Hz", from_rate, to_rate)));
    }
    Ok(FastFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        chunk_frames,
        channels,
    )?)
}

/// Mono resampler that keeps its state between calls, so a signal split over
/// many device callbacks converts exactly as if it were one buffer.
///
/// Input is buffered until a full rubato chunk is available; the leading
/// output delay is dropped once.
pub struct StreamResampler {
    /// `None` when both rates match
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    skip: usize,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, ResampleError> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(fixed_in(from_rate, to_rate, STREAM_CHUNK_FRAMES, 1)?)
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());

        Ok(Self {
            inner,
            pending: Vec::with_capacity(STREAM_CHUNK_FRAMES * 2),
            skip,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Convert `input`, appending every output sample that is ready.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<(), ResampleError> {
        let Some(resampler) = self.inner.as_mut() else {
            output.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);

        let mut consumed = 0;
        while self.pending.len() - consumed >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let converted = resampler.process(&[&self.pending[consumed..consumed + needed]], None)?;
            consumed += needed;

            let frames = &converted[0];
            let skipped = self.skip.min(frames.len());
            self.skip -= skipped;
            output.extend_from_slice(&frames[skipped..]);
        }

        self.pending.drain(..consumed);
        Ok(())
    }
}

/// Resample planar `channels` from `from_rate` to `to_rate`, returning exactly
/// `frames` frames per channel.
///
/// The buffer is converted on its own, edges extended, and the result is cut
/// or held at its last sample to the requested length. Consecutive chunks sized
/// this way tile the output clock with no gap and no overlap.
pub fn resample_exact(
    channels: &[Vec<f32>],
    from_rate: u32,
    to_rate: u32,
    frames: usize,
) -> Result<Vec<Vec<f32>>, ResampleError> {
    let input_frames = channels.first().map_or(0, Vec::len);
    if input_frames == 0 {
        return Ok(vec![vec![0.0; frames]; channels.len()]);
    }
    if from_rate == to_rate {
        return Ok(channels.iter().map(|c| fit(c, 0, frames)).collect());
    }

    let padded: Vec<Vec<f32>> = channels.iter().map(|c| pad_edges(c)).collect();
    let mut resampler = fixed_in(from_rate, to_rate, padded[0].len(), channels.len())?;
    let lead = resampler.output_delay()
        + (EDGE_PAD_FRAMES as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    let mut converted = resampler.process(&padded, None)?;
    let tail = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
    for (channel, rest) in converted.iter_mut().zip(tail) {
        channel.extend(rest);
    }

    Ok(converted.iter().map(|c| fit(c, lead, frames)).collect())
}

fn pad_edges(samples: &[f32]) -> Vec<f32> {
    let first = samples.first().copied().unwrap_or(0.0);
    let last = samples.last().copied().unwrap_or(0.0);

    let mut padded = Vec::with_capacity(samples.len() + 2 * EDGE_PAD_FRAMES);
    padded.extend(std::iter::repeat(first).take(EDGE_PAD_FRAMES));
    padded.extend_from_slice(samples);
    padded.extend(std::iter::repeat(last).take(EDGE_PAD_FRAMES));
    padded
}

/// `frames` samples starting at `skip`, held at the last one if short.
fn fit(samples: &[f32], skip: usize, frames: usize) -> Vec<f32> {
    let mut out: Vec<f32> = samples.iter().skip(skip).take(frames).copied().collect();
    let hold = out.last().copied().unwrap_or(0.0);
    out.resize(frames, hold);
    out
}
