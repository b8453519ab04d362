//! # Capture Buffer Shaping
//!
//! Audio devices hand us whatever they like: interleaved stereo at 48kHz in
//! 441-frame callbacks, mono at 16kHz in 1024-frame callbacks, and so on. The
//! capture pipeline wants one thing only: mono blocks of exactly
//! `block_frames` samples at the capture rate.
//!
//! ## Stages (all run on the device callback thread, no locking):
//! 1. **Downmix**: average interleaved channels into mono
//! 2. **Resample**: rubato, only when the device rate differs
//! 3. **Re-block**: accumulate into fixed-size blocks, emit each as soon as it fills

use crate::audio::resample::{ResampleError, StreamResampler};

/// Average interleaved frames down to one channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Collects samples into fixed-size blocks.
#[derive(Debug)]
pub struct BlockAccumulator {
    pending: Vec<f32>,
    block_frames: usize,
}

impl BlockAccumulator {
    pub fn new(block_frames: usize) -> Self {
        let block_frames = block_frames.max(1);
        Self {
            pending: Vec::with_capacity(block_frames),
            block_frames,
        }
    }

    /// Append samples, calling `emit` once for every block that fills up.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        while !samples.is_empty() {
            let room = self.block_frames - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.block_frames {
                let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_frames));
                emit(block);
            }
        }
    }
}

/// Downmix + resample + re-block, as one callback-side object.
pub struct CaptureShaper {
    device_channels: usize,
    resampler: StreamResampler,
    blocks: BlockAccumulator,
    scratch: Vec<f32>,
}

impl CaptureShaper {
    pub fn new(
        device_rate: u32,
        target_rate: u32,
        device_channels: usize,
        block_frames: usize,
    ) -> Result<Self, ResampleError> {
        Ok(Self {
            device_channels: device_channels.max(1),
            resampler: StreamResampler::new(device_rate, target_rate)?,
            blocks: BlockAccumulator::new(block_frames),
            scratch: Vec::new(),
        })
    }

    pub fn push(&mut self, interleaved: &[f32], emit: impl FnMut(Vec<f32>)) -> Result<(), ResampleError> {
        let mono = downmix_to_mono(interleaved, self.device_channels);
        self.scratch.clear();
        self.resampler.process(&mono, &mut self.scratch)?;
        self.blocks.push(&self.scratch, emit);
        Ok(())
    }
}
