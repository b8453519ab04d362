//! Software mixer behind the output device.
//!
//! The device callback pulls frames with [`Mixer::render`]; the playback
//! scheduler pushes sources through [`MixerOutput`]. The number of frames
//! rendered so far is the output clock, so a source scheduled at `t` seconds
//! starts at frame `round(t * sample_rate)` with sample accuracy.
//!
//! A source at another rate is resampled to fill exactly the frames between
//! its start and end on this clock, so back-to-back sources stay back-to-back
//! whatever rate the device runs at.

use crate::audio::codec::AudioBuffer;
use crate::audio::playback::{AudioOutput, SourceId};
use crate::audio::resample::resample_exact;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::warn;

struct Voice {
    id: SourceId,
    start_frame: u64,
    buffer: AudioBuffer,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

struct MixerState {
    frames_rendered: u64,
    voices: Vec<Voice>,
    next_id: SourceId,
}

/// Build a connected mixer pair for an output running at `sample_rate` with
/// `channels` interleaved channels. Naturally finished sources are reported on
/// `completions`.
pub fn mixer(
    sample_rate: u32,
    channels: u16,
    completions: mpsc::UnboundedSender<SourceId>,
) -> (Mixer, MixerOutput) {
    let state = Arc::new(Mutex::new(MixerState {
        frames_rendered: 0,
        voices: Vec::new(),
        next_id: 0,
    }));

    (
        Mixer {
            state: state.clone(),
            channels: usize::from(channels.max(1)),
            completions,
        },
        MixerOutput {
            state,
            sample_rate: sample_rate.max(1),
        },
    )
}

fn lock(state: &Mutex<MixerState>) -> MutexGuard<'_, MixerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Device-callback side.
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    channels: usize,
    completions: mpsc::UnboundedSender<SourceId>,
}

impl Mixer {
    /// Fill one interleaved output buffer and advance the clock by its length.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = (out.len() / self.channels) as u64;

        let mut state = lock(&self.state);
        let block_start = state.frames_rendered;
        let block_end = block_start + frames;

        for voice in &state.voices {
            let source_channels = voice.buffer.channel_count();
            if source_channels == 0 {
                continue;
            }
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);

            for frame in from..to {
                let src = (frame - voice.start_frame) as usize;
                let dst = (frame - block_start) as usize * self.channels;
                for channel in 0..self.channels {
                    out[dst + channel] += voice.buffer.channel(channel % source_channels)[src];
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        state.frames_rendered = block_end;

        let (finished, playing): (Vec<Voice>, Vec<Voice>) = std::mem::take(&mut state.voices)
            .into_iter()
            .partition(|voice| voice.end_frame() <= block_end);
        state.voices = playing;
        drop(state);

        for voice in finished {
            let _ = self.completions.send(voice.id);
        }
    }
}

/// Scheduler side; the clock the playback scheduler reads.
#[derive(Clone)]
pub struct MixerOutput {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
}

impl MixerOutput {
    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    /// Convert `buffer` to this output's rate, `frames` frames long.
    fn convert(&self, buffer: &AudioBuffer, frames: usize) -> AudioBuffer {
        match resample_exact(buffer.channels(), buffer.sample_rate(), self.sample_rate, frames) {
            Ok(channels) => AudioBuffer::new(self.sample_rate, channels),
            Err(e) => {
                warn!("Playing silence in place of an unconvertible chunk: {}", e);
                AudioBuffer::new(self.sample_rate, vec![vec![0.0; frames]; buffer.channel_count().max(1)])
            }
        }
    }

    /// Sources started and not yet finished or stopped.
    pub fn voice_count(&self) -> usize {
        lock(&self.state).voices.len()
    }
}

impl AudioOutput for MixerOutput {
    fn current_time(&self) -> f64 {
        lock(&self.state).frames_rendered as f64 / self.sample_rate as f64
    }

    fn start(&mut self, buffer: AudioBuffer, start: f64) -> SourceId {
        let start_frame = self.frame_at(start);
        let buffer = if buffer.sample_rate() == self.sample_rate {
            buffer
        } else {
            let end_frame = self.frame_at(start + buffer.duration());
            self.convert(&buffer, (end_frame - start_frame) as usize)
        };

        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.voices.push(Voice {
            id,
            start_frame,
            buffer,
        });
        id
    }

    fn stop(&mut self, id: SourceId) {
        lock(&self.state).voices.retain(|voice| voice.id != id);
    }
}
