//! # Playback Scheduler
//!
//! Renders inbound audio chunks back-to-back on an output clock.
//!
//! Each decoded chunk starts at `max(cursor, now)` and pushes the cursor to
//! its own end, so consecutive chunks neither overlap nor leave gaps unless
//! the network falls behind real time. An interruption stops every source
//! that is still scheduled and unsets the cursor.
//!
//! The scheduler is single-writer: the session dispatch loop owns it and
//! feeds it chunks in arrival order.

use crate::audio::codec::{AudioBuffer, WireFormat};
use crate::error::DecodeError;
use crate::state::StreamStats;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Identifier of one scheduled source on an output.
pub type SourceId = u64;

/// An output device context with its own monotonic clock, in seconds.
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;

    /// Start `buffer` exactly at `start` on this output's clock.
    fn start(&mut self, buffer: AudioBuffer, start: f64) -> SourceId;

    /// Stop a source immediately. Stopping a finished source is a no-op.
    fn stop(&mut self, id: SourceId);
}

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    format: WireFormat,
    /// End of the last scheduled chunk; `None` until the first chunk and after an interruption
    cursor: Option<f64>,
    active: HashSet<SourceId>,
    stats: Arc<StreamStats>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, format: WireFormat, stats: Arc<StreamStats>) -> Self {
        Self {
            output,
            format,
            cursor: None,
            active: HashSet::new(),
            stats,
        }
    }

    /// Decode one inbound payload and schedule it right after the previous one.
    ///
    /// A payload that fails to decode is logged, counted and dropped; the cursor
    /// does not move. An empty payload schedules nothing.
    pub fn on_chunk_received(&mut self, data: &str) -> Result<Option<ScheduledChunk>, DecodeError> {
        self.stats.record_chunk_received();

        let buffer = match self.format.decode(data) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Dropping inbound audio chunk: {}", e);
                self.stats.record_chunk_dropped();
                return Err(e);
            }
        };

        if buffer.is_empty() {
            trace!("Ignoring empty audio chunk");
            return Ok(None);
        }

        let now = self.output.current_time();
        let start = self.cursor.unwrap_or(0.0).max(now);
        let duration = buffer.duration();

        let id = self.output.start(buffer, start);
        let scheduled = ScheduledChunk { id, start, duration };
        self.cursor = Some(scheduled.end());
        self.active.insert(id);

        trace!(source = id, start, duration, "Scheduled audio chunk");
        Ok(Some(scheduled))
    }

    /// Cut playback: stop everything active, forget the cursor.
    pub fn on_interrupt(&mut self) {
        debug!("Interrupted, stopping {} active sources", self.active.len());
        self.stats.record_interruption();
        self.stop_all();
    }

    /// A source finished playing on its own.
    pub fn on_source_ended(&mut self, id: SourceId) {
        self.active.remove(&id);
    }

    /// Drop all playback state at session teardown.
    pub fn reset(&mut self) {
        self.stop_all();
    }

    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    fn stop_all(&mut self) {
        for id in self.active.drain() {
            self.output.stop(id);
        }
        self.cursor = None;
    }
}
