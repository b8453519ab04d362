//! # Capture Pipeline
//!
//! Turns microphone blocks into an ordered stream of outbound wire chunks.
//!
//! The device callback pushes blocks through a [`BlockSink`]; it never waits
//! on the network. Every encoded chunk goes onto a single-consumer queue and
//! one sender task ([`run_sender`]) drains it strictly in order, holding
//! everything back until the session reports it is ready.
//!
//! ```text
//! device callback ──push_block──▶ [queue] ──run_sender──▶ ChunkSender (live socket)
//!                                              ▲
//!                                   ready (watch<bool>)
//! ```

use crate::audio::codec::WireFormat;
use crate::error::{CaptureError, SessionError};
use crate::live::protocol::{MediaBlob, OutboundChunk};
use crate::state::StreamStats;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Anything that can transmit one outbound chunk.
///
/// Implemented by the live transport's outbound channel; tests use recording fakes.
pub trait ChunkSender: Send {
    fn send_chunk(&mut self, chunk: OutboundChunk) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// The three ends of a freshly built capture pipeline.
pub struct CapturePipeline {
    /// Handed to the input device
    pub sink: BlockSink,
    /// Drained by [`run_sender`]
    pub queue: CaptureQueue,
    /// Device failures, watched by the session
    pub errors: mpsc::UnboundedReceiver<CaptureError>,
}

impl CapturePipeline {
    pub fn new(format: WireFormat, stats: Arc<StreamStats>) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Self {
            sink: BlockSink {
                format,
                chunks: chunk_tx,
                errors: error_tx,
            },
            queue: CaptureQueue {
                chunks: chunk_rx,
                stats,
            },
            errors: error_rx,
        }
    }
}

/// Device-side end of the pipeline. Cheap to clone, safe to call from any thread.
#[derive(Clone)]
pub struct BlockSink {
    format: WireFormat,
    chunks: mpsc::UnboundedSender<OutboundChunk>,
    errors: mpsc::UnboundedSender<CaptureError>,
}

impl BlockSink {
    /// Encode one captured block and enqueue it behind every earlier block.
    ///
    /// Returns `false` once the session side has gone away; the device should
    /// stop delivering at that point.
    pub fn push_block(&self, samples: &[f32]) -> bool {
        let chunk = OutboundChunk {
            media: MediaBlob {
                data: self.format.encode(samples),
                mime_type: self.format.mime_type(),
            },
        };
        self.chunks.send(chunk).is_ok()
    }

    /// Report a device failure. Capture is never restarted after this.
    pub fn fail(&self, error: CaptureError) {
        let _ = self.errors.send(error);
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_closed()
    }
}

/// Session-side end of the pipeline.
pub struct CaptureQueue {
    chunks: mpsc::UnboundedReceiver<OutboundChunk>,
    stats: Arc<StreamStats>,
}

impl CaptureQueue {
    pub async fn recv(&mut self) -> Option<OutboundChunk> {
        self.chunks.recv().await
    }

    /// Chunks captured but not yet handed to the sender.
    pub fn pending(&self) -> usize {
        self.chunks.len()
    }
}

/// Drain the capture queue into `sender`, one chunk at a time, in capture order.
///
/// Nothing is sent until `ready` turns `true`; chunks captured before then
/// stay queued. Returns `Ok(())` when the capture side closes or the session
/// is dropped before it ever became ready, and the first send error otherwise.
pub async fn run_sender<S: ChunkSender>(
    mut queue: CaptureQueue,
    mut ready: watch::Receiver<bool>,
    mut sender: S,
) -> Result<(), SessionError> {
    if ready.wait_for(|ready| *ready).await.is_err() {
        debug!("Session dropped before becoming ready, discarding {} captured chunks", queue.pending());
        return Ok(());
    }

    debug!("Session ready, flushing {} queued chunks", queue.pending());

    while let Some(chunk) = queue.recv().await {
        sender.send_chunk(chunk).await?;
        queue.stats.record_chunk_sent();
        trace!("Sent capture chunk");
    }

    debug!("Capture queue closed, sender finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::from_wire;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records what it sends; the first send is the slowest.
    struct SlowSender {
        sent: Arc<Mutex<Vec<OutboundChunk>>>,
        delays_ms: Vec<u64>,
    }

    impl ChunkSender for SlowSender {
        fn send_chunk(&mut self, chunk: OutboundChunk) -> impl Future<Output = Result<(), SessionError>> + Send {
            let delay = if self.delays_ms.is_empty() { 0 } else { self.delays_ms.remove(0) };
            let sent = self.sent.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                sent.lock().unwrap().push(chunk);
                Ok(())
            }
        }
    }

    struct FailingSender;

    impl ChunkSender for FailingSender {
        fn send_chunk(&mut self, _chunk: OutboundChunk) -> impl Future<Output = Result<(), SessionError>> + Send {
            async { Err(SessionError::Disconnected("socket closed".to_string())) }
        }
    }

    fn block(value: f32) -> Vec<f32> {
        vec![value; 4]
    }

    #[tokio::test]
    async fn test_chunks_are_sent_in_capture_order() {
        let stats = Arc::new(StreamStats::default());
        let pipeline = CapturePipeline::new(WireFormat::mono(16000), stats.clone());
        let (ready_tx, ready_rx) = watch::channel(false);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sender = SlowSender {
            sent: sent.clone(),
            delays_ms: vec![30, 1, 0],
        };

        let task = tokio::spawn(run_sender(pipeline.queue, ready_rx, sender));

        assert!(pipeline.sink.push_block(&block(0.25)));
        assert!(pipeline.sink.push_block(&block(0.5)));
        assert!(pipeline.sink.push_block(&block(-0.5)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sent.lock().unwrap().is_empty(), "nothing may be sent before ready");

        ready_tx.send(true).unwrap();
        drop(pipeline.sink);
        task.await.unwrap().unwrap();

        let sent = sent.lock().unwrap();
        let firsts: Vec<f32> = sent
            .iter()
            .map(|chunk| from_wire(&chunk.media.data).unwrap()[0])
            .collect();
        assert_eq!(firsts, vec![0.25, 0.5, -0.5]);
        assert!(sent.iter().all(|chunk| chunk.media.mime_type == "audio/pcm;rate=16000"));
        assert_eq!(stats.snapshot().chunks_sent, 3);
    }

    #[tokio::test]
    async fn test_dropped_session_discards_queue() {
        let stats = Arc::new(StreamStats::default());
        let pipeline = CapturePipeline::new(WireFormat::mono(16000), stats.clone());
        let (ready_tx, ready_rx) = watch::channel(false);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sender = SlowSender {
            sent: sent.clone(),
            delays_ms: Vec::new(),
        };

        pipeline.sink.push_block(&block(0.1));
        drop(ready_tx);

        run_sender(pipeline.queue, ready_rx, sender).await.unwrap();
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().chunks_sent, 0);
    }

    #[tokio::test]
    async fn test_send_error_stops_sender() {
        let stats = Arc::new(StreamStats::default());
        let pipeline = CapturePipeline::new(WireFormat::mono(16000), stats);
        let (_ready_tx, ready_rx) = watch::channel(true);

        pipeline.sink.push_block(&block(0.1));
        let result = run_sender(pipeline.queue, ready_rx, FailingSender).await;
        assert!(matches!(result, Err(SessionError::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_sink_reports_closed_queue_and_failures() {
        let stats = Arc::new(StreamStats::default());
        let CapturePipeline { sink, queue, mut errors } =
            CapturePipeline::new(WireFormat::mono(16000), stats);

        sink.fail(CaptureError::Stream("device unplugged".to_string()));
        assert_eq!(
            errors.recv().await,
            Some(CaptureError::Stream("device unplugged".to_string()))
        );

        drop(queue);
        assert!(sink.is_closed());
        assert!(!sink.push_block(&block(0.0)));
    }
}
