//! # Voice Session Lifecycle
//!
//! Owns the one live voice session and wires its parts together.
//!
//! ## States:
//! ```text
//! Idle ──open──▶ Opening ──setupComplete──▶ Streaming ──close/error──▶ Closing ──▶ Idle
//!                   └──────────── error / timeout / superseded ──────────────────▶ Idle
//! ```
//!
//! ## Per-session tasks:
//! - **dispatch** (`LiveSession::run`): the single consumer of transport events,
//!   device completions and capture failures. It is the only writer of the
//!   playback scheduler, so chunks are scheduled strictly in arrival order.
//! - **sender** (`audio::capture::run_sender`): drains captured chunks to the
//!   transport once the session is ready.
//!
//! A new `open` always closes the previous session first. Errors never
//! reconnect; the caller decides whether to `open` again.

use crate::audio::capture::{run_sender, BlockSink, CapturePipeline};
use crate::audio::codec::WireFormat;
use crate::audio::mixer::MixerOutput;
use crate::audio::playback::{PlaybackScheduler, SourceId};
use crate::config::AppConfig;
use crate::device::{AudioBackend, DeviceGuard};
use crate::error::{CaptureError, SessionError, VoiceError};
use crate::live::protocol::{SessionEvent, SessionSetup};
use crate::live::transport::{OutboundFrame, Transport};
use crate::state::StreamStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Opening,
    Streaming,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Opening => "opening",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        }
    }

    /// Opening or streaming: a `toggle` would close it.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Opening | SessionState::Streaming)
    }
}

/// Observable state of the voice session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Current session, or the most recent one once back to `Idle`
    pub session_id: Option<Uuid>,
    /// When the endpoint acknowledged the current session
    pub opened_at: Option<DateTime<Utc>>,
    /// Why the most recent session ended, if it failed
    pub last_error: Option<VoiceError>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            opened_at: None,
            last_error: None,
        }
    }
}

/// Everything fixed at `open` for the lifetime of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub setup: SessionSetup,
    pub capture: WireFormat,
    pub playback: WireFormat,
    pub block_frames: usize,
    pub connect_timeout: Duration,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            setup: SessionSetup {
                model: config.live.model.clone(),
                voice_name: config.live.voice_name.clone(),
                system_instruction: config.live.system_instruction.clone(),
            },
            capture: WireFormat::mono(config.audio.capture_sample_rate),
            playback: WireFormat::new(config.audio.playback_sample_rate, config.audio.playback_channels),
            block_frames: config.audio.capture_block_frames,
            connect_timeout: Duration::from_millis(config.live.connect_timeout_ms),
            input_device: config.audio.input_device.clone(),
            output_device: config.audio.output_device.clone(),
        }
    }
}

struct SessionHandle {
    id: Uuid,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The microphone and speaker held by one session.
struct Devices {
    capture: DeviceGuard,
    playback: DeviceGuard,
}

pub struct SessionManager<T: Transport, B: AudioBackend> {
    transport: Arc<T>,
    backend: Arc<B>,
    stats: Arc<StreamStats>,
    current: Mutex<Option<SessionHandle>>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl<T: Transport, B: AudioBackend> SessionManager<T, B> {
    pub fn new(transport: Arc<T>, backend: Arc<B>, stats: Arc<StreamStats>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            transport,
            backend,
            stats,
            current: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Open a session and wait until the endpoint is ready.
    ///
    /// Any previous session is fully closed first. On failure the devices are
    /// released and the state is back to `Idle` before this returns.
    pub async fn open(&self, config: SessionConfig) -> Result<Uuid, VoiceError> {
        let mut current = self.current.lock().await;
        if let Some(prior) = current.take() {
            info!(session_id = %prior.id, "Closing previous voice session before opening a new one");
            shutdown(prior).await;
        }

        let id = Uuid::new_v4();
        let mut status_rx = self.status.subscribe();
        self.status.send_replace(SessionStatus {
            state: SessionState::Opening,
            session_id: Some(id),
            opened_at: None,
            last_error: None,
        });
        info!(session_id = %id, voice = %config.setup.voice_name, "Opening voice session");

        let CapturePipeline { sink, queue, errors } = CapturePipeline::new(config.capture, self.stats.clone());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let opened = {
            let backend = self.backend.clone();
            let config = config.clone();
            tokio::task::spawn_blocking(move || open_devices(&*backend, &config, sink, completions_tx)).await
        };
        let (output, devices) = match opened {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => return Err(self.fail_open(id, e.into())),
            Err(e) => return Err(self.fail_open(id, CaptureError::Stream(e.to_string()).into())),
        };

        let connection = self.transport.connect(config.setup.clone());
        let (ready_tx, ready_rx) = watch::channel(false);
        let sender = tokio::spawn(run_sender(queue, ready_rx, connection.outbound.clone()));

        let session = LiveSession {
            id,
            events: connection.events,
            outbound: connection.outbound,
            completions: completions_rx,
            capture_errors: errors,
            scheduler: PlaybackScheduler::new(output, config.playback, self.stats.clone()),
            ready: ready_tx,
            sender,
            devices,
            status: self.status.clone(),
            stats: self.stats.clone(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(
            session
                .run(shutdown_rx)
                .instrument(info_span!("voice_session", session_id = %id)),
        );
        *current = Some(SessionHandle {
            id,
            shutdown: shutdown_tx,
            task,
        });
        drop(current);

        let settled = tokio::time::timeout(config.connect_timeout, async {
            status_rx
                .wait_for(|s| {
                    s.session_id != Some(id) || matches!(s.state, SessionState::Streaming | SessionState::Idle)
                })
                .await
                .map(|status| status.clone())
        })
        .await;

        let status = match settled {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => return Err(SessionError::Cancelled.into()),
            Err(_) => {
                let error = VoiceError::Session(SessionError::Timeout(config.connect_timeout));
                warn!(session_id = %id, "Live endpoint not ready after {:?}", config.connect_timeout);
                self.close_if_current(id).await;
                self.stats.record_session_error();
                update_if_current(&self.status, id, |status| status.last_error = Some(error.clone()));
                return Err(error);
            }
        };

        if status.session_id != Some(id) {
            return Err(SessionError::Cancelled.into());
        }
        match status.state {
            SessionState::Streaming => Ok(id),
            _ => Err(status.last_error.unwrap_or(VoiceError::Session(SessionError::Cancelled))),
        }
    }

    /// Close the current session, if any. Safe to call at any time, any number of times.
    pub async fn close(&self) {
        let handle = self.current.lock().await.take();
        match handle {
            Some(handle) => {
                info!(session_id = %handle.id, "Closing voice session");
                shutdown(handle).await;
            }
            None => debug!("No voice session to close"),
        }
    }

    /// Close when a session is active, otherwise open one.
    ///
    /// Returns the new session id, or `None` when this call closed a session.
    pub async fn toggle(&self, config: SessionConfig) -> Result<Option<Uuid>, VoiceError> {
        if self.status().state.is_active() {
            self.close().await;
            Ok(None)
        } else {
            self.open(config).await.map(Some)
        }
    }

    async fn close_if_current(&self, id: Uuid) {
        let handle = {
            let mut current = self.current.lock().await;
            match current.as_ref() {
                Some(handle) if handle.id == id => current.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            shutdown(handle).await;
        }
    }

    fn fail_open(&self, id: Uuid, error: VoiceError) -> VoiceError {
        error!(session_id = %id, "Failed to open voice session: {}", error);
        self.stats.record_session_error();
        update_if_current(&self.status, id, |status| {
            status.state = SessionState::Idle;
            status.last_error = Some(error.clone());
        });
        error
    }
}

/// Apply `update` only while `id` is still the session being reported.
fn update_if_current(status: &watch::Sender<SessionStatus>, id: Uuid, update: impl FnOnce(&mut SessionStatus)) {
    status.send_modify(|current| {
        if current.session_id == Some(id) {
            update(current);
        }
    });
}

async fn shutdown(handle: SessionHandle) {
    let _ = handle.shutdown.send(());
    if let Err(e) = handle.task.await {
        error!(session_id = %handle.id, "Voice session task failed: {}", e);
    }
}

/// Acquire the microphone, then the speaker. Blocks while the devices start.
fn open_devices<B: AudioBackend>(
    backend: &B,
    config: &SessionConfig,
    sink: BlockSink,
    completions: mpsc::UnboundedSender<SourceId>,
) -> Result<(MixerOutput, Devices), CaptureError> {
    let capture = backend.open_capture(config.input_device.as_deref(), config.capture, config.block_frames, sink)?;
    let (output, playback) = backend.open_playback(config.output_device.as_deref(), config.playback, completions)?;
    Ok((output, Devices { capture, playback }))
}

/// One running session, owned by its dispatch task.
struct LiveSession {
    id: Uuid,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::Sender<OutboundFrame>,
    completions: mpsc::UnboundedReceiver<SourceId>,
    capture_errors: mpsc::UnboundedReceiver<CaptureError>,
    scheduler: PlaybackScheduler<MixerOutput>,
    ready: watch::Sender<bool>,
    sender: JoinHandle<Result<(), SessionError>>,
    devices: Devices,
    status: Arc<watch::Sender<SessionStatus>>,
    stats: Arc<StreamStats>,
}

impl LiveSession {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut opened = false;

        let outcome: Result<(), VoiceError> = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break Ok(()),

                Some(error) = self.capture_errors.recv() => break Err(error.into()),

                event = self.events.recv() => match event {
                    Some(SessionEvent::Opened) => {
                        if !opened {
                            opened = true;
                            self.ready.send_replace(true);
                            self.stats.record_session_opened();
                            update_if_current(&self.status, self.id, |status| {
                                status.state = SessionState::Streaming;
                                status.opened_at = Some(Utc::now());
                            });
                            info!("Voice session streaming");
                        }
                    }
                    Some(SessionEvent::AudioData(data)) => {
                        // Decode failures are logged and counted by the scheduler.
                        let _ = self.scheduler.on_chunk_received(&data);
                    }
                    Some(SessionEvent::Interrupted) => self.scheduler.on_interrupt(),
                    Some(SessionEvent::Errored(e)) => break Err(e.into()),
                    Some(SessionEvent::Closed) if opened => break Ok(()),
                    Some(SessionEvent::Closed) => {
                        break Err(SessionError::Rejected("closed before setup completed".to_string()).into())
                    }
                    None => break Err(SessionError::Disconnected("event stream ended".to_string()).into()),
                },

                Some(id) = self.completions.recv() => self.scheduler.on_source_ended(id),

                result = &mut self.sender => break match result {
                    Ok(Ok(())) => Err(CaptureError::Stream("capture stopped".to_string()).into()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(SessionError::Protocol(format!("sender task failed: {}", e)).into()),
                },
            }
        };

        self.teardown(outcome).await;
    }

    async fn teardown(self, outcome: Result<(), VoiceError>) {
        let LiveSession {
            id,
            outbound,
            mut scheduler,
            sender,
            devices,
            status,
            stats,
            ..
        } = self;

        update_if_current(&status, id, |s| s.state = SessionState::Closing);

        let _ = outbound.try_send(OutboundFrame::Close);
        sender.abort();
        debug!(
            active = scheduler.active_sources(),
            voices = scheduler.output().voice_count(),
            cursor = ?scheduler.cursor(),
            "Stopping playback"
        );
        scheduler.reset();

        let Devices { capture, playback } = devices;
        if let Err(e) = tokio::task::spawn_blocking(move || {
            capture.release();
            playback.release();
        })
        .await
        {
            error!("Failed to release audio devices: {}", e);
        }

        let last_error = match outcome {
            Ok(()) => {
                info!("Voice session closed");
                None
            }
            Err(e) => {
                error!("Voice session ended: {}", e);
                stats.record_session_error();
                Some(e)
            }
        };

        update_if_current(&status, id, |s| {
            s.state = SessionState::Idle;
            s.opened_at = None;
            s.last_error = last_error;
        });
    }
}
