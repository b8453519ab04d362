//! # Live Voice Session
//!
//! The realtime conversation with the remote model:
//! - **protocol**: JSON messages and the `SessionEvent` they fold into
//! - **transport**: websocket connection to the live endpoint
//! - **session**: the single-session state machine tying devices, capture,
//!   playback and transport together

pub mod protocol;
pub mod session;
pub mod transport;

use crate::device::SystemAudio;
use transport::GeminiLiveTransport;

/// The session manager the service runs with: Gemini Live over websocket, real sound devices.
pub type VoiceService = session::SessionManager<GeminiLiveTransport, SystemAudio>;
