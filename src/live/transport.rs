//! # Live Transport
//!
//! Owns the websocket to the live endpoint for one session.
//!
//! `Transport::connect` returns immediately with a [`Connection`]: a bounded
//! outbound channel for audio and a single inbound [`SessionEvent`] stream.
//! Connection failures, remote errors and the final close all arrive on that
//! stream, so the session only ever has one place to look.
//!
//! ## Socket task lifecycle:
//! 1. connect, send the `setup` frame
//! 2. forward outbound audio / fold inbound messages into events
//! 3. finish with exactly one `Closed` or `Errored` event

use crate::audio::capture::ChunkSender;
use crate::error::SessionError;
use crate::live::protocol::{ClientMessage, OutboundChunk, ServerMessage, SessionEvent, SessionSetup};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Outbound capacity; full means the socket is behind and the capture sender waits.
const OUTBOUND_CAPACITY: usize = 64;

/// Frames the session pushes towards the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Audio(OutboundChunk),
    /// Graceful shutdown: send a close frame and end the stream
    Close,
}

/// One live stream as seen by the session.
pub struct Connection {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Connection {
    /// A connection backed by plain channels, returning the far ends.
    pub fn channel() -> (
        Self,
        mpsc::Receiver<OutboundFrame>,
        mpsc::UnboundedSender<SessionEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                events: events_rx,
            },
            outbound_rx,
            events_tx,
        )
    }
}

/// Opens live streams.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, setup: SessionSetup) -> Connection;
}

impl ChunkSender for mpsc::Sender<OutboundFrame> {
    fn send_chunk(&mut self, chunk: OutboundChunk) -> impl Future<Output = Result<(), SessionError>> + Send {
        let tx = self.clone();
        async move {
            tx.send(OutboundFrame::Audio(chunk))
                .await
                .map_err(|_| SessionError::Disconnected("outbound channel closed".to_string()))
        }
    }
}

/// Websocket transport to the Gemini Live bidirectional endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    endpoint: String,
    api_key: String,
}

impl GeminiLiveTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Endpoint URL with the API key attached as the `key` query parameter.
    pub fn url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

impl Transport for GeminiLiveTransport {
    fn connect(&self, setup: SessionSetup) -> Connection {
        let (connection, outbound, events) = Connection::channel();
        let url = self.url();
        tokio::spawn(async move {
            let outcome = drive_socket(&url, setup, outbound, &events).await;
            let event = match outcome {
                Ok(()) => SessionEvent::Closed,
                Err(e) => SessionEvent::Errored(e),
            };
            let _ = events.send(event);
        });
        connection
    }
}

async fn drive_socket(
    url: &str,
    setup: SessionSetup,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), SessionError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;
    debug!("Websocket connected, sending setup for model {}", setup.model);

    let setup_frame = serde_json::to_string(&ClientMessage::setup(&setup))
        .map_err(|e| SessionError::Protocol(e.to_string()))?;
    ws.send(Message::Text(setup_frame))
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;

    let mut opened = false;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(OutboundFrame::Audio(chunk)) => {
                    let text = serde_json::to_string(&ClientMessage::audio(chunk))
                        .map_err(|e| SessionError::Protocol(e.to_string()))?;
                    ws.send(Message::Text(text))
                        .await
                        .map_err(|e| SessionError::Disconnected(e.to_string()))?;
                }
                Some(OutboundFrame::Close) | None => {
                    debug!("Closing websocket");
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "session closed".into(),
                        }))
                        .await;
                    return Ok(());
                }
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(&text, &mut opened, events) {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if !dispatch(&text, &mut opened, events) {
                            let _ = ws.close(None).await;
                            return Ok(());
                        }
                    }
                    Err(e) => warn!("Ignoring non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => return close_outcome(frame, opened),
                Some(Ok(_)) => trace!("Ignoring control frame"),
                Some(Err(e)) if opened => return Err(SessionError::Disconnected(e.to_string())),
                Some(Err(e)) => return Err(SessionError::Connect(e.to_string())),
                None => {
                    return Err(SessionError::Disconnected(
                        "stream ended without a close frame".to_string(),
                    ))
                }
            },
        }
    }
}

/// Parse one server message and forward its events.
///
/// Returns `false` once nobody is listening any more.
fn dispatch(text: &str, opened: &mut bool, events: &mpsc::UnboundedSender<SessionEvent>) -> bool {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable server message: {}", e);
            return true;
        }
    };

    if let Some(go_away) = &message.go_away {
        warn!(
            "Live endpoint will disconnect soon (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }
    if message.server_content.as_ref().is_some_and(|c| c.turn_complete) {
        trace!("Model turn complete");
    }

    for event in message.into_events() {
        if event == SessionEvent::Opened {
            info!("Live endpoint acknowledged setup");
            *opened = true;
        }
        if events.send(event).is_err() {
            return false;
        }
    }
    true
}

fn close_outcome(frame: Option<CloseFrame<'_>>, opened: bool) -> Result<(), SessionError> {
    let Some(frame) = frame else {
        return Ok(());
    };
    if frame.code == CloseCode::Normal {
        return Ok(());
    }

    let reason = format!("{} ({})", frame.reason, u16::from(frame.code));
    if opened {
        Err(SessionError::Disconnected(reason))
    } else {
        Err(SessionError::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::protocol::MediaBlob;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::WebSocketStream;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "test-model".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "Be brief.".to_string(),
        }
    }

    fn chunk(data: &str) -> OutboundChunk {
        OutboundChunk {
            media: MediaBlob {
                data: data.to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            },
        }
    }

    async fn next_json(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[test]
    fn test_url_carries_api_key() {
        let transport = GeminiLiveTransport::new("wss://example.test/live", "secret");
        assert_eq!(transport.url(), "wss://example.test/live?key=secret");

        let transport = GeminiLiveTransport::new("wss://example.test/live?alt=json", "secret");
        assert_eq!(transport.url(), "wss://example.test/live?alt=json&key=secret");

        let transport = GeminiLiveTransport::new("ws://localhost:9000", "");
        assert_eq!(transport.url(), "ws://localhost:9000");
    }

    #[tokio::test]
    async fn test_full_exchange_over_websocket() {
        let (listener, url) = listener().await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup = next_json(&mut ws).await;
            assert_eq!(setup["setup"]["model"], "models/test-model");
            ws.send(Message::Text(json!({"setupComplete": {}}).to_string())).await.unwrap();

            let audio = next_json(&mut ws).await;
            assert_eq!(audio["realtimeInput"]["mediaChunks"][0]["data"], "AAA=");

            let content = json!({
                "serverContent": {
                    "modelTurn": { "parts": [ { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQA=" } } ] },
                    "interrupted": true
                }
            });
            ws.send(Message::Binary(content.to_string().into_bytes())).await.unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let transport = GeminiLiveTransport::new(url, "");
        let mut connection = transport.connect(setup());

        assert_eq!(connection.events.recv().await, Some(SessionEvent::Opened));
        connection.outbound.send(OutboundFrame::Audio(chunk("AAA="))).await.unwrap();

        assert_eq!(
            connection.events.recv().await,
            Some(SessionEvent::AudioData("AQA=".to_string()))
        );
        assert_eq!(connection.events.recv().await, Some(SessionEvent::Interrupted));
        assert_eq!(connection.events.recv().await, Some(SessionEvent::Closed));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_ready_is_rejection() {
        let (listener, url) = listener().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            ws.close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "API key not valid".into(),
            }))
            .await
            .unwrap();
            // Drain until the client acknowledges the close.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut connection = GeminiLiveTransport::new(url, "bad").connect(setup());
        match connection.events.recv().await {
            Some(SessionEvent::Errored(SessionError::Rejected(reason))) => {
                assert!(reason.contains("API key not valid"));
                assert!(reason.contains("1008"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_close_ends_with_closed() {
        let (listener, url) = listener().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            ws.send(Message::Text(json!({"setupComplete": {}}).to_string())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut connection = GeminiLiveTransport::new(url, "").connect(setup());
        assert_eq!(connection.events.recv().await, Some(SessionEvent::Opened));

        connection.outbound.send(OutboundFrame::Close).await.unwrap();
        assert_eq!(connection.events.recv().await, Some(SessionEvent::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_error() {
        let (listener, url) = listener().await;
        drop(listener);

        let mut connection = GeminiLiveTransport::new(url, "").connect(setup());
        assert!(matches!(
            connection.events.recv().await,
            Some(SessionEvent::Errored(SessionError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_channel_sender_reports_closed_socket() {
        let (connection, outbound, _events) = Connection::channel();
        drop(outbound);
        let mut sender = connection.outbound.clone();
        let result = sender.send_chunk(chunk("AAA=")).await;
        assert!(matches!(result, Err(SessionError::Disconnected(_))));
    }
}
