//! # Live Session Wire Protocol
//!
//! JSON messages exchanged with the bidirectional live endpoint over websocket.
//!
//! ## Client → Server:
//! - **setup**: first frame; model, voice and behaviour instruction
//! - **realtimeInput**: one captured PCM16 chunk at 16kHz
//!
//! ## Server → Client:
//! - **setupComplete**: the endpoint is ready, outbound audio may flow
//! - **serverContent**: audio parts of the model turn (PCM16 at 24kHz) and/or
//!   the `interrupted` flag
//! - **goAway**: the endpoint will disconnect soon
//!
//! Everything the server sends is folded into [`SessionEvent`]s so the
//! session state machine only ever matches on one enum.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};

/// Audio payload: base64 PCM16 bytes plus their format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

/// One captured chunk as produced by the capture pipeline: `{ media: { data, mimeType } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundChunk {
    pub media: MediaBlob,
}

/// Voice identity and behaviour for one session; passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

/// Messages the client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

/// Text or inline-data parts, used in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };

        let system_instruction = (!setup.system_instruction.trim().is_empty()).then(|| Content {
            parts: vec![Part {
                text: Some(setup.system_instruction.clone()),
                inline_data: None,
            }],
        });

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    pub fn audio(chunk: OutboundChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk.media],
        })
    }
}

/// Any message the server sends. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Everything the session state machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The endpoint acknowledged the setup
    Opened,
    /// Base64 PCM16 audio at the playback rate
    AudioData(String),
    /// Discard everything queued or playing
    Interrupted,
    /// The stream failed; the session must be torn down
    Errored(SessionError),
    /// The stream ended cleanly
    Closed,
}

impl ServerMessage {
    /// Fold one server message into events, in the order they must be applied:
    /// readiness first, then audio parts in part order, then interruption.
    pub fn into_events(self) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(SessionEvent::Opened);
        }

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                events.extend(
                    turn.parts
                        .into_iter()
                        .filter_map(|part| part.inline_data)
                        .filter(|inline| is_audio(inline.mime_type.as_deref()))
                        .map(|inline| SessionEvent::AudioData(inline.data)),
                );
            }
            if content.interrupted {
                events.push(SessionEvent::Interrupted);
            }
        }

        events
    }
}

/// Inline data without a MIME type is assumed to be audio.
fn is_audio(mime_type: Option<&str>) -> bool {
    mime_type.map_or(true, |mime| mime.starts_with("audio/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "Help with measurements.".to_string(),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let value = serde_json::to_value(ClientMessage::setup(&setup())).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-2.5-flash-native-audio-preview-12-2025",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Zephyr" } }
                        }
                    },
                    "systemInstruction": { "parts": [ { "text": "Help with measurements." } ] }
                }
            })
        );
    }

    #[test]
    fn test_blank_instruction_is_omitted() {
        let mut setup = setup();
        setup.system_instruction = "  ".to_string();
        let value = serde_json::to_value(ClientMessage::setup(&setup)).unwrap();
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_outbound_chunk_shapes() {
        let chunk = OutboundChunk {
            media: MediaBlob {
                data: "AAA=".to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({ "media": { "data": "AAA=", "mimeType": "audio/pcm;rate=16000" } })
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::audio(chunk)).unwrap(),
            json!({ "realtimeInput": { "mediaChunks": [ { "data": "AAA=", "mimeType": "audio/pcm;rate=16000" } ] } })
        );
    }

    #[test]
    fn test_setup_complete_opens() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![SessionEvent::Opened]);
    }

    #[test]
    fn test_audio_parts_then_interrupt() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQA=" } },
                    { "text": "thinking" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AgA=" } }
                ] },
                "interrupted": true
            }
        }))
        .unwrap();

        assert_eq!(
            msg.into_events(),
            vec![
                SessionEvent::AudioData("AQA=".to_string()),
                SessionEvent::AudioData("AgA=".to_string()),
                SessionEvent::Interrupted,
            ]
        );
    }

    #[test]
    fn test_interrupt_without_audio() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![SessionEvent::Interrupted]);
    }

    #[test]
    fn test_unknown_messages_produce_nothing() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"usageMetadata": {"totalTokenCount": 12}}"#).unwrap();
        assert!(msg.into_events().is_empty());

        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_non_audio_inline_data_is_skipped() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "iVBO" } },
                { "inlineData": { "data": "AQA=" } }
            ] } }
        }))
        .unwrap();
        assert_eq!(msg.into_events(), vec![SessionEvent::AudioData("AQA=".to_string())]);
    }
}
