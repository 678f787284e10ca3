//! Live protocol messages exchanged with the remote conversational service.
//!
//! Field names follow the service's camelCase JSON. Only the parts of the
//! protocol the voice pipeline uses are modelled; unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// Mime type of outbound microphone audio.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Response modality requested from the service.
pub const MODALITY_AUDIO: &str = "AUDIO";

/// Parameters used to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

/// Messages sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the opening `setup` message.
    pub fn setup(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };
        ClientMessage::Setup(SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![MODALITY_AUDIO.to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfigPayload {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        })
    }

    /// Wrap one encoded capture block.
    pub fn audio(data: String) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: CAPTURE_MIME_TYPE.to_string(),
                data,
            }],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfigPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfigPayload {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Inline binary payload (base64 `data`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

/// Messages received from the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ServerMessage {
    /// Model audio carrying `data` (one inline-data part).
    pub fn audio(data: impl Into<String>) -> Self {
        ServerMessage {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(ModelTurn {
                    parts: vec![Part {
                        inline_data: Some(Blob {
                            mime_type: "audio/pcm;rate=24000".to_string(),
                            data: data.into(),
                        }),
                        text: None,
                    }],
                }),
                ..Default::default()
            }),
        }
    }

    /// An interruption signal with no audio.
    pub fn interrupted() -> Self {
        ServerMessage {
            setup_complete: None,
            server_content: Some(ServerContent {
                interrupted: true,
                ..Default::default()
            }),
        }
    }

    /// Base64 audio payloads of the model turn, in part order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
            .map(|blob| blob.data.as_str())
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.turn_complete)
            .unwrap_or(false)
    }
}
