//! Live-session wire messages.
//!
//! Outbound messages are typed `Serialize` structs; inbound frames are parsed
//! into [`ServerEvent`]s. The server may deliver JSON in text or binary frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    buffering::block::EncodedFrame,
    codec,
    error::{Result, VoiceError},
    transport::{SessionConfig, ToolInvocation},
};

/// Name of the single tool the interviewer may call.
pub const COMPLETE_EVALUATION: &str = "complete_evaluation";

/// MIME type of captured audio sent to the session.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ── Setup ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// A role-less list of parts, used for system instructions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                ..Part::default()
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The `complete_evaluation` tool both the voice and text interviewers expose.
pub fn evaluation_tool() -> Tool {
    Tool {
        function_declarations: vec![FunctionDeclaration {
            name: COMPLETE_EVALUATION.to_string(),
            description: "Call this when you have gathered enough information to assess \
                          the user's immigration case."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "viabilityScore": {
                        "type": "NUMBER",
                        "description": "Estimated viability of the case from 0 to 100."
                    },
                    "summary": {
                        "type": "STRING",
                        "description": "Short summary of the user's situation and likely routes."
                    }
                },
                "required": ["viabilityScore", "summary"]
            }),
        }],
    }
}

pub fn build_setup(config: &SessionConfig) -> SetupMessage {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };
    SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content::text(config.system_prompt.clone()),
            tools: vec![evaluation_tool()],
        },
    }
}

// ── Realtime input and tool responses ─────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

pub fn build_audio(frame: &EncodedFrame) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: codec::to_transport_text(frame),
            }],
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub tool_response: ToolResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

pub fn build_tool_response(id: &str, name: &str, response: Value) -> ToolResponseMessage {
    ToolResponseMessage {
        tool_response: ToolResponse {
            function_responses: vec![FunctionResponse {
                id: id.to_string(),
                name: name.to_string(),
                response,
            }],
        },
    }
}

// ── Server messages ───────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCallMessage>,
    #[serde(default)]
    go_away: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

/// One thing the server told us, in message order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// 24 kHz PCM from the model's turn.
    Audio(EncodedFrame),
    Interrupted,
    TurnComplete,
    ToolCall(ToolInvocation),
    /// The server will close the connection soon.
    GoAway,
    Error(String),
}

/// Parse one JSON server message.
///
/// # Errors
/// Returns `VoiceError::Protocol` if the text is not a JSON object.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| VoiceError::Protocol(format!("malformed server message: {e}")))?;

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else {
                continue;
            };
            match codec::from_transport_text(&inline.data) {
                Ok(frame) => events.push(ServerEvent::Audio(frame)),
                Err(e) => warn!("dropping undecodable audio part: {e}"),
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            events.push(ServerEvent::ToolCall(ToolInvocation {
                id: call.id.unwrap_or_default(),
                name: call.name,
                args: call.args,
            }));
        }
    }

    if message.go_away.is_some() {
        events.push(ServerEvent::GoAway);
    }

    if let Some(error) = message.error {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        events.push(ServerEvent::Error(detail));
    }

    Ok(events)
}
