//! Text interview over the `generateContent` REST endpoint.
//!
//! Same interviewer as the voice session, with the longer written prompt.
//! The history starts with the greeting the user has already seen; every
//! user turn answers with either a reply or a completed evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, VoiceError},
    ipc::events::EvaluationResult,
    language::Language,
    transport::{
        protocol::{evaluation_tool, Content, Part, Tool, COMPLETE_EVALUATION},
        ToolInvocation,
    },
};

pub const CHAT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL; the request goes to `{endpoint}/{model}:generateContent`.
    pub endpoint: String,
    pub timeout: Duration,
}

impl ChatConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            endpoint: CHAT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// One turn of the conversation, as the API stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl ChatTurn {
    fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            parts: Content::text(text).parts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatReply {
    Text(String),
    Completed(EvaluationResult),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: &'a [ChatTurn],
    system_instruction: &'a Content,
    tools: &'a [Tool],
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ChatTurn>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

pub struct EvaluatorChat {
    client: reqwest::Client,
    config: ChatConfig,
    language: Language,
    system: Content,
    tools: Vec<Tool>,
    history: Vec<ChatTurn>,
}

impl EvaluatorChat {
    /// Start a fresh conversation in `language`.
    ///
    /// # Errors
    /// - `VoiceError::CredentialMissing` if the key is blank.
    pub fn new(config: ChatConfig, language: Language) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(VoiceError::CredentialMissing);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| VoiceError::Chat(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            system: Content::text(language.chat_prompt()),
            tools: vec![evaluation_tool()],
            history: vec![ChatTurn::text("model", language.greeting())],
            config,
            language,
        })
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// The opening line, already part of the history.
    pub fn greeting(&self) -> &'static str {
        self.language.greeting()
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Send one user message.
    ///
    /// Returns `Ok(None)` for a blank message (nothing is sent) or when the
    /// model answered with neither text nor a completion. The history only
    /// grows, by a user turn and a model turn together, when the model answered.
    pub async fn send(&mut self, text: &str) -> Result<Option<ChatReply>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let mut contents = self.history.clone();
        contents.push(ChatTurn::text("user", text));
        let request = GenerateRequest {
            contents: &contents,
            system_instruction: &self.system,
            tools: &self.tools,
        };

        let url = format!(
            "{}/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );
        debug!(turns = contents.len(), "sending chat turn");
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Chat(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VoiceError::Chat(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            let detail = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or(body);
            warn!(%status, "chat request rejected");
            return Err(VoiceError::Chat(format!("{status}: {detail}")));
        }

        let (turn, reply) = read_response(&body)?;
        // Roles must alternate, so an empty answer leaves the history untouched.
        if let Some(turn) = turn {
            self.history = contents;
            self.history.push(ChatTurn {
                role: "model".to_string(),
                ..turn
            });
        }
        if let Some(ChatReply::Completed(result)) = &reply {
            info!(viability = result.viability, "chat evaluation complete");
        }
        Ok(reply)
    }
}

/// Interpret a `generateContent` response body.
///
/// A `complete_evaluation` call wins over any text in the same turn. Other
/// function calls are ignored.
pub(crate) fn read_response(body: &str) -> Result<(Option<ChatTurn>, Option<ChatReply>)> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| VoiceError::Chat(format!("malformed response: {e}")))?;
    if let Some(error) = response.error {
        return Err(VoiceError::Chat(error.message));
    }
    let Some(turn) = response.candidates.into_iter().find_map(|c| c.content) else {
        return Ok((None, None));
    };

    for call in turn.parts.iter().filter_map(|p| p.function_call.as_ref()) {
        if call.name != COMPLETE_EVALUATION {
            warn!(tool = %call.name, "ignoring unknown tool call");
            continue;
        }
        let args = ToolInvocation {
            id: call.id.clone().unwrap_or_default(),
            name: call.name.clone(),
            args: call.args.clone(),
        }
        .evaluation_args()?;
        let result = EvaluationResult::success(args.viability_score, args.summary);
        return Ok((Some(turn), Some(ChatReply::Completed(result))));
    }

    // Only the text goes back into the history; an unanswered call would be rejected.
    let text: String = turn.parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if text.trim().is_empty() {
        return Ok((None, None));
    }
    Ok((
        Some(ChatTurn::text("model", text.clone())),
        Some(ChatReply::Text(text)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_key_is_rejected() {
        let err = EvaluatorChat::new(ChatConfig::new("  "), Language::default())
            .err()
            .expect("blank key");
        assert!(matches!(err, VoiceError::CredentialMissing));
    }

    #[test]
    fn history_starts_with_greeting() {
        let chat = EvaluatorChat::new(ChatConfig::new("key"), Language::from_code("es"))
            .expect("chat");
        assert_eq!(chat.history().len(), 1);
        assert_eq!(chat.history()[0].role, "model");
        assert_eq!(
            chat.history()[0].parts[0].text.as_deref(),
            Some(chat.greeting())
        );
    }

    #[test]
    fn text_reply_is_joined() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"How long "},{"text":"have you lived in Spain?"}]}}]}"#;
        let (turn, reply) = read_response(body).unwrap();
        assert_eq!(turn.unwrap().parts.len(), 1);
        assert_eq!(
            reply,
            Some(ChatReply::Text("How long have you lived in Spain?".into()))
        );
    }

    #[test]
    fn evaluation_call_completes() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[
            {"text":"Thanks."},
            {"functionCall":{"name":"complete_evaluation","args":{"viabilityScore":64,"summary":"Student visa, valid until June"}}}
        ]}}]}"#;
        let (_, reply) = read_response(body).unwrap();
        match reply {
            Some(ChatReply::Completed(result)) => {
                assert_eq!(result.viability, 64.0);
                assert_eq!(result.summary, "Student visa, valid until June");
                assert_eq!(result.status, "success");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn unknown_call_falls_back_to_text() {
        let body = r#"{"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"lookup","args":{}}},
            {"text":"Which permit do you hold?"}
        ]}}]}"#;
        let (turn, reply) = read_response(body).unwrap();
        assert!(turn.unwrap().parts.iter().all(|p| p.function_call.is_none()));
        assert_eq!(
            reply,
            Some(ChatReply::Text("Which permit do you hold?".into()))
        );
    }

    #[tokio::test]
    async fn empty_answer_leaves_history_unchanged() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                    if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                        let body_len = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= end + 4 + body_len {
                            break;
                        }
                    }
                }
                let body = r#"{"candidates":[{"content":{"role":"model","parts":[]}}]}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        let config = ChatConfig {
            endpoint: format!("http://{addr}"),
            ..ChatConfig::new("key")
        };
        let mut chat = EvaluatorChat::new(config, Language::from_code("es")).expect("chat");
        assert_eq!(chat.send("Tengo un permiso de estudios").await.unwrap(), None);
        assert_eq!(chat.history().len(), 1);
        assert_eq!(chat.history()[0].role, "model");
        server.abort();
    }

    #[test]
    fn api_error_is_reported() {
        let body = r#"{"error":{"code":400,"message":"API key not valid"}}"#;
        let err = read_response(body).unwrap_err();
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn empty_candidates_yield_nothing() {
        let (turn, reply) = read_response(r#"{"candidates":[]}"#).unwrap();
        assert!(turn.is_none());
        assert!(reply.is_none());
    }
}
