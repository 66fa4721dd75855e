//! Session transport: the duplex connection to the remote voice model.
//!
//! A [`Connector`] performs the handshake and yields a [`Session`]. The session
//! is a pair of channels: outbound [`Outbound`] commands written in order by a
//! background task, and inbound [`TransportEvent`]s in arrival order.
//!
//! After `Closed` or `TransportError` no further events are delivered, and at
//! most one `TransportError` is ever reported per session.

pub mod live;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    buffering::block::EncodedFrame,
    error::{Result, VoiceError},
};

pub use live::LiveConnector;

/// Everything needed to open one live session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, without the key query parameter.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_prompt: String,
    /// How long to wait for the server to acknowledge setup.
    pub setup_timeout: Duration,
}

/// A function call requested by the remote model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Arguments of `complete_evaluation`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvaluationArgs {
    #[serde(rename = "viabilityScore")]
    pub viability_score: f64,
    #[serde(default)]
    pub summary: String,
}

impl ToolInvocation {
    /// Decode the arguments as an evaluation result.
    pub fn evaluation_args(&self) -> Result<EvaluationArgs> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            VoiceError::Protocol(format!("invalid {} arguments: {e}", self.name))
        })
    }
}

/// Inbound notification from the session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 24 kHz PCM from the model.
    AudioFrame(EncodedFrame),
    ToolCall(ToolInvocation),
    /// The model stopped speaking because the user barged in.
    Interrupted,
    Closed,
    TransportError(String),
}

/// Command for the session's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(EncodedFrame),
    ToolResult {
        id: String,
        name: String,
        response: Value,
    },
    Close,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a session and complete its setup handshake.
    async fn connect(&self, config: &SessionConfig) -> Result<Session>;
}

/// An established session.
pub struct Session {
    id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            outbound,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Separate the write half from the event stream.
    pub fn split(self) -> (SessionSender, mpsc::UnboundedReceiver<TransportEvent>) {
        (
            SessionSender {
                id: self.id,
                outbound: self.outbound,
            },
            self.events,
        )
    }
}

/// Write half of a [`Session`]. All sends are fire-and-forget.
#[derive(Debug, Clone)]
pub struct SessionSender {
    id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl SessionSender {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a captured frame. Dropped silently once the session has ended.
    pub fn send(&self, frame: EncodedFrame) {
        if self.outbound.send(Outbound::Audio(frame)).is_err() {
            trace!(session_id = %self.id, "session closed, dropping audio frame");
        }
    }

    /// Acknowledge a tool call.
    pub fn send_tool_result(&self, id: &str, name: &str, response: Value) {
        let _ = self.outbound.send(Outbound::ToolResult {
            id: id.to_string(),
            name: name.to_string(),
            response,
        });
    }

    /// Ask the writer to close the connection after anything already queued.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluation_args_decode() {
        let call = ToolInvocation {
            id: "1".into(),
            name: protocol::COMPLETE_EVALUATION.into(),
            args: json!({"viabilityScore": 64.5, "summary": "Student visa"}),
        };
        let args = call.evaluation_args().unwrap();
        assert_eq!(args.viability_score, 64.5);
        assert_eq!(args.summary, "Student visa");
    }

    #[test]
    fn evaluation_args_require_score() {
        let call = ToolInvocation {
            id: "1".into(),
            name: protocol::COMPLETE_EVALUATION.into(),
            args: json!({"summary": "?"}),
        };
        assert!(matches!(call.evaluation_args(), Err(VoiceError::Protocol(_))));
    }

    #[test]
    fn sender_queues_in_order_and_ignores_closed_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (sender, _events) = Session::new("s", tx, events_rx).split();

        sender.send(EncodedFrame::from_bytes(vec![0, 0]));
        sender.send_tool_result("c", "complete_evaluation", json!({"result": "ok"}));
        sender.close();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Audio(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::ToolResult { .. })));
        assert_eq!(rx.try_recv(), Ok(Outbound::Close));

        drop(rx);
        assert!(sender.is_closed());
        sender.send(EncodedFrame::from_bytes(vec![0, 0]));
    }
}
