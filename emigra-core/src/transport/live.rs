//! WebSocket connector for the Gemini Live bidirectional streaming API.
//!
//! `connect` sends the setup message on the unsplit stream and waits for
//! `setupComplete` (in a text or binary frame) before handing the socket to
//! two tasks: a writer draining [`Outbound`] commands and a reader turning
//! frames into [`TransportEvent`]s.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, VoiceError},
    transport::{
        protocol::{self, ServerEvent},
        Connector, Outbound, Session, SessionConfig, TransportEvent,
    },
};

/// Default live endpoint.
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Connects to the live API over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct LiveConnector;

impl LiveConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Session> {
        let session_id = format!("live-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        let url = format!("{}?key={}", config.endpoint, config.api_key);

        info!(session_id = %session_id, model = %config.model, voice = %config.voice, "connecting to live session");

        let ws = match tokio::time::timeout(config.setup_timeout, handshake(&url, config)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::Transport(format!(
                    "live session not ready within {:?}",
                    config.setup_timeout
                )))
            }
        };
        info!(session_id = %session_id, "live session ready");

        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let reporter = EventReporter {
            tx: event_tx,
            ended: Arc::new(AtomicBool::new(false)),
            session_id: session_id.clone(),
        };

        tokio::spawn(outbound_loop(outbound_rx, sink, reporter.clone()));
        tokio::spawn(inbound_loop(source, reporter));

        Ok(Session::new(session_id, outbound_tx, event_rx))
    }
}

/// Open the socket, send the setup message and wait for its acknowledgement.
async fn handshake(url: &str, config: &SessionConfig) -> Result<WsStream> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| VoiceError::Transport(format!("connect failed: {e}")))?;

    let setup = serde_json::to_string(&protocol::build_setup(config))
        .map_err(|e| VoiceError::Protocol(format!("setup serialization: {e}")))?;
    ws.send(Message::Text(setup.into()))
        .await
        .map_err(|e| VoiceError::Transport(format!("sending setup failed: {e}")))?;

    wait_for_setup(&mut ws).await?;
    Ok(ws)
}

/// Read frames until the server acknowledges setup.
async fn wait_for_setup(ws: &mut WsStream) -> Result<()> {
    while let Some(message) = ws.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => text.to_owned(),
                Err(_) => continue,
            },
            Ok(Message::Close(frame)) => {
                return Err(VoiceError::Transport(format!(
                    "closed before setup completed: {frame:?}"
                )))
            }
            Ok(other) => {
                debug!(msg = ?other, "ignoring frame during setup");
                continue;
            }
            Err(e) => {
                return Err(VoiceError::Transport(format!(
                    "socket error before setup completed: {e}"
                )))
            }
        };

        for event in protocol::parse_server_message(&text)? {
            match event {
                ServerEvent::SetupComplete => return Ok(()),
                ServerEvent::Error(detail) => return Err(VoiceError::Transport(detail)),
                other => debug!(?other, "event before setup completed"),
            }
        }
    }
    Err(VoiceError::Transport("stream ended before setup completed".into()))
}

/// Delivers events until the session reaches a terminal event.
#[derive(Clone)]
struct EventReporter {
    tx: mpsc::UnboundedSender<TransportEvent>,
    ended: Arc<AtomicBool>,
    session_id: String,
}

impl EventReporter {
    /// Returns `false` once the session has ended or the receiver is gone.
    fn deliver(&self, event: TransportEvent) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Deliver `Closed` or `TransportError`; only the first terminal event wins.
    fn finish(&self, event: TransportEvent) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session_id = %self.session_id, ?event, "session ended");
        let _ = self.tx.send(event);
    }

    fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

async fn send_json<T: Serialize>(sink: &mut WsSink, message: &T) -> Result<()> {
    let json = serde_json::to_string(message)
        .map_err(|e| VoiceError::Protocol(format!("serialization failed: {e}")))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| VoiceError::Transport(format!("send failed: {e}")))
}

async fn outbound_loop(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sink: WsSink,
    reporter: EventReporter,
) {
    while let Some(command) = rx.recv().await {
        let sent = match command {
            Outbound::Audio(frame) => send_json(&mut sink, &protocol::build_audio(&frame)).await,
            Outbound::ToolResult { id, name, response } => {
                info!(session_id = %reporter.session_id, tool = %name, "acknowledging tool call");
                send_json(&mut sink, &protocol::build_tool_response(&id, &name, response)).await
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                reporter.finish(TransportEvent::Closed);
                break;
            }
        };

        if let Err(e) = sent {
            if !reporter.has_ended() {
                warn!(session_id = %reporter.session_id, "outbound failed: {e}");
                reporter.finish(TransportEvent::TransportError(e.to_string()));
            }
            break;
        }
    }
    debug!(session_id = %reporter.session_id, "outbound loop terminated");
}

async fn inbound_loop(mut source: WsSource, reporter: EventReporter) {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => {
                if data.first() != Some(&b'{') {
                    warn!(
                        session_id = %reporter.session_id,
                        len = data.len(),
                        "unexpected non-JSON binary frame, skipping"
                    );
                    continue;
                }
                match std::str::from_utf8(&data) {
                    Ok(text) => text.to_owned(),
                    Err(_) => continue,
                }
            }
            Ok(Message::Close(frame)) => {
                info!(session_id = %reporter.session_id, close_frame = ?frame, "live session closed by server");
                reporter.finish(TransportEvent::Closed);
                return;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                if !reporter.has_ended() {
                    error!(session_id = %reporter.session_id, error = %e, "live socket error");
                }
                reporter.finish(TransportEvent::TransportError(format!("socket error: {e}")));
                return;
            }
        };

        let events = match protocol::parse_server_message(&text) {
            Ok(events) => events,
            Err(e) => {
                warn!(session_id = %reporter.session_id, "skipping message: {e}");
                continue;
            }
        };

        for event in events {
            let delivered = match event {
                ServerEvent::Audio(frame) => reporter.deliver(TransportEvent::AudioFrame(frame)),
                ServerEvent::Interrupted => reporter.deliver(TransportEvent::Interrupted),
                ServerEvent::ToolCall(call) => reporter.deliver(TransportEvent::ToolCall(call)),
                ServerEvent::TurnComplete => {
                    debug!(session_id = %reporter.session_id, "turn complete");
                    true
                }
                ServerEvent::SetupComplete => true,
                ServerEvent::GoAway => {
                    warn!(session_id = %reporter.session_id, "server announced disconnect");
                    true
                }
                ServerEvent::Error(detail) => {
                    reporter.finish(TransportEvent::TransportError(detail));
                    false
                }
            };
            if !delivered {
                debug!(session_id = %reporter.session_id, "inbound loop stopping");
                return;
            }
        }
    }

    reporter.finish(TransportEvent::Closed);
    debug!(session_id = %reporter.session_id, "inbound loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> (EventReporter, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventReporter {
                tx,
                ended: Arc::new(AtomicBool::new(false)),
                session_id: "test".into(),
            },
            rx,
        )
    }

    #[test]
    fn only_first_terminal_event_is_delivered() {
        let (reporter, mut rx) = reporter();
        assert!(reporter.deliver(TransportEvent::Interrupted));
        reporter.finish(TransportEvent::TransportError("reset".into()));
        reporter.finish(TransportEvent::TransportError("again".into()));
        reporter.finish(TransportEvent::Closed);

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Interrupted);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::TransportError("reset".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        // Accepts the TCP connection and never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(socket);
        });

        let config = SessionConfig {
            endpoint: format!("ws://{addr}"),
            api_key: "key".into(),
            model: "model".into(),
            voice: "Kore".into(),
            system_prompt: String::new(),
            setup_timeout: std::time::Duration::from_millis(200),
        };
        let started = std::time::Instant::now();
        let err = LiveConnector::new().connect(&config).await.err().unwrap();
        assert!(matches!(err, VoiceError::Transport(_)), "{err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        server.abort();
    }

    #[test]
    fn nothing_is_delivered_after_close() {
        let (reporter, mut rx) = reporter();
        reporter.finish(TransportEvent::Closed);
        assert!(!reporter.deliver(TransportEvent::Interrupted));
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Closed);
        assert!(rx.try_recv().is_err());
    }
}
