//! The voice session task.
//!
//! ## Lifecycle (one spawned task per session)
//!
//! ```text
//! 1. connecting: check credential (before touching any device)
//! 2. acquire input → open output → connect transport
//!    (each await races cancellation; late resources are released)
//! 3. wire capture, state = listening
//! 4. select! over cancellation, transport, playback and capture events
//! 5. teardown (idempotent), then completion / error / close events
//! ```
//!
//! All status changes happen on this task, so the state machine has a single
//! writer. The host only ever observes a snapshot through `SessionHandle`.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::{
        AudioBackend, BufferRelease, CaptureEvent, CaptureInputStage, CaptureMechanism,
        InputSource, PlaybackEvent, PlaybackOutputStage,
    },
    buffering::block::PLAYBACK_SAMPLE_RATE,
    codec,
    engine::{state::SessionStateMachine, EngineConfig, PlatformProfile, SessionOutcome},
    error::{ErrorCategory, VoiceError},
    ipc::events::{
        EvaluationResult, SessionErrorInfo, SessionState, SessionStateEvent, VoiceEvent,
        VolumeEvent,
    },
    language::Language,
    transport::{protocol::COMPLETE_EVALUATION, Connector, SessionSender, TransportEvent},
};

#[derive(Default)]
pub struct SessionDiagnostics {
    pub frames_sent: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub audio_frames_received: AtomicUsize,
    pub buffers_scheduled: AtomicUsize,
    pub buffers_ended: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub tool_calls: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.audio_frames_received.store(0, Ordering::Relaxed);
        self.buffers_scheduled.store(0, Ordering::Relaxed);
        self.buffers_ended.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
        self.tool_calls.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            audio_frames_received: self.audio_frames_received.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            buffers_ended: self.buffers_ended.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_sent: usize,
    pub bytes_sent: usize,
    pub audio_frames_received: usize,
    pub buffers_scheduled: usize,
    pub buffers_ended: usize,
    pub interruptions: usize,
    pub tool_calls: usize,
}

/// All context the session task needs, passed as one struct.
pub(crate) struct SessionContext<B, C> {
    pub config: EngineConfig,
    pub language: Language,
    pub backend: Arc<B>,
    pub connector: Arc<C>,
    pub events: mpsc::UnboundedSender<VoiceEvent>,
    pub live: Arc<AtomicBool>,
    pub cancel: Arc<Notify>,
    pub status: Arc<Mutex<SessionState>>,
    /// Engine-wide "a session is running" flag, cleared when this task ends.
    pub active: Arc<AtomicBool>,
    pub diagnostics: Arc<SessionDiagnostics>,
}

impl<B, C> SessionContext<B, C> {
    fn cancelled(&self) -> bool {
        !self.live.load(Ordering::Acquire)
    }

    /// Await `fut`, giving up with `None` as soon as the host closes the session.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.notified() => None,
            out = fut => Some(out),
        }
    }
}

/// Why the event loop stopped.
enum Exit {
    Completed(EvaluationResult),
    Cancelled,
    RemoteClosed,
    Failed(VoiceError),
}

/// Receivers wired up once every resource is live.
struct Wiring {
    capture: mpsc::UnboundedReceiver<CaptureEvent>,
    playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Every resource the session may hold. Each slot is released at most once.
#[derive(Default)]
struct PipelineResources {
    capture: Option<CaptureInputStage>,
    input: Option<Box<dyn InputSource>>,
    playback: Option<PlaybackOutputStage>,
    session: Option<SessionSender>,
}

impl PipelineResources {
    /// Release whatever was acquired. Safe to call repeatedly and on partial setups.
    fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.stop() {
                warn!("releasing input failed: {e}");
            }
        }
        if let Some(mut playback) = self.playback.take() {
            if let Err(e) = playback.close() {
                warn!("releasing output failed: {e}");
            }
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

impl Drop for PipelineResources {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Applies status changes and forwards events to the host.
struct Reporter {
    machine: SessionStateMachine,
    events: mpsc::UnboundedSender<VoiceEvent>,
    status: Arc<Mutex<SessionState>>,
    platform: PlatformProfile,
    volume_seq: u64,
}

impl Reporter {
    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    fn announce(&self) {
        self.emit(VoiceEvent::State(SessionStateEvent {
            state: self.machine.state(),
            error: None,
        }));
    }

    fn set(&mut self, next: SessionState) {
        if self.machine.advance(next) {
            *self.status.lock() = next;
            self.announce();
        }
    }

    fn fail(&mut self, category: ErrorCategory) {
        if self.machine.advance(SessionState::Error) {
            *self.status.lock() = SessionState::Error;
            self.emit(VoiceEvent::State(SessionStateEvent {
                state: SessionState::Error,
                error: Some(SessionErrorInfo {
                    category,
                    message: category.message(&self.platform).to_string(),
                    hint: category.hint(&self.platform).map(str::to_string),
                }),
            }));
        }
    }

    fn volume(&mut self, level: f32) {
        self.volume_seq += 1;
        self.emit(VoiceEvent::Volume(VolumeEvent {
            seq: self.volume_seq,
            level,
        }));
    }
}

/// Run one session to completion.
pub(crate) async fn run<B, C>(ctx: SessionContext<B, C>) -> SessionOutcome
where
    B: AudioBackend,
    C: Connector,
{
    let span = info_span!("voice_session", language = ctx.language.code);
    async move {
        let mut reporter = Reporter {
            machine: SessionStateMachine::new(),
            events: ctx.events.clone(),
            status: Arc::clone(&ctx.status),
            platform: ctx.config.platform,
            volume_seq: 0,
        };
        *ctx.status.lock() = SessionState::Connecting;
        reporter.announce();
        info!("voice session starting");

        let mut resources = PipelineResources::default();
        let exit = drive(&ctx, &mut reporter, &mut resources).await;

        resources.teardown();
        ctx.live.store(false, Ordering::Release);
        info!(diagnostics = ?ctx.diagnostics.snapshot(), "session torn down");

        let outcome = match exit {
            Exit::Completed(result) => {
                info!(viability = result.viability, "evaluation complete");
                reporter.emit(VoiceEvent::Complete(result.clone()));
                reporter.set(SessionState::Closed);
                SessionOutcome::Completed(result)
            }
            Exit::Cancelled => {
                info!("session closed by host");
                reporter.set(SessionState::Closed);
                SessionOutcome::Closed
            }
            Exit::RemoteClosed => {
                info!("session closed by remote");
                reporter.set(SessionState::Closed);
                SessionOutcome::Closed
            }
            Exit::Failed(e) => {
                let category = e.category();
                error!(?category, "voice session failed: {e}");
                reporter.fail(category);
                SessionOutcome::Failed(category)
            }
        };
        reporter.emit(VoiceEvent::Close);
        ctx.active.store(false, Ordering::Release);
        outcome
    }
    .instrument(span)
    .await
}

async fn drive<B, C>(
    ctx: &SessionContext<B, C>,
    reporter: &mut Reporter,
    resources: &mut PipelineResources,
) -> Exit
where
    B: AudioBackend,
    C: Connector,
{
    let mut wiring = match setup(ctx, resources).await {
        Ok(Some(wiring)) => wiring,
        Ok(None) => return Exit::Cancelled,
        Err(e) => return Exit::Failed(e),
    };
    let (Some(playback), Some(sender)) = (resources.playback.as_mut(), resources.session.as_ref())
    else {
        return Exit::Failed(VoiceError::Other(anyhow::anyhow!(
            "session wired without playback or transport"
        )));
    };

    reporter.set(SessionState::Listening);
    let diag = &ctx.diagnostics;

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.notified() => return Exit::Cancelled,

            event = wiring.transport.recv() => match event {
                Some(TransportEvent::AudioFrame(frame)) => {
                    SessionDiagnostics::bump(&diag.audio_frames_received);
                    let block = codec::decode(&frame, PLAYBACK_SAMPLE_RATE);
                    match playback.enqueue(block) {
                        Ok(Some(_)) => {
                            SessionDiagnostics::bump(&diag.buffers_scheduled);
                            reporter.set(SessionState::Speaking);
                        }
                        Ok(None) => {}
                        Err(e) => return Exit::Failed(e),
                    }
                }
                Some(TransportEvent::Interrupted) => {
                    SessionDiagnostics::bump(&diag.interruptions);
                    let stopped = playback.interrupt();
                    info!(stopped, "model interrupted");
                    reporter.set(SessionState::Listening);
                }
                Some(TransportEvent::ToolCall(call)) => {
                    SessionDiagnostics::bump(&diag.tool_calls);
                    if call.name != COMPLETE_EVALUATION {
                        warn!(tool = %call.name, "ignoring unknown tool call");
                        continue;
                    }
                    sender.send_tool_result(&call.id, &call.name, json!({ "result": "ok" }));
                    return match call.evaluation_args() {
                        Ok(args) => Exit::Completed(EvaluationResult::success(
                            args.viability_score,
                            args.summary,
                        )),
                        Err(e) => Exit::Failed(e),
                    };
                }
                Some(TransportEvent::Closed) => return Exit::RemoteClosed,
                None => {
                    warn!("transport ended without a close event");
                    return Exit::RemoteClosed;
                }
                Some(TransportEvent::TransportError(detail)) => {
                    return Exit::Failed(VoiceError::Transport(detail));
                }
            },

            Some(PlaybackEvent::Ended(id)) = wiring.playback.recv() => {
                SessionDiagnostics::bump(&diag.buffers_ended);
                if playback.on_buffer_ended(id) == BufferRelease::Drained {
                    debug!("playback drained");
                    reporter.set(SessionState::Listening);
                }
            }

            Some(CaptureEvent::Block { frame, volume }) = wiring.capture.recv() => {
                SessionDiagnostics::bump(&diag.frames_sent);
                diag.bytes_sent.fetch_add(frame.len(), Ordering::Relaxed);
                sender.send(frame);
                reporter.volume(volume);
            }
        }

        if ctx.cancelled() {
            return Exit::Cancelled;
        }
    }
}

/// Acquire devices and connect. `Ok(None)` means the host cancelled meanwhile.
async fn setup<B, C>(
    ctx: &SessionContext<B, C>,
    resources: &mut PipelineResources,
) -> Result<Option<Wiring>, VoiceError>
where
    B: AudioBackend,
    C: Connector,
{
    let session_config = ctx
        .config
        .session_config(&ctx.language)
        .ok_or(VoiceError::CredentialMissing)?;

    let constraints = ctx.config.input_constraints();
    let Some(acquired) = ctx
        .until_cancelled(ctx.backend.acquire_input(&constraints))
        .await
    else {
        return Ok(None);
    };
    if ctx.cancelled() {
        if let Ok(mut input) = acquired {
            let _ = input.stop();
        }
        return Ok(None);
    }
    let mut input = acquired?;
    let device_rate = input.sample_rate();
    let quantum = input.low_latency_quantum();
    let consumer = input.take_consumer();
    resources.input = Some(input);
    let consumer =
        consumer.ok_or_else(|| VoiceError::AudioStream("input ring already taken".into()))?;
    info!(device_rate, ?quantum, "microphone acquired");

    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let Some(opened) = ctx
        .until_cancelled(ctx.backend.open_output(PLAYBACK_SAMPLE_RATE, playback_tx))
        .await
    else {
        return Ok(None);
    };
    if ctx.cancelled() {
        if let Ok(mut output) = opened {
            let _ = output.close();
        }
        return Ok(None);
    }
    resources.playback = Some(PlaybackOutputStage::new(opened?));

    let Some(connected) = ctx
        .until_cancelled(ctx.connector.connect(&session_config))
        .await
    else {
        info!("closed while connecting; handshake abandoned");
        return Ok(None);
    };
    if ctx.cancelled() {
        if let Ok(session) = connected {
            let (sender, _) = session.split();
            sender.close();
        }
        return Ok(None);
    }
    let (sender, transport_rx) = connected?.split();
    info!(session_id = sender.id(), "session connected");
    resources.session = Some(sender);

    let mechanism = CaptureMechanism::select(quantum, device_rate, ctx.config.fallback_block_size());
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    resources.capture = Some(CaptureInputStage::start(
        consumer,
        device_rate,
        mechanism,
        ctx.config.volume_gain,
        capture_tx,
    )?);

    Ok(Some(Wiring {
        capture: capture_rx,
        playback: playback_rx,
        transport: transport_rx,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_reset_and_snapshot() {
        let diag = SessionDiagnostics::default();
        SessionDiagnostics::bump(&diag.frames_sent);
        diag.bytes_sent.fetch_add(8192, Ordering::Relaxed);
        let snap = diag.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.bytes_sent, 8192);

        diag.reset();
        assert_eq!(diag.snapshot().frames_sent, 0);
    }

    #[test]
    fn teardown_of_empty_resources_is_a_no_op() {
        let mut resources = PipelineResources::default();
        resources.teardown();
        resources.teardown();
    }

    #[test]
    fn reporter_emits_only_real_changes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = Reporter {
            machine: SessionStateMachine::new(),
            events: tx,
            status: Arc::new(Mutex::new(SessionState::Connecting)),
            platform: PlatformProfile::default(),
            volume_seq: 0,
        };
        reporter.set(SessionState::Listening);
        reporter.set(SessionState::Listening);
        reporter.fail(ErrorCategory::TransportFailure);
        reporter.set(SessionState::Closed);

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                VoiceEvent::State(s) => Some(s.state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::Listening, SessionState::Error]);
        assert_eq!(*reporter.status.lock(), SessionState::Error);
    }
}
