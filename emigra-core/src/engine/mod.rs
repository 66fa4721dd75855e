//! `VoiceEngine`: top-level lifecycle controller for live voice sessions.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::new(config, backend, connector)
//!     └─► start(language)     → session task spawned, state = connecting
//!         ├─► events          → state / volume / complete / close
//!         └─► handle.close()  → liveness cleared, teardown, state = closed
//! ```
//!
//! Only one session runs at a time. `start()` while a session is active
//! returns `VoiceError::AlreadyRunning`.
//!
//! ## Threading
//!
//! Device streams are owned by the backend's own threads; the session task
//! only holds `Send` handles to them. Every state change is made on the
//! session task, the host reads a snapshot through [`SessionHandle::state`].

pub mod session;
pub mod state;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    audio::{AudioBackend, InputConstraints},
    error::{ErrorCategory, Result, VoiceError},
    ipc::events::{EvaluationResult, SessionState, VoiceEvent},
    language::Language,
    transport::{live::LIVE_ENDPOINT, Connector, SessionConfig},
};

pub use session::{DiagnosticsSnapshot, SessionDiagnostics};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// What kind of device the engine runs on. Drives buffer sizes, input
/// constraints and the wording of error hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProfile {
    pub is_mobile: bool,
    pub is_ios: bool,
}

impl PlatformProfile {
    /// Profile of the platform this binary was compiled for.
    pub fn detect() -> Self {
        let is_ios = cfg!(target_os = "ios");
        Self {
            is_mobile: is_ios || cfg!(target_os = "android"),
            is_ios,
        }
    }
}

/// Configuration for `VoiceEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Credential for the live service. `None` or blank fails the session
    /// with `CredentialMissing` before any device is touched.
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    /// WebSocket endpoint of the live service.
    pub endpoint: String,
    /// How long to wait for the service to acknowledge setup. Default: 15 s.
    pub setup_timeout: Duration,
    /// Multiplier applied to block RMS before clamping to [0, 1]. Default: 5.0.
    pub volume_gain: f32,
    /// Capture block size (samples at 16 kHz) when no low-latency quantum is
    /// available. Default: 4096 on desktop, 2048 on mobile.
    pub desktop_block_size: usize,
    pub mobile_block_size: usize,
    /// Requested device buffer duration. Default: 32 ms.
    pub low_latency_quantum_ms: u32,
    pub preferred_input_device: Option<String>,
    pub platform: PlatformProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpoint: LIVE_ENDPOINT.to_string(),
            setup_timeout: Duration::from_secs(15),
            volume_gain: crate::codec::VOLUME_GAIN,
            desktop_block_size: 4096,
            mobile_block_size: 2048,
            low_latency_quantum_ms: 32,
            preferred_input_device: None,
            platform: PlatformProfile::detect(),
        }
    }
}

impl EngineConfig {
    /// The credential, if one is configured and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn fallback_block_size(&self) -> usize {
        if self.platform.is_mobile {
            self.mobile_block_size
        } else {
            self.desktop_block_size
        }
    }

    /// Microphone constraints for this platform. iOS only accepts the
    /// capture rate as a preference.
    pub fn input_constraints(&self) -> InputConstraints {
        InputConstraints {
            sample_rate_is_ideal: self.platform.is_ios,
            low_latency_quantum_ms: self.low_latency_quantum_ms,
            preferred_device: self.preferred_input_device.clone(),
            ..InputConstraints::default()
        }
    }

    /// Transport parameters for one session, or `None` without a credential.
    pub fn session_config(&self, language: &Language) -> Option<SessionConfig> {
        let api_key = self.api_key()?;
        Some(SessionConfig {
            endpoint: self.endpoint.clone(),
            api_key: api_key.to_string(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_prompt: language.voice_prompt(),
            setup_timeout: self.setup_timeout,
        })
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(EvaluationResult),
    Closed,
    Failed(ErrorCategory),
}

/// The top-level engine handle.
///
/// Generic over the audio backend and the transport so hosts (and tests)
/// can plug in their own.
pub struct VoiceEngine<B, C> {
    config: EngineConfig,
    backend: Arc<B>,
    connector: Arc<C>,
    /// `true` while a session task is running.
    active: Arc<AtomicBool>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl<B: AudioBackend, C: Connector> VoiceEngine<B, C> {
    pub fn new(config: EngineConfig, backend: B, connector: C) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            connector: Arc::new(connector),
            active: Arc::new(AtomicBool::new(false)),
            diagnostics: Arc::new(SessionDiagnostics::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a session is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start a voice session in `language`.
    ///
    /// Returns immediately; progress is reported on the event receiver,
    /// starting with `connecting` and always ending with `VoiceEvent::Close`.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - `VoiceError::AlreadyRunning` if another session is active.
    pub fn start(
        &self,
        language: Language,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<VoiceEvent>)> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VoiceError::AlreadyRunning);
        }

        self.diagnostics.reset();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicBool::new(true));
        let cancel = Arc::new(Notify::new());
        let status = Arc::new(Mutex::new(SessionState::Connecting));

        let ctx = session::SessionContext {
            config: self.config.clone(),
            language,
            backend: Arc::clone(&self.backend),
            connector: Arc::clone(&self.connector),
            events: events_tx,
            live: Arc::clone(&live),
            cancel: Arc::clone(&cancel),
            status: Arc::clone(&status),
            active: Arc::clone(&self.active),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let task = tokio::spawn(session::run(ctx));
        info!(language = language.code, "voice session spawned");

        Ok((
            SessionHandle {
                live,
                cancel,
                status,
                task: Some(task),
            },
            events_rx,
        ))
    }

    /// Snapshot of the counters of the current (or last) session.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

/// Host-side handle to a running session. Dropping it closes the session.
pub struct SessionHandle {
    live: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    status: Arc<Mutex<SessionState>>,
    task: Option<JoinHandle<SessionOutcome>>,
}

impl SessionHandle {
    /// Ask the session to end. Idempotent; teardown happens on the session task.
    pub fn close(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            info!("session close requested");
            self.cancel.notify_one();
        }
    }

    pub fn state(&self) -> SessionState {
        *self.status.lock()
    }

    /// `false` once the host closed the session or it ended on its own.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Wait for the session task to finish.
    pub async fn wait(mut self) -> SessionOutcome {
        let Some(task) = self.task.take() else {
            return SessionOutcome::Closed;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("session task failed: {e}");
                SessionOutcome::Failed(ErrorCategory::Other)
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> EngineConfig {
        EngineConfig {
            platform: PlatformProfile::default(),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn blank_credential_is_missing() {
        let mut config = desktop();
        assert!(config.api_key().is_none());
        config.api_key = Some("   ".into());
        assert!(config.api_key().is_none());
        assert!(config.session_config(&Language::default()).is_none());
        config.api_key = Some(" key ".into());
        assert_eq!(config.api_key(), Some("key"));
    }

    #[test]
    fn session_config_carries_language_prompt() {
        let config = EngineConfig {
            api_key: Some("key".into()),
            ..desktop()
        };
        let session = config
            .session_config(&Language::from_code("es"))
            .expect("credential present");
        assert_eq!(session.voice, "Kore");
        assert!(session.system_prompt.contains("Español (es)"));
        assert_eq!(session.setup_timeout, Duration::from_secs(15));
    }

    #[test]
    fn block_size_follows_platform() {
        let mut config = desktop();
        assert_eq!(config.fallback_block_size(), 4096);
        config.platform.is_mobile = true;
        assert_eq!(config.fallback_block_size(), 2048);
    }

    #[test]
    fn ios_requests_rate_as_ideal() {
        let mut config = desktop();
        assert!(!config.input_constraints().sample_rate_is_ideal);
        config.platform = PlatformProfile {
            is_mobile: true,
            is_ios: true,
        };
        let constraints = config.input_constraints();
        assert!(constraints.sample_rate_is_ideal);
        assert_eq!(constraints.sample_rate, Some(16_000));
        assert!(constraints.echo_cancellation);
    }
}
