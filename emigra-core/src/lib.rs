//! # emigra-core
//!
//! Live voice interview engine: microphone capture, streaming to a remote
//! speech model, and gapless playback of its spoken replies.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputSource → SPSC RingBuffer → CaptureInputStage (pump thread)
//!                                                   │ 16 kHz PCM16 frames + volume
//!                                                   ▼
//!                        VoiceEngine session task (tokio::select!)
//!                           │                        ▲
//!                SessionSender (WebSocket)      TransportEvent
//!                                                    │ 24 kHz PCM16
//!                                                    ▼
//!                       PlaybackOutputStage → OutputSink → Speaker
//! ```
//!
//! The audio callbacks never allocate or block. Everything the host sees
//! arrives as [`VoiceEvent`]s on one channel per session.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod chat;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod language;
pub mod transport;

// Convenience re-exports for downstream crates
pub use chat::{ChatConfig, ChatReply, EvaluatorChat};
pub use engine::{EngineConfig, PlatformProfile, SessionHandle, SessionOutcome, VoiceEngine};
pub use error::{ErrorCategory, VoiceError};
pub use ipc::events::{EvaluationResult, SessionState, SessionStateEvent, VoiceEvent, VolumeEvent};
pub use language::Language;
pub use transport::LiveConnector;

#[cfg(feature = "audio-cpal")]
pub use audio::CpalBackend;
