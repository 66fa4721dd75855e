//! Audio devices and the two real-time stages of a voice session.
//!
//! ```text
//! InputSource ─ring─► CaptureInputStage ─► EncodedFrame + volume
//! decoded 24 kHz AudioBlock ─► PlaybackOutputStage ─► OutputSink
//! ```
//!
//! Device access goes through the [`backend::AudioBackend`] trait so the
//! session controller can run against cpal or in-memory devices.

pub mod backend;
pub mod capture;
#[cfg(feature = "audio-cpal")]
pub mod cpal_backend;
pub mod device;
pub mod playback;
pub mod resample;

pub use backend::{
    AudioBackend, BufferId, InputConstraints, InputSource, OutputSink, PlaybackEvent,
    PlaybackEventSender,
};
pub use capture::{CaptureEvent, CaptureInputStage, CaptureMechanism};
#[cfg(feature = "audio-cpal")]
pub use cpal_backend::CpalBackend;
pub use playback::{BufferRelease, PlaybackOutputStage, ScheduledBuffer};
