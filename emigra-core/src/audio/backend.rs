//! Device seam between the session controller and the host audio API.
//!
//! The controller only ever talks to these traits. `CpalBackend` implements
//! them for real hardware; tests plug in in-memory devices.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    buffering::{block::AudioBlock, AudioConsumer},
    error::Result,
};

/// Identifier of one scheduled playback buffer.
pub type BufferId = u64;

/// Microphone constraints requested at acquisition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    /// Target capture rate, where the device lets us tune it.
    pub sample_rate: Option<u32>,
    /// `true` when `sample_rate` is only a preference (iOS), `false` when exact.
    pub sample_rate_is_ideal: bool,
    /// Preferred low-latency device quantum, in milliseconds.
    pub low_latency_quantum_ms: u32,
    /// Input device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl Default for InputConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 1,
            sample_rate: Some(crate::buffering::block::CAPTURE_SAMPLE_RATE),
            sample_rate_is_ideal: false,
            low_latency_quantum_ms: 32,
            preferred_device: None,
        }
    }
}

/// Notification from an output device's render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The buffer finished playing, or was stopped and released.
    Ended(BufferId),
}

pub type PlaybackEventSender = mpsc::UnboundedSender<PlaybackEvent>;

/// An acquired microphone.
///
/// Raw mono samples at [`InputSource::sample_rate`] are written into a ring
/// whose consumer half is handed to the capture stage exactly once.
pub trait InputSource: Send {
    /// Native rate of the samples pushed into the ring (Hz).
    fn sample_rate(&self) -> u32;

    /// Device quantum in frames when the device accepted a fixed low-latency
    /// buffer size; `None` when only default buffering is available.
    fn low_latency_quantum(&self) -> Option<u32>;

    /// Hand over the consumer half of the sample ring. Returns `None` once taken.
    fn take_consumer(&mut self) -> Option<AudioConsumer>;

    /// Stop the device and release it. Must be idempotent.
    fn stop(&mut self) -> Result<()>;
}

/// An opened speaker output with its own clock.
pub trait OutputSink: Send {
    /// Rate of the output context (Hz); buffers may be resampled to the device.
    fn sample_rate(&self) -> u32;

    /// Current output clock time in seconds. Monotonically non-decreasing.
    fn now(&self) -> f64;

    /// Schedule `block` to start at `start_at` seconds on the output clock.
    fn schedule(&mut self, id: BufferId, block: AudioBlock, start_at: f64) -> Result<()>;

    /// Stop a scheduled or playing buffer immediately.
    fn stop(&mut self, id: BufferId);

    /// Stop everything and release the device. Must be idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Factory for input and output devices.
#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    /// Acquire the microphone. Suspends until the device is open or refused.
    async fn acquire_input(&self, constraints: &InputConstraints) -> Result<Box<dyn InputSource>>;

    /// Open the speaker output at `sample_rate`; buffer-ended notifications go to `events`.
    async fn open_output(
        &self,
        sample_rate: u32,
        events: PlaybackEventSender,
    ) -> Result<Box<dyn OutputSink>>;
}
