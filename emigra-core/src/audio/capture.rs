//! Capture input stage: microphone ring → 16 kHz blocks → encoded frames.
//!
//! ## Pump stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → scratch Vec<f32>
//! 2. Resample device rate → 16 kHz (passthrough when equal)
//! 3. Cut into fixed-size blocks (mechanism block size)
//! 4. process_block → (EncodedFrame, volume)
//! 5. Emit CaptureEvent::Block under the emission gate
//! ```
//!
//! The pump runs in `spawn_blocking`. `stop()` closes the gate while holding
//! the same lock the pump holds around each emission, so once `stop()` returns
//! no further block is delivered.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{
        block::{AudioBlock, EncodedFrame, CAPTURE_SAMPLE_RATE},
        AudioConsumer, Consumer,
    },
    codec,
    error::Result,
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// Smallest block the low-latency path will emit.
const MIN_LOW_LATENCY_BLOCK: usize = 128;

/// Capture processing mechanism chosen when the stage starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CaptureMechanism {
    /// Device delivers a fixed small quantum; blocks follow that quantum.
    LowLatency { block_size: usize },
    /// Default device buffering; blocks are cut at a fixed size.
    Buffered { block_size: usize },
}

impl CaptureMechanism {
    /// Pick the mechanism from what the acquired device supports.
    ///
    /// `quantum` is the device's fixed buffer size in frames at `device_rate`,
    /// or `None` when the device only offers default buffering, in which case
    /// blocks of `fallback_block` samples are used.
    pub fn select(quantum: Option<u32>, device_rate: u32, fallback_block: usize) -> Self {
        match quantum {
            Some(frames) if frames > 0 && device_rate > 0 => {
                let at_capture_rate =
                    (frames as u64 * CAPTURE_SAMPLE_RATE as u64 / device_rate as u64) as usize;
                CaptureMechanism::LowLatency {
                    block_size: at_capture_rate.max(MIN_LOW_LATENCY_BLOCK),
                }
            }
            _ => {
                let block_size = fallback_block.max(MIN_LOW_LATENCY_BLOCK);
                warn!(
                    block_size,
                    "low-latency capture unavailable, falling back to buffered blocks"
                );
                CaptureMechanism::Buffered { block_size }
            }
        }
    }

    pub fn block_size(&self) -> usize {
        match *self {
            CaptureMechanism::LowLatency { block_size }
            | CaptureMechanism::Buffered { block_size } => block_size,
        }
    }
}

/// Output of the capture stage, in capture order.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Block { frame: EncodedFrame, volume: f32 },
}

#[derive(Default)]
pub struct CaptureCounters {
    pub samples_in: AtomicUsize,
    pub blocks_emitted: AtomicUsize,
}

/// Running capture stage. Dropping it stops the pump.
pub struct CaptureInputStage {
    /// Emission gate: `true` while blocks may be delivered.
    gate: Arc<Mutex<bool>>,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
}

impl CaptureInputStage {
    /// Spawn the pump over `consumer` (mono samples at `device_rate`).
    ///
    /// # Errors
    /// Returns `VoiceError::AudioStream` if the resampler cannot be built.
    pub fn start(
        consumer: AudioConsumer,
        device_rate: u32,
        mechanism: CaptureMechanism,
        volume_gain: f32,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self> {
        let resampler = RateConverter::new(device_rate, CAPTURE_SAMPLE_RATE, DRAIN_CHUNK)?;
        if !resampler.is_passthrough() {
            info!(from = device_rate, to = CAPTURE_SAMPLE_RATE, "capture resampling enabled");
        }

        let gate = Arc::new(Mutex::new(true));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(CaptureCounters::default());

        let pump = Pump {
            consumer,
            resampler,
            block_size: mechanism.block_size(),
            volume_gain,
            gate: Arc::clone(&gate),
            running: Arc::clone(&running),
            counters: Arc::clone(&counters),
            events,
        };
        tokio::task::spawn_blocking(move || pump.run());

        info!(?mechanism, "capture stage started");
        Ok(Self {
            gate,
            running,
            counters,
        })
    }

    /// Encode one block and measure its level with `volume_gain`.
    pub fn process_block(block: &AudioBlock, volume_gain: f32) -> (EncodedFrame, f32) {
        (
            codec::encode(block),
            codec::volume_level(&block.samples, volume_gain),
        )
    }

    pub fn counters(&self) -> &CaptureCounters {
        &self.counters
    }

    /// Stop emitting. Idempotent; nothing is delivered after this returns.
    pub fn stop(&mut self) {
        let mut live = self.gate.lock();
        if *live {
            *live = false;
            self.running.store(false, Ordering::Release);
            debug!("capture stage stopped");
        }
    }
}

impl Drop for CaptureInputStage {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Pump {
    consumer: AudioConsumer,
    resampler: RateConverter,
    block_size: usize,
    volume_gain: f32,
    gate: Arc<Mutex<bool>>,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl Pump {
    fn run(mut self) {
        let mut raw = vec![0f32; DRAIN_CHUNK];
        let mut pending: Vec<f32> = Vec::with_capacity(self.block_size * 2);

        while self.running.load(Ordering::Acquire) {
            let n = self.consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(SLEEP_EMPTY);
                continue;
            }
            self.counters.samples_in.fetch_add(n, Ordering::Relaxed);

            pending.extend(self.resampler.process(&raw[..n]));

            let mut offset = 0;
            while pending.len() - offset >= self.block_size {
                let block = AudioBlock::new(
                    pending[offset..offset + self.block_size].to_vec(),
                    CAPTURE_SAMPLE_RATE,
                );
                offset += self.block_size;
                if !self.emit(&block) {
                    debug!("capture pump exiting: gate closed");
                    return;
                }
            }
            pending.drain(..offset);
        }
        debug!("capture pump exiting");
    }

    /// Deliver one block. Returns `false` once the stage is stopped.
    fn emit(&self, block: &AudioBlock) -> bool {
        let (frame, volume) = CaptureInputStage::process_block(block, self.volume_gain);
        let live = self.gate.lock();
        if !*live {
            return false;
        }
        if self.events.send(CaptureEvent::Block { frame, volume }).is_err() {
            error!("capture receiver dropped");
            return false;
        }
        self.counters.blocks_emitted.fetch_add(1, Ordering::Relaxed);
        true
    }
}
