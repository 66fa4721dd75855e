//! `AudioBackend` over cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They must not
//! block or perform I/O, and they avoid allocation in steady state:
//! - the input callback mixes down into a reused buffer and `push_slice`s
//!   into the SPSC ring;
//! - the output callback drains a bounded command queue with `try_recv`,
//!   mixes voices on the 24 kHz context timeline, converts that single stream
//!   to the device rate, and hands finished voices back to the device thread
//!   so their buffers are freed off the RT thread.
//!
//! The output prefers a device config at the context rate. Otherwise one
//! [`PullResampler`] converts the mixed timeline for the life of the stream,
//! so consecutive buffers join without a seam.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. Each stream is therefore built,
//! played and dropped inside its own `spawn_blocking` thread, which reports the
//! open result back over a oneshot and then parks until asked to stop.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BuildStreamError, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, SupportedBufferSize, SupportedStreamConfig,
};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        backend::{
            AudioBackend, BufferId, InputConstraints, InputSource, OutputSink, PlaybackEvent,
            PlaybackEventSender,
        },
        device,
        resample::PullResampler,
    },
    buffering::{block::AudioBlock, create_audio_ring, AudioConsumer, AudioProducer, Producer},
    error::{Result, VoiceError},
};

/// Pending render commands the output callback can lag behind by.
const COMMAND_QUEUE: usize = 512;

/// Pre-allocated room for voices waiting on the timeline; grows past this.
const VOICE_CAPACITY: usize = 256;

/// Pre-allocated mono scratch for one callback, in device frames.
const SCRATCH_FRAMES: usize = 8192;

/// Host audio through cpal's default host.
#[derive(Debug, Default, Clone)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn acquire_input(&self, constraints: &InputConstraints) -> Result<Box<dyn InputSource>> {
        let (open_tx, open_rx) = oneshot::channel::<Result<OpenedInput>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let constraints = constraints.clone();
        let callback_running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            let stream = match open_input_stream(&constraints, callback_running) {
                Ok((stream, opened)) => {
                    if open_tx.send(Ok(opened)).is_err() {
                        debug!("input acquisition abandoned; releasing device");
                        return;
                    }
                    stream
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            // Returns on stop() or when the handle is dropped.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("input device released");
        });

        let opened = open_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("input device thread exited".into()))??;

        Ok(Box::new(CpalInput {
            sample_rate: opened.sample_rate,
            quantum: opened.quantum,
            consumer: Some(opened.consumer),
            running,
            stop_tx: Some(stop_tx),
        }))
    }

    async fn open_output(
        &self,
        sample_rate: u32,
        events: PlaybackEventSender,
    ) -> Result<Box<dyn OutputSink>> {
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (command_tx, command_rx) = crossbeam_channel::bounded::<RenderCommand>(COMMAND_QUEUE);
        // Unbounded: every retired voice must reach this thread to report `Ended`.
        let (retired_tx, retired_rx) = crossbeam_channel::unbounded::<Voice>();
        let clock = Arc::new(AtomicU64::new(0));

        let renderer = Renderer::new(command_rx, Mixer::new(retired_tx), Arc::clone(&clock));

        tokio::task::spawn_blocking(move || {
            let stream = match open_output_stream(sample_rate, renderer) {
                Ok((stream, device_rate)) => {
                    if open_tx.send(Ok(device_rate)).is_err() {
                        return;
                    }
                    stream
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            loop {
                crossbeam_channel::select! {
                    recv(stop_rx) -> _ => break,
                    recv(retired_rx) -> voice => match voice {
                        Ok(voice) => {
                            let _ = events.send(PlaybackEvent::Ended(voice.id));
                        }
                        Err(_) => break,
                    },
                }
            }
            drop(stream);
            debug!("output device released");
        });

        let device_rate = open_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("output device thread exited".into()))??;

        info!(context_rate = sample_rate, device_rate, "output opened");
        Ok(Box::new(CpalOutput {
            context_rate: sample_rate,
            clock,
            commands: command_tx,
            stop_tx: Some(stop_tx),
        }))
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

struct OpenedInput {
    sample_rate: u32,
    quantum: Option<u32>,
    consumer: AudioConsumer,
}

struct CpalInput {
    sample_rate: u32,
    quantum: Option<u32>,
    consumer: Option<AudioConsumer>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
}

impl InputSource for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn low_latency_quantum(&self) -> Option<u32> {
        self.quantum
    }

    fn take_consumer(&mut self) -> Option<AudioConsumer> {
        self.consumer.take()
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
            debug!("input stop requested");
        }
        Ok(())
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Open, configure and start the microphone stream on the calling thread.
fn open_input_stream(
    constraints: &InputConstraints,
    running: Arc<AtomicBool>,
) -> Result<(Stream, OpenedInput)> {
    let host = cpal::default_host();
    let device = device::resolve_input_device(&host, constraints.preferred_device.as_deref())?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );
    debug!(
        echo_cancellation = constraints.echo_cancellation,
        noise_suppression = constraints.noise_suppression,
        auto_gain_control = constraints.auto_gain_control,
        "voice processing is left to the host platform"
    );

    let supported = choose_input_config(&device, constraints)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let mut quantum = fixed_quantum(
        supported.buffer_size(),
        sample_rate,
        constraints.low_latency_quantum_ms,
    );

    let mut config: StreamConfig = supported.config();
    config.buffer_size = match quantum {
        Some(frames) => cpal::BufferSize::Fixed(frames),
        None => cpal::BufferSize::Default,
    };
    info!(sample_rate, channels, ?quantum, "input config selected");

    let (producer, consumer) = create_audio_ring();
    let (stream, consumer) = match build_input(&device, &config, format, producer, Arc::clone(&running)) {
        Ok(stream) => (stream, consumer),
        // Some backends advertise a range they then refuse; retry with defaults.
        Err(e) if quantum.is_some() => {
            warn!("fixed input buffer rejected ({e}), retrying with default buffering");
            quantum = None;
            config.buffer_size = cpal::BufferSize::Default;
            let (producer, consumer) = create_audio_ring();
            (
                build_input(&device, &config, format, producer, Arc::clone(&running))?,
                consumer,
            )
        }
        Err(e) => return Err(e),
    };

    stream.play().map_err(|e| {
        running.store(false, Ordering::Release);
        map_play_error(e)
    })?;

    Ok((
        stream,
        OpenedInput {
            sample_rate,
            quantum,
            consumer,
        },
    ))
}

/// Prefer a config that natively runs at the requested rate, else the default.
fn choose_input_config(
    device: &cpal::Device,
    constraints: &InputConstraints,
) -> Result<SupportedStreamConfig> {
    if let Some(rate) = constraints.sample_rate {
        match device.supported_input_configs() {
            Ok(ranges) => {
                let mut candidates: Vec<_> = ranges
                    .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
                    .collect();
                candidates.sort_by_key(|r| {
                    (
                        r.channels() != constraints.channel_count,
                        r.sample_format() != SampleFormat::F32,
                    )
                });
                if let Some(range) = candidates.into_iter().next() {
                    return Ok(range.with_sample_rate(SampleRate(rate)));
                }
                if constraints.sample_rate_is_ideal {
                    debug!(rate, "preferred capture rate unavailable, using device default");
                } else {
                    warn!(rate, "capture rate unsupported by device, resampling instead");
                }
            }
            Err(e) => warn!("failed to query input configs: {e}"),
        }
    }

    device.default_input_config().map_err(|e| {
        let text = e.to_string();
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => VoiceError::DeviceBusy(text),
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend_message(&err.description)
            }
            _ => VoiceError::AudioDevice(text),
        }
    })
}

/// Fixed device quantum for `quantum_ms`, if the device's range allows it.
fn fixed_quantum(buffer: &SupportedBufferSize, sample_rate: u32, quantum_ms: u32) -> Option<u32> {
    let wanted = sample_rate.checked_mul(quantum_ms)? / 1000;
    match *buffer {
        SupportedBufferSize::Range { min, max } if wanted > 0 && min <= wanted && wanted <= max => {
            Some(wanted)
        }
        _ => None,
    }
}

/// Build the input stream for the device's sample format.
fn build_input(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream> {
    match format {
        SampleFormat::F32 => build_capture_stream::<f32>(device, config, producer, running),
        SampleFormat::I16 => build_capture_stream::<i16>(device, config, producer, running),
        SampleFormat::U16 => build_capture_stream::<u16>(device, config, producer, running),
        SampleFormat::U8 => build_capture_stream::<u8>(device, config, producer, running),
        fmt => Err(VoiceError::AudioStream(format!(
            "unsupported sample format: {fmt:?}"
        ))),
    }
}

/// Mix every frame down to mono and push it into the ring.
fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = (config.channels as usize).max(1);
    let mut mix: Vec<f32> = Vec::with_capacity(8192);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                mix.clear();
                for frame in data.chunks_exact(ch) {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    mix.push(sum / ch as f32);
                }
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    warn!("ring buffer full: dropped {} frames", mix.len() - written);
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(map_build_error)
}

// ── Output ───────────────────────────────────────────────────────────────────

/// One scheduled buffer on the context timeline.
struct Voice {
    id: BufferId,
    samples: Vec<f32>,
    /// Context frame at which the first sample plays.
    start_frame: u64,
    cursor: usize,
}

enum RenderCommand {
    Schedule(Voice),
    Stop(BufferId),
}

/// Context frame for a time on the output clock.
fn frame_at(seconds: f64, rate: u32) -> u64 {
    (seconds.max(0.0) * rate as f64).round() as u64
}

/// Sums voices on the context timeline.
struct Mixer {
    /// Voices that have started and still have samples left.
    playing: Vec<Voice>,
    /// Voices not yet started, ordered by start frame.
    waiting: VecDeque<Voice>,
    retired: Sender<Voice>,
    /// Context frames mixed so far.
    frame: u64,
}

impl Mixer {
    fn new(retired: Sender<Voice>) -> Self {
        Self {
            playing: Vec::with_capacity(16),
            waiting: VecDeque::with_capacity(VOICE_CAPACITY),
            retired,
            frame: 0,
        }
    }

    fn accept(&mut self, voice: Voice) {
        let at = self
            .waiting
            .iter()
            .rposition(|v| v.start_frame <= voice.start_frame)
            .map_or(0, |i| i + 1);
        self.waiting.insert(at, voice);
    }

    fn stop(&mut self, id: BufferId) {
        if let Some(idx) = self.playing.iter().position(|v| v.id == id) {
            let voice = self.playing.swap_remove(idx);
            self.retire(voice);
        } else if let Some(idx) = self.waiting.iter().position(|v| v.id == id) {
            if let Some(voice) = self.waiting.remove(idx) {
                self.retire(voice);
            }
        }
    }

    /// Fill `buf` with the next frames of the timeline.
    fn mix(&mut self, buf: &mut [f32]) {
        for sample in buf.iter_mut() {
            while self
                .waiting
                .front()
                .is_some_and(|v| v.start_frame <= self.frame)
            {
                if let Some(voice) = self.waiting.pop_front() {
                    self.playing.push(voice);
                }
            }
            let mut acc = 0f32;
            for voice in self.playing.iter_mut() {
                if let Some(&s) = voice.samples.get(voice.cursor) {
                    acc += s;
                    voice.cursor += 1;
                }
            }
            *sample = acc;
            self.frame += 1;
        }

        let mut idx = 0;
        while idx < self.playing.len() {
            if self.playing[idx].cursor >= self.playing[idx].samples.len() {
                let voice = self.playing.swap_remove(idx);
                self.retire(voice);
            } else {
                idx += 1;
            }
        }
    }

    /// Hand a finished or stopped voice to the device thread.
    fn retire(&self, voice: Voice) {
        // Fails only once the device thread is gone; the voice is freed here then.
        let _ = self.retired.send(voice);
    }
}

/// Lives inside the output callback.
struct Renderer {
    mixer: Mixer,
    commands: Receiver<RenderCommand>,
    /// Context rate to device rate; `None` when they match.
    resampler: Option<PullResampler>,
    scratch: Vec<f32>,
    /// Context frames mixed since the stream started; the output clock.
    clock: Arc<AtomicU64>,
}

impl Renderer {
    fn new(commands: Receiver<RenderCommand>, mixer: Mixer, clock: Arc<AtomicU64>) -> Self {
        Self {
            mixer,
            commands,
            resampler: None,
            scratch: vec![0f32; SCRATCH_FRAMES],
            clock,
        }
    }

    fn render<T>(&mut self, out: &mut [T], channels: usize)
    where
        T: Sample + FromSample<f32>,
    {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RenderCommand::Schedule(voice) => self.mixer.accept(voice),
                RenderCommand::Stop(id) => self.mixer.stop(id),
            }
        }

        let frames = out.len() / channels;
        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0.0);
        }
        let buf = &mut self.scratch[..frames];
        match self.resampler.as_mut() {
            Some(resampler) => {
                let mixer = &mut self.mixer;
                resampler.fill(buf, |src| mixer.mix(src));
            }
            None => self.mixer.mix(buf),
        }
        self.clock.store(self.mixer.frame, Ordering::Release);

        for (frame, value) in out.chunks_mut(channels).zip(buf.iter()) {
            let value = T::from_sample(value.clamp(-1.0, 1.0));
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }
    }
}

struct CpalOutput {
    context_rate: u32,
    clock: Arc<AtomicU64>,
    commands: Sender<RenderCommand>,
    stop_tx: Option<Sender<()>>,
}

impl OutputSink for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.context_rate
    }

    fn now(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.context_rate as f64
    }

    fn schedule(&mut self, id: BufferId, block: AudioBlock, start_at: f64) -> Result<()> {
        if block.sample_rate != self.context_rate {
            return Err(VoiceError::AudioStream(format!(
                "buffer at {} Hz on a {} Hz output",
                block.sample_rate, self.context_rate
            )));
        }
        self.commands
            .try_send(RenderCommand::Schedule(Voice {
                id,
                samples: block.samples,
                start_frame: frame_at(start_at, self.context_rate),
                cursor: 0,
            }))
            .map_err(|e| match e {
                TrySendError::Full(_) => VoiceError::AudioStream("playback queue full".into()),
                TrySendError::Disconnected(_) => {
                    VoiceError::AudioStream("playback renderer stopped".into())
                }
            })
    }

    fn stop(&mut self, id: BufferId) {
        if self.commands.try_send(RenderCommand::Stop(id)).is_err() {
            debug!(id, "stop not delivered to renderer");
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
            debug!("output close requested");
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Open and start the default output device with `renderer` as its callback.
///
/// Returns the device rate; the renderer resamples when it differs from
/// `context_rate`.
fn open_output_stream(context_rate: u32, mut renderer: Renderer) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(VoiceError::NoOutputDevice)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = choose_output_config(&device, context_rate)?;
    let device_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();
    if device_rate != context_rate {
        renderer.resampler = Some(PullResampler::new(context_rate, device_rate)?);
    }
    info!(
        device_rate,
        channels = config.channels,
        resampling = device_rate != context_rate,
        "output config selected"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_render_stream::<f32>(&device, &config, renderer),
        SampleFormat::I16 => build_render_stream::<i16>(&device, &config, renderer),
        SampleFormat::U16 => build_render_stream::<u16>(&device, &config, renderer),
        SampleFormat::U8 => build_render_stream::<u8>(&device, &config, renderer),
        fmt => {
            return Err(VoiceError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    stream.play().map_err(map_play_error)?;
    Ok((stream, device_rate))
}

/// Prefer a config running at the context rate, else the device default.
fn choose_output_config(device: &cpal::Device, rate: u32) -> Result<SupportedStreamConfig> {
    match device.supported_output_configs() {
        Ok(ranges) => {
            let mut candidates: Vec<_> = ranges
                .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
                .collect();
            candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
            if let Some(range) = candidates.into_iter().next() {
                return Ok(range.with_sample_rate(SampleRate(rate)));
            }
            debug!(rate, "output cannot run at the context rate, resampling");
        }
        Err(e) => warn!("failed to query output configs: {e}"),
    }

    device.default_output_config().map_err(|e| {
        let text = e.to_string();
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => VoiceError::DeviceBusy(text),
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend_message(&err.description)
            }
            _ => VoiceError::AudioDevice(text),
        }
    })
}

fn build_render_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: Renderer,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    device
        .build_output_stream(
            config,
            move |out: &mut [T], _info| renderer.render(out, channels),
            |err| error!("audio output stream error: {err}"),
            None,
        )
        .map_err(map_build_error)
}

// ── Error mapping ────────────────────────────────────────────────────────────

/// Classify a host backend message into the user-facing error kinds.
fn classify_backend_message(description: &str) -> VoiceError {
    let lowered = description.to_ascii_lowercase();
    if ["permission", "denied", "not permitted", "not allowed", "unauthorized"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        VoiceError::PermissionDenied(description.to_string())
    } else if ["busy", "in use", "exclusive"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        VoiceError::DeviceBusy(description.to_string())
    } else {
        VoiceError::AudioStream(description.to_string())
    }
}

fn map_build_error(e: BuildStreamError) -> VoiceError {
    let text = e.to_string();
    match e {
        BuildStreamError::DeviceNotAvailable => VoiceError::DeviceBusy(text),
        BuildStreamError::BackendSpecific { err } => classify_backend_message(&err.description),
        _ => VoiceError::AudioStream(text),
    }
}

fn map_play_error(e: cpal::PlayStreamError) -> VoiceError {
    let text = e.to_string();
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => VoiceError::DeviceBusy(text),
        cpal::PlayStreamError::BackendSpecific { err } => classify_backend_message(&err.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn renderer() -> (Renderer, Sender<RenderCommand>, Receiver<Voice>) {
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_QUEUE);
        let (retired_tx, retired_rx) = crossbeam_channel::unbounded();
        (
            Renderer::new(command_rx, Mixer::new(retired_tx), Arc::new(AtomicU64::new(0))),
            command_tx,
            retired_rx,
        )
    }

    fn voice(id: BufferId, len: usize, start_frame: u64) -> Voice {
        Voice {
            id,
            samples: vec![0.25; len],
            start_frame,
            cursor: 0,
        }
    }

    #[test]
    fn quantum_chosen_only_inside_device_range() {
        let range = SupportedBufferSize::Range { min: 64, max: 4096 };
        assert_eq!(fixed_quantum(&range, 48_000, 32), Some(1536));
        assert_eq!(fixed_quantum(&range, 48_000, 100), None);
        assert_eq!(fixed_quantum(&SupportedBufferSize::Unknown, 48_000, 32), None);
    }

    #[test]
    fn backend_messages_map_to_categories() {
        assert_eq!(
            classify_backend_message("Access denied by user").category(),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify_backend_message("Device or resource busy").category(),
            ErrorCategory::DeviceBusy
        );
        assert_eq!(
            classify_backend_message("something odd").category(),
            ErrorCategory::Other
        );
    }

    #[test]
    fn renderer_plays_voices_back_to_back_and_retires_them() {
        let (mut renderer, commands, retired) = renderer();
        commands.send(RenderCommand::Schedule(voice(1, 4, 0))).unwrap();
        commands.send(RenderCommand::Schedule(voice(2, 4, 4))).unwrap();

        let mut out = [0f32; 16]; // 8 stereo frames
        renderer.render(&mut out, 2);

        assert!(out.iter().all(|s| *s == 0.25));
        assert_eq!(renderer.clock.load(Ordering::Acquire), 8);
        let ids: Vec<_> = retired.try_iter().map(|v| v.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[test]
    fn renderer_waits_for_start_frame() {
        let (mut renderer, commands, retired) = renderer();
        commands.send(RenderCommand::Schedule(voice(7, 2, 6))).unwrap();

        let mut out = [0f32; 4];
        renderer.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(retired.try_recv().is_err());

        renderer.render(&mut out, 1);
        assert_eq!(out, [0.0, 0.0, 0.25, 0.25]);
        assert_eq!(retired.try_recv().unwrap().id, 7);
    }

    #[test]
    fn stopped_voice_is_silenced_and_retired() {
        let (mut renderer, commands, retired) = renderer();
        commands.send(RenderCommand::Schedule(voice(3, 100, 0))).unwrap();
        let mut out = [0f32; 4];
        renderer.render(&mut out, 1);

        commands.send(RenderCommand::Stop(3)).unwrap();
        renderer.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(retired.try_recv().unwrap().id, 3);
    }

    #[test]
    fn backlog_beyond_voice_capacity_all_plays() {
        let (mut renderer, commands, retired) = renderer();
        let count = VOICE_CAPACITY + 44;
        for i in 0..count {
            commands
                .send(RenderCommand::Schedule(voice(i as BufferId, 2, 2 * i as u64)))
                .unwrap();
        }

        let mut out = vec![0f32; 2 * count];
        for piece in out.chunks_mut(128) {
            renderer.render(piece, 1);
        }
        assert!(out.iter().all(|s| *s == 0.25));

        let mut ids: Vec<_> = retired.try_iter().map(|v| v.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..count as BufferId).collect::<Vec<_>>());
    }

    #[test]
    fn waiting_voice_can_be_stopped() {
        let (mut renderer, commands, retired) = renderer();
        commands.send(RenderCommand::Schedule(voice(1, 4, 100))).unwrap();
        commands.send(RenderCommand::Stop(1)).unwrap();
        let mut out = [0f32; 8];
        renderer.render(&mut out, 1);
        assert_eq!(retired.try_recv().unwrap().id, 1);

        let mut later = [0f32; 200];
        renderer.render(&mut later, 1);
        assert!(later.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn resampled_buffers_join_without_a_seam() {
        let (mut renderer, commands, retired) = renderer();
        renderer.resampler = Some(PullResampler::new(24_000, 48_000).unwrap());
        // Two back-to-back 40 ms buffers at 24 kHz.
        commands.send(RenderCommand::Schedule(voice(1, 960, 0))).unwrap();
        commands.send(RenderCommand::Schedule(voice(2, 960, 960))).unwrap();

        let mut out = vec![0f32; 4_096];
        for piece in out.chunks_mut(480) {
            renderer.render(piece, 1);
        }
        // The seam sits at device frame 1920; only the onset and tail ramp.
        let worst = out[32..3_800]
            .iter()
            .map(|s| (s - 0.25).abs())
            .fold(0f32, f32::max);
        assert!(worst < 1e-4, "worst deviation {worst}");
        assert_eq!(retired.try_iter().count(), 2);
    }

    #[test]
    fn back_to_back_start_times_map_to_contiguous_frames() {
        // 437 samples is not a whole number of milliseconds at 24 kHz.
        let len = 437u64;
        let mut start_at = 0.0f64;
        for i in 0..2_000u64 {
            assert_eq!(frame_at(start_at, 24_000), i * len);
            start_at += len as f64 / 24_000.0;
        }
        assert_eq!(frame_at(-0.5, 24_000), 0);
    }
}
