//! Playback output stage: gap-free scheduling of decoded 24 kHz blocks.
//!
//! Each block starts at `max(now, next_start)` on the output clock and pushes
//! `next_start` forward by its duration, so consecutive blocks abut without
//! gaps or overlap. `interrupt()` drops everything scheduled and resets the
//! timeline to the current clock.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::{
    audio::backend::{BufferId, OutputSink},
    buffering::block::AudioBlock,
    error::Result,
};

/// Where a block landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_at: f64,
    pub duration: f64,
}

/// Result of a buffer-ended notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRelease {
    /// Other buffers are still scheduled or playing.
    Playing,
    /// That was the last active buffer.
    Drained,
    /// Not an active buffer (already interrupted or unknown).
    Stale,
}

pub struct PlaybackOutputStage {
    sink: Box<dyn OutputSink>,
    /// Output-clock time at which the next block should start.
    next_start: f64,
    active: HashSet<BufferId>,
    next_id: BufferId,
    closed: bool,
}

impl PlaybackOutputStage {
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            next_start: 0.0,
            active: HashSet::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Schedule a decoded block back-to-back with what is already queued.
    ///
    /// Returns `None` for an empty block, which is skipped.
    pub fn enqueue(&mut self, block: AudioBlock) -> Result<Option<ScheduledBuffer>> {
        if block.is_empty() {
            trace!("skipping empty playback block");
            return Ok(None);
        }

        let now = self.sink.now();
        let start_at = self.next_start.max(now);
        let duration = block.duration_secs();
        let id = self.next_id;
        self.next_id += 1;

        self.sink.schedule(id, block, start_at)?;
        self.active.insert(id);
        self.next_start = start_at + duration;

        trace!(id, start_at, duration, "playback block scheduled");
        Ok(Some(ScheduledBuffer {
            id,
            start_at,
            duration,
        }))
    }

    /// Record that a buffer finished; reports whether playback has drained.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> BufferRelease {
        if !self.active.remove(&id) {
            return BufferRelease::Stale;
        }
        if self.active.is_empty() {
            BufferRelease::Drained
        } else {
            BufferRelease::Playing
        }
    }

    /// Stop all scheduled and playing buffers and reset the timeline to now.
    ///
    /// Returns the number of buffers stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.sink.stop(id);
        }
        self.next_start = self.sink.now();
        debug!(stopped, next_start = self.next_start, "playback interrupted");
        stopped
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Start time the next block would get if the clock does not pass it.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Stop everything and release the output device. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.interrupt();
        self.sink.close().inspect_err(|e| warn!("closing output failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct SinkLog {
        now: f64,
        scheduled: Vec<(BufferId, f64, usize)>,
        stopped: Vec<BufferId>,
        closes: usize,
    }

    struct ManualSink(Arc<Mutex<SinkLog>>);

    impl OutputSink for ManualSink {
        fn sample_rate(&self) -> u32 {
            24_000
        }
        fn now(&self) -> f64 {
            self.0.lock().now
        }
        fn schedule(&mut self, id: BufferId, block: AudioBlock, start_at: f64) -> Result<()> {
            self.0.lock().scheduled.push((id, start_at, block.len()));
            Ok(())
        }
        fn stop(&mut self, id: BufferId) {
            self.0.lock().stopped.push(id);
        }
        fn close(&mut self) -> Result<()> {
            self.0.lock().closes += 1;
            Ok(())
        }
    }

    fn stage() -> (PlaybackOutputStage, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        (
            PlaybackOutputStage::new(Box::new(ManualSink(Arc::clone(&log)))),
            log,
        )
    }

    fn block(ms: usize) -> AudioBlock {
        AudioBlock::new(vec![0.1; 24 * ms], 24_000)
    }

    #[test]
    fn consecutive_blocks_abut() {
        let (mut stage, log) = stage();
        log.lock().now = 1.0;

        let a = stage.enqueue(block(100)).unwrap().unwrap();
        let b = stage.enqueue(block(50)).unwrap().unwrap();
        let c = stage.enqueue(block(100)).unwrap().unwrap();

        assert_eq!(a.start_at, 1.0);
        assert!((b.start_at - 1.1).abs() < 1e-9);
        assert!((c.start_at - 1.15).abs() < 1e-9);
        assert_eq!(stage.active_len(), 3);
    }

    #[test]
    fn start_never_precedes_clock() {
        let (mut stage, log) = stage();
        stage.enqueue(block(100)).unwrap();

        // Clock ran past the queued audio: the next block starts at now.
        log.lock().now = 5.0;
        let late = stage.enqueue(block(100)).unwrap().unwrap();
        assert_eq!(late.start_at, 5.0);
        assert!((stage.next_start() - 5.1).abs() < 1e-9);
    }

    #[test]
    fn empty_block_is_skipped() {
        let (mut stage, log) = stage();
        assert!(stage.enqueue(AudioBlock::new(vec![], 24_000)).unwrap().is_none());
        assert!(log.lock().scheduled.is_empty());
        assert_eq!(stage.next_start(), 0.0);
    }

    #[test]
    fn drained_only_after_last_buffer_ends() {
        let (mut stage, _log) = stage();
        let a = stage.enqueue(block(20)).unwrap().unwrap();
        let b = stage.enqueue(block(20)).unwrap().unwrap();

        assert_eq!(stage.on_buffer_ended(a.id), BufferRelease::Playing);
        assert_eq!(stage.on_buffer_ended(b.id), BufferRelease::Drained);
        assert_eq!(stage.on_buffer_ended(b.id), BufferRelease::Stale);
    }

    #[test]
    fn interrupt_stops_everything_and_resets_to_now() {
        let (mut stage, log) = stage();
        log.lock().now = 2.0;
        for _ in 0..3 {
            stage.enqueue(block(100)).unwrap();
        }
        log.lock().now = 2.05;

        assert_eq!(stage.interrupt(), 3);
        assert!(stage.is_idle());
        assert_eq!(stage.next_start(), 2.05);

        let mut stopped = log.lock().stopped.clone();
        stopped.sort();
        assert_eq!(stopped, vec![0, 1, 2]);

        // Late ended notifications for stopped buffers are ignored.
        assert_eq!(stage.on_buffer_ended(0), BufferRelease::Stale);

        let next = stage.enqueue(block(10)).unwrap().unwrap();
        assert_eq!(next.start_at, 2.05);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut stage, log) = stage();
        stage.enqueue(block(10)).unwrap();
        stage.close().unwrap();
        stage.close().unwrap();
        assert_eq!(log.lock().closes, 1);
        assert_eq!(log.lock().stopped.len(), 1);
    }
}
