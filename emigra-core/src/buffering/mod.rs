//! Lock-free SPSC ring buffer for captured audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time input callback.

pub mod block;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half, held by the device callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the capture pump.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
/// A live conversation never needs more backlog than that; anything older
/// would be stale by the time it reached the remote session.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    create_audio_ring_with_capacity(RING_CAPACITY)
}

/// Same as [`create_audio_ring`] with an explicit capacity (in samples).
pub fn create_audio_ring_with_capacity(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}
