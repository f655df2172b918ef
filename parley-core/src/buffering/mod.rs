//! Queues between pipeline stages.
//!
//! - `frame_queue`: bounded capture → VAD queue of `AudioFrame`s. Pushing never
//!   blocks: when the queue is full the oldest frame is evicted, so a stalled
//!   consumer can never stall the audio device.
//! - `create_sample_ring`: lock-free SPSC `ringbuf::HeapRb<f32>` used between
//!   the synthesis stage and the playback thread, and inside the cpal backends
//!   whose callbacks must not lock or allocate.

pub mod frame;
pub mod segment;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

use frame::AudioFrame;

/// Producer half of a sample ring.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half of a sample ring.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

/// Create the bounded capture → VAD frame queue.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let sender = FrameSender {
        tx,
        evict: rx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, FrameReceiver { rx })
}

/// Capture-side handle of the frame queue.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<AudioFrame>,
    /// Receiver clone used only to evict the oldest frame when full.
    evict: Receiver<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    /// Enqueue a frame without blocking, evicting the oldest queued frames if
    /// needed. Returns how many frames were evicted by this call.
    pub fn push(&self, frame: AudioFrame) -> usize {
        let mut frame = frame;
        let mut evicted = 0usize;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if self.evict.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // Unreachable while `evict` is alive; treat as a drop.
                Err(TrySendError::Disconnected(_)) => return evicted + 1,
            }
        }
    }

    /// Total frames evicted since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// VAD-side handle of the frame queue.
pub struct FrameReceiver {
    rx: Receiver<AudioFrame>,
}

impl FrameReceiver {
    /// Wait up to `timeout` for the next frame. `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }
}
