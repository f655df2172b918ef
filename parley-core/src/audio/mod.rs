//! Audio endpoints: where frames come from and where speech goes.
//!
//! # Threading
//!
//! Neither trait requires `Send`. `cpal::Stream` is `!Send` on Windows and
//! macOS, so the engine takes a *factory* for each endpoint and opens the
//! device on the thread that will use and drop it. A sync oneshot reports
//! open errors back to `ParleyEngine::start`.
//!
//! # Real-time callbacks
//!
//! The cpal backends (`backend.rs`) run on OS audio threads. Their callbacks
//! never allocate, lock or log: they move samples through SPSC ring buffers
//! and bump atomic counters.

pub mod device;
pub mod resample;
pub mod wav;

#[cfg(feature = "audio-cpal")]
pub mod backend;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{ParleyError, Result};

#[cfg(feature = "audio-cpal")]
pub use backend::{CpalSink, CpalSource};
pub use wav::{SegmentRecorder, WavFileSource};

/// Continuous PCM input (microphone, meeting loopback, file).
pub trait AudioSource {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16 {
        1
    }

    /// Block up to `timeout` for the next block of interleaved samples.
    /// Blocks may be any length; the capture stage re-frames them.
    ///
    /// `Ok(None)` means nothing arrived in time. `Err` is a device failure
    /// and stops the pipeline.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>>;

    /// Release the device. Called exactly once, on the capture thread.
    fn close(&mut self) {}
}

/// Mono PCM output at `sample_rate()`.
pub trait AudioSink {
    fn sample_rate(&self) -> u32;

    /// Queue samples for playback. May block while the device catches up.
    fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Drop everything queued and go silent immediately.
    fn flush(&mut self) -> Result<()>;

    /// Times the device ran dry mid-playback.
    fn underruns(&self) -> u64 {
        0
    }

    /// Release the device. Called exactly once, on the playback thread.
    fn close(&mut self) {}
}

/// Opens a source on the capture thread.
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSource>> + Send>;

/// Opens a sink on the playback thread.
pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSink>> + Send>;

// ---------------------------------------------------------------------------
// Channel-fed source
// ---------------------------------------------------------------------------

enum SourceMessage {
    Samples(Vec<f32>),
    Fail(String),
}

/// Source fed from another thread through a [`SourceFeeder`]. Used by the
/// simulator and by tests that need to decide when speech happens.
pub struct ChannelSource {
    rx: Receiver<SourceMessage>,
    sample_rate: u32,
    channels: u16,
    closed: Arc<Mutex<u32>>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeeder {
    tx: Sender<SourceMessage>,
    closed: Arc<Mutex<u32>>,
}

pub fn channel_source(sample_rate: u32, channels: u16) -> (ChannelSource, SourceFeeder) {
    let (tx, rx) = unbounded();
    let closed = Arc::new(Mutex::new(0));
    (
        ChannelSource {
            rx,
            sample_rate,
            channels: channels.max(1),
            closed: Arc::clone(&closed),
        },
        SourceFeeder { tx, closed },
    )
}

impl SourceFeeder {
    /// Returns `false` once the source is gone.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        self.tx.send(SourceMessage::Samples(samples)).is_ok()
    }

    /// Make the next read fail with a device error.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.send(SourceMessage::Fail(message.into())).is_ok()
    }

    /// How many times the source was closed.
    pub fn close_count(&self) -> u32 {
        *self.closed.lock()
    }
}

impl AudioSource for ChannelSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(SourceMessage::Samples(samples)) => Ok(Some(samples)),
            Ok(SourceMessage::Fail(message)) => Err(ParleyError::Device(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // Feeder gone: behave like a silent line.
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        *self.closed.lock() += 1;
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Write(Vec<f32>),
    Flush,
    Close,
}

/// Shared view of everything a [`MemorySink`] received.
#[derive(Debug, Clone, Default)]
pub struct SinkLog {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl SinkLog {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// All written samples, concatenated.
    pub fn written(&self) -> Vec<f32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Write(s) => Some(s.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Flush))
    }

    pub fn close_count(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::Close))
    }

    fn count(&self, pred: impl Fn(&SinkEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

/// Sink that records into a [`SinkLog`]. With `realtime` each write sleeps
/// for the audio's duration, like a device would.
pub struct MemorySink {
    sample_rate: u32,
    realtime: bool,
    log: SinkLog,
}

impl MemorySink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            realtime: false,
            log: SinkLog::default(),
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn log(&self) -> SinkLog {
        self.log.clone()
    }
}

impl AudioSink for MemorySink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.log.push(SinkEvent::Write(samples.to_vec()));
        if self.realtime && self.sample_rate > 0 {
            thread::sleep(Duration::from_secs_f64(
                samples.len() as f64 / self.sample_rate as f64,
            ));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.push(SinkEvent::Flush);
        Ok(())
    }

    fn close(&mut self) {
        self.log.push(SinkEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_delivers_blocks_and_failures() {
        let (mut source, feeder) = channel_source(16_000, 1);
        assert!(feeder.push(vec![0.5; 4]));
        assert!(feeder.fail("unplugged"));

        let block = source.read_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(block, Some(vec![0.5; 4]));
        assert!(matches!(
            source.read_frame(Duration::from_millis(10)),
            Err(ParleyError::Device(_))
        ));
        assert_eq!(source.read_frame(Duration::from_millis(5)).unwrap(), None);

        source.close();
        assert_eq!(feeder.close_count(), 1);
    }

    #[test]
    fn memory_sink_records_in_order() {
        let mut sink = MemorySink::new(16_000);
        let log = sink.log();
        sink.write(&[0.1, 0.2]).unwrap();
        sink.flush().unwrap();
        sink.write(&[0.3]).unwrap();
        sink.close();

        assert_eq!(log.written(), vec![0.1, 0.2, 0.3]);
        assert_eq!(log.flush_count(), 1);
        assert_eq!(log.close_count(), 1);
        assert_eq!(log.events()[1], SinkEvent::Flush);
    }
}
