//! cpal capture and playback.
//!
//! Both types hold a `cpal::Stream` and are therefore `!Send`: open and drop
//! them on the same thread (the engine's capture and playback threads do).

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::device::is_loopback_like_name;
use super::{AudioSink, AudioSource};
use crate::buffering::{
    create_sample_ring, Consumer, Observer, Producer, SampleConsumer, SampleProducer,
};
use crate::error::{ParleyError, Result};

/// Largest callback buffer handled without reallocating in the callback.
const CALLBACK_SCRATCH: usize = 16_384;
const POLL: Duration = Duration::from_millis(5);
const FLUSH_WAIT: Duration = Duration::from_millis(200);

type ErrorSlot = Arc<Mutex<Option<String>>>;

fn pick_device(
    host: &cpal::Host,
    preferred: Option<&str>,
    input: bool,
) -> Result<cpal::Device> {
    let kind = if input { "input" } else { "output" };
    if let Some(wanted) = preferred {
        let found = if input {
            host.input_devices().map(|mut d| d.find(|x| x.name().ok().as_deref() == Some(wanted)))
        } else {
            host.output_devices().map(|mut d| d.find(|x| x.name().ok().as_deref() == Some(wanted)))
        };
        match found {
            Ok(Some(device)) => return Ok(device),
            Ok(None) => warn!("preferred {kind} device '{wanted}' not found, falling back"),
            Err(e) => warn!("failed to list {kind} devices: {e}"),
        }
    }
    let default = if input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    default.ok_or(ParleyError::NoDefaultDevice(kind))
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Microphone or meeting-audio capture, down-mixed to mono in the callback.
pub struct CpalSource {
    stream: Stream,
    consumer: SampleConsumer,
    running: Arc<AtomicBool>,
    error: ErrorSlot,
    overflowed: Arc<AtomicU64>,
    sample_rate: u32,
    block: usize,
}

impl CpalSource {
    /// Open `preferred` (by exact name) or the default input device.
    /// `ring_samples` sizes the callback → reader ring.
    pub fn open(preferred: Option<&str>, ring_samples: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(&host, preferred, true)?;
        let name = device.name().unwrap_or_default();
        if is_loopback_like_name(&name) {
            warn!(device = name.as_str(), "input looks like a loopback device; the agent may hear itself");
        }

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::Device(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(device = name.as_str(), sample_rate, channels, "opening input device");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let (producer, consumer) = create_sample_ring(ring_samples.max(sample_rate as usize));
        let running = Arc::new(AtomicBool::new(true));
        let error: ErrorSlot = Arc::new(Mutex::new(None));
        let overflowed = Arc::new(AtomicU64::new(0));

        let parts = InputParts {
            producer,
            running: Arc::clone(&running),
            error: Arc::clone(&error),
            overflowed: Arc::clone(&overflowed),
            channels: channels as usize,
        };
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, parts),
            SampleFormat::I16 => build_input::<i16>(&device, &config, parts),
            SampleFormat::U16 => build_input::<u16>(&device, &config, parts),
            SampleFormat::U8 => build_input::<u8>(&device, &config, parts),
            fmt => {
                return Err(ParleyError::Device(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| ParleyError::Device(e.to_string()))?;

        Ok(Self {
            stream,
            consumer,
            running,
            error,
            overflowed,
            sample_rate,
            // 20 ms blocks at the device rate.
            block: (sample_rate as usize / 50).max(1),
        })
    }

    /// Samples lost because the reader fell behind the callback.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

struct InputParts {
    producer: SampleProducer,
    running: Arc<AtomicBool>,
    error: ErrorSlot,
    overflowed: Arc<AtomicU64>,
    channels: usize,
}

fn build_input<T>(device: &cpal::Device, config: &StreamConfig, parts: InputParts) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let InputParts {
        mut producer,
        running,
        error,
        overflowed,
        channels,
    } = parts;
    let ch = channels.max(1);
    let mut mono: Vec<f32> = Vec::with_capacity(CALLBACK_SCRATCH);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.clear();
                mono.extend(data.chunks_exact(ch).take(frames).map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / ch as f32
                }));
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    overflowed.fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                }
            },
            move |err| {
                // Only the first error is kept; later ones add nothing.
                if let Some(mut slot) = error.try_lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|e| ParleyError::Device(e.to_string()))
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.error.lock().take() {
                return Err(ParleyError::Device(message));
            }
            if self.consumer.occupied_len() >= self.block {
                let mut out = vec![0.0; self.block];
                let n = self.consumer.pop_slice(&mut out);
                out.truncate(n);
                return Ok(Some(out));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL);
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.stream.pause();
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Speaker or virtual-microphone output fed from an SPSC ring.
pub struct CpalSink {
    stream: Stream,
    producer: SampleProducer,
    flush_requested: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    error: ErrorSlot,
    sample_rate: u32,
}

impl CpalSink {
    pub fn open(preferred: Option<&str>, ring_samples: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = pick_device(&host, preferred, false)?;
        let name = device.name().unwrap_or_default();

        let supported = device
            .default_output_config()
            .map_err(|e| ParleyError::Device(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(device = name.as_str(), sample_rate, channels, "opening output device");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let (producer, consumer) = create_sample_ring(ring_samples.max(1024));
        let flush_requested = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        let parts = OutputParts {
            consumer,
            flush_requested: Arc::clone(&flush_requested),
            underruns: Arc::clone(&underruns),
            error: Arc::clone(&error),
            channels: channels as usize,
        };
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, parts),
            SampleFormat::I16 => build_output::<i16>(&device, &config, parts),
            SampleFormat::U16 => build_output::<u16>(&device, &config, parts),
            SampleFormat::U8 => build_output::<u8>(&device, &config, parts),
            fmt => {
                return Err(ParleyError::Device(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| ParleyError::Device(e.to_string()))?;

        Ok(Self {
            stream,
            producer,
            flush_requested,
            underruns,
            error,
            sample_rate,
        })
    }

    fn check_error(&self) -> Result<()> {
        match self.error.lock().take() {
            Some(message) => Err(ParleyError::Device(message)),
            None => Ok(()),
        }
    }
}

struct OutputParts {
    consumer: SampleConsumer,
    flush_requested: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    error: ErrorSlot,
    channels: usize,
}

fn build_output<T>(device: &cpal::Device, config: &StreamConfig, parts: OutputParts) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let OutputParts {
        mut consumer,
        flush_requested,
        underruns,
        error,
        channels,
    } = parts;
    let ch = channels.max(1);
    let mut mono = vec![0f32; CALLBACK_SCRATCH];

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _info| {
                if flush_requested.load(Ordering::Acquire) {
                    consumer.clear();
                    flush_requested.store(false, Ordering::Release);
                }
                let frames = (out.len() / ch).min(mono.len());
                let got = consumer.pop_slice(&mut mono[..frames]);
                if got > 0 && got < frames {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
                for (idx, frame) in out.chunks_mut(ch).enumerate() {
                    let value = if idx < got {
                        T::from_sample(mono[idx])
                    } else {
                        T::EQUILIBRIUM
                    };
                    frame.fill(value);
                }
            },
            move |err| {
                if let Some(mut slot) = error.try_lock() {
                    slot.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|e| ParleyError::Device(e.to_string()))
}

impl AudioSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&mut self, samples: &[f32]) -> Result<()> {
        let mut rest = samples;
        while !rest.is_empty() {
            self.check_error()?;
            let n = self.producer.push_slice(rest);
            rest = &rest[n..];
            if !rest.is_empty() {
                thread::sleep(POLL);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_requested.store(true, Ordering::Release);
        let deadline = Instant::now() + FLUSH_WAIT;
        while self.flush_requested.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("output callback did not acknowledge flush in time");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.check_error()
    }

    fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        let _ = self.stream.pause();
    }
}
