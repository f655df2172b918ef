//! Capture and VAD threads.
//!
//! ```text
//! AudioSource ─► [capture thread] ─► frame queue (drop-oldest) ─► [VAD thread] ─► segment channel
//! ```
//!
//! The capture thread converts whatever the source delivers into fixed
//! `frame_samples()` frames at the pipeline rate and never blocks on the
//! queue. The VAD thread owns the detector and hands finished segments to
//! the orchestrator.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as sync_mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::diagnostics::PipelineDiagnostics;
use crate::audio::resample::{downmix, RateConverter, DEFAULT_CHUNK};
use crate::audio::{AudioSource, SourceFactory};
use crate::buffering::{frame::AudioFrame, segment::SpeechSegment, FrameReceiver, FrameSender};
use crate::config::PipelineConfig;
use crate::error::{ParleyError, Result};
use crate::events::PipelineEvent;
use crate::vad::VoiceActivityDetector;

const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);
const VAD_POLL: Duration = Duration::from_millis(50);

pub(crate) struct CaptureContext {
    pub config: Arc<PipelineConfig>,
    pub frames: FrameSender,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub events: broadcast::Sender<PipelineEvent>,
    pub fatal: mpsc::UnboundedSender<ParleyError>,
}

/// Turns arbitrary source blocks into fixed pipeline frames.
struct Framer {
    converter: Option<RateConverter>,
    downmix_from: Option<u16>,
    pending: Vec<f32>,
    frame_samples: usize,
    sample_rate: u32,
    channels: u16,
    next_seq: u64,
}

impl Framer {
    fn new(config: &PipelineConfig, source_rate: u32, source_channels: u16) -> Result<Self> {
        let source_channels = source_channels.max(1);
        let downmix_from = if source_channels == config.channels {
            None
        } else if config.channels == 1 {
            Some(source_channels)
        } else {
            return Err(ParleyError::Config(format!(
                "cannot convert {source_channels}-channel capture into {}-channel frames",
                config.channels
            )));
        };

        let converter = if source_rate == config.sample_rate {
            None
        } else if config.channels == 1 {
            Some(RateConverter::new(source_rate, config.sample_rate, DEFAULT_CHUNK)?)
        } else {
            return Err(ParleyError::Config(format!(
                "multi-channel capture must already run at {} Hz (device: {source_rate} Hz)",
                config.sample_rate
            )));
        };

        Ok(Self {
            converter,
            downmix_from,
            pending: Vec::with_capacity(config.frame_samples() * 4),
            frame_samples: config.frame_samples(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            next_seq: 0,
        })
    }

    fn push(&mut self, block: &[f32]) -> Vec<AudioFrame> {
        let mono;
        let block = match self.downmix_from {
            Some(ch) => {
                mono = downmix(block, ch);
                mono.as_slice()
            }
            None => block,
        };
        match self.converter.as_mut() {
            Some(rc) => self.pending.extend(rc.process(block)),
            None => self.pending.extend_from_slice(block),
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let samples: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            frames.push(AudioFrame::new(
                samples,
                self.sample_rate,
                self.channels,
                self.next_seq,
            ));
            self.next_seq += 1;
        }
        frames
    }
}

/// Open the source on a new thread and start capturing. Returns once the
/// device is open (or failed to open).
pub(crate) fn spawn_capture(factory: SourceFactory, ctx: CaptureContext) -> Result<JoinHandle<()>> {
    let (open_tx, open_rx) = sync_mpsc::channel::<Result<()>>();

    let handle = thread::Builder::new()
        .name("parley-capture".into())
        .spawn(move || {
            // Open on THIS thread: device streams may be !Send.
            let source = factory().and_then(|source| {
                let framer = Framer::new(&ctx.config, source.sample_rate(), source.channels())?;
                Ok((source, framer))
            });
            let (mut source, framer) = match source {
                Ok(opened) => {
                    let _ = open_tx.send(Ok(()));
                    opened
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            run_capture(source.as_mut(), framer, &ctx);
            source.close();
            debug!("capture source closed");
        })?;

    match open_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(ParleyError::Other(anyhow::anyhow!(
            "capture thread died before opening the source"
        ))),
    }
}

fn run_capture(source: &mut dyn AudioSource, mut framer: Framer, ctx: &CaptureContext) {
    info!(
        sample_rate = source.sample_rate(),
        channels = source.channels(),
        "capture started"
    );
    let timeout = ctx.config.source_read_timeout();
    let mut last_drop_warn: Option<Instant> = None;

    while ctx.running.load(Ordering::SeqCst) {
        let block = match source.read_frame(timeout) {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(e) => {
                error!("capture device failed: {e}");
                let _ = ctx.fatal.send(e);
                break;
            }
        };

        for frame in framer.push(&block) {
            PipelineDiagnostics::bump(&ctx.diagnostics.frames_captured);
            let evicted = ctx.frames.push(frame);
            if evicted == 0 {
                continue;
            }
            ctx.diagnostics
                .frames_dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            let due = last_drop_warn.map_or(true, |t| t.elapsed() >= DROP_WARN_INTERVAL);
            if due {
                last_drop_warn = Some(Instant::now());
                let total = ctx.frames.dropped();
                warn!(total, "frame queue full, dropped oldest frames");
                let _ = ctx.events.send(PipelineEvent::FramesDropped { total });
            }
        }
    }
    info!("capture stopped");
}

pub(crate) struct VadContext {
    pub frames: FrameReceiver,
    pub detector: VoiceActivityDetector,
    pub segments: mpsc::Sender<SpeechSegment>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub events: broadcast::Sender<PipelineEvent>,
}

pub(crate) fn spawn_vad(ctx: VadContext) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new()
        .name("parley-vad".into())
        .spawn(move || run_vad(ctx))?)
}

fn run_vad(mut ctx: VadContext) {
    debug!("vad started");
    while ctx.running.load(Ordering::SeqCst) {
        let Some(frame) = ctx.frames.recv_timeout(VAD_POLL) else {
            continue;
        };
        PipelineDiagnostics::bump(&ctx.diagnostics.frames_classified);

        let segments = ctx.detector.process(frame);
        ctx.diagnostics
            .candidates_rejected
            .store(ctx.detector.rejected_candidates(), Ordering::Relaxed);
        ctx.diagnostics
            .short_segments_discarded
            .store(ctx.detector.discarded_short(), Ordering::Relaxed);

        for segment in segments {
            PipelineDiagnostics::bump(&ctx.diagnostics.segments_emitted);
            if segment.forced {
                PipelineDiagnostics::bump(&ctx.diagnostics.segments_forced);
            }
            debug!(
                segment_id = segment.id,
                duration_ms = segment.duration_ms(),
                forced = segment.forced,
                "speech segment"
            );
            let _ = ctx.events.send(PipelineEvent::SegmentDetected {
                segment_id: segment.id,
                duration_ms: segment.duration_ms(),
                forced: segment.forced,
            });
            if ctx.segments.blocking_send(segment).is_err() {
                debug!("segment channel closed, vad exiting");
                return;
            }
        }
    }
    debug!("vad stopped");
}
