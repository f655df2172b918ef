//! Scripted ports and a harness that runs the real engine against an
//! in-memory source and sink.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::audio::{channel_source, MemorySink, SinkLog, SourceFeeder};
use parley_core::conversation::{AlwaysRespond, ResponsePolicy};
use parley_core::meeting::{MeetingChannel, RecordingChannel};
use parley_core::ports::{
    GenerationPort, GenerationRequest, PortError, PortResult, SynthesisPort, SynthesisRequest,
    SynthesizedAudio, Transcript, TranscriptionPort, TranscriptionRequest,
};
use parley_core::{
    AudioSink, AudioSource, ParleyEngine, ParleyError, PipelineConfig, PipelineEvent,
    PipelineStage, Ports,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

pub const RATE: u32 = 16_000;

/// Fast-reacting pipeline: short hangover and cooldown, millisecond backoff.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sample_rate = RATE;
    config.hangover_ms = 300;
    config.min_speech_ms = 300;
    config.cooldown_ms = 50;
    config.cancel_ack_timeout_ms = 200;
    config.retry.max_attempts = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = 0.0;
    config
}

pub fn speech(ms: u64) -> Vec<f32> {
    let n = (RATE as u64 * ms / 1000) as usize;
    (0..n)
        .map(|i| 0.3 * (TAU * 220.0 * i as f32 / RATE as f32).sin())
        .collect()
}

pub fn silence(ms: u64) -> Vec<f32> {
    vec![0.0; (RATE as u64 * ms / 1000) as usize]
}

/// A recognisable ramp so the sink contents can be compared exactly.
pub fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 1_000) as f32 / 2_000.0).collect()
}

// ── Ports ────────────────────────────────────────────────────────────────

/// Returns queued results in order, then `fallback` forever.
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<PortResult<Transcript>>>,
    fallback: PortResult<Transcript>,
    pub calls: AtomicU32,
}

impl ScriptedTranscriber {
    pub fn new(script: Vec<PortResult<Transcript>>, fallback: PortResult<Transcript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    pub fn saying(texts: &[&str]) -> Self {
        let script = texts.iter().map(|t| Ok(transcript(t, 0.9))).collect();
        Self::new(script, Ok(transcript("", 0.0)))
    }

    pub fn failing() -> Self {
        Self::new(Vec::new(), Err(PortError::Transient("connection reset".into())))
    }
}

pub fn transcript(text: &str, confidence: f32) -> Transcript {
    Transcript {
        text: text.into(),
        confidence,
    }
}

#[async_trait]
impl TranscriptionPort for ScriptedTranscriber {
    async fn transcribe(
        &self,
        _request: &TranscriptionRequest,
        _cancel: &CancellationToken,
    ) -> PortResult<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Replies from a queue; records the newest human line it was shown.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    latency: Duration,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            latency: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl GenerationPort for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> PortResult<String> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PortError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }
        if let Some(turn) = request.context.last_human() {
            self.seen.lock().push(turn.text.clone());
        }
        Ok(self.replies.lock().pop_front().unwrap_or_default())
    }
}

/// Always renders the same buffer, at whatever rate was asked for.
pub struct FixedSynthesizer {
    samples: Vec<f32>,
    latency: Duration,
    pub calls: AtomicU32,
}

impl FixedSynthesizer {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl SynthesisPort for FixedSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> PortResult<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PortError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }
        Ok(SynthesizedAudio {
            samples: self.samples.clone(),
            sample_rate: request.sample_rate,
        })
    }
}

pub struct TestPorts {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<FixedSynthesizer>,
}

impl TestPorts {
    pub fn new(
        transcriber: ScriptedTranscriber,
        generator: ScriptedGenerator,
        synthesizer: FixedSynthesizer,
    ) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            generator: Arc::new(generator),
            synthesizer: Arc::new(synthesizer),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            transcription: self.transcriber.clone(),
            generation: self.generator.clone(),
            synthesis: self.synthesizer.clone(),
        }
    }
}

/// Records every call like `RecordingChannel`, then reports the meeting
/// as gone.
pub struct FlakyChannel {
    pub inner: Arc<RecordingChannel>,
}

#[async_trait]
impl MeetingChannel for FlakyChannel {
    async fn set_muted(&self, muted: bool) -> parley_core::Result<()> {
        self.inner.set_muted(muted).await?;
        Err(ParleyError::Meeting("meeting ended".into()))
    }

    async fn send_message(&self, text: &str) -> parley_core::Result<()> {
        self.inner.send_message(text).await?;
        Err(ParleyError::Meeting("chat disabled".into()))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

pub struct HarnessOptions {
    pub realtime_sink: bool,
    pub policy: Arc<dyn ResponsePolicy>,
    pub flaky_meeting: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            realtime_sink: false,
            policy: Arc::new(AlwaysRespond),
            flaky_meeting: false,
        }
    }
}

pub struct Harness {
    pub engine: ParleyEngine,
    pub feeder: SourceFeeder,
    pub sink: SinkLog,
    pub channel: Arc<RecordingChannel>,
    pub events: broadcast::Receiver<PipelineEvent>,
    pub ports: TestPorts,
}

impl Harness {
    pub fn start(config: PipelineConfig, ports: TestPorts, realtime_sink: bool) -> Self {
        Self::start_with(
            config,
            ports,
            HarnessOptions {
                realtime_sink,
                ..HarnessOptions::default()
            },
        )
    }

    pub fn start_with(config: PipelineConfig, ports: TestPorts, options: HarnessOptions) -> Self {
        let engine = ParleyEngine::new(config, ports.ports(), options.policy);
        let events = engine.subscribe_events();
        let (source, feeder) = channel_source(RATE, 1);
        let sink = MemorySink::new(RATE).realtime(options.realtime_sink);
        let sink_log = sink.log();
        let channel = Arc::new(RecordingChannel::new());
        let meeting: Arc<dyn MeetingChannel> = if options.flaky_meeting {
            Arc::new(FlakyChannel {
                inner: Arc::clone(&channel),
            })
        } else {
            channel.clone() as Arc<dyn MeetingChannel>
        };
        engine
            .start(
                Box::new(move || Ok(Box::new(source) as Box<dyn AudioSource>)),
                Box::new(move || Ok(Box::new(sink) as Box<dyn AudioSink>)),
                Some(meeting),
            )
            .expect("engine starts");
        Self {
            engine,
            feeder,
            sink: sink_log,
            channel,
            events,
            ports,
        }
    }

    /// Push `samples` in 20 ms blocks, as a device callback would.
    pub fn feed(&self, samples: &[f32]) {
        for block in samples.chunks((RATE / 50) as usize) {
            assert!(self.feeder.push(block.to_vec()), "source closed");
        }
    }

    /// One utterance: speech followed by enough silence to close it.
    pub fn say(&self, ms: u64) {
        self.feed(&speech(ms));
        self.feed(&silence(800));
    }

    pub async fn wait_for_stage(&self, stage: PipelineStage, timeout: Duration) {
        let mut rx = self.engine.watch_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.stage == stage))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {stage}"))
            .expect("state channel open");
    }

    /// Next event matching `pred`, skipping the rest.
    pub async fn wait_for_event(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&PipelineEvent) -> bool,
    ) -> PipelineEvent {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event");
            match next {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    }

    /// Everything still buffered on the event receiver.
    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
