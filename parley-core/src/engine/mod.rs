//! `ParleyEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! ParleyEngine::new(config, ports, policy)
//!     └─► start(source, sink, meeting)  → devices open, threads + orchestrator running, LISTENING
//!         └─► shutdown()                → cancelled, threads joined, devices closed, IDLE
//! ```
//!
//! `shutdown()` is idempotent: the first call tears everything down, later
//! calls return `Ok(())` without touching anything.
//!
//! ## Threading
//!
//! | Worker | Kind | Owns |
//! |--------|------|------|
//! | `parley-capture` | OS thread | the `AudioSource` |
//! | `parley-vad` | OS thread | the `VoiceActivityDetector` |
//! | `parley-playback` | OS thread | the `AudioSink` |
//! | orchestrator | tokio task | conversation history, pipeline state |
//!
//! Devices are opened *inside* their threads (cpal streams are `!Send`);
//! a sync oneshot propagates open errors back to `start()`.

pub mod diagnostics;

mod capture;
mod orchestrator;
mod playback;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{SegmentRecorder, SinkFactory, SourceFactory};
use crate::buffering::frame_queue;
use crate::config::PipelineConfig;
use crate::conversation::{ConversationLog, ConversationManager, ResponsePolicy};
use crate::error::{ParleyError, Result};
use crate::events::{PipelineEvent, PipelineStage, PipelineState};
use crate::meeting::MeetingChannel;
use crate::ports::{Ports, RetryPolicy};
use crate::vad::{EnergyClassifier, VadSettings, VoiceActivityDetector};

pub use diagnostics::{DiagnosticsSnapshot, PipelineDiagnostics};

use capture::{spawn_capture, spawn_vad, CaptureContext, VadContext};
use orchestrator::Orchestrator;
use playback::{spawn_playback, PlaybackContext};

/// Broadcast capacity: events buffered for slow subscribers.
const EVENT_CAP: usize = 256;
/// Typed messages waiting for the pipeline to be `LISTENING`.
const TEXT_QUEUE_CAP: usize = 8;

struct Session {
    shutdown: CancellationToken,
    commands: mpsc::Sender<String>,
    orchestrator: tokio::task::JoinHandle<Result<()>>,
    threads: Vec<JoinHandle<()>>,
}

/// The top-level engine handle. `Send + Sync`; share it behind an `Arc`.
pub struct ParleyEngine {
    config: Arc<PipelineConfig>,
    ports: Ports,
    policy: Arc<dyn ResponsePolicy>,
    running: Arc<AtomicBool>,
    events_tx: broadcast::Sender<PipelineEvent>,
    state_tx: watch::Sender<PipelineState>,
    diagnostics: Arc<PipelineDiagnostics>,
    session: Mutex<Option<Session>>,
}

impl ParleyEngine {
    /// `config` is normalized once here and frozen for the engine's life.
    pub fn new(mut config: PipelineConfig, ports: Ports, policy: Arc<dyn ResponsePolicy>) -> Self {
        config.normalize();
        let (events_tx, _) = broadcast::channel(EVENT_CAP);
        let (state_tx, _) = watch::channel(PipelineState::default());
        Self {
            config: Arc::new(config),
            ports,
            policy,
            running: Arc::new(AtomicBool::new(false)),
            events_tx,
            state_tx,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Open the devices and start the pipeline. Must be called from within
    /// a Tokio runtime. Returns once both devices are confirmed open.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyRunning` if a session is active.
    /// - Device, I/O or configuration errors from opening the endpoints,
    ///   the conversation log or the recordings directory.
    pub fn start(
        &self,
        source: SourceFactory,
        sink: SinkFactory,
        meeting: Option<Arc<dyn MeetingChannel>>,
    ) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() || self.running.load(Ordering::SeqCst) {
            return Err(ParleyError::AlreadyRunning);
        }
        let config = Arc::clone(&self.config);

        let mut conversation = ConversationManager::new(&config, Arc::clone(&self.policy));
        if let Some(path) = &config.conversation_log_path {
            conversation = conversation.with_log(ConversationLog::open(path)?);
            info!(path = %path.display(), "conversation log enabled");
        }
        let recorder = config
            .recordings_dir
            .as_ref()
            .map(SegmentRecorder::new)
            .transpose()?;

        self.diagnostics.reset();
        self.running.store(true, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = frame_queue(config.frame_queue_capacity);
        let (segment_tx, segment_rx) = mpsc::channel(config.segment_queue_capacity);
        let (command_tx, command_rx) = mpsc::channel(TEXT_QUEUE_CAP);

        let mut threads = Vec::with_capacity(3);
        let started = spawn_playback(
            sink,
            PlaybackContext {
                ring_samples: config.playback_ring_samples,
                chunk_samples: config.playback_chunk_samples,
                running: Arc::clone(&self.running),
                diagnostics: Arc::clone(&self.diagnostics),
                fatal: fatal_tx.clone(),
            },
        )
        .and_then(|(playback_thread, playback)| {
            threads.push(playback_thread);
            threads.push(spawn_capture(
                source,
                CaptureContext {
                    config: Arc::clone(&config),
                    frames: frame_tx,
                    running: Arc::clone(&self.running),
                    diagnostics: Arc::clone(&self.diagnostics),
                    events: self.events_tx.clone(),
                    fatal: fatal_tx,
                },
            )?);
            let detector = VoiceActivityDetector::new(
                Box::new(EnergyClassifier::new(config.vad_threshold)),
                VadSettings::from_config(&config),
            );
            threads.push(spawn_vad(VadContext {
                frames: frame_rx,
                detector,
                segments: segment_tx,
                running: Arc::clone(&self.running),
                diagnostics: Arc::clone(&self.diagnostics),
                events: self.events_tx.clone(),
            })?);
            Ok(playback)
        });

        let playback = match started {
            Ok(playback) => playback,
            Err(e) => {
                error!("failed to start pipeline: {e}");
                self.running.store(false, Ordering::SeqCst);
                for thread in threads {
                    let _ = thread.join();
                }
                return Err(e);
            }
        };

        let orchestrator = Orchestrator {
            config: Arc::clone(&config),
            ports: self.ports.clone(),
            conversation,
            playback,
            meeting,
            recorder,
            retry: RetryPolicy::from_config(&config.retry),
            events: self.events_tx.clone(),
            state_tx: self.state_tx.clone(),
            state: PipelineState::default(),
            diagnostics: Arc::clone(&self.diagnostics),
            segments: segment_rx,
            commands: command_rx,
            fatal: fatal_rx,
            shutdown: shutdown.clone(),
            running: Arc::clone(&self.running),
        };

        *session = Some(Session {
            shutdown,
            commands: command_tx,
            orchestrator: tokio::spawn(orchestrator.run()),
            threads,
        });
        info!("engine started, listening");
        Ok(())
    }

    /// Stop the pipeline and release both devices.
    ///
    /// Returns the device error that stopped the pipeline, if one did.
    /// Calling it again (or before `start`) is a no-op returning `Ok(())`.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            debug!("shutdown requested while not running");
            return Ok(());
        };
        info!("engine shutdown requested");
        session.shutdown.cancel();
        drop(session.commands);

        let result = match session.orchestrator.await {
            Ok(result) => result,
            Err(e) => Err(ParleyError::Other(anyhow::anyhow!(
                "orchestrator task failed: {e}"
            ))),
        };

        self.running.store(false, Ordering::SeqCst);
        let threads = session.threads;
        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .map(|t| t.join())
                .filter(|r| r.is_err())
                .count()
        })
        .await;
        match joined {
            Ok(0) => {}
            Ok(panicked) => warn!(panicked, "pipeline threads panicked"),
            Err(e) => warn!("failed to join pipeline threads: {e}"),
        }

        let d = self.diagnostics.snapshot();
        info!(
            frames_captured = d.frames_captured,
            frames_dropped = d.frames_dropped,
            segments = d.segments_emitted,
            human_turns = d.human_turns,
            agent_turns = d.agent_turns,
            barge_ins = d.barge_ins,
            port_failures = d.port_failures,
            "engine stopped"
        );
        result
    }

    /// Wait until the pipeline is back in `IDLE`: after `shutdown`, or
    /// after a device failure stopped it.
    pub async fn wait(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.stage == PipelineStage::Idle).await;
    }

    /// Inject a typed message as if it had been spoken (confidence 1.0).
    /// Messages are handled in order whenever the pipeline is `LISTENING`.
    pub fn submit_text(&self, text: impl Into<String>) -> Result<()> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(ParleyError::NotRunning);
        };
        let text = text.into();
        if text.trim().is_empty() {
            return Ok(());
        }
        session.commands.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ParleyError::InputQueueFull,
            mpsc::error::TrySendError::Closed(_) => ParleyError::NotRunning,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current state (snapshot).
    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for ParleyEngine {
    fn drop(&mut self) {
        // Without an explicit shutdown the threads still wind down and close
        // their devices; they are just not joined.
        if let Some(session) = self.session.get_mut().take() {
            session.shutdown.cancel();
            self.running.store(false, Ordering::SeqCst);
        }
    }
}
