//! The turn-taking state machine.
//!
//! ```text
//!            ┌──────────────── barge-in ─────────────────┐
//!            ▼                                           │
//! LISTENING ─► TRANSCRIBING ─► GENERATING ─► SYNTHESIZING ─► SPEAKING ─► COOLDOWN ─► LISTENING
//!     ▲             │               │              │
//!     └── discard / no reply / port failure ───────┘
//! ```
//!
//! Runs as a single tokio task and is the only writer of the conversation
//! history and the pipeline state. Port calls run as spawned tasks under a
//! per-turn child of the shutdown token so a barge-in can cancel them while
//! the orchestrator keeps watching the segment channel.

use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::diagnostics::PipelineDiagnostics;
use super::playback::{PlayOutcome, PlaybackHandle};
use crate::audio::resample::{RateConverter, DEFAULT_CHUNK};
use crate::audio::SegmentRecorder;
use crate::buffering::segment::SpeechSegment;
use crate::config::PipelineConfig;
use crate::conversation::{ConversationManager, Role, Utterance};
use crate::error::{ParleyError, Result};
use crate::events::{DiscardReason, PipelineEvent, PipelineStage, PipelineState};
use crate::meeting::MeetingChannel;
use crate::ports::{
    call_with_retry, split_text_for_synthesis, CallError, GenerationRequest, PortKind, Ports,
    RetryPolicy, SynthesisRequest, SynthesizedAudio, TranscriptionRequest,
};

pub(crate) enum Input {
    Segment(SpeechSegment),
    Text(String),
}

/// How a turn left the pipeline.
enum TurnEnd {
    /// Back to `LISTENING` (completed, discarded or failed).
    Finished,
    /// Barge-in: transcribe this segment next.
    Interrupted(SpeechSegment),
    Shutdown,
    Fatal(ParleyError),
}

enum SpeakEnd {
    Played(PlayOutcome),
    BargeIn(SpeechSegment),
    Shutdown,
    Fatal(ParleyError),
}

pub(crate) struct Orchestrator {
    pub config: Arc<PipelineConfig>,
    pub ports: Ports,
    pub conversation: ConversationManager,
    pub playback: PlaybackHandle,
    pub meeting: Option<Arc<dyn MeetingChannel>>,
    pub recorder: Option<SegmentRecorder>,
    pub retry: RetryPolicy,
    pub events: broadcast::Sender<PipelineEvent>,
    pub state_tx: watch::Sender<PipelineState>,
    pub state: PipelineState,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub segments: mpsc::Receiver<SpeechSegment>,
    pub commands: mpsc::Receiver<String>,
    pub fatal: mpsc::UnboundedReceiver<ParleyError>,
    pub shutdown: CancellationToken,
    /// Cleared on exit so the capture, VAD and playback threads stop.
    pub running: Arc<AtomicBool>,
}

impl Orchestrator {
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(agent = %self.config.agent_name, "orchestrator started");
        self.conversation.start_session();
        if self.config.mute_when_idle {
            self.set_muted(true).await;
        }
        self.transition(PipelineStage::Listening);

        let mut pending: Option<Input> = None;
        let result = loop {
            let input = match pending.take() {
                Some(input) => input,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break Ok(()),
                    Some(err) = self.fatal.recv() => break Err(err),
                    segment = self.segments.recv() => match segment {
                        Some(segment) => Input::Segment(segment),
                        None => break Ok(()),
                    },
                    Some(text) = self.commands.recv() => Input::Text(text),
                },
            };

            let turn_id = self.conversation.reserve_turn_id();
            let span = info_span!("turn", turn_id);
            match self.turn(turn_id, input).instrument(span).await {
                TurnEnd::Finished => {}
                TurnEnd::Interrupted(segment) => pending = Some(Input::Segment(segment)),
                TurnEnd::Shutdown => break Ok(()),
                TurnEnd::Fatal(err) => break Err(err),
            }
        };

        if let Err(err) = &result {
            error!("pipeline stopped by device failure: {err}");
            let _ = self.events.send(PipelineEvent::DeviceError {
                message: err.to_string(),
            });
        }
        self.running.store(false, Ordering::SeqCst);
        self.transition(PipelineStage::Idle);
        if self.config.mute_when_idle {
            self.set_muted(true).await;
        }

        let summary = self.conversation.summary();
        info!(
            turns = summary.total_turns,
            human = summary.human_turns,
            agent = summary.agent_turns,
            session_secs = summary.session_secs,
            "orchestrator stopped"
        );
        result
    }

    async fn turn(&mut self, turn_id: u64, input: Input) -> TurnEnd {
        let cancel = self.shutdown.child_token();
        self.state.active_turn_id = Some(turn_id);
        self.state.cancelling = false;

        let utterance = match input {
            Input::Text(text) => {
                debug!("text input");
                Utterance::from_text(text)
            }
            Input::Segment(segment) => match self.transcribe(segment, &cancel).await {
                Ok(Some(utterance)) => utterance,
                Ok(None) => return TurnEnd::Finished,
                Err(end) => return end,
            },
        };

        let human = self.conversation.commit_human(turn_id, &utterance);
        PipelineDiagnostics::bump(&self.diagnostics.human_turns);
        info!(text = %human.text, "human turn committed");
        let _ = self.events.send(PipelineEvent::TurnCommitted {
            turn_id: human.id,
            role: Role::Human,
            text: human.text.clone(),
        });

        if !self.conversation.should_respond(&utterance) {
            debug!("policy chose not to respond");
            self.transition(PipelineStage::Listening);
            return TurnEnd::Finished;
        }

        let reply = match self.generate(&cancel).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return TurnEnd::Finished,
            Err(end) => return end,
        };
        let audio = match self.synthesize(&reply, &cancel).await {
            Ok(Some(audio)) => audio,
            Ok(None) => return TurnEnd::Finished,
            Err(end) => return end,
        };
        self.speak(&reply, audio, &cancel).await
    }

    // ── Stages ───────────────────────────────────────────────────────────

    async fn transcribe(
        &mut self,
        segment: SpeechSegment,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<Utterance>, TurnEnd> {
        self.transition(PipelineStage::Transcribing);
        if let Some(recorder) = &self.recorder {
            match recorder.record(&segment) {
                Ok(path) => debug!(path = %path.display(), "segment recorded"),
                Err(e) => warn!("failed to record segment: {e}"),
            }
        }

        let segment_id = segment.id;
        let request = TranscriptionRequest {
            segment: Arc::new(segment),
            context_hint: self.conversation.transcription_hint(),
        };
        let port = Arc::clone(&self.ports.transcription);
        let policy = self.retry.clone();
        let timeout = Duration::from_millis(self.config.transcription_timeout_ms);
        let token = cancel.clone();
        let call = async move {
            call_with_retry(PortKind::Transcription, &policy, timeout, &token, || {
                port.transcribe(&request, &token)
            })
            .await
        };
        let transcript = self
            .run_stage(PortKind::Transcription, call, cancel)
            .await?;

        let text = transcript.text.trim();
        let reason = if text.is_empty() {
            Some(DiscardReason::Empty)
        } else if transcript.confidence < self.config.min_transcript_confidence {
            Some(DiscardReason::LowConfidence)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(
                segment_id,
                confidence = transcript.confidence,
                ?reason,
                "utterance discarded"
            );
            self.discard(Some(segment_id), transcript.confidence, reason);
            self.transition(PipelineStage::Listening);
            return Ok(None);
        }
        Ok(Some(Utterance::new(
            text,
            transcript.confidence,
            Some(segment_id),
        )))
    }

    async fn generate(
        &mut self,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<String>, TurnEnd> {
        self.transition(PipelineStage::Generating);
        let request = GenerationRequest {
            context: self.conversation.build_context(),
        };
        let port = Arc::clone(&self.ports.generation);
        let policy = self.retry.clone();
        let timeout = Duration::from_millis(self.config.generation_timeout_ms);
        let token = cancel.clone();
        let call = async move {
            call_with_retry(PortKind::Generation, &policy, timeout, &token, || {
                port.generate(&request, &token)
            })
            .await
        };
        let reply = self.run_stage(PortKind::Generation, call, cancel).await?;

        let reply = reply.trim();
        if reply.is_empty() {
            debug!("generation returned nothing to say");
            self.transition(PipelineStage::Listening);
            return Ok(None);
        }
        Ok(Some(reply.to_string()))
    }

    async fn synthesize(
        &mut self,
        reply: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<Vec<f32>>, TurnEnd> {
        self.transition(PipelineStage::Synthesizing);
        let chunks = split_text_for_synthesis(reply, self.config.synthesis_max_chars);
        if chunks.len() > 1 {
            debug!(chunks = chunks.len(), "response split for synthesis");
        }

        let port = Arc::clone(&self.ports.synthesis);
        let policy = self.retry.clone();
        let timeout = Duration::from_millis(self.config.synthesis_timeout_ms);
        let voice = self.config.voice.clone();
        let sample_rate = self.playback.sink_rate();
        let token = cancel.clone();
        let call = async move {
            let mut clips = Vec::with_capacity(chunks.len());
            for text in chunks {
                let request = SynthesisRequest {
                    text,
                    voice: voice.clone(),
                    sample_rate,
                };
                let clip = call_with_retry(PortKind::Synthesis, &policy, timeout, &token, || {
                    port.synthesize(&request, &token)
                })
                .await?;
                clips.push(clip);
            }
            Ok::<_, CallError>(clips)
        };
        let clips = self.run_stage(PortKind::Synthesis, call, cancel).await?;

        let audio = match self.prepare_audio(clips) {
            Ok(audio) => audio,
            Err(e) => {
                self.port_failed(PortKind::Synthesis, e);
                return Err(TurnEnd::Finished);
            }
        };
        if audio.is_empty() {
            debug!("synthesis produced no audio");
            self.transition(PipelineStage::Listening);
            return Ok(None);
        }
        Ok(Some(audio))
    }

    /// Play the reply while watching for barge-in. The agent turn is only
    /// committed once playback completed.
    async fn speak(&mut self, reply: &str, audio: Vec<f32>, cancel: &CancellationToken) -> TurnEnd {
        self.transition(PipelineStage::Speaking);
        if self.config.mute_when_idle {
            self.set_muted(false).await;
        }
        let since = Instant::now();
        let grace = self.config.barge_in_grace();

        let end = {
            let play = self.playback.play(&audio, cancel);
            tokio::pin!(play);
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break SpeakEnd::Shutdown,
                    Some(err) = self.fatal.recv() => break SpeakEnd::Fatal(err),
                    segment = self.segments.recv() => match segment {
                        Some(segment) if within_grace(&segment, since, grace) => {
                            debug!(segment_id = segment.id, "segment inside barge-in grace, ignored");
                            PipelineDiagnostics::bump(&self.diagnostics.echo_suppressed);
                            let _ = self.events.send(PipelineEvent::EchoSuppressed {
                                segment_id: segment.id,
                            });
                        }
                        Some(segment) => break SpeakEnd::BargeIn(segment),
                        None => break SpeakEnd::Shutdown,
                    },
                    outcome = &mut play => break SpeakEnd::Played(outcome),
                }
            }
        };

        match end {
            SpeakEnd::Played(PlayOutcome::Completed) => {
                if self.config.mute_when_idle {
                    self.set_muted(true).await;
                }
                let agent = self.conversation.commit_agent(reply);
                PipelineDiagnostics::bump(&self.diagnostics.agent_turns);
                info!(turn = agent.id, "agent turn committed");
                let _ = self.events.send(PipelineEvent::TurnCommitted {
                    turn_id: agent.id,
                    role: Role::Agent,
                    text: agent.text.clone(),
                });
                if self.config.mirror_responses_to_chat {
                    if let Some(meeting) = &self.meeting {
                        if let Err(e) = meeting.send_message(&agent.text).await {
                            warn!("failed to mirror response to chat: {e}");
                        }
                    }
                }
                self.cooldown().await
            }
            SpeakEnd::Played(PlayOutcome::Cancelled) | SpeakEnd::Shutdown => {
                cancel.cancel();
                self.playback.flush(self.config.cancel_ack_timeout()).await;
                TurnEnd::Shutdown
            }
            SpeakEnd::Played(PlayOutcome::DeviceFailed) => {
                cancel.cancel();
                let err = self
                    .fatal
                    .try_recv()
                    .unwrap_or_else(|_| ParleyError::Device("playback device failed".into()));
                TurnEnd::Fatal(err)
            }
            SpeakEnd::BargeIn(segment) => {
                self.interrupt(cancel).await;
                TurnEnd::Interrupted(segment)
            }
            SpeakEnd::Fatal(err) => {
                cancel.cancel();
                TurnEnd::Fatal(err)
            }
        }
    }

    async fn cooldown(&mut self) -> TurnEnd {
        self.transition(PipelineStage::Cooldown);
        let delay = tokio::time::sleep(self.config.cooldown());
        tokio::pin!(delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return TurnEnd::Shutdown,
                Some(err) = self.fatal.recv() => return TurnEnd::Fatal(err),
                segment = self.segments.recv() => match segment {
                    Some(segment) => {
                        debug!(segment_id = segment.id, "segment during cooldown discarded");
                        self.discard(Some(segment.id), 0.0, DiscardReason::Cooldown);
                    }
                    None => return TurnEnd::Shutdown,
                },
                _ = &mut delay => break,
            }
        }
        self.transition(PipelineStage::Listening);
        TurnEnd::Finished
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Run one port stage as its own task while watching for shutdown,
    /// device failure and (in interruptible stages) barge-in.
    async fn run_stage<T, F>(
        &mut self,
        port: PortKind,
        call: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, TurnEnd>
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, CallError>> + Send + 'static,
    {
        PipelineDiagnostics::bump(&self.diagnostics.port_calls);
        let mut task = tokio::spawn(call);
        let interruptible = self.state.stage.is_interruptible();

        let early = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => TurnEnd::Shutdown,
            Some(err) = self.fatal.recv() => TurnEnd::Fatal(err),
            segment = self.segments.recv(), if interruptible => match segment {
                Some(segment) => TurnEnd::Interrupted(segment),
                None => TurnEnd::Shutdown,
            },
            joined = &mut task => {
                return match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(CallError::Cancelled)) => Err(TurnEnd::Shutdown),
                    Ok(Err(CallError::Failed(err))) => {
                        self.port_failed(port, err);
                        Err(TurnEnd::Finished)
                    }
                    Err(join_err) => {
                        self.port_failed(
                            port,
                            ParleyError::Other(anyhow::anyhow!("{port} task failed: {join_err}")),
                        );
                        Err(TurnEnd::Finished)
                    }
                };
            }
        };

        cancel.cancel();
        self.reap(task).await;
        if let TurnEnd::Interrupted(_) = &early {
            self.interrupt(cancel).await;
        }
        Err(early)
    }

    /// Wait for a cancelled task to notice, then abort it.
    async fn reap<T>(&mut self, mut task: JoinHandle<T>) {
        let ack = self.config.cancel_ack_timeout();
        if tokio::time::timeout(ack, &mut task).await.is_err() {
            warn!(
                timeout_ms = ack.as_millis() as u64,
                "port call ignored cancellation, aborting"
            );
            task.abort();
        }
    }

    /// Barge-in bookkeeping: cancel, flush the sink, report.
    async fn interrupt(&mut self, cancel: &CancellationToken) {
        let interrupted = self.state.stage;
        cancel.cancel();
        self.state.cancelling = true;
        self.state_tx.send_replace(self.state);
        self.playback.flush(self.config.cancel_ack_timeout()).await;
        if interrupted == PipelineStage::Speaking && self.config.mute_when_idle {
            self.set_muted(true).await;
        }
        info!(stage = %interrupted, "barge-in, response cancelled");
        PipelineDiagnostics::bump(&self.diagnostics.barge_ins);
        let _ = self.events.send(PipelineEvent::BargeIn {
            turn_id: self.state.active_turn_id,
            interrupted,
        });
    }

    fn port_failed(&mut self, port: PortKind, err: ParleyError) {
        let (port, attempts, timed_out) = match &err {
            ParleyError::PortTimeout { port, attempts } => (*port, *attempts, true),
            ParleyError::PortFailure { port, attempts, .. } => (*port, *attempts, false),
            _ => (port, 1, false),
        };
        warn!(%port, attempts, "turn aborted: {err}");
        PipelineDiagnostics::bump(&self.diagnostics.port_failures);
        let _ = self.events.send(PipelineEvent::PortFailure {
            port,
            attempts,
            timed_out,
            message: err.to_string(),
        });
        self.transition(PipelineStage::Listening);
    }

    fn discard(&mut self, segment_id: Option<u64>, confidence: f32, reason: DiscardReason) {
        PipelineDiagnostics::bump(&self.diagnostics.utterances_discarded);
        let _ = self.events.send(PipelineEvent::UtteranceDiscarded {
            segment_id,
            confidence,
            reason,
        });
    }

    /// Concatenate clips, converting each to the sink's rate.
    fn prepare_audio(&self, clips: Vec<SynthesizedAudio>) -> Result<Vec<f32>> {
        let target = self.playback.sink_rate();
        let mut audio = Vec::with_capacity(clips.iter().map(|c| c.samples.len()).sum());
        for clip in clips {
            if clip.sample_rate == target {
                audio.extend(clip.samples);
            } else {
                let mut converter = RateConverter::new(clip.sample_rate, target, DEFAULT_CHUNK)?;
                audio.extend(converter.process_all(&clip.samples));
            }
        }
        Ok(audio)
    }

    async fn set_muted(&mut self, muted: bool) {
        let Some(meeting) = self.meeting.clone() else {
            return;
        };
        if let Err(e) = meeting.set_muted(muted).await {
            warn!(muted, "meeting mute change failed: {e}");
        }
    }

    fn transition(&mut self, to: PipelineStage) {
        let from = self.state.stage;
        if matches!(
            to,
            PipelineStage::Listening | PipelineStage::Cooldown | PipelineStage::Idle
        ) {
            self.state.active_turn_id = None;
            self.state.cancelling = false;
        }
        if from == to {
            return;
        }
        self.state.stage = to;
        debug!(%from, %to, turn_id = ?self.state.active_turn_id, "state transition");
        self.state_tx.send_replace(self.state);
        let _ = self.events.send(PipelineEvent::StateChanged {
            from,
            to,
            turn_id: self.state.active_turn_id,
        });
    }
}

/// A segment that began within `grace` of the agent starting to speak is
/// most likely the agent's own voice. Speech that started earlier is the
/// human talking over the reply.
fn within_grace(segment: &SpeechSegment, since: Instant, grace: Duration) -> bool {
    if grace.is_zero() {
        return false;
    }
    segment.started_at >= since && segment.started_at.duration_since(since) < grace
}
