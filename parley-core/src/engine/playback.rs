//! Playback thread and the orchestrator's handle onto it.
//!
//! The orchestrator pushes synthesized samples into an SPSC ring; a
//! dedicated thread owns the sink and drains the ring in
//! `playback_chunk_samples` writes. Flushing is a request/acknowledge
//! handshake: the thread clears the ring, flushes the sink and bumps
//! `flush_acks`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc as sync_mpsc, Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::diagnostics::PipelineDiagnostics;
use crate::audio::{AudioSink, SinkFactory};
use crate::buffering::{
    create_sample_ring, Consumer, Producer, SampleConsumer, SampleProducer,
};
use crate::error::{ParleyError, Result};

const IDLE_SLEEP: Duration = Duration::from_millis(2);
const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct PlaybackShared {
    /// Samples written to the sink or discarded by a flush.
    consumed: AtomicU64,
    flush_requested: AtomicBool,
    flush_acks: AtomicU64,
    failed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlayOutcome {
    Completed,
    Cancelled,
    DeviceFailed,
}

pub(crate) struct PlaybackHandle {
    producer: SampleProducer,
    shared: Arc<PlaybackShared>,
    pushed: u64,
    sink_rate: u32,
}

impl PlaybackHandle {
    /// Rate the sink plays at; synthesized audio must be converted to it.
    pub fn sink_rate(&self) -> u32 {
        self.sink_rate
    }

    /// Feed `samples` to the playback thread and wait until all of them
    /// were written to the sink. Cancellation stops feeding at once; the
    /// caller is expected to `flush` afterwards.
    pub async fn play(&mut self, samples: &[f32], cancel: &CancellationToken) -> PlayOutcome {
        let target = self.pushed + samples.len() as u64;
        let mut rest = samples;
        loop {
            if !rest.is_empty() {
                let n = self.producer.push_slice(rest);
                self.pushed += n as u64;
                rest = &rest[n..];
            }
            if rest.is_empty() && self.shared.consumed.load(Ordering::Acquire) >= target {
                return PlayOutcome::Completed;
            }
            if self.shared.failed.load(Ordering::Acquire) {
                return PlayOutcome::DeviceFailed;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PlayOutcome::Cancelled,
                _ = tokio::time::sleep(POLL) => {}
            }
        }
    }

    /// Drop everything queued and flush the sink. Returns `false` if the
    /// playback thread did not acknowledge within `ack_timeout`.
    pub async fn flush(&mut self, ack_timeout: Duration) -> bool {
        let before = self.shared.flush_acks.load(Ordering::Acquire);
        self.shared.flush_requested.store(true, Ordering::Release);
        let deadline = Instant::now() + ack_timeout;
        while self.shared.flush_acks.load(Ordering::Acquire) == before {
            if self.shared.failed.load(Ordering::Acquire) || Instant::now() >= deadline {
                warn!(
                    timeout_ms = ack_timeout.as_millis() as u64,
                    "playback flush not acknowledged"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }
}

pub(crate) struct PlaybackContext {
    pub ring_samples: usize,
    pub chunk_samples: usize,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub fatal: mpsc::UnboundedSender<ParleyError>,
}

/// Open the sink on a new thread. Returns once the device is open.
pub(crate) fn spawn_playback(
    factory: SinkFactory,
    ctx: PlaybackContext,
) -> Result<(JoinHandle<()>, PlaybackHandle)> {
    let (producer, consumer) = create_sample_ring(ctx.ring_samples);
    let shared = Arc::new(PlaybackShared::default());
    let thread_shared = Arc::clone(&shared);
    let (open_tx, open_rx) = sync_mpsc::channel::<Result<u32>>();

    let handle = thread::Builder::new()
        .name("parley-playback".into())
        .spawn(move || {
            let mut sink = match factory() {
                Ok(sink) => {
                    let _ = open_tx.send(Ok(sink.sample_rate()));
                    sink
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            run_playback(sink.as_mut(), consumer, &thread_shared, &ctx);
            ctx.diagnostics
                .playback_underruns
                .store(sink.underruns(), Ordering::Relaxed);
            sink.close();
            debug!("playback sink closed");
        })?;

    match open_rx.recv() {
        Ok(Ok(sink_rate)) => {
            info!(sink_rate, "playback started");
            Ok((
                handle,
                PlaybackHandle {
                    producer,
                    shared,
                    pushed: 0,
                    sink_rate,
                },
            ))
        }
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(ParleyError::Other(anyhow::anyhow!(
            "playback thread died before opening the sink"
        ))),
    }
}

fn run_playback(
    sink: &mut dyn AudioSink,
    mut consumer: SampleConsumer,
    shared: &PlaybackShared,
    ctx: &PlaybackContext,
) {
    let mut chunk = vec![0f32; ctx.chunk_samples.max(1)];

    while ctx.running.load(Ordering::SeqCst) {
        if shared.flush_requested.swap(false, Ordering::AcqRel) {
            let mut cleared = 0u64;
            loop {
                let n = consumer.pop_slice(&mut chunk);
                if n == 0 {
                    break;
                }
                cleared += n as u64;
            }
            let flushed = sink.flush();
            shared.consumed.fetch_add(cleared, Ordering::AcqRel);
            shared.flush_acks.fetch_add(1, Ordering::AcqRel);
            PipelineDiagnostics::bump(&ctx.diagnostics.playback_flushes);
            debug!(cleared, "playback flushed");
            if let Err(e) = flushed {
                fail(shared, ctx, e);
                break;
            }
            continue;
        }

        let n = consumer.pop_slice(&mut chunk);
        if n == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        // A flush requested while popping drops this chunk with the rest.
        if shared.flush_requested.load(Ordering::Acquire) {
            shared.consumed.fetch_add(n as u64, Ordering::AcqRel);
            continue;
        }
        if let Err(e) = sink.write(&chunk[..n]) {
            fail(shared, ctx, e);
            break;
        }
        shared.consumed.fetch_add(n as u64, Ordering::AcqRel);
        ctx.diagnostics
            .samples_played
            .fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn fail(shared: &PlaybackShared, ctx: &PlaybackContext, e: ParleyError) {
    error!("playback device failed: {e}");
    shared.failed.store(true, Ordering::Release);
    let _ = ctx.fatal.send(e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MemorySink, SinkEvent};

    fn context(
        running: &Arc<AtomicBool>,
    ) -> (PlaybackContext, mpsc::UnboundedReceiver<ParleyError>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        (
            PlaybackContext {
                ring_samples: 4_096,
                chunk_samples: 480,
                running: Arc::clone(running),
                diagnostics: Arc::new(PipelineDiagnostics::default()),
                fatal: fatal_tx,
            },
            fatal_rx,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plays_whole_buffer_then_completes() {
        let running = Arc::new(AtomicBool::new(true));
        let sink = MemorySink::new(16_000);
        let log = sink.log();
        let (ctx, _fatal) = context(&running);
        let (thread, mut handle) =
            spawn_playback(Box::new(move || Ok(Box::new(sink) as Box<dyn AudioSink>)), ctx)
                .unwrap();
        assert_eq!(handle.sink_rate(), 16_000);

        // Larger than the ring: feeding has to wait for the thread.
        let samples: Vec<f32> = (0..10_000).map(|i| (i % 100) as f32 / 100.0).collect();
        let outcome = handle.play(&samples, &CancellationToken::new()).await;
        assert_eq!(outcome, PlayOutcome::Completed);
        assert_eq!(log.written(), samples);

        running.store(false, Ordering::SeqCst);
        thread.join().unwrap();
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_then_flush_stops_output() {
        let running = Arc::new(AtomicBool::new(true));
        let sink = MemorySink::new(16_000).realtime(true);
        let log = sink.log();
        let (ctx, _fatal) = context(&running);
        let (thread, mut handle) =
            spawn_playback(Box::new(move || Ok(Box::new(sink) as Box<dyn AudioSink>)), ctx)
                .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        // Two seconds of audio; cancelled after ~100 ms.
        let outcome = handle.play(&vec![0.5; 32_000], &cancel).await;
        assert_eq!(outcome, PlayOutcome::Cancelled);
        assert!(handle.flush(Duration::from_millis(250)).await);

        let written_at_flush = log.written().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.written().len(), written_at_flush);
        assert!(written_at_flush < 32_000);
        assert!(matches!(log.events().last(), Some(SinkEvent::Flush)));

        running.store(false, Ordering::SeqCst);
        thread.join().unwrap();
    }

    /// Requests a flush from inside its first write, like a barge-in landing
    /// while the device is busy.
    struct InterruptingSink {
        shared: Arc<PlaybackShared>,
        running: Arc<AtomicBool>,
        events: Arc<parking_lot::Mutex<Vec<SinkEvent>>>,
    }

    impl AudioSink for InterruptingSink {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn write(&mut self, samples: &[f32]) -> Result<()> {
            self.events.lock().push(SinkEvent::Write(samples.to_vec()));
            self.shared.flush_requested.store(true, Ordering::Release);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.events.lock().push(SinkEvent::Flush);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn flush_request_stops_writes_until_the_sink_is_flushed() {
        let running = Arc::new(AtomicBool::new(true));
        let (ctx, _fatal) = context(&running);
        let shared = Arc::new(PlaybackShared::default());
        let (mut producer, consumer) = create_sample_ring(ctx.ring_samples);
        assert_eq!(producer.push_slice(&[0.25; 1_440]), 1_440);
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut sink = InterruptingSink {
            shared: Arc::clone(&shared),
            running: Arc::clone(&running),
            events: Arc::clone(&events),
        };

        run_playback(&mut sink, consumer, &shared, &ctx);

        assert_eq!(
            *events.lock(),
            vec![SinkEvent::Write(vec![0.25; 480]), SinkEvent::Flush]
        );
        // Flushed samples count as consumed so a pending `play` can finish.
        assert_eq!(shared.consumed.load(Ordering::Acquire), 1_440);
        assert_eq!(shared.flush_acks.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let running = Arc::new(AtomicBool::new(true));
        let (ctx, _fatal) = context(&running);
        let result = spawn_playback(
            Box::new(|| Err(ParleyError::NoDefaultDevice("output"))),
            ctx,
        );
        assert!(matches!(result, Err(ParleyError::NoDefaultDevice("output"))));
    }
}
