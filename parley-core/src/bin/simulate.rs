//! `parley-sim`: drive a scripted conversation through the full engine.
//!
//! Synthetic "speech" (a modulated tone) and silence are fed into an
//! in-memory source in real time; the offline ports answer with an echo
//! rendered as a tone. Prints the event stream and a JSON diagnostics
//! summary when the script ends.
//!
//! ```text
//! parley-sim [--config settings.json] [--log conversation.jsonl] [--chat]
//! ```

use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parley_core::audio::{channel_source, MemorySink, SourceFeeder};
use parley_core::conversation::policy_for;
use parley_core::meeting::{MeetingChannel, RecordingChannel};
use parley_core::ports::stub::{EchoGenerator, StubTranscriber, ToneSynthesizer};
use parley_core::{load_config, AudioSink, AudioSource, ParleyEngine, PipelineConfig, Ports};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::info;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    log: Option<PathBuf>,
    chat: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it.next().ok_or("--config requires a path")?;
                args.config = Some(PathBuf::from(value));
            }
            "--log" => {
                let value = it.next().ok_or("--log requires a path")?;
                args.log = Some(PathBuf::from(value));
            }
            "--chat" => args.chat = true,
            "-h" | "--help" => {
                println!("usage: parley-sim [--config settings.json] [--log conversation.jsonl] [--chat]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

/// One step of the scripted microphone.
#[derive(Debug, Clone, Copy)]
enum Cue {
    Speech(u64),
    Silence(u64),
}

const SCRIPT: &[Cue] = &[
    Cue::Silence(500),
    Cue::Speech(1200),
    Cue::Silence(2500),
    Cue::Speech(900),
    Cue::Silence(300),
    // Interrupts the second answer while it is still playing.
    Cue::Speech(700),
    Cue::Silence(3000),
];

const BLOCK_MS: u64 = 20;

fn feed_script(feeder: SourceFeeder, sample_rate: u32) {
    let block = (sample_rate as u64 * BLOCK_MS / 1000) as usize;
    let mut phase = 0usize;
    for cue in SCRIPT {
        let (ms, voiced) = match *cue {
            Cue::Speech(ms) => (ms, true),
            Cue::Silence(ms) => (ms, false),
        };
        for _ in 0..(ms / BLOCK_MS) {
            let samples = (0..block)
                .map(|i| {
                    let t = (phase + i) as f32 / sample_rate as f32;
                    if voiced {
                        let envelope = 0.6 + 0.4 * (TAU * 4.0 * t).sin();
                        0.3 * envelope * (TAU * 180.0 * t).sin()
                    } else {
                        0.001 * (TAU * 50.0 * t).sin()
                    }
                })
                .collect();
            phase += block;
            if !feeder.push(samples) {
                return;
            }
            thread::sleep(Duration::from_millis(BLOCK_MS));
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    events: &'a [parley_core::PipelineEvent],
    chat_messages: Vec<String>,
    samples_written: usize,
    diagnostics: parley_core::DiagnosticsSnapshot,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley_core=info,parley_sim=info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("simulation failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => load_config(path).map_err(|e| e.to_string())?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides();
    if args.log.is_some() {
        config.conversation_log_path = args.log.clone();
    }
    config.mirror_responses_to_chat |= args.chat;

    let sample_rate = config.sample_rate;
    let ports = Ports::new(
        StubTranscriber {
            latency: Duration::from_millis(120),
        },
        EchoGenerator {
            latency: Duration::from_millis(200),
        },
        ToneSynthesizer {
            latency: Duration::from_millis(80),
            ..ToneSynthesizer::default()
        },
    );
    let policy = policy_for(&config);
    let engine = ParleyEngine::new(config, ports, policy);
    let mut events = engine.subscribe_events();

    let (source, feeder) = channel_source(sample_rate, 1);
    let sink = MemorySink::new(sample_rate).realtime(true);
    let sink_log = sink.log();
    let channel = Arc::new(RecordingChannel::new());

    engine
        .start(
            Box::new(move || Ok(Box::new(source) as Box<dyn AudioSource>)),
            Box::new(move || Ok(Box::new(sink) as Box<dyn AudioSink>)),
            Some(channel.clone() as Arc<dyn MeetingChannel>),
        )
        .map_err(|e| e.to_string())?;
    info!("simulation started");

    let script = tokio::task::spawn_blocking(move || feed_script(feeder, sample_rate));
    script.await.map_err(|e| e.to_string())?;
    engine.shutdown().await.map_err(|e| e.to_string())?;

    let mut collected = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => collected.push(event),
            Err(TryRecvError::Lagged(skipped)) => info!(skipped, "event receiver lagged"),
            Err(_) => break,
        }
    }

    let report = Report {
        events: &collected,
        chat_messages: channel.messages(),
        samples_written: sink_log.written().len(),
        diagnostics: engine.diagnostics_snapshot(),
    };
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
