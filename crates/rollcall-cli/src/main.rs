use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use rollcall_core::{EventEmitter, PresenceTracker, TrackerConfig};
use rollcall_wire::{write_envelope, FrameEnvelope};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance tracking CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL capture of frame batches through the tracker
    /// offline and print the derived events
    Replay {
        /// Capture file: one frame envelope JSON object per line
        file: PathBuf,
        /// Seconds without observation before a departure is declared
        #[arg(long, default_value_t = 300)]
        absence_timeout_secs: u64,
        /// Minimum seconds between heartbeat events per identity
        #[arg(long, default_value_t = 120)]
        detection_log_interval_secs: u64,
        /// After the last frame, advance the clock past the absence
        /// timeout so pending departures are flushed
        #[arg(long)]
        settle: bool,
    },
    /// Stream a JSONL capture to a running daemon as wire envelopes
    Send {
        /// Capture file: one frame envelope JSON object per line
        file: PathBuf,
        /// Daemon ingest address
        #[arg(long, default_value = "127.0.0.1:7399")]
        addr: String,
        /// Fixed delay between envelopes, in milliseconds
        #[arg(long, default_value_t = 0)]
        pace_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            file,
            absence_timeout_secs,
            detection_log_interval_secs,
            settle,
        } => {
            let config = TrackerConfig {
                absence_timeout_secs,
                detection_log_interval_secs,
                ..TrackerConfig::default()
            };
            replay(&file, config, settle)
        }
        Commands::Send { file, addr, pace_ms } => send(&file, &addr, pace_ms).await,
    }
}

fn read_capture(file: &PathBuf) -> Result<Vec<FrameEnvelope>> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );
    let mut envelopes = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: FrameEnvelope = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), lineno + 1))?;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

fn replay(file: &PathBuf, config: TrackerConfig, settle: bool) -> Result<()> {
    let envelopes = read_capture(file)?;
    let mut tracker = PresenceTracker::new(config);
    let mut emitter = EventEmitter::new(config);
    let mut last_at = None;

    for envelope in &envelopes {
        let at = envelope.captured_at;
        // Sweep up to this frame first, as the live ticker would have.
        for event in emitter.on_tick(&tracker.tick(at), at) {
            println!("{}", serde_json::to_string(&event)?);
        }
        for event in emitter.on_observe(&tracker.observe(&envelope.detections, at)) {
            println!("{}", serde_json::to_string(&event)?);
        }
        last_at = Some(at);
    }

    if settle {
        if let Some(last) = last_at {
            let horizon = last + Duration::seconds(config.absence_timeout_secs as i64 + 1);
            for event in emitter.on_tick(&tracker.tick(horizon), horizon) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    eprintln!(
        "replayed {} frames, {} sessions live, {} malformed detections dropped",
        envelopes.len(),
        tracker.session_count(),
        tracker.dropped_malformed()
    );
    Ok(())
}

async fn send(file: &PathBuf, addr: &str, pace_ms: u64) -> Result<()> {
    let envelopes = read_capture(file)?;
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let total = envelopes.len();
    for mut envelope in envelopes {
        // Captures carry no image bytes even if the recording pipeline
        // noted a payload length.
        envelope.image_len = 0;
        write_envelope(&mut stream, &envelope, &[]).await?;
        if pace_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(pace_ms)).await;
        }
    }
    eprintln!("sent {total} frames to {addr}");
    Ok(())
}
