//! # GazePlay Player
//!
//! Headless host for the decode pipeline: opens a file, runs the decode
//! thread and consumes its frames the way a renderer would, optionally
//! dumping some of them as PNG.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use gazeplay_core::{ChannelSink, DecoderConfig, DecoderEvent, DecoderThread, Image, SessionOutcome, VERSION};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Default)]
struct PlayerOptions {
    input: Option<PathBuf>,
    config: Option<PathBuf>,
    queue: Option<usize>,
    dump_dir: Option<PathBuf>,
    dump_every: u64,
    stop_after: Option<u64>,
}

impl PlayerOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = PlayerOptions {
            dump_every: 30,
            ..Default::default()
        };

        let mut i = 1;
        while i < args.len() {
            let arg = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .map(String::as_str)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for {}", arg))
            };
            match arg {
                "--config" | "-c" => {
                    options.config = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--queue" | "-q" => {
                    let v = value()?;
                    options.queue = Some(v.parse().with_context(|| format!("Invalid queue size {}", v))?);
                    i += 2;
                }
                "--dump-dir" => {
                    options.dump_dir = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--dump-every" => {
                    let v = value()?;
                    options.dump_every = v.parse().with_context(|| format!("Invalid frame interval {}", v))?;
                    i += 2;
                }
                "--stop-after" | "-n" => {
                    let v = value()?;
                    options.stop_after = Some(v.parse().with_context(|| format!("Invalid frame count {}", v))?);
                    i += 2;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    tracing::warn!("Ignoring unknown option {}", other);
                    i += 1;
                }
                path => {
                    options.input = Some(PathBuf::from(path));
                    i += 1;
                }
            }
        }

        if options.input.is_none() {
            print_usage();
            anyhow::bail!("Missing input file");
        }
        Ok(options)
    }

    fn decoder_config(&self) -> Result<DecoderConfig> {
        let mut config = match &self.config {
            Some(path) => DecoderConfig::from_json_file(path)
                .with_context(|| format!("Loading config {:?}", path))?,
            None => DecoderConfig::default(),
        };
        if let Some(queue) = self.queue {
            config.max_frames_in_queue = queue;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  gazeplay <file> [--config <json>] [--queue <n>] [--dump-dir <dir>] [--dump-every <n>] [--stop-after <n>]\n"
    );
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "gazeplay=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let options = PlayerOptions::from_args(&args)?;
    let config = options.decoder_config()?;
    let Some(input) = options.input.clone() else {
        anyhow::bail!("Missing input file");
    };

    tracing::info!("GazePlay v{}", VERSION);
    if let Some(dir) = &options.dump_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating dump directory {:?}", dir))?;
    }

    let (sink, events) = ChannelSink::unbounded();
    let mut worker = DecoderThread::new(config, Arc::new(sink));
    worker
        .try_open(&input)
        .with_context(|| format!("Cannot open {:?}", input))?;
    worker.start()?;

    let started = Instant::now();
    let playback = consume(&mut worker, &events, &options)?;
    worker.abort();

    let summary = serde_json::json!({
        "input": input.display().to_string(),
        "duration_ms": playback.duration_ms,
        "last_position_ms": playback.position_ms,
        "frames": playback.frames,
        "dumped": playback.dumped,
        "state": format!("{:?}", worker.state()),
        "stats": worker.stats(),
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let SessionOutcome::Failed { error, .. } = playback.outcome {
        anyhow::bail!("Decoding stopped: {}", error);
    }
    Ok(())
}

// ============================================================================
// Frame Consumer
// ============================================================================

struct Playback {
    duration_ms: i64,
    position_ms: i64,
    frames: u64,
    dumped: u64,
    outcome: SessionOutcome,
}

/// Receive events until the session ends, releasing every frame after use.
fn consume(
    worker: &mut DecoderThread,
    events: &crossbeam_channel::Receiver<DecoderEvent>,
    options: &PlayerOptions,
) -> Result<Playback> {
    let mut duration_ms = 0;
    let mut position_ms = 0;
    let mut frames = 0u64;
    let mut dumped = 0u64;
    let mut stopping = false;

    let outcome = loop {
        let event = events.recv().context("Decoder event channel closed")?;
        match event {
            DecoderEvent::DurationChanged(ms) => {
                tracing::info!("Duration: {} ms", ms);
                duration_ms = ms;
            }
            DecoderEvent::PositionChanged(ms) => position_ms = ms,
            DecoderEvent::FrameReady(frame) => {
                frames += 1;
                if let Some(dir) = &options.dump_dir {
                    if options.dump_every > 0 && frame.sequence % options.dump_every == 0 {
                        save_png(dir, &frame.image, frame.sequence)?;
                        dumped += 1;
                    }
                }
                tracing::debug!("Frame {} at {:?} ms", frame.sequence, frame.pts_ms);
                frame.release();

                if !stopping && options.stop_after.is_some_and(|n| frames >= n) {
                    tracing::info!("Stopping after {} frames", frames);
                    stopping = true;
                    worker.abort();
                }
            }
            DecoderEvent::SessionEnded(outcome) => break outcome,
        }
    };

    Ok(Playback {
        duration_ms,
        position_ms,
        frames,
        dumped,
        outcome,
    })
}

fn save_png(dir: &Path, image: &Image, sequence: u64) -> Result<()> {
    let path = dir.join(format!("frame_{:06}.png", sequence));
    let rgba = image::RgbaImage::from_raw(image.width() as u32, image.height() as u32, image.to_rgba8())
        .context("Frame buffer does not match its size")?;
    rgba.save(&path).with_context(|| format!("Writing {:?}", path))?;
    tracing::debug!("Wrote {:?}", path);
    Ok(())
}
