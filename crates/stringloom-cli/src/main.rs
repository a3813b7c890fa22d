//! Run a string-art generation against an image file.
//!
//! Reads the image, runs a background job with progress logged to
//! stderr, and writes the preview PNG and the full result JSON next to
//! the requested output path.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use log::{info, LevelFilter, Log, Metadata, Record};
use stringloom_engine::{ColorMode, FrameType, GenerationParams, QualityPreset};

/// Generate a string-art winding from an image.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Input image path (PNG, JPEG, BMP, WebP).
    input: PathBuf,

    /// Output stem; writes `<stem>.png` and `<stem>.json`.
    #[arg(short, long, default_value = "stringloom-out")]
    output: PathBuf,

    /// Number of pins on the frame perimeter.
    #[arg(long, default_value_t = GenerationParams::DEFAULT_PIN_COUNT)]
    pins: u32,

    /// Total threads to place.
    #[arg(long, default_value_t = GenerationParams::DEFAULT_MAX_THREADS)]
    threads: u32,

    /// Frame shape.
    #[arg(long, value_parser = parse_frame, default_value = "circular")]
    frame: FrameType,

    /// Use the LAB-interleaved CMYK color mode.
    #[arg(long)]
    color: bool,

    /// Quality preset.
    #[arg(long, value_parser = parse_preset, default_value = "balanced")]
    preset: QualityPreset,

    /// Run the simulated-annealing post-pass.
    #[arg(long)]
    anneal: bool,

    /// Log verbosity (-v = debug, -vv = trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_frame(s: &str) -> Result<FrameType, String> {
    match s {
        "circular" => Ok(FrameType::Circular),
        "square" => Ok(FrameType::Square),
        "rectangular" => Ok(FrameType::Rectangular),
        other => Err(format!("unknown frame type: {other}")),
    }
}

fn parse_preset(s: &str) -> Result<QualityPreset, String> {
    match s {
        "fast" => Ok(QualityPreset::Fast),
        "balanced" => Ok(QualityPreset::Balanced),
        "high" => Ok(QualityPreset::High),
        other => Err(format!("unknown preset: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Minimal stderr logger
// ---------------------------------------------------------------------------

struct StderrLogger {
    level: LevelFilter,
    started: Instant,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "[{:7.3}s {:>5}] {}",
            elapsed,
            record.level(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let logger = LOGGER.get_or_init(|| StderrLogger {
        level,
        started: Instant::now(),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger(args.verbose);

    let params = GenerationParams {
        frame_type: args.frame,
        pin_count: args.pins,
        max_threads: args.threads,
        color_mode: if args.color {
            ColorMode::Color
        } else {
            ColorMode::Monochrome
        },
        quality_preset: args.preset,
        use_simulated_annealing: args.anneal,
        ..GenerationParams::default()
    };
    params.validate().map_err(|e| e.to_string())?;

    let image_bytes = std::fs::read(&args.input)?;
    info!(
        "generating: {} pins, {} threads, {} mode, {} preset",
        params.pin_count, params.max_threads, params.color_mode, params.quality_preset,
    );

    let job = stringloom_job::spawn(image_bytes, params);
    let mut last_stage = String::new();
    for snap in job.progress().iter() {
        if snap.stage_label != last_stage {
            info!("stage: {}", snap.stage_label);
            last_stage = snap.stage_label.clone();
        }
        if let Some(acc) = snap.accuracy {
            info!(
                "  {}/{} threads, similarity {:.1}%",
                snap.current_thread, snap.total_threads, acc.similarity_pct,
            );
        }
    }
    let result = job.join()?;

    let png_path = args.output.with_extension("png");
    std::fs::write(&png_path, BASE64.decode(&result.preview_base64)?)?;

    let json_path = args.output.with_extension("json");
    std::fs::write(&json_path, serde_json::to_vec_pretty(&result)?)?;

    info!(
        "done: {} threads, mse {:.1}, ssim {:.3}, similarity {:.1}% -> {} / {}",
        result.total_threads,
        result.accuracy.mse,
        result.accuracy.ssim,
        result.accuracy.similarity_pct,
        png_path.display(),
        json_path.display(),
    );
    Ok(())
}
