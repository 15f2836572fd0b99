//! framemux entry point.
//!
//! ```text
//! framemux                     Encode using framemux.toml (or defaults)
//! framemux --config <path>     Load a custom config TOML
//! framemux --gen-config        Write default config to stdout
//! framemux --frames 90         Stop after 90 frames
//! framemux --output out.mkv    Override the output file or URL
//! framemux --dry-run           Use the in-process backend, write nothing
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framemux_cli::config::AppConfig;
use framemux_cli::service::{RunSummary, ServiceError, StreamService};
use framemux_core::MemoryBackend;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "framemux", version, about = "Encode raw BGR frames to a file or a live stream")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "framemux.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Stop after this many frames (0 = until the source ends).
    #[arg(short, long)]
    frames: Option<u64>,

    /// Output file or URL, overriding the config.
    #[arg(short, long)]
    output: Option<String>,

    /// Encode with the in-process backend; nothing is written.
    #[arg(long)]
    dry_run: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", AppConfig::default().to_toml()?);
        return Ok(());
    }

    // Load config.
    let mut config = AppConfig::load(&cli.config);
    if let Some(frames) = cli.frames {
        config.source.frames = frames;
    }
    if let Some(output) = cli.output {
        config.encoder.output = output;
    }
    config.encoder.validate()?;

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("framemux v{}", env!("CARGO_PKG_VERSION"));
    info!("output: {} ({:?})", config.encoder.output, config.encoder.mode);
    info!(
        "{}x{} -> {}x{} @ {} fps, {} bit/s, codec {}",
        config.encoder.src_width,
        config.encoder.src_height,
        config.encoder.dst_width,
        config.encoder.dst_height,
        config.encoder.fps,
        config.encoder.bitrate,
        config.encoder.codec_name
    );

    let service = StreamService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    let dry_run = cli.dry_run;
    let summary = tokio::task::spawn_blocking(move || run(&service, dry_run)).await??;
    println!("{summary}");

    Ok(())
}

#[cfg(feature = "ffmpeg")]
fn run(service: &StreamService, dry_run: bool) -> Result<RunSummary, ServiceError> {
    if dry_run {
        return service.run(MemoryBackend::new());
    }
    let backend = framemux_core::FfmpegBackend::new().map_err(framemux_core::QueueError::from)?;
    let summary = service.run(backend);
    framemux_core::backend::ffmpeg::release_shared_device();
    summary
}

#[cfg(not(feature = "ffmpeg"))]
fn run(service: &StreamService, dry_run: bool) -> Result<RunSummary, ServiceError> {
    if !dry_run {
        tracing::warn!("built without the ffmpeg feature; running a dry run");
    }
    service.run(MemoryBackend::new())
}
