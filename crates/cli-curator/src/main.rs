use anyhow::{Context, Result};
use clap::Parser;
use curator::{
    config::{read_api_key, CuratorConfig},
    encoder::Encoder,
    orchestrator::{Orchestrator, Shutdown},
    provider::{MetadataProvider, TmdbProvider},
    FfmpegEncoder, Layout,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use log::{error, info, warn};

/// Exit code for an interrupted run (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

/// Media curator: classify, rename, stage and transcode queued video files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media root containing Queue, Staged, Completed and Errors
    root: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log every move and encode without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Move staged files to Completed without re-encoding
    #[arg(long)]
    skip_transcode: bool,

    /// Number of parallel transcode workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log filter, e.g. "info" or "curator=debug" (defaults to RUST_LOG, then info)
    #[arg(long)]
    log_level: Option<String>,

    /// Write the log to a timestamped file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Force a specific ffmpeg video encoder (e.g. libx264, h264_nvenc)
    #[arg(long)]
    encoder: Option<String>,

    /// Keep the staged original next to the transcoded output
    #[arg(long)]
    keep_source: bool,

    /// Replace differing files already at the destination
    #[arg(long, overrides_with = "no_overwrite")]
    overwrite: bool,

    /// Never replace files at the destination (default)
    #[arg(long, overrides_with = "overwrite")]
    no_overwrite: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = &args.log_level {
        builder.parse_filters(level);
    }
    builder.format_timestamp_secs();

    if let Some(dir) = &args.log_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let path = dir.join(format!("curator-{}.log", chrono::Local::now().format("%Y%m%d-%H%M%S")));
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn apply_overrides(cfg: &mut CuratorConfig, args: &Args) {
    if let Some(root) = &args.root {
        cfg.media_root = root.clone();
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers.max(1);
    }
    if args.encoder.is_some() {
        cfg.encoder_override = args.encoder.clone();
    }
    cfg.dry_run |= args.dry_run;
    cfg.skip_transcode |= args.skip_transcode;
    cfg.keep_source |= args.keep_source;
    if args.overwrite {
        cfg.overwrite = true;
    } else if args.no_overwrite {
        cfg.overwrite = false;
    }
}

/// Ctrl-C, and SIGTERM on unix, as one stream of interrupt requests
struct Interrupts {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl Interrupts {
    fn new() -> Self {
        #[cfg(unix)]
        let terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };
        Self {
            #[cfg(unix)]
            terminate,
        }
    }

    /// Name of the next signal received, `None` once no signal can arrive
    async fn next(&mut self) -> Option<&'static str> {
        #[cfg(unix)]
        if let Some(terminate) = self.terminate.as_mut() {
            return tokio::select! {
                result = tokio::signal::ctrl_c() => result.ok().map(|_| "Ctrl-C"),
                received = terminate.recv() => received.map(|_| "SIGTERM"),
            };
        }
        tokio::signal::ctrl_c().await.ok().map(|_| "Ctrl-C")
    }
}

/// The first interrupt stops dispatch, the second cancels running encodes
fn spawn_interrupt_handler(shutdown: Shutdown) {
    let mut interrupts = Interrupts::new();
    tokio::spawn(async move {
        let Some(signal) = interrupts.next().await else {
            return;
        };
        warn!("⚠️  {} received: finishing in-flight work, interrupt again to abort", signal);
        shutdown.request_stop();

        let Some(signal) = interrupts.next().await else {
            return;
        };
        warn!("⚠️  Second interrupt ({}): cancelling running encodes", signal);
        shutdown.request_abort();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    // Load configuration
    let mut cfg = CuratorConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    apply_overrides(&mut cfg, &args);

    info!("Curator starting");
    info!("Configuration loaded:");
    info!("  Media root: {}", cfg.media_root.display());
    info!("  Workers: {}", cfg.workers);
    info!("  Dry run: {}", cfg.dry_run);
    info!("  Skip transcode: {}", cfg.skip_transcode);
    info!("  Keep source: {}", cfg.keep_source);
    info!("  Overwrite: {}", cfg.overwrite);
    info!("  Target: {} / {} crf {} / {}", cfg.profile.container, cfg.profile.video_codec,
          cfg.profile.crf, cfg.profile.audio_codec);

    // Fatal checks, all before any file is touched
    Layout::new(&cfg.media_root).validate()?;
    let api_key = read_api_key()?;
    let encoder: Option<Arc<dyn Encoder>> = if cfg.skip_transcode {
        info!("Transcoding skipped: staged files move to Completed unchanged");
        None
    } else {
        Some(Arc::new(FfmpegEncoder::detect(&cfg).await?))
    };

    let provider: Arc<dyn MetadataProvider> = Arc::new(
        TmdbProvider::new(api_key, &cfg.provider).context("Failed to create metadata client")?,
    );

    let shutdown = Shutdown::new();
    spawn_interrupt_handler(shutdown.clone());

    let orchestrator = Orchestrator::new(&cfg, provider, encoder, shutdown);
    let summary = match orchestrator.run().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Run failed: {:#}", e);
            return Err(e);
        }
    };
    summary.log();

    if summary.interrupted {
        std::process::exit(EXIT_INTERRUPTED);
    }
    info!("✅ Run complete");
    Ok(())
}
