//! sentinelad - multi-camera person detection daemon
//!
//! This daemon:
//! 1. Loads configuration (file, then environment overrides)
//! 2. Opens every configured camera, skipping the ones that fail
//! 3. Runs person detection through one shared inference gate
//! 4. Sends debounced, rate-limited alerts to every subscriber
//! 5. Answers bot commands when a bot token is configured

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use sentinela::alert::{RateBudget, VideoAssembler};
use sentinela::detect::backend_from_config;
use sentinela::telegram::{BotPoller, TelegramClient};
use sentinela::{
    build_sources, AlertDispatcher, Clock, CommandProcessor, InferenceGate, InferenceSettings,
    JsonStore, LogNotifier, MjpegAviAssembler, Notifier, Orchestrator, SentinelConfig,
    SubscriberSource, SystemClock,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera person detection with chat alerts")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `sentinela=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Log alerts instead of sending them.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let cfg = SentinelConfig::load(args.config.as_deref())?;
    log::info!(
        "sentinelad {} starting with {} camera(s), store {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        cfg.store_path.display()
    );

    let store = Arc::new(JsonStore::open(&cfg.store_path)?);
    let inference = Arc::new(InferenceSettings::new(
        store.inference_activated().unwrap_or(cfg.model.activated),
        store
            .inference_threshold()
            .unwrap_or(cfg.model.confidence_threshold),
    ));
    log::info!(
        "detection {} at threshold {:.2}",
        if inference.is_activated() { "enabled" } else { "disabled" },
        inference.threshold()
    );

    let backend = backend_from_config(&cfg.model)?;
    let gate = Arc::new(InferenceGate::new(backend, inference.clone()));
    log::info!("detector backend: {}", gate.backend_name());

    let telegram = match (&cfg.bot.token, args.dry_run) {
        (Some(token), false) => Some(Arc::new(TelegramClient::new(token, &cfg.bot.api_base))),
        _ => None,
    };
    let notifier: Arc<dyn Notifier> = match &telegram {
        Some(client) => client.clone(),
        None => {
            log::warn!("no bot token or dry run: alerts are only logged");
            Arc::new(LogNotifier::new())
        }
    };

    let assembler = video_assembler(&cfg);
    let subscribers: Arc<dyn SubscriberSource> = store.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dispatcher = Arc::new(
        AlertDispatcher::new(
            RateBudget::new(cfg.rate.max_per_minute, cfg.rate.min_interval),
            notifier,
            assembler,
            subscribers,
            clock.clone(),
        )
        .with_video_threshold(cfg.buffer.video_threshold),
    );

    let orchestrator = Orchestrator::start(
        build_sources(cfg.source_configs()),
        gate.clone(),
        dispatcher,
        cfg.pipeline_settings(),
        clock,
    )?;
    let cancel = orchestrator.cancel_token();

    // Warm-up runs after the cameras are up so a slow model load does not
    // delay their first frames.
    if let Err(e) = gate.warm_up(&cancel) {
        log::warn!("detector warm-up failed: {}", e);
    }

    let poller = match telegram {
        Some(client) => {
            let processor =
                CommandProcessor::new(store.clone(), inference, orchestrator.registry().clone());
            let poller = BotPoller::new(client, processor, cfg.bot.poll_timeout);
            let cancel = cancel.clone();
            Some(
                thread::Builder::new()
                    .name("bot-poller".to_string())
                    .spawn(move || poller.run(cancel))
                    .context("spawn bot poller thread")?,
            )
        }
        None => None,
    };

    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("error setting Ctrl-C handler")?;
    }

    log::info!("sentinelad running; waiting for shutdown signal (Ctrl-C)...");
    cancel.wait();
    log::info!("shutdown signal received, stopping cameras...");

    orchestrator.shutdown();
    if let Some(handle) = poller {
        if handle.join().is_err() {
            log::error!("bot poller panicked");
        }
    }
    log::info!("sentinelad stopped");
    Ok(())
}

fn mjpeg_assembler(cfg: &SentinelConfig) -> Arc<dyn VideoAssembler> {
    let mut assembler = MjpegAviAssembler::new(&cfg.video.output_dir, cfg.video.fps);
    if let Some(ffmpeg) = &cfg.video.ffmpeg {
        assembler = assembler.with_ffmpeg(ffmpeg);
    }
    Arc::new(assembler)
}

#[cfg(feature = "video-ffmpeg")]
fn video_assembler(cfg: &SentinelConfig) -> Arc<dyn VideoAssembler> {
    match sentinela::alert::FfmpegAssembler::new(&cfg.video.output_dir, cfg.video.fps) {
        Ok(assembler) => Arc::new(assembler),
        Err(e) => {
            log::warn!("libav unavailable ({}); clips fall back to MJPEG AVI", e);
            mjpeg_assembler(cfg)
        }
    }
}

#[cfg(not(feature = "video-ffmpeg"))]
fn video_assembler(cfg: &SentinelConfig) -> Arc<dyn VideoAssembler> {
    mjpeg_assembler(cfg)
}
