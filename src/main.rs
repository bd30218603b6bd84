use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use region_scale::presets::DownscalePreset;
use region_watch::config::{API_KEY_ENV, MAX_FRAME_RATE_HZ, MIN_FRAME_RATE_HZ};
use region_watch::probe::probe_api_key;
use region_watch::relay::{BroadcastServer, ControlServer, SentenceObserver};
use region_watch::{
    HasRecoverySuggestion, Orchestrator, Region, ResponseFragment, ResponseObserver, SessionState,
    WatchSettings,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_PROMPT: &str = "Watch this screen region and describe what you see. Alert me of any significant changes or interesting activity.";

/// Stream a screen region to a live multimodal model and print what it says.
#[derive(Parser, Debug)]
#[command(name = "region-watch")]
#[command(about = "👀 Stream a screen region to a live model and print its commentary")]
#[command(long_about = "Capture a region of the screen a few times a second, send each snapshot with a prompt
to a live multimodal model over a persistent session, and print the streamed replies as they arrive.")]
struct Args {
    /// Region to watch
    #[arg(short, long, help = "Region to watch as x,y,width,height (e.g. 0,0,800,600)")]
    region: Option<Region>,

    /// Snapshots per second
    #[arg(short, long, help = "Snapshots per second, 1 to 10 (default 2)")]
    fps: Option<u32>,

    /// Prompt sent with every snapshot
    #[arg(short, long, help = "Prompt sent with every snapshot")]
    prompt: Option<String>,

    /// API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, help = "API key for the model service")]
    api_key: Option<String>,

    /// JPEG quality preset
    #[arg(short, long,
          help = "JPEG quality preset: low (smallest frames), medium, high (default), ultra (sharpest)")]
    quality: Option<String>,

    /// Downscale preset
    #[arg(short, long, value_enum, help = "Longest side sent to the model")]
    scale: Option<DownscalePreset>,

    /// Watch duration (supports seconds, minutes, hours)
    #[arg(short, long,
          help = "How long to watch: 30s, 2m, 1h (default: until Ctrl-C)")]
    duration: Option<String>,

    /// Reopen the live session periodically
    #[arg(long, help = "Reopen the live session after this long, e.g. 30s")]
    rotate_after: Option<String>,

    /// Settings file
    #[arg(short, long, help = "TOML settings file")]
    config: Option<PathBuf>,

    /// Re-publish replies to local WebSocket clients
    #[arg(long, value_name = "ADDR", num_args = 0..=1, default_missing_value = "127.0.0.1:8001",
          help = "Broadcast finished replies over WebSocket (default 127.0.0.1:8001)")]
    broadcast: Option<SocketAddr>,

    /// Serve /health and /shutdown
    #[arg(long, value_name = "ADDR", num_args = 0..=1, default_missing_value = "127.0.0.1:8005",
          help = "Serve GET /health and POST /shutdown (default 127.0.0.1:8005)")]
    control: Option<SocketAddr>,

    /// Check the API key and exit
    #[arg(long, help = "Check the API key with a single request and exit")]
    probe: bool,
}

/// Prints fragments to stdout as `[HH:MM:SS] text`.
struct ConsoleObserver;

impl ResponseObserver for ConsoleObserver {
    fn on_fragment(&self, fragment: &ResponseFragment) -> Result<()> {
        println!("{}", fragment);
        Ok(())
    }

    fn on_status(&self, state: &SessionState) -> Result<()> {
        if let SessionState::Failed(reason) = state {
            eprintln!("session failed: {}", reason);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides, e.g. RUST_LOG=region_watch=debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("region_watch=info"));
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => WatchSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => WatchSettings::default(),
    };

    let mut encoder_settings = settings.encoder_settings();
    if let Some(quality) = &args.quality {
        let q = parse_quality(quality)?;
        encoder_settings.quality = q;
        encoder_settings.min_quality = encoder_settings.min_quality.min(q);
    }
    if let Some(scale) = args.scale {
        encoder_settings.max_long_side = scale.long_side();
    }

    let mut channel_settings = settings.channel_settings();
    if let Some(rotate) = &args.rotate_after {
        channel_settings.rotate_after = Some(parse_duration(rotate)?);
    }

    let (mut config, has_region) = settings.session_config(None);
    if let Some(key) = args.api_key {
        config.api_key = key;
    }

    if args.probe {
        if config.api_key.trim().is_empty() {
            return Err(anyhow!("no API key: pass --api-key or set {}", API_KEY_ENV));
        }
        let outcome = probe_api_key(&channel_settings, &config.api_key).await?;
        println!("{}", outcome);
        return Ok(());
    }

    match args.region {
        Some(region) => config.region = region,
        None if !has_region => {
            return Err(anyhow!(
                "no region: pass --region x,y,width,height or set [session].region"
            ));
        }
        None => {}
    }
    if let Some(fps) = args.fps {
        if !(MIN_FRAME_RATE_HZ..=MAX_FRAME_RATE_HZ).contains(&fps) {
            warn!(fps, "frame rate outside {}..={}", MIN_FRAME_RATE_HZ, MAX_FRAME_RATE_HZ);
        }
        config.frame_rate_hz = fps;
    }
    if let Some(prompt) = args.prompt {
        config.prompt = prompt.into();
    } else if config.prompt.trim().is_empty() {
        config.prompt = DEFAULT_PROMPT.into();
    }
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;

    let mut services = settings.service_settings();
    if args.broadcast.is_some() {
        services.broadcast = args.broadcast;
    }
    if args.control.is_some() {
        services.control = args.control;
    }

    let mut builder = Orchestrator::builder()
        .with_observer(Arc::new(SentenceObserver::new(Arc::new(ConsoleObserver))))
        .with_encoder_settings(encoder_settings)
        .with_channel_settings(channel_settings);
    let broadcast = match services.broadcast {
        Some(addr) => {
            let server = Arc::new(BroadcastServer::bind(addr).await?);
            builder = builder.with_observer(Arc::new(SentenceObserver::new(server.clone())));
            Some(server)
        }
        None => None,
    };
    let control = match services.control {
        Some(addr) => Some(ControlServer::bind(addr).await?),
        None => None,
    };
    let orchestrator = builder.build()?;

    if let Err(e) = orchestrator.start(config).await {
        if let Some(hint) = e.recovery_suggestion() {
            eprintln!("hint: {}", hint);
        }
        return Err(e.into());
    }
    info!("watching; press Ctrl-C to stop");

    let mut status = orchestrator.subscribe();
    let failed = async move {
        loop {
            if let SessionState::Failed(reason) = status.borrow_and_update().clone() {
                return reason;
            }
            if status.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let remote_stop = async {
        match &control {
            Some(control) => control.shutdown_requested().await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = deadline => Ok(()),
        _ = remote_stop => Ok(()),
        reason = failed => Err(anyhow!("session failed: {}", reason)),
    };

    orchestrator.stop().await;
    if let Some(broadcast) = &broadcast {
        broadcast.shutdown().await;
    }
    if let Some(control) = &control {
        control.close().await;
    }
    let stats = orchestrator.stats();
    info!(
        attempted = stats.attempted,
        sent = stats.sent,
        dropped = stats.dropped_sends,
        skipped = stats.skipped_ticks,
        responses = orchestrator.sink().len(),
        "done"
    );
    outcome
}

/// Parse duration string like "30s", "2m", "1h"; a bare number is seconds
fn parse_duration(duration: &str) -> Result<Duration> {
    if let Ok(seconds) = duration.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let len = duration.len();
    if len < 2 {
        return Err(anyhow!("Invalid duration format: {}", duration));
    }

    let (num_str, unit) = duration.split_at(len - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid number in duration: {}", num_str))?;

    match unit {
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(anyhow!(
            "Invalid duration unit: {}. Use 's' for seconds, 'm' for minutes, 'h' for hours",
            unit
        )),
    }
}

/// Parse quality preset into a JPEG quality
fn parse_quality(quality: &str) -> Result<u8> {
    match quality.to_lowercase().as_str() {
        "low" => Ok(50),
        "medium" => Ok(70),
        "high" => Ok(85),
        "ultra" => Ok(95),
        _ => Err(anyhow!(
            "Invalid quality preset: {}. Use: low, medium, high, ultra",
            quality
        )),
    }
}
