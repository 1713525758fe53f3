use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livepush::config::{AppConfig, ConfigStore, StreamOverrides};
use livepush::events::SystemEvent;
use livepush::pipeline::{ConnectionFactory, StreamPipeline};
use livepush::publish::{PublishConnection, TcpPublishConnection, TcpSink};
use livepush::video::encoder::{EncoderRegistry, RawVideoEncoderFactory};
use livepush::video::{Resolution, TestPatternSource};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// livepush command line arguments
#[derive(Parser, Debug)]
#[command(name = "livepush")]
#[command(version, about = "Live video publisher with a self-healing connection", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a generated test pattern
    Publish {
        /// Config file path (default: $LIVEPUSH_CONFIG or ./livepush.json)
        #[arg(short = 'c', long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Publish URL (overrides config)
        #[arg(short = 'u', long, value_name = "URL")]
        url: Option<String>,

        /// Stream key (overrides config)
        #[arg(short = 'k', long, value_name = "KEY")]
        key: Option<String>,

        /// Resolution, e.g. 1280x720 (overrides config)
        #[arg(short = 'r', long, value_name = "WxH")]
        resolution: Option<Resolution>,

        /// Frame rate (overrides config)
        #[arg(long, value_name = "FPS")]
        fps: Option<u32>,

        /// Video bitrate in kbps (overrides config)
        #[arg(short = 'b', long, value_name = "KBPS")]
        bitrate: Option<u32>,

        /// Enable load-driven quality control
        #[arg(long)]
        adaptive: bool,
    },

    /// Receive streams published over the TCP transport
    Sink {
        /// Listen address
        #[arg(short = 'a', long, value_name = "ADDRESS", default_value = "127.0.0.1:1935")]
        address: SocketAddr,

        /// Only accept this stream key
        #[arg(short = 'k', long, value_name = "KEY")]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting livepush v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Publish {
            config,
            url,
            key,
            resolution,
            fps,
            bitrate,
            adaptive,
        } => {
            let path = config.unwrap_or_else(default_config_path);
            let store = ConfigStore::new(&path).await?;
            tracing::info!("Config file: {}", path.display());

            let overrides = StreamOverrides {
                url,
                stream_key: key,
                resolution,
                fps,
                video_bitrate_kbps: bitrate,
            };
            let mut config = (*store.get()).clone();
            overrides.apply(&mut config.stream);
            if adaptive {
                config.quality.enabled = true;
            }
            publish(config, store, overrides).await
        }
        Command::Sink { address, key } => {
            let sink = TcpSink::bind(address, key).await?;
            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown signal received");
                }
                stopper.cancel();
            });
            let counters = sink.counters();
            sink.run(cancel).await;
            tracing::info!(
                "Received {} samples ({} bytes)",
                counters.samples.load(std::sync::atomic::Ordering::Relaxed),
                counters.bytes.load(std::sync::atomic::Ordering::Relaxed)
            );
            Ok(())
        }
    }
}

async fn publish(
    config: AppConfig,
    store: ConfigStore,
    overrides: StreamOverrides,
) -> anyhow::Result<()> {
    let connector: ConnectionFactory =
        Arc::new(|| Box::new(TcpPublishConnection::new()) as Box<dyn PublishConnection>);
    let registry = EncoderRegistry::new().with(Arc::new(RawVideoEncoderFactory::new()));
    let resolution = config.stream.resolution;
    let fps = config.stream.fps;
    let pipeline = Arc::new(StreamPipeline::new(config, registry, connector));

    // Log what the pipeline reports
    let mut events = pipeline.events().subscribe_topic("*");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                SystemEvent::StreamStatsUpdate { stats } => tracing::debug!(
                    "{:.1} fps, {:.0} kbps, {} dropped, quality {:?}",
                    stats.fps,
                    stats.bitrate_kbps,
                    stats.dropped_frames,
                    stats.quality
                ),
                SystemEvent::StreamError {
                    message,
                    manual_restart_required: true,
                    ..
                } => tracing::error!("{} (restart required)", message),
                other => tracing::info!("event {}", other.event_name()),
            }
        }
    });

    pipeline.start().await?;

    // Edits to the config file apply live after SIGHUP
    let mut changes = store.subscribe();
    let reloader = {
        let pipeline = pipeline.clone();
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if change.key == "stream" => {
                        let mut settings = store.get().stream.clone();
                        overrides.apply(&mut settings);
                        if let Err(e) = pipeline.update_settings(settings).await {
                            tracing::warn!("Rejected settings change: {}", e);
                        }
                    }
                    Ok(change) => {
                        tracing::info!("Section '{}' changed, applies on restart", change.key)
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };
    let hangup = reload_on_hangup(store);

    let cancel = CancellationToken::new();
    let source = {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            TestPatternSource::new(resolution, fps)
                .run(cancel, |frame| {
                    let _ = pipeline.push_frame(frame);
                })
                .await;
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = source.await;
    reloader.abort();
    if let Some(hangup) = hangup {
        hangup.abort();
    }
    pipeline.stop().await?;
    tracing::info!("livepush stopped");
    Ok(())
}

#[cfg(unix)]
fn reload_on_hangup(store: ConfigStore) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("Config reload on SIGHUP unavailable: {}", e);
            return None;
        }
    };
    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading {}", store.path().display());
            if let Err(e) = store.reload().await {
                tracing::warn!("Config reload failed, keeping current settings: {}", e);
            }
        }
    }))
}

#[cfg(not(unix))]
fn reload_on_hangup(_store: ConfigStore) -> Option<tokio::task::JoinHandle<()>> {
    None
}

fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "livepush=error",
        LogLevel::Warn => "livepush=warn",
        LogLevel::Info => "livepush=info",
        LogLevel::Verbose => "livepush=debug",
        LogLevel::Debug => "livepush=debug",
        LogLevel::Trace => "livepush=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Config file location
fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LIVEPUSH_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("livepush.json")
}
