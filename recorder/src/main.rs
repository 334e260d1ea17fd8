use clap::{Parser, Subcommand};
use ecptrace_recorder::{EventKind, SessionConfig, SessionManager, StartOptions, TraceEvent};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ecptrace - capture traces and heap snapshots from a device over ECP
///
/// Settings not given on the command line are read from the environment
/// (ECP_HOST, ECP_PORT, ECP_CHANNEL_ID, TRACE_DIR, TRACE_FILENAME, ...).
/// Lifecycle events are printed to stdout, one JSON object per line.
#[derive(Parser, Debug)]
#[command(name = "ecptrace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Device address
    #[arg(long, global = true)]
    host: Option<String>,

    /// ECP port on the device
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Channel to enable and capture
    #[arg(long, global = true)]
    channel: Option<String>,

    /// Output directory (default: <root-dir>/profiling)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output filename template, e.g. "${appTitle}_${sequence}.perfetto-trace"
    #[arg(long, global = true)]
    filename: Option<String>,

    /// Project root holding the app manifest
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enable tracing for the channel on the device
    Enable,

    /// Capture a trace until Ctrl-C, the duration elapses or the device closes the stream
    Trace {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Enable tracing on the device first
        #[arg(long)]
        enable: bool,
    },

    /// Capture a heap snapshot
    Snapshot,
}

impl Cli {
    /// Command-line overrides on top of the environment
    fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env();
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.remote_port = port;
        }
        if let Some(channel) = &self.channel {
            config.channel_id = channel.clone();
        }
        if let Some(dir) = &self.dir {
            config.dir = Some(dir.clone());
        }
        if let Some(filename) = &self.filename {
            config.filename = Some(filename.clone());
        }
        if let Some(root_dir) = &self.root_dir {
            config.root_dir = root_dir.clone();
        }
        config
    }
}

fn print_event(event: &TraceEvent) {
    if let Ok(line) = serde_json::to_string(event) {
        println!("{}", line);
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout carries only events
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecptrace=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    info!(
        "Loaded configuration: host={:?}, port={}, channel={}",
        config.host, config.remote_port, config.channel_id
    );

    let manager = SessionManager::new(config);
    for kind in [
        EventKind::Enable,
        EventKind::Start,
        EventKind::Stop,
        EventKind::Error,
    ] {
        manager.subscribe(kind, print_event);
    }

    match cli.command {
        Commands::Enable => {
            manager.enable_tracing().await?;
        }
        Commands::Trace { duration, enable } => {
            if enable {
                manager.enable_tracing().await?;
            }
            manager.start_tracing(StartOptions::default()).await?;
            info!("Tracing, press Ctrl-C to stop");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = sleep_for(duration.map(Duration::from_secs)) => info!("Duration elapsed"),
                _ = manager.wait_idle() => info!("Device ended the trace session"),
            }
            manager.stop_tracing().await;
        }
        Commands::Snapshot => match manager.capture_heap_snapshot().await? {
            Some(path) => info!("Heap snapshot written to {}", path.display()),
            None => info!("Heap snapshot captured"),
        },
    }

    manager.dispose().await;
    Ok(())
}
