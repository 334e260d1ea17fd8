//! Trace session configuration
//!
//! Configuration is loaded from environment variables on top of defaults.
//! Every field is fixed for the lifetime of a [`crate::SessionManager`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default ECP port on the device
pub const DEFAULT_REMOTE_PORT: u16 = 8060;

/// Default developer channel id
pub const DEFAULT_CHANNEL_ID: &str = "dev";

/// Path of the trace WebSocket on the device
pub const SESSION_PATH: &str = "perfetto-session";

/// Configuration for one trace capture session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device address; required before any device call
    pub host: Option<String>,
    /// ECP port used for both HTTP control calls and the trace stream
    pub remote_port: u16,
    /// Channel whose tracing is enabled and captured
    pub channel_id: String,
    /// Output directory (defaults to `<root_dir>/profiling`)
    pub dir: Option<PathBuf>,
    /// Output filename template (see [`crate::filename`])
    pub filename: Option<String>,
    /// Project root; holds the `manifest` read for the app title
    pub root_dir: PathBuf,
    /// Keepalive ping period while connected
    pub keepalive_interval: Duration,
    /// Queued bytes at which the file sink reports backpressure
    pub high_water_mark: usize,
    /// Upper bound on waiting for the peer to finish the close handshake
    pub close_timeout: Duration,
    /// Grace period for heap graph data to arrive before an auto-started session stops
    pub snapshot_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: None,
            remote_port: DEFAULT_REMOTE_PORT,
            channel_id: DEFAULT_CHANNEL_ID.to_string(),
            dir: None,
            filename: None,
            root_dir: PathBuf::from("."),
            keepalive_interval: Duration::from_secs(30),
            high_water_mark: 64 * 1024, // 64 KiB
            close_timeout: Duration::from_secs(5),
            snapshot_settle: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(host) = lookup("ECP_HOST")
            && !host.trim().is_empty()
        {
            config.host = Some(host.trim().to_string());
        }
        if let Some(val) = lookup("ECP_PORT")
            && let Ok(port) = val.parse()
        {
            config.remote_port = port;
        }
        if let Some(channel) = lookup("ECP_CHANNEL_ID")
            && !channel.is_empty()
        {
            config.channel_id = channel;
        }

        // Output location
        if let Some(dir) = lookup("TRACE_DIR")
            && !dir.is_empty()
        {
            config.dir = Some(PathBuf::from(dir));
        }
        if let Some(template) = lookup("TRACE_FILENAME")
            && !template.is_empty()
        {
            config.filename = Some(template);
        }
        if let Some(root) = lookup("TRACE_ROOT_DIR")
            && !root.is_empty()
        {
            config.root_dir = PathBuf::from(root);
        }

        // Stream tuning
        if let Some(val) = lookup("TRACE_KEEPALIVE_SECS")
            && let Ok(secs) = val.parse::<u64>()
            && secs > 0
        {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("TRACE_HIGH_WATER_MARK_KB")
            && let Ok(kb) = val.parse::<usize>()
            && kb > 0
            && let Some(bytes) = kb.checked_mul(1024)
        {
            config.high_water_mark = bytes;
        }
        if let Some(val) = lookup("TRACE_CLOSE_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.close_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("HEAP_SNAPSHOT_SETTLE_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.snapshot_settle = Duration::from_secs(secs);
        }

        config
    }

    /// Directory trace files are written to
    pub fn output_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("profiling"))
    }

    /// WebSocket URL of the trace stream
    pub fn session_url(&self, host: &str) -> String {
        format!("ws://{}:{}/{}", host, self.remote_port, SESSION_PATH)
    }
}
