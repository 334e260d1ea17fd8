//! Error types for trace capture
//!
//! Every public failure is a [`TraceError`]; [`TraceError::kind`] places it in
//! one of the five failure families the session reports on its event bus.

use std::path::PathBuf;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias for trace capture operations
pub type TraceResult<T> = Result<T, TraceError>;

/// Broad classification of a [`TraceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Protocol,
    Filesystem,
    State,
}

/// All errors that can occur while capturing a trace
#[derive(Debug, Error)]
pub enum TraceError {
    // Configuration errors
    #[error("No device host configured: set ECP_HOST or pass --host")]
    MissingHost,

    // Connection errors
    #[error("Failed to connect to trace stream at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("Trace stream failed: {0}")]
    Stream(#[source] Box<tungstenite::Error>),

    #[error("Device request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    // Protocol errors
    #[error("Device rejected {endpoint} with HTTP {status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    DeviceStatus {
        endpoint: String,
        status: u16,
        message: Option<String>,
    },

    #[error("Channel '{channel_id}' is not enabled on the device (enabled: [{}])", .enabled.join(", "))]
    ChannelNotEnabled {
        channel_id: String,
        enabled: Vec<String>,
    },

    // Filesystem errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Trace file {0} is no longer accepting data")]
    SinkClosed(PathBuf),

    // State errors
    #[error("No active trace connection")]
    NotConnected,

    #[error("Tracing was stopped before the connection opened")]
    Cancelled,

    #[error("A previous trace session is still shutting down")]
    ShuttingDown,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl TraceError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn connect(url: impl Into<String>, source: tungstenite::Error) -> Self {
        Self::Connect {
            url: url.into(),
            source: Box::new(source),
        }
    }

    pub fn stream(source: tungstenite::Error) -> Self {
        Self::Stream(Box::new(source))
    }

    /// Failure family, used for event reporting and by callers deciding whether to retry
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingHost => ErrorKind::Configuration,
            Self::Connect { .. } | Self::Stream(_) | Self::Request { .. } => ErrorKind::Connection,
            Self::DeviceStatus { .. } | Self::ChannelNotEnabled { .. } => ErrorKind::Protocol,
            Self::Io { .. } | Self::SinkClosed(_) => ErrorKind::Filesystem,
            Self::NotConnected | Self::Cancelled | Self::ShuttingDown | Self::Task(_) => {
                ErrorKind::State
            }
        }
    }
}
