//! ECP trace capture library
//!
//! Enables tracing on a device, streams its binary trace data to a file and
//! publishes the session lifecycle on an event bus. The `ecptrace` binary is
//! a thin CLI over this crate.

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod filename;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use config::SessionConfig;
pub use device::{EcpGateway, HttpEcpGateway};
pub use error::{ErrorKind, TraceError, TraceResult};
pub use events::{CaptureType, ErrorInfo, EventBus, EventKind, Subscription, TraceEvent};
pub use session::{SessionManager, SessionPhase, StartOptions};
