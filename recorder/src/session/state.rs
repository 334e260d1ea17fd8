use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::stream::{ConnectionControl, KeepAlive};

/// Externally visible session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Tracing,
    Closing,
}

/// Options for [`crate::SessionManager::start_tracing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Report the output path in the trace `stop` event
    pub report_result: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            report_result: true,
        }
    }
}

/// Resources of an open trace session
///
/// The connection itself and the file sink are owned by the close handler task;
/// this holds the handles needed to stop them.
pub(crate) struct Active {
    pub cycle: Uuid,
    pub trace_path: PathBuf,
    pub control: ConnectionControl,
    pub keepalive: KeepAlive,
    pub close_handler: JoinHandle<()>,
}

/// Session state owned by one manager
pub(crate) enum Slot {
    Idle,
    Connecting {
        cycle: Uuid,
        trace_path: Option<PathBuf>,
        cancel: Option<oneshot::Sender<()>>,
    },
    Tracing(Active),
    Closing {
        cycle: Uuid,
        trace_path: Option<PathBuf>,
    },
}

impl Slot {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Self::Idle => SessionPhase::Idle,
            Self::Connecting { .. } => SessionPhase::Connecting,
            Self::Tracing(_) => SessionPhase::Tracing,
            Self::Closing { .. } => SessionPhase::Closing,
        }
    }

    pub fn cycle(&self) -> Option<Uuid> {
        match self {
            Self::Idle => None,
            Self::Connecting { cycle, .. } | Self::Closing { cycle, .. } => Some(*cycle),
            Self::Tracing(active) => Some(active.cycle),
        }
    }

    /// Output path of the current cycle, once resolved
    pub fn trace_path(&self) -> Option<&Path> {
        match self {
            Self::Idle => None,
            Self::Connecting { trace_path, .. } | Self::Closing { trace_path, .. } => {
                trace_path.as_deref()
            }
            Self::Tracing(active) => Some(&active.trace_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_options_report_by_default() {
        assert!(StartOptions::default().report_result);
    }

    #[test]
    fn slot_accessors() {
        assert_eq!(Slot::Idle.phase(), SessionPhase::Idle);
        assert!(Slot::Idle.cycle().is_none());
        assert!(Slot::Idle.trace_path().is_none());

        let cycle = Uuid::new_v4();
        let slot = Slot::Closing {
            cycle,
            trace_path: Some(PathBuf::from("/tmp/t/x_1.trace")),
        };
        assert_eq!(slot.phase(), SessionPhase::Closing);
        assert_eq!(slot.cycle(), Some(cycle));
        assert_eq!(slot.trace_path(), Some(Path::new("/tmp/t/x_1.trace")));

        let slot = Slot::Connecting {
            cycle,
            trace_path: None,
            cancel: None,
        };
        assert_eq!(slot.phase(), SessionPhase::Connecting);
        assert!(slot.trace_path().is_none());
    }
}
