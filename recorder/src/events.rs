//! Lifecycle events and the typed publish/subscribe bus
//!
//! Handlers are registered per [`EventKind`] and run synchronously on the
//! emitting task, in registration order. A handler may subscribe or
//! unsubscribe from inside a callback; the change applies to the next emit.

use crate::error::TraceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as _;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// What a lifecycle event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureType {
    Trace,
    HeapSnapshot,
}

/// Event kinds that can be subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Enable,
    Start,
    Stop,
    Error,
}

/// Serializable description of a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    /// Cause chain, one cause per line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&TraceError> for ErrorInfo {
    fn from(err: &TraceError) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }
}

/// Session lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// Tracing was enabled on the device for these capture types
    Enable { types: Vec<CaptureType> },
    /// A capture started
    Start {
        #[serde(rename = "type")]
        kind: CaptureType,
    },
    /// A capture ended; `result` is the output file when there is one to report
    Stop {
        #[serde(rename = "type")]
        kind: CaptureType,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<PathBuf>,
    },
    /// A public operation failed
    Error {
        #[serde(rename = "type")]
        kind: CaptureType,
        error: ErrorInfo,
    },
}

impl TraceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Enable { .. } => EventKind::Enable,
            Self::Start { .. } => EventKind::Start,
            Self::Stop { .. } => EventKind::Stop,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn error(kind: CaptureType, err: &TraceError) -> Self {
        Self::Error {
            kind,
            error: ErrorInfo::from(err),
        }
    }
}

type Handler = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// Typed publish/subscribe registry for [`TraceEvent`]s
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every handler of its kind
    pub fn emit(&self, event: &TraceEvent) {
        // Snapshot handlers so callbacks can touch the registry
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock();
            registry
                .handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            handler(event);
        }
    }

    /// Number of handlers registered for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::subscribe`]
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(list) = registry.handlers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}
