//! Trace session lifecycle
//!
//! [`SessionManager`] owns the session slot and walks it through
//! Idle, Connecting, Tracing and Closing. Each connection gets one close
//! handler task, which publishes the trace `stop` event and frees the slot.

use chrono::Local;
use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::device::{EcpGateway, HttpEcpGateway, enable_endpoint, heap_snapshot_endpoint};
use crate::error::{TraceError, TraceResult};
use crate::events::{CaptureType, EventBus, EventKind, Subscription, TraceEvent};
use crate::filename::{FilenameContext, FsListing, resolve_filename};
use crate::session::state::{Active, SessionPhase, Slot, StartOptions};
use crate::stream::{CloseReason, Connection, FileSink, KeepAlive};

/// Trace session manager: enable/start/stop/snapshot for one device
///
/// One manager drives at most one connection and output file at a time and can
/// be reused for any number of capture cycles. Callers are expected to
/// serialize lifecycle calls; overlapping calls are safe but not queued.
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    gateway: Arc<dyn EcpGateway>,
    events: EventBus,
    slot: Mutex<Slot>,
    phase: watch::Sender<SessionPhase>,
}

impl Inner {
    /// Replace the slot and publish the new phase; returns the previous slot
    fn transition(&self, slot: &mut Slot, next: Slot) -> Slot {
        let previous = std::mem::replace(slot, next);
        self.phase.send_replace(slot.phase());
        previous
    }

    /// Return to Idle if `cycle` still owns the slot
    async fn release(&self, cycle: Uuid) {
        let mut slot = self.slot.lock().await;
        if slot.cycle() == Some(cycle) {
            self.transition(&mut slot, Slot::Idle);
            debug!(%cycle, "Session released");
        }
    }

    async fn wait_idle(&self) {
        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p == SessionPhase::Idle).await;
    }

    /// Log, count and publish a public failure, handing the error back for `Err`
    fn fail(&self, kind: CaptureType, err: TraceError) -> TraceError {
        counter!("ecptrace_session_failures_total").increment(1);
        error!("{:?} operation failed: {}", kind, err);
        self.events.emit(&TraceEvent::error(kind, &err));
        err
    }
}

impl SessionManager {
    /// Manager talking to the device over HTTP ECP
    pub fn new(config: SessionConfig) -> Self {
        let gateway = Arc::new(HttpEcpGateway::new(config.remote_port));
        Self::with_gateway(config, gateway)
    }

    pub fn with_gateway(config: SessionConfig, gateway: Arc<dyn EcpGateway>) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                events: EventBus::new(),
                slot: Mutex::new(Slot::Idle),
                phase,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register an event handler; see [`EventBus::subscribe`]
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    /// Resolve once the session is back to Idle
    pub async fn wait_idle(&self) {
        self.inner.wait_idle().await;
    }

    /// Whether a connection exists and is open
    pub async fn is_tracing(&self) -> bool {
        matches!(&*self.inner.slot.lock().await, Slot::Tracing(active) if active.control.is_open())
    }

    /// Output file of the current cycle
    pub async fn trace_path(&self) -> Option<PathBuf> {
        self.inner.slot.lock().await.trace_path().map(Path::to_path_buf)
    }

    fn host(&self) -> TraceResult<&str> {
        self.inner
            .config
            .host
            .as_deref()
            .ok_or(TraceError::MissingHost)
    }

    /// Enable tracing for the configured channel on the device
    ///
    /// Succeeds only when the call succeeds and the device lists the channel
    /// among its enabled channels.
    pub async fn enable_tracing(&self) -> TraceResult<bool> {
        let inner = &self.inner;
        let host = self.host().map_err(|e| inner.fail(CaptureType::Trace, e))?;
        let channel_id = &inner.config.channel_id;

        let checked = match inner.gateway.enable(host, channel_id).await {
            Ok(response) if response.ok && response.has_channel(channel_id) => Ok(()),
            Ok(response) if !response.ok => Err(TraceError::DeviceStatus {
                endpoint: enable_endpoint(channel_id),
                status: response.status,
                message: None,
            }),
            Ok(response) => Err(TraceError::ChannelNotEnabled {
                channel_id: channel_id.clone(),
                enabled: response.enabled_channels.unwrap_or_default(),
            }),
            Err(e) => Err(e),
        };

        match checked {
            Ok(()) => {
                info!("Tracing enabled for channel '{}' on {}", channel_id, host);
                inner.events.emit(&TraceEvent::Enable {
                    types: vec![CaptureType::Trace, CaptureType::HeapSnapshot],
                });
                Ok(true)
            }
            Err(e) => Err(inner.fail(CaptureType::Trace, e)),
        }
    }

    /// Open the trace stream and start writing it to a new output file
    ///
    /// No-op while a session is already connecting or tracing.
    pub async fn start_tracing(&self, options: StartOptions) -> TraceResult<()> {
        self.begin(options).await.map(|_| ())
    }

    /// Start a session; `Ok(true)` when this call opened it
    async fn begin(&self, options: StartOptions) -> TraceResult<bool> {
        let inner = &self.inner;
        let host = self.host().map_err(|e| inner.fail(CaptureType::Trace, e))?;

        let cycle = Uuid::new_v4();
        let cancel = {
            let mut slot = inner.slot.lock().await;
            match &*slot {
                Slot::Idle => {}
                Slot::Connecting { .. } | Slot::Tracing(_) => {
                    debug!("Tracing already active, ignoring start");
                    return Ok(false);
                }
                Slot::Closing { .. } => {
                    return Err(inner.fail(CaptureType::Trace, TraceError::ShuttingDown));
                }
            }

            let (cancel_tx, cancel_rx) = oneshot::channel();
            inner.transition(
                &mut slot,
                Slot::Connecting {
                    cycle,
                    trace_path: None,
                    cancel: Some(cancel_tx),
                },
            );
            cancel_rx
        };

        match self.open(cycle, host, options, cancel).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // open() has already released the file and connection it created
                let err = inner.fail(CaptureType::Trace, e);
                inner.release(cycle).await;
                Err(err)
            }
        }
    }

    async fn open(
        &self,
        cycle: Uuid,
        host: &str,
        options: StartOptions,
        mut cancel: oneshot::Receiver<()>,
    ) -> TraceResult<()> {
        let inner = &self.inner;
        let config = &inner.config;

        let dir = config.output_dir();
        fs::create_dir_all(&dir).await.map_err(|e| {
            TraceError::io(format!("creating output directory {}", dir.display()), e)
        })?;

        let ctx = FilenameContext {
            timestamp: Local::now().naive_local(),
            root_dir: Some(config.root_dir.clone()),
            dir: dir.clone(),
        };
        let trace_path = dir.join(resolve_filename(config.filename.as_deref(), &ctx, &FsListing).await);
        {
            let mut slot = inner.slot.lock().await;
            if let Slot::Connecting {
                cycle: current,
                trace_path: path,
                ..
            } = &mut *slot
                && *current == cycle
            {
                *path = Some(trace_path.clone());
            }
        }

        let sink = FileSink::create(&trace_path, config.high_water_mark).await?;
        let url = config.session_url(host);
        info!(%cycle, "Connecting to {} (output {})", url, trace_path.display());

        // Frames are routed to the sink from the moment the socket opens
        let connected = tokio::select! {
            result = Connection::open(&url, sink.writer(), config.close_timeout) => Some(result),
            _ = &mut cancel => None,
        };
        let connection = match connected {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                finish_sink(cycle, sink).await;
                return Err(e);
            }
            None => {
                finish_sink(cycle, sink).await;
                return Err(TraceError::Cancelled);
            }
        };

        let mut slot = inner.slot.lock().await;
        if !matches!(&*slot, Slot::Connecting { cycle: current, .. } if *current == cycle) {
            drop(slot);
            info!(%cycle, "Stopped while connecting, closing trace stream");
            connection.control().close();
            let _ = connection.closed().await;
            finish_sink(cycle, sink).await;
            return Err(TraceError::Cancelled);
        }

        let control = connection.control();
        let keepalive = KeepAlive::start(control.clone(), config.keepalive_interval);
        let close_handler = tokio::spawn(close_handler(
            Arc::clone(inner),
            cycle,
            connection,
            sink,
            options.report_result,
        ));
        inner.transition(
            &mut slot,
            Slot::Tracing(Active {
                cycle,
                trace_path,
                control,
                keepalive,
                close_handler,
            }),
        );

        counter!("ecptrace_sessions_started_total").increment(1);
        info!(%cycle, "Tracing started");
        // Published under the slot lock so the close handler's stop cannot overtake it
        inner.events.emit(&TraceEvent::Start {
            kind: CaptureType::Trace,
        });
        Ok(())
    }

    /// Stop the current session and wait until its resources are released
    ///
    /// A session still connecting is cancelled. No-op when idle.
    pub async fn stop_tracing(&self) {
        self.cleanup().await;
    }

    /// Force cleanup from any state; safe to call any number of times
    pub async fn dispose(&self) {
        self.cleanup().await;
    }

    /// Trigger a heap snapshot, opening a session first if none is open
    ///
    /// A session opened here is stopped again once the snapshot has had
    /// `snapshot_settle` to arrive, and its output path is returned when the
    /// file is non-empty. An already running session is left open.
    pub async fn capture_heap_snapshot(&self) -> TraceResult<Option<PathBuf>> {
        let inner = &self.inner;

        let mut started_here = false;
        if !self.is_tracing().await {
            started_here = self
                .begin(StartOptions {
                    report_result: false,
                })
                .await?;
            if !self.is_tracing().await {
                if started_here {
                    self.stop_tracing().await;
                }
                return Err(inner.fail(CaptureType::HeapSnapshot, TraceError::NotConnected));
            }
        }

        let host = self
            .host()
            .map_err(|e| inner.fail(CaptureType::HeapSnapshot, e))?;
        let channel_id = &inner.config.channel_id;
        let trace_path = self.trace_path().await;

        info!("Capturing heap snapshot on {}", host);
        inner.events.emit(&TraceEvent::Start {
            kind: CaptureType::HeapSnapshot,
        });

        let triggered = match inner.gateway.trigger_heap_snapshot(host, channel_id).await {
            Ok(response) if response.ok => Ok(()),
            Ok(response) => Err(TraceError::DeviceStatus {
                endpoint: heap_snapshot_endpoint(channel_id),
                status: response.status.unwrap_or_default(),
                message: response.message,
            }),
            Err(e) => Err(e),
        };

        match triggered {
            Ok(()) => {
                let mut result = None;
                if started_here {
                    tokio::time::sleep(inner.config.snapshot_settle).await;
                    self.stop_tracing().await;
                    if let Some(path) = trace_path
                        && file_len(&path).await > 0
                    {
                        result = Some(path);
                    }
                }

                info!("Heap snapshot captured");
                inner.events.emit(&TraceEvent::Stop {
                    kind: CaptureType::HeapSnapshot,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                inner.events.emit(&TraceEvent::Stop {
                    kind: CaptureType::HeapSnapshot,
                    result: None,
                });
                let err = inner.fail(CaptureType::HeapSnapshot, e);
                if started_here {
                    self.stop_tracing().await;
                }
                Err(err)
            }
        }
    }

    /// Single teardown path for stop and dispose
    async fn cleanup(&self) {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;

        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::Connecting {
                cycle,
                trace_path,
                cancel,
            } => {
                inner.transition(&mut slot, Slot::Closing { cycle, trace_path });
                drop(slot);
                info!(%cycle, "Cancelling pending connection");

                // A dropped receiver means the start call is gone and cannot release the slot
                if cancel.is_some_and(|cancel| cancel.send(()).is_ok()) {
                    inner.wait_idle().await;
                } else {
                    inner.release(cycle).await;
                }
            }
            closing @ Slot::Closing { .. } => {
                *slot = closing;
                drop(slot);
                inner.wait_idle().await;
            }
            Slot::Tracing(mut active) => {
                // Detach the session before closing so concurrent stops see Closing
                inner.transition(
                    &mut slot,
                    Slot::Closing {
                        cycle: active.cycle,
                        trace_path: Some(active.trace_path.clone()),
                    },
                );
                drop(slot);
                info!(cycle = %active.cycle, "Stopping tracing");

                active.keepalive.stop();
                active.control.close();
                if let Err(e) = (&mut active.close_handler).await {
                    warn!(cycle = %active.cycle, "Close handler failed: {}", e);
                    inner.release(active.cycle).await;
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let Ok(mut slot) = self.inner.slot.try_lock() else {
            return;
        };
        match &mut *slot {
            Slot::Tracing(active) => {
                active.keepalive.stop();
                active.control.close();
            }
            Slot::Connecting { cancel, .. } => {
                if let Some(cancel) = cancel.take() {
                    let _ = cancel.send(());
                }
            }
            Slot::Idle | Slot::Closing { .. } => {}
        }
    }
}

/// Runs once per connection, whatever closed it
async fn close_handler(
    inner: Arc<Inner>,
    cycle: Uuid,
    connection: Connection,
    sink: FileSink,
    report_result: bool,
) {
    let reason = connection.closed().await;
    let trace_path = sink.path().to_path_buf();

    {
        let mut slot = inner.slot.lock().await;
        if matches!(&*slot, Slot::Tracing(active) if active.cycle == cycle)
            && let Slot::Tracing(mut active) = inner.transition(
                &mut slot,
                Slot::Closing {
                    cycle,
                    trace_path: Some(trace_path.clone()),
                },
            )
        {
            active.keepalive.stop();
        }
    }

    match &reason {
        CloseReason::Local => debug!(%cycle, "Trace stream closed locally"),
        CloseReason::Remote { code, reason } => {
            info!(%cycle, "Device closed trace stream ({:?}): {}", code, reason)
        }
        CloseReason::Failed(err) => {
            counter!("ecptrace_session_failures_total").increment(1);
            error!(%cycle, "Trace stream failed: {}", err);
            inner
                .events
                .emit(&TraceEvent::error(CaptureType::Trace, err));
        }
    }

    let written = match sink.end().await {
        Ok(written) => written,
        Err(e) => {
            warn!(%cycle, "Failed to finish {}: {}", trace_path.display(), e);
            file_len(&trace_path).await
        }
    };

    info!(%cycle, "Tracing stopped, {} bytes in {}", written, trace_path.display());
    inner.events.emit(&TraceEvent::Stop {
        kind: CaptureType::Trace,
        result: (report_result && written > 0).then_some(trace_path),
    });
    inner.release(cycle).await;
}

async fn finish_sink(cycle: Uuid, sink: FileSink) {
    let path = sink.path().to_path_buf();
    if let Err(e) = sink.end().await {
        warn!(%cycle, "Failed to finish {}: {}", path.display(), e);
    }
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Accept one trace stream; close it from the device side when `close` fires
    async fn start_device(close: Arc<Notify>) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    message = ws.next() => match message {
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    _ = close.notified() => {
                        let _ = ws.send(Message::Close(None)).await;
                    }
                }
            }
        });
        (addr, handle)
    }

    fn manager_for(addr: SocketAddr, dir: &Path) -> SessionManager {
        SessionManager::new(SessionConfig {
            host: Some(addr.ip().to_string()),
            remote_port: addr.port(),
            dir: Some(dir.to_path_buf()),
            root_dir: dir.to_path_buf(),
            keepalive_interval: Duration::from_millis(20),
            close_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        })
    }

    async fn keepalive_active(manager: &SessionManager) -> Option<bool> {
        match &*manager.inner.slot.lock().await {
            Slot::Tracing(active) => Some(active.keepalive.is_active()),
            _ => None,
        }
    }

    async fn assert_idle(manager: &SessionManager) {
        tokio::time::timeout(TIMEOUT, manager.wait_idle())
            .await
            .unwrap();
        assert!(matches!(*manager.inner.slot.lock().await, Slot::Idle));
        assert_eq!(manager.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_keepalive_runs_while_tracing_and_goes_with_stop() {
        let temp = TempDir::new().unwrap();
        let (addr, device) = start_device(Arc::new(Notify::new())).await;
        let manager = manager_for(addr, temp.path());

        manager.start_tracing(StartOptions::default()).await.unwrap();
        assert_eq!(keepalive_active(&manager).await, Some(true));

        manager.stop_tracing().await;
        assert_idle(&manager).await;
        assert_eq!(keepalive_active(&manager).await, None);

        device.abort();
    }

    #[tokio::test]
    async fn test_keepalive_goes_with_dispose() {
        let temp = TempDir::new().unwrap();
        let (addr, device) = start_device(Arc::new(Notify::new())).await;
        let manager = manager_for(addr, temp.path());

        manager.start_tracing(StartOptions::default()).await.unwrap();
        assert_eq!(keepalive_active(&manager).await, Some(true));

        manager.dispose().await;
        assert_idle(&manager).await;
        assert_eq!(keepalive_active(&manager).await, None);

        device.abort();
    }

    #[tokio::test]
    async fn test_keepalive_goes_with_remote_close() {
        let temp = TempDir::new().unwrap();
        let close = Arc::new(Notify::new());
        let (addr, device) = start_device(Arc::clone(&close)).await;
        let manager = manager_for(addr, temp.path());

        manager.start_tracing(StartOptions::default()).await.unwrap();
        assert_eq!(keepalive_active(&manager).await, Some(true));

        close.notify_one();
        assert_idle(&manager).await;
        assert_eq!(keepalive_active(&manager).await, None);

        tokio::time::timeout(TIMEOUT, device).await.unwrap().unwrap();
    }
}
