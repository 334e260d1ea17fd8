//! Common Test Utilities for Integration Tests
//!
//! A scripted mock device serving the trace WebSocket and the ECP endpoints on
//! one local port, plus an event recorder for session managers.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use ecptrace_recorder::{EventKind, SessionConfig, SessionManager, TraceEvent};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// One message the device sends when a client connects
#[derive(Debug, Clone)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Scripted device behaviour
#[derive(Debug, Clone)]
pub struct Script {
    /// Sent to every new trace connection, in order
    pub frames: Vec<Frame>,
    /// Close the trace stream right after `frames`
    pub close_after_frames: bool,
    /// Channels listed in the enable response
    pub enabled_channels: Vec<String>,
    pub enable_status: StatusCode,
    pub snapshot_status: StatusCode,
    /// Pushed to connected clients when a snapshot is triggered
    pub snapshot_frame: Option<Vec<u8>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            close_after_frames: false,
            enabled_channels: vec!["dev".to_string()],
            enable_status: StatusCode::OK,
            snapshot_status: StatusCode::OK,
            snapshot_frame: Some(b"heapgraph".to_vec()),
        }
    }
}

#[derive(Debug, Clone)]
enum Push {
    Frame(Vec<u8>),
    Close,
}

struct DeviceState {
    script: Mutex<Script>,
    push: broadcast::Sender<Push>,
    connections: AtomicUsize,
    open_sessions: AtomicUsize,
    pings: AtomicUsize,
    enable_calls: AtomicUsize,
    snapshot_calls: AtomicUsize,
}

/// Handle to a running mock device
#[derive(Clone)]
pub struct MockDevice {
    pub addr: SocketAddr,
    state: Arc<DeviceState>,
}

impl MockDevice {
    /// Session config pointing at this device, writing into `dir`
    pub fn config(&self, dir: &std::path::Path) -> SessionConfig {
        SessionConfig {
            host: Some(self.addr.ip().to_string()),
            remote_port: self.addr.port(),
            dir: Some(dir.to_path_buf()),
            root_dir: dir.to_path_buf(),
            close_timeout: Duration::from_secs(2),
            snapshot_settle: Duration::from_millis(100),
            ..SessionConfig::default()
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.state.script.lock());
    }

    /// Send a binary frame to every connected client
    pub fn push_frame(&self, data: &[u8]) {
        let _ = self.state.push.send(Push::Frame(data.to_vec()));
    }

    /// Close every open trace stream from the device side
    pub fn close_sessions(&self) {
        let _ = self.state.push.send(Push::Close);
    }

    /// Trace connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Trace connections currently open
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn enable_calls(&self) -> usize {
        self.state.enable_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.state.snapshot_calls.load(Ordering::SeqCst)
    }
}

/// Start a mock device on an ephemeral local port
pub async fn start_mock_device(script: Script) -> (MockDevice, tokio::task::JoinHandle<()>) {
    let (push, _) = broadcast::channel(64);
    let state = Arc::new(DeviceState {
        script: Mutex::new(script),
        push,
        connections: AtomicUsize::new(0),
        open_sessions: AtomicUsize::new(0),
        pings: AtomicUsize::new(0),
        enable_calls: AtomicUsize::new(0),
        snapshot_calls: AtomicUsize::new(0),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let device = MockDevice { addr, state };

    let app = Router::new()
        .route("/perfetto-session", get(session_ws))
        .route("/perfetto/enable/:channel", post(enable))
        .route("/perfetto/heapgraph/trigger/:channel", post(trigger_snapshot))
        .with_state(device.clone());

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (device, handle)
}

async fn session_ws(ws: WebSocketUpgrade, State(device): State<MockDevice>) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, device))
}

async fn serve_session(mut socket: WebSocket, device: MockDevice) {
    let state = &device.state;
    let mut push = state.push.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.open_sessions.fetch_add(1, Ordering::SeqCst);

    let script = state.script.lock().clone();

    for frame in script.frames {
        let message = match frame {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text),
        };
        if socket.send(message).await.is_err() {
            state.open_sessions.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    }

    let mut closing = script.close_after_frames;
    if closing {
        let _ = socket.send(Message::Close(None)).await;
    }

    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Ping(_))) => {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            pushed = push.recv(), if !closing => match pushed {
                Ok(Push::Frame(data)) => {
                    let _ = socket.send(Message::Binary(data)).await;
                }
                Ok(Push::Close) => {
                    closing = true;
                    let _ = socket.send(Message::Close(None)).await;
                }
                Err(_) => {}
            },
        }
    }

    state.open_sessions.fetch_sub(1, Ordering::SeqCst);
}

async fn enable(
    State(device): State<MockDevice>,
    Path(_channel): Path<String>,
) -> (StatusCode, String) {
    device.state.enable_calls.fetch_add(1, Ordering::SeqCst);
    let script = device.state.script.lock().clone();

    let channels: String = script
        .enabled_channels
        .iter()
        .map(|c| format!("    <channel>{}</channel>\n", c))
        .collect();
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<perfetto-enable>\n  <enabled-channels>\n{}  </enabled-channels>\n</perfetto-enable>\n",
        channels
    );
    (script.enable_status, body)
}

async fn trigger_snapshot(
    State(device): State<MockDevice>,
    Path(_channel): Path<String>,
) -> (StatusCode, String) {
    device.state.snapshot_calls.fetch_add(1, Ordering::SeqCst);
    let script = device.state.script.lock().clone();

    if !script.snapshot_status.is_success() {
        return (script.snapshot_status, "heap snapshot unavailable".to_string());
    }
    if let Some(frame) = script.snapshot_frame {
        let _ = device.state.push.send(Push::Frame(frame));
    }
    (script.snapshot_status, String::new())
}

/// Every event a manager publishes, in delivery order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl EventLog {
    pub fn attach(manager: &SessionManager) -> Self {
        let log = Self::default();
        for kind in [
            EventKind::Enable,
            EventKind::Start,
            EventKind::Stop,
            EventKind::Error,
        ] {
            let events = Arc::clone(&log.events);
            manager.subscribe(kind, move |event| events.lock().push(event.clone()));
        }
        log
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A local port with nothing listening on it
pub async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
