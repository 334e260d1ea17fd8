//! Trace stream connection
//!
//! [`Connection::open`] settles exactly once: with an open socket or with the
//! handshake error. After that a single pump task owns the socket. It forwards
//! binary frames to the [`SinkWriter`], serves keepalive pings and close
//! requests, and finishes with exactly one [`CloseReason`], whatever ended it.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::sink::SinkWriter;
use crate::error::{TraceError, TraceResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of an opened connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Why a connection ended
#[derive(Debug)]
pub enum CloseReason {
    /// Closed on request (stop, dispose or drop)
    Local,
    /// The device closed the stream
    Remote { code: Option<u16>, reason: String },
    /// The stream or the sink failed after open
    Failed(TraceError),
}

impl CloseReason {
    fn remote(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::Remote {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_string(),
            },
            None => Self::Remote {
                code: None,
                reason: String::new(),
            },
        }
    }
}

/// Inbound flow state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Flowing,
    Paused,
}

/// Two-state flow-control flag, toggled only at the drain boundary
#[derive(Debug, Default)]
pub struct FlowControl {
    flow: Flow,
    pauses: u64,
    resumes: u64,
}

impl FlowControl {
    pub fn pause(&mut self) {
        if self.flow == Flow::Flowing {
            self.flow = Flow::Paused;
            self.pauses += 1;
            counter!("ecptrace_backpressure_pauses_total").increment(1);
        }
    }

    pub fn resume(&mut self) {
        if self.flow == Flow::Paused {
            self.flow = Flow::Flowing;
            self.resumes += 1;
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn pauses(&self) -> u64 {
        self.pauses
    }

    pub fn resumes(&self) -> u64 {
        self.resumes
    }
}

/// What happened to one inbound message
#[derive(Debug)]
pub enum Routed {
    Forwarded,
    Discarded,
    Close(Option<CloseFrame>),
}

/// Forward a binary frame to the sink, pausing inbound flow until it drains if needed
///
/// Non-binary messages are dropped. While paused the caller is not polling the
/// socket, so the device is held back by TCP flow control.
pub async fn route_frame(
    message: Message,
    sink: &SinkWriter,
    flow: &mut FlowControl,
) -> TraceResult<Routed> {
    match message {
        Message::Binary(data) => {
            trace!("Trace frame: {} bytes", data.len());
            if !sink.write(data)? {
                flow.pause();
                sink.drained().await?;
                flow.resume();
            }
            Ok(Routed::Forwarded)
        }
        Message::Close(frame) => Ok(Routed::Close(frame)),
        other => {
            trace!("Discarding non-binary message: {:?}", other);
            counter!("ecptrace_frames_discarded_total").increment(1);
            Ok(Routed::Discarded)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Ping,
    Close,
}

/// Cloneable control handle: state queries, pings and close requests
#[derive(Clone)]
pub struct ConnectionControl {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionControl {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue a keepalive ping
    pub fn ping(&self) -> TraceResult<()> {
        self.commands
            .send(Command::Ping)
            .map_err(|_| TraceError::NotConnected)
    }

    /// Request a close; no-op once the pump is gone
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Resolve once the connection is fully closed
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

#[cfg(test)]
impl ConnectionControl {
    /// A control handle with no pump behind it; the caller plays the pump
    pub(crate) fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<Command>,
        watch::Sender<ConnectionState>,
    ) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Open);
        (Self { commands, state }, commands_rx, state_tx)
    }
}

/// An open trace stream and the task pumping it
pub struct Connection {
    control: ConnectionControl,
    task: Option<JoinHandle<CloseReason>>,
}

impl Connection {
    /// Connect to `url` and start forwarding binary frames to `sink`
    pub async fn open(url: &str, sink: SinkWriter, close_timeout: Duration) -> TraceResult<Self> {
        let start = Instant::now();
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| TraceError::connect(url, e))?;
        histogram!("ecptrace_connect_duration_seconds").record(start.elapsed());

        let id = Uuid::new_v4();
        info!("Trace stream {} open: {} ({})", id, url, response.status());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let task = tokio::spawn(pump(id, ws, sink, commands_rx, state_tx, close_timeout));

        Ok(Self {
            control: ConnectionControl {
                commands: commands_tx,
                state: state_rx,
            },
            task: Some(task),
        })
    }

    pub fn control(&self) -> ConnectionControl {
        self.control.clone()
    }

    /// Wait for the pump to finish and report why the connection ended
    pub async fn closed(mut self) -> CloseReason {
        let Some(task) = self.task.take() else {
            return CloseReason::Local;
        };
        match task.await {
            Ok(reason) => reason,
            Err(e) => CloseReason::Failed(TraceError::Task(format!("trace stream pump: {}", e))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.control.close();
        }
    }
}

async fn pump(
    id: Uuid,
    mut ws: WsStream,
    sink: SinkWriter,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    close_timeout: Duration,
) -> CloseReason {
    let mut flow = FlowControl::default();

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Ping) => send_ping(id, &mut ws).await,
                Some(Command::Close) | None => break CloseReason::Local,
            },
            message = ws.next() => match message {
                Some(Ok(message)) => match route_frame(message, &sink, &mut flow).await {
                    Ok(Routed::Forwarded | Routed::Discarded) => {}
                    Ok(Routed::Close(frame)) => break CloseReason::remote(frame),
                    Err(e) => break CloseReason::Failed(e),
                },
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    break CloseReason::remote(None);
                }
                Some(Err(e)) => break CloseReason::Failed(TraceError::stream(e)),
            },
        }
    };

    state.send_replace(ConnectionState::Closing);
    debug!("Trace stream {} closing: {:?}", id, reason);

    if tokio::time::timeout(close_timeout, finish(&mut ws, &reason, &sink, &mut flow))
        .await
        .is_err()
    {
        warn!("Trace stream {} close handshake timed out", id);
    }

    state.send_replace(ConnectionState::Closed);
    info!(
        "Trace stream {} closed ({} backpressure pauses)",
        id,
        flow.pauses()
    );
    reason
}

/// Complete the close handshake, keeping any trailing trace frames
async fn finish(ws: &mut WsStream, reason: &CloseReason, sink: &SinkWriter, flow: &mut FlowControl) {
    // The device's close frame was answered automatically when it was read
    if !matches!(reason, CloseReason::Remote { .. })
        && let Err(e) = ws.close(None).await
    {
        debug!("Close frame not sent: {}", e);
        return;
    }

    while let Some(Ok(message)) = ws.next().await {
        if matches!(reason, CloseReason::Failed(_)) {
            continue;
        }
        if let Err(e) = route_frame(message, sink, flow).await {
            debug!("Dropping trailing frame: {}", e);
        }
    }
}

async fn send_ping(id: Uuid, ws: &mut WsStream) {
    if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
        counter!("ecptrace_keepalive_failures_total").increment(1);
        debug!("Keepalive ping on {} failed: {}", id, e);
    }
}
