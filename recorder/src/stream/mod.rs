//! Trace data path
//!
//! This module provides:
//! - `Connection` owning the trace WebSocket and its pump task
//! - `FileSink` writing frames to disk with backpressure
//! - `KeepAlive` probing the connection while it is open

mod connection;
mod keepalive;
mod sink;

pub use connection::{
    CloseReason, Connection, ConnectionControl, ConnectionState, Flow, FlowControl, Routed,
    route_frame,
};
pub use keepalive::KeepAlive;
pub use sink::{FileSink, SinkWriter};
