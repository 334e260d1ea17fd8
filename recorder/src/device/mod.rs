//! Device control (ECP) module
//!
//! This module provides:
//! - `EcpGateway` trait for abstracting device control calls
//! - `HttpEcpGateway` issuing the calls over HTTP
//! - Response types carrying the success contract the session checks

mod http;
mod service;
mod types;

pub use http::{HttpEcpGateway, enable_endpoint, heap_snapshot_endpoint, parse_enabled_channels};
pub use service::EcpGateway;
pub use types::{EnableResponse, SnapshotResponse};
