//! EcpGateway trait definition

use async_trait::async_trait;

use super::types::{EnableResponse, SnapshotResponse};
use crate::error::TraceResult;

/// Device control calls used by the trace session (HTTP ECP or a test double)
///
/// `Err` means the call could not be made at all; a call the device answered
/// with a failure status comes back as `Ok` with `ok == false`.
#[async_trait]
pub trait EcpGateway: Send + Sync {
    /// Enable tracing for `channel_id` and report the enabled channels
    async fn enable(&self, host: &str, channel_id: &str) -> TraceResult<EnableResponse>;

    /// Ask the device to dump a heap graph into the trace stream
    async fn trigger_heap_snapshot(
        &self,
        host: &str,
        channel_id: &str,
    ) -> TraceResult<SnapshotResponse>;
}
