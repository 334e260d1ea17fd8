//! ECP gateway over HTTP
//!
//! Endpoints (all `POST`, on the ECP port):
//! - `/perfetto/enable/<channel>`: replies with an XML document listing the
//!   enabled channels as `<channel>` elements
//! - `/perfetto/heapgraph/trigger/<channel>`: status only

use async_trait::async_trait;
use metrics::histogram;
use std::time::Instant;
use tracing::{debug, info};

use super::service::EcpGateway;
use super::types::{EnableResponse, SnapshotResponse};
use crate::error::{TraceError, TraceResult};

/// HTTP implementation of [`EcpGateway`]
pub struct HttpEcpGateway {
    client: reqwest::Client,
    port: u16,
}

impl HttpEcpGateway {
    pub fn new(port: u16) -> Self {
        Self::with_client(reqwest::Client::new(), port)
    }

    pub fn with_client(client: reqwest::Client, port: u16) -> Self {
        Self { client, port }
    }

    /// POST to `endpoint`, returning the status and body text
    async fn post(&self, host: &str, endpoint: &str) -> TraceResult<(reqwest::StatusCode, String)> {
        let url = format!("http://{}:{}{}", host, self.port, endpoint);
        let start = Instant::now();
        debug!("ECP POST {}", url);

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|source| TraceError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| TraceError::Request {
            endpoint: endpoint.to_string(),
            source,
        })?;

        histogram!("ecptrace_ecp_request_duration_seconds").record(start.elapsed());
        debug!("ECP {} -> {}", endpoint, status);
        Ok((status, body))
    }
}

#[async_trait]
impl EcpGateway for HttpEcpGateway {
    async fn enable(&self, host: &str, channel_id: &str) -> TraceResult<EnableResponse> {
        let endpoint = enable_endpoint(channel_id);
        let (status, body) = self.post(host, &endpoint).await?;

        let enabled_channels = parse_enabled_channels(&body);
        info!(
            "Enable tracing for '{}' on {}: HTTP {}, channels {:?}",
            channel_id, host, status, enabled_channels
        );

        Ok(EnableResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            enabled_channels,
        })
    }

    async fn trigger_heap_snapshot(
        &self,
        host: &str,
        channel_id: &str,
    ) -> TraceResult<SnapshotResponse> {
        let endpoint = heap_snapshot_endpoint(channel_id);
        let (status, body) = self.post(host, &endpoint).await?;

        let body = body.trim();
        Ok(SnapshotResponse {
            ok: status.is_success(),
            status: Some(status.as_u16()),
            message: (!status.is_success() && !body.is_empty()).then(|| body.to_string()),
        })
    }
}

pub fn enable_endpoint(channel_id: &str) -> String {
    format!("/perfetto/enable/{}", channel_id)
}

pub fn heap_snapshot_endpoint(channel_id: &str) -> String {
    format!("/perfetto/heapgraph/trigger/{}", channel_id)
}

/// Channel ids listed in an enable response body
///
/// Returns `None` when the body is not XML or carries no channel list at all.
pub fn parse_enabled_channels(body: &str) -> Option<Vec<String>> {
    let doc = roxmltree::Document::parse(body.trim_start()).ok()?;

    let has_list = doc
        .descendants()
        .any(|n| n.has_tag_name("enabled-channels"));
    let channels: Vec<String> = doc
        .descendants()
        .filter(|n| n.has_tag_name("channel"))
        .filter_map(|n| n.text())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    if channels.is_empty() && !has_list {
        None
    } else {
        Some(channels)
    }
}
