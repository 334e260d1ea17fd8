//! Device control call results

/// Result of enabling tracing for a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableResponse {
    /// Whether the HTTP call succeeded
    pub ok: bool,
    /// HTTP status code
    pub status: u16,
    /// Channels the device reports as enabled (absent when the body had none)
    pub enabled_channels: Option<Vec<String>>,
}

impl EnableResponse {
    /// Whether `channel_id` is among the enabled channels, ignoring case
    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.enabled_channels
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel_id))
    }
}

/// Result of triggering a heap snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub ok: bool,
    pub status: Option<u16>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_match_ignores_case() {
        let response = EnableResponse {
            ok: true,
            status: 200,
            enabled_channels: Some(vec!["DEV".to_string(), "prod".to_string()]),
        };
        assert!(response.has_channel("dev"));
        assert!(response.has_channel("Prod"));
        assert!(!response.has_channel("beta"));
    }

    #[test]
    fn no_channels_matches_nothing() {
        let response = EnableResponse {
            ok: true,
            status: 200,
            enabled_channels: None,
        };
        assert!(!response.has_channel("dev"));
    }
}
