use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration consumed by the SFU core. Loading (file parsing,
/// flags) happens outside this crate; embedders deserialize this struct and
/// hand it to [`crate::router::Router::start`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the chat-protocol homeserver the signaler talks to.
    pub homeserver_url: String,
    /// Identity the SFU signs in as.
    pub user_id: String,
    /// Access token for `user_id`.
    pub access_token: String,

    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_pli_min_interval_ms")]
    pub pli_min_interval_ms: u64,
    #[serde(default = "default_stall_timeout_ms")]
    pub publisher_stall_timeout_ms: u64,
    #[serde(default = "default_stall_timeout_ms")]
    pub subscription_stall_timeout_ms: u64,
}

fn default_keep_alive_timeout_ms() -> u64 {
    30_000
}

fn default_pli_min_interval_ms() -> u64 {
    500
}

fn default_stall_timeout_ms() -> u64 {
    2_000
}

/// The per-call subset of [`Config`], with durations resolved.
#[derive(Debug, Clone, Copy)]
pub struct ConferenceConfig {
    pub keep_alive_timeout: Duration,
    pub pli_min_interval: Duration,
    pub publisher_stall_timeout: Duration,
    pub subscription_stall_timeout: Duration,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_millis(default_keep_alive_timeout_ms()),
            pli_min_interval: Duration::from_millis(default_pli_min_interval_ms()),
            publisher_stall_timeout: Duration::from_millis(default_stall_timeout_ms()),
            subscription_stall_timeout: Duration::from_millis(default_stall_timeout_ms()),
        }
    }
}

impl From<&Config> for ConferenceConfig {
    fn from(config: &Config) -> Self {
        Self {
            keep_alive_timeout: Duration::from_millis(config.keep_alive_timeout_ms),
            pli_min_interval: Duration::from_millis(config.pli_min_interval_ms),
            publisher_stall_timeout: Duration::from_millis(config.publisher_stall_timeout_ms),
            subscription_stall_timeout: Duration::from_millis(config.subscription_stall_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let config: Config = serde_json::from_str(
            r#"{
                "homeserver_url": "https://example.org",
                "user_id": "@sfu:example.org",
                "access_token": "secret"
            }"#,
        )
        .unwrap();

        assert_eq!(config.keep_alive_timeout_ms, 30_000);
        assert_eq!(config.pli_min_interval_ms, 500);
        assert_eq!(config.publisher_stall_timeout_ms, 2_000);
        assert_eq!(config.subscription_stall_timeout_ms, 2_000);

        let call = ConferenceConfig::from(&config);
        assert_eq!(call.pli_min_interval, Duration::from_millis(500));
    }
}
