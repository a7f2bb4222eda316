//! Client configuration: the static part supplied at construction and the
//! remote part fetched from the app backend at startup.

use crate::allocate::DeviceInfo;
use crate::net::{HttpClient, HttpRequest};
use log::info;
use serde::Deserialize;
use thiserror::Error;

/// Static configuration for one [`crate::client::Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the app backend (remote config + allocator).
    pub base_url: String,
    pub customer_name: String,
    pub client_name: String,
    pub mobile_number: String,
    pub device_info: DeviceInfo,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            customer_name: "Mobile User".to_string(),
            client_name: "DigiKhata".to_string(),
            mobile_number: "9999999999".to_string(),
            device_info: DeviceInfo {
                user_agent: concat!("vkyc-rust/", env!("CARGO_PKG_VERSION")).to_string(),
                platform: std::env::consts::OS.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config request failed: {0}")]
    Request(String),
    #[error("config endpoint returned HTTP {0}")]
    Status(u16),
    #[error("malformed config response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Remote configuration, consumed once at startup to parameterize the
/// signaling channel's connect target.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub socket_url: String,
}

impl RemoteConfig {
    /// Fetches `{base}/config` and parses the `socketUrl` out of it.
    pub async fn fetch(http: &dyn HttpClient, base_url: &str) -> Result<Self, ConfigError> {
        let url = format!("{}/config", base_url.trim_end_matches('/'));
        let response = http
            .execute(HttpRequest::get(&url))
            .await
            .map_err(|e| ConfigError::Request(e.to_string()))?;

        if !response.is_success() {
            return Err(ConfigError::Status(response.status_code));
        }

        let config: RemoteConfig = serde_json::from_slice(&response.body)?;
        info!(target: "Config", "Loaded config, socket url: {}", config.socket_url);
        Ok(config)
    }
}
