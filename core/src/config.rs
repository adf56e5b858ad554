//! Client configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    #[serde(default)]
    pub calls: CallSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Tokens closer than this to expiry are refreshed before use.
    pub token_refresh_buffer_hours: i64,
    pub status_retry_delay_ms: u64,
    pub status_retry_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            token_refresh_buffer_hours: 24,
            status_retry_delay_ms: 2000,
            status_retry_attempts: 1,
            request_timeout_secs: 15,
        }
    }
}

impl CallSettings {
    pub fn refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_refresh_buffer_hours)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.status_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            calls: CallSettings::default(),
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    /// Load from a TOML file, writing the defaults there first if it is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = ClientConfig::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            log::info!("Created default config at {}", path.display());
            Ok(config)
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("api.qrparking.app", 443, true)
    }
}
