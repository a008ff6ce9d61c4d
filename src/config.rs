use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub mqtt: MqttConfig,
    pub ha: HomeAssistantConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub api_endpoint: String,
    /// Local port the OAuth redirect lands on.
    pub port: u16,
    pub redirect: String,
    pub auth_file_path: String,
    pub auth_server: String,
    pub client_id: String,
    /// Anti-forgery value echoed back by the authorization server.
    pub state: String,
    pub open_browser: bool,
    /// Seconds between poll cycles.
    pub refresh_interval: u64,
    /// Seconds to wait for the OAuth redirect before giving up.
    pub callback_timeout: u64,
    /// Upper bound in seconds for a single HTTP request.
    pub request_timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.qvantum.com".to_string(),
            port: 5173,
            redirect: "http://localhost".to_string(),
            auth_file_path: "auth_tokens.json".to_string(),
            auth_server: "https://account.qvantum.com".to_string(),
            client_id: "qvantum2mqtt".to_string(),
            state: "abc123".to_string(),
            open_browser: true,
            refresh_interval: 10,
            callback_timeout: 300,
            request_timeout: 30,
        }
    }
}

impl ApiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}:{}", self.redirect, self.port)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub server: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 1883,
            user: None,
            password: None,
            client_id: "qvantum2mqtt".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub topic_prefix: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "homeassistant".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}
