use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ApiError;
use crate::token_store::TokenPair;

/// Shared credentials for every authenticated call. The authenticator swaps
/// the whole pair on refresh; API calls only ever read a snapshot.
#[derive(Debug, Default)]
pub struct Session {
    tokens: RwLock<TokenPair>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_tokens(tokens: TokenPair) -> Arc<Self> {
        Arc::new(Self {
            tokens: RwLock::new(tokens),
        })
    }

    pub async fn tokens(&self) -> TokenPair {
        self.tokens.read().await.clone()
    }

    pub async fn replace(&self, tokens: TokenPair) {
        *self.tokens.write().await = tokens;
    }

    pub async fn access_token(&self) -> Result<String, ApiError> {
        self.tokens
            .read()
            .await
            .access_token()
            .map(str::to_string)
            .ok_or(ApiError::NotAuthenticated)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TokenUser {
    pub email: Option<String>,
    #[serde(rename = "isQvantum")]
    pub is_qvantum: Option<bool>,
    pub uid: Option<String>,
    pub you: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DevicesResponse {
    pub user_id: Option<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Device {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub vendor: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Setting {
    pub name: String,
    pub value: Option<SettingValue>,
    pub read_only: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Meta {
    pub last_reported: Option<String>,
    pub validity: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SettingsResponse {
    pub meta: Option<Meta>,
    #[serde(default)]
    pub settings: Vec<Setting>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Connectivity {
    pub connected: Option<bool>,
    pub timestamp: Option<String>,
    pub disconnect_reason: Option<String>,
}

/// Latest metric values keyed by metric name, as listed in the metrics inventory.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Metrics {
    pub time: Option<String>,
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DeviceMetadata {
    pub uptime_hours: Option<u64>,
    pub display_fw_version: Option<String>,
    pub cc_fw_version: Option<String>,
    pub inv_fw_version: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StatusResponse {
    pub connectivity: Option<Connectivity>,
    pub metrics: Option<Metrics>,
    #[serde(rename = "device_metadata")]
    pub metadata: Option<DeviceMetadata>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SettingInventory {
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    pub data_type: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SettingsInventoryResponse {
    #[serde(default)]
    pub settings: Vec<SettingInventory>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetricInventory {
    pub name: String,
    pub unit: Option<String>,
    pub value_kind: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MetricsInventoryResponse {
    #[serde(default)]
    pub metrics: Vec<MetricInventory>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AlarmInventory {
    #[serde(rename = "type")]
    pub category: Option<String>,
    pub code: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AlarmInventoryResponse {
    #[serde(default)]
    pub alarms: Vec<AlarmInventory>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Alarm {
    pub id: Option<String>,
    pub device_alarm_id: Option<String>,
    #[serde(rename = "type")]
    pub category: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
    pub is_active: Option<bool>,
    pub is_acknowledged: Option<bool>,
    pub triggered_timestamp: Option<String>,
    pub reset_timestamp: Option<String>,
    pub acknowledged_timestamp: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AlarmEventsResponse {
    #[serde(default)]
    pub alarms: Vec<Alarm>,
}

#[derive(Serialize)]
struct SetSetting<'a> {
    name: &'a str,
    value: Value,
}

#[derive(Serialize)]
struct SetSettingsRequest<'a> {
    settings: Vec<SetSetting<'a>>,
}

/// Converts an inbound setting value before it is sent upstream.
///
/// A string made of an optional single leading `-` followed by one or more
/// ASCII digits becomes a JSON integer; everything else is sent as the
/// original string. The API answers 200 to numeric settings submitted as
/// strings but never applies them, so integers must go out as numbers.
pub fn coerce_setting_value(value: &str) -> Value {
    let digits = value.strip_prefix('-').unwrap_or(value);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(number) = value.parse::<i64>() {
            return Value::from(number);
        }
    }
    Value::from(value)
}

/// HTTP client shared by the API and token calls. Every request, including
/// reading the body, is bounded by `timeout`.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

// API client with configurable base URL for testing
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    session: Arc<Session>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, session: Arc<Session>) -> Self {
        Self::with_http(base_url, session, reqwest::Client::new())
    }

    pub fn with_http(
        base_url: impl Into<String>,
        session: Arc<Session>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            session,
        }
    }

    async fn authorized(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.session.access_token().await?;
        let url = format!("{}/{}", self.base_url, path);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        let response = self
            .authorized(Method::GET, path)
            .await?
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Potential server error on {}: {} {}", path, status, body);
            return Ok(None);
        }

        Ok(Some(response.json().await?))
    }

    pub async fn whoami(&self) -> Result<Option<TokenUser>, ApiError> {
        self.get_json("api/auth/v1/whoami").await
    }

    pub async fn get_pumps(&self, user_id: &str) -> Result<Option<DevicesResponse>, ApiError> {
        self.get_json(&format!("api/inventory/v1/users/{}/devices", user_id))
            .await
    }

    pub async fn get_settings(&self, device_id: &str) -> Result<Option<SettingsResponse>, ApiError> {
        self.get_json(&format!("api/device-info/v1/devices/{}/settings", device_id))
            .await
    }

    pub async fn get_status(&self, device_id: &str) -> Result<Option<StatusResponse>, ApiError> {
        self.get_json(&format!(
            "api/device-info/v1/devices/{}/status?metrics=now",
            device_id
        ))
        .await
    }

    pub async fn get_settings_inventory(
        &self,
        device_id: &str,
    ) -> Result<Option<SettingsInventoryResponse>, ApiError> {
        self.get_json(&format!("api/inventory/v1/devices/{}/settings", device_id))
            .await
    }

    pub async fn get_metrics_inventory(
        &self,
        device_id: &str,
    ) -> Result<Option<MetricsInventoryResponse>, ApiError> {
        self.get_json(&format!("api/inventory/v1/devices/{}/metrics", device_id))
            .await
    }

    // The category query parameter is ignored upstream, so it is never sent.
    pub async fn get_alarm_inventory(
        &self,
        device_id: &str,
    ) -> Result<Option<AlarmInventoryResponse>, ApiError> {
        self.get_json(&format!("api/inventory/v1/devices/{}/alarms", device_id))
            .await
    }

    pub async fn get_alarm_events(
        &self,
        device_id: &str,
    ) -> Result<Option<AlarmEventsResponse>, ApiError> {
        self.get_json(&format!("api/events/v1/devices/{}/alarms?limit=10", device_id))
            .await
    }

    /// Sends one setting change upstream. See [`coerce_setting_value`] for how
    /// the raw value is encoded.
    pub async fn set_setting(
        &self,
        device_id: &str,
        setting: &str,
        value: &str,
    ) -> Result<Option<Value>, ApiError> {
        let path = format!(
            "api/device-info/v1/devices/{}/settings?dispatch=false",
            device_id
        );
        let payload = SetSettingsRequest {
            settings: vec![SetSetting {
                name: setting,
                value: coerce_setting_value(value),
            }],
        };

        let response = self
            .authorized(Method::PATCH, &path)
            .await?
            .header("accept", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(
                "Failed to set {} on {}: {} {}",
                setting, device_id, status, body
            );
            return Ok(None);
        }

        debug!("Set {} on {}: {} {}", setting, device_id, status, body);
        Ok(Some(serde_json::from_str(&body).unwrap_or(Value::Null)))
    }
}
