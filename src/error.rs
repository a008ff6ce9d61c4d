use std::io;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("token file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("could not bind OAuth callback listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("no OAuth callback received within {0:?}")]
    CallbackTimeout(Duration),
    #[error("OAuth callback did not contain an authorization code")]
    MissingCode,
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("OAuth callback state mismatch (got {0:?})")]
    StateMismatch(String),
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("token endpoint rejected the request with status {0}")]
    Rejected(StatusCode),
    #[error("invalid authorization URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("callback I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] TokenStoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no access token, authenticate first")]
    NotAuthenticated,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),
    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not resolve the account user id")]
    UnknownUser,
}

pub type Result<T> = std::result::Result<T, Error>;
