pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod homeassistant;
pub mod mqtt;
pub mod poller;
pub mod token_store;

pub use error::{Error, Result};
