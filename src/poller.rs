//! Discovery announcement and the periodic settings/status publisher.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::api::{ApiClient, Device};
use crate::auth::Authenticator;
use crate::config::Config;
use crate::error::Result;
use crate::homeassistant::{DeviceContext, EntityConfig};
use crate::mqtt::{state_topic, Publisher};

/// Cycles between proactive access token refreshes.
pub const TOKEN_REFRESH_CYCLES: u32 = 10;
const DEVICE_LIST_RETRY: Duration = Duration::from_secs(2);

/// Keeps asking for the account's heat pumps until the API answers.
pub async fn fetch_devices(api: &ApiClient, user_id: &str) -> Vec<Device> {
    loop {
        match api.get_pumps(user_id).await {
            Ok(Some(response)) => return response.devices,
            Ok(None) => warn!("Device list unavailable, retrying"),
            Err(e) => warn!("Failed to fetch devices: {}", e),
        }
        tokio::time::sleep(DEVICE_LIST_RETRY).await;
    }
}

pub struct Poller<P> {
    api: ApiClient,
    auth: Authenticator,
    publisher: P,
    devices: Vec<Device>,
    topic_prefix: String,
    interval: Duration,
}

impl<P: Publisher> Poller<P> {
    pub fn new(
        api: ApiClient,
        auth: Authenticator,
        publisher: P,
        devices: Vec<Device>,
        config: &Config,
    ) -> Self {
        Self {
            api,
            auth,
            publisher,
            devices,
            topic_prefix: config.ha.topic_prefix.clone(),
            interval: config.api.poll_interval(),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    async fn publish_state(
        &self,
        device_id: &str,
        category: &str,
        name: &str,
        payload: String,
    ) -> Result<()> {
        self.publisher
            .publish(state_topic(device_id, category, name), payload, false)
            .await?;
        Ok(())
    }

    async fn deploy(&self, context: &DeviceContext, entity: &EntityConfig) -> Result<()> {
        let topic = context.config_topic(&self.topic_prefix, entity);
        let payload = serde_json::to_string(entity)?;
        debug!("Deploying {} config to {}", entity.component(), topic);
        self.publisher.publish(topic, payload, true).await?;
        Ok(())
    }

    /// Publishes the retained discovery config of every device once.
    pub async fn configure_devices(&self) {
        if let Err(e) = self.auth.refresh().await {
            warn!("Token refresh before discovery failed: {}", e);
        }
        for device in &self.devices {
            info!("Configuring device {}", device.id);
            self.configure_device(device).await;
        }
    }

    // Each discovery step stands alone; a failed one is logged and the
    // rest of the device is still announced.
    async fn configure_device(&self, device: &Device) {
        let metadata = match self.api.get_status(&device.id).await {
            Ok(status) => status.and_then(|status| status.metadata),
            Err(e) => {
                warn!("No firmware metadata for {}: {}", device.id, e);
                None
            }
        };
        let context = DeviceContext::new(device, metadata.as_ref());

        if let Err(e) = self.configure_settings(&context).await {
            error!("Settings discovery for {} failed: {}", device.id, e);
        }
        if let Err(e) = self.configure_metrics(&context).await {
            error!("Metrics discovery for {} failed: {}", device.id, e);
        }
        if let Err(e) = self.configure_alarms(&context).await {
            error!("Alarm inventory for {} failed: {}", device.id, e);
        }
    }

    async fn configure_settings(&self, context: &DeviceContext) -> Result<()> {
        let Some(inventory) = self.api.get_settings_inventory(&context.device_id).await? else {
            warn!("No settings inventory for {}", context.device_id);
            return Ok(());
        };
        for setting in &inventory.settings {
            match context.setting_entity(setting) {
                Some(entity) => self.deploy(context, &entity).await?,
                None => debug!(
                    "Skipping setting {} with data type {:?}",
                    setting.name, setting.data_type
                ),
            }
        }
        Ok(())
    }

    async fn configure_metrics(&self, context: &DeviceContext) -> Result<()> {
        self.deploy(context, &context.connectivity_entity()).await?;

        let Some(inventory) = self.api.get_metrics_inventory(&context.device_id).await? else {
            warn!("No metrics inventory for {}", context.device_id);
            return Ok(());
        };
        for metric in &inventory.metrics {
            match context.metric_entity(metric) {
                Some(entity) => self.deploy(context, &entity).await?,
                None => debug!("{} not yet available", metric.name),
            }
        }
        Ok(())
    }

    // Alarms are not exposed to Home Assistant yet; the inventory is only
    // logged.
    async fn configure_alarms(&self, context: &DeviceContext) -> Result<()> {
        if let Some(alarms) = self.api.get_alarm_inventory(&context.device_id).await? {
            debug!(
                "{} alarm definitions for {}",
                alarms.alarms.len(),
                context.device_id
            );
        }
        Ok(())
    }

    async fn publish_settings(&self, device_id: &str) -> Result<()> {
        let Some(response) = self.api.get_settings(device_id).await? else {
            return Ok(());
        };
        if let Some(meta) = &response.meta {
            self.publish_state(device_id, "settings", "meta", serde_json::to_string(meta)?)
                .await?;
        }
        for setting in &response.settings {
            self.publish_state(
                device_id,
                "settings",
                &setting.name,
                serde_json::to_string(setting)?,
            )
            .await?;
        }
        Ok(())
    }

    async fn publish_status(&self, device_id: &str) -> Result<()> {
        let Some(status) = self.api.get_status(device_id).await? else {
            return Ok(());
        };

        match &status.connectivity {
            Some(connectivity) if connectivity.timestamp.is_some() => {
                self.publish_state(
                    device_id,
                    "status",
                    "connectivity",
                    serde_json::to_string(connectivity)?,
                )
                .await?
            }
            _ => debug!("No connectivity timestamp for {}, skipping", device_id),
        }

        match &status.metrics {
            Some(metrics) if metrics.time.is_some() => {
                self.publish_state(device_id, "status", "metrics", serde_json::to_string(metrics)?)
                    .await?
            }
            _ => debug!("No metrics timestamp for {}, skipping", device_id),
        }

        if let Some(metadata) = &status.metadata {
            self.publish_state(
                device_id,
                "status",
                "metadata",
                serde_json::to_string(metadata)?,
            )
            .await?;
        }
        Ok(())
    }

    /// Publishes current settings and status of every device. Returns the
    /// number of failed fetch/publish steps; none of them stops the cycle.
    pub async fn poll_cycle(&self) -> usize {
        info!("Updating states on all devices");
        let mut failures = 0;
        for device in &self.devices {
            if let Err(e) = self.publish_settings(&device.id).await {
                error!("Settings update for {} failed: {}", device.id, e);
                failures += 1;
            }
            if let Err(e) = self.publish_status(&device.id).await {
                error!("Status update for {} failed: {}", device.id, e);
                failures += 1;
            }
        }
        failures
    }

    /// Runs one poll cycle and, every `TOKEN_REFRESH_CYCLES` cycles, refreshes
    /// the access token. A failed refresh is retried on the next cycle.
    pub async fn tick(&self, cycle: &mut u32) -> usize {
        *cycle += 1;
        let failures = self.poll_cycle().await;
        if failures > 0 {
            warn!("Poll cycle finished with {} failure(s)", failures);
        }

        if *cycle >= TOKEN_REFRESH_CYCLES {
            info!("Refreshing access token");
            match self.auth.refresh().await {
                Ok(()) => *cycle = 0,
                Err(e) => error!("Token refresh failed, retrying next cycle: {}", e),
            }
        }
        failures
    }

    pub async fn run(&self) {
        let mut cycle = 0;
        loop {
            self.tick(&mut cycle).await;
            tokio::time::sleep(self.interval).await;
        }
    }
}
