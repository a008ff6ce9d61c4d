use std::future::Future;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Packet,
    QoS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

use crate::api::ApiClient;
use crate::config::MqttConfig;

pub const TOPIC_ROOT: &str = "qvantum";
/// Every writable setting of every device.
pub const COMMAND_SUBSCRIPTION: &str = "qvantum/devices/+/settings/+/set";

const BRIDGE_ID: &str = "q2m";
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeState {
    pub running: bool,
}

pub fn state_topic(device_id: &str, category: &str, name: &str) -> String {
    format!("{}/devices/{}/{}/{}/value", TOPIC_ROOT, device_id, category, name)
}

pub fn command_topic(device_id: &str, category: &str, name: &str) -> String {
    format!("{}/devices/{}/{}/{}/set", TOPIC_ROOT, device_id, category, name)
}

pub fn config_topic(prefix: &str, component: &str, device_id: &str, name: &str) -> String {
    format!("{}/{}/{}/{}/config", prefix, component, device_id, name)
}

pub fn value_template(key: &str) -> String {
    format!("{{{{ value_json.{} }}}}", key)
}

/// Liveness topic of the bridge itself.
pub fn running_topic() -> String {
    state_topic(BRIDGE_ID, "status", "running")
}

pub fn running_payload(running: bool) -> String {
    serde_json::json!(BridgeState { running }).to_string()
}

/// Connection options, including the last will that tells subscribers the
/// bridge went away.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.server, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    if let Some(user) = &config.user {
        options.set_credentials(user, config.password.as_deref().unwrap_or_default());
    }
    options.set_last_will(LastWill::new(
        running_topic(),
        running_payload(false),
        QoS::AtMostOnce,
        true,
    ));
    options
}

/// Outbound side of the bridge, split out so the poll loop can run against
/// a recorder in tests.
pub trait Publisher {
    fn publish(
        &self,
        topic: String,
        payload: String,
        retain: bool,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

#[derive(Debug, PartialEq, Eq)]
pub struct SettingCommand<'a> {
    pub device_id: &'a str,
    pub setting: &'a str,
}

/// Accepts only `qvantum/devices/{device_id}/settings/{setting}/set`.
pub fn parse_command_topic(topic: &str) -> Option<SettingCommand<'_>> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        [TOPIC_ROOT, "devices", device_id, "settings", setting, "set"]
            if !device_id.is_empty() && !setting.is_empty() =>
        {
            Some(SettingCommand {
                device_id: *device_id,
                setting: *setting,
            })
        }
        _ => None,
    }
}

/// Forwards one inbound `/set` message to the API. Malformed topics and
/// non UTF-8 payloads are dropped.
pub async fn handle_command(api: &ApiClient, topic: &str, payload: &[u8]) {
    let Some(command) = parse_command_topic(topic) else {
        warn!("Dropping message on unexpected topic {}", topic);
        return;
    };
    let value = match std::str::from_utf8(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse MQTT payload on {} as UTF-8: {}", topic, e);
            return;
        }
    };

    info!(
        "Received command for {}: {} = {}",
        command.device_id, command.setting, value
    );
    match api
        .set_setting(command.device_id, command.setting, value)
        .await
    {
        Ok(Some(_)) => debug!("Applied {} on {}", command.setting, command.device_id),
        Ok(None) => {}
        Err(e) => warn!(
            "Failed to set {} on {}: {}",
            command.setting, command.device_id, e
        ),
    }
}

#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MqttBridge {
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), 10);
        let bridge = Self {
            client,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        };
        (bridge, eventloop)
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Registers a topic for every (re)connect and subscribes right away.
    pub async fn add_subscription(&self, topic: &str) -> Result<(), ClientError> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            if subscriptions.iter().any(|t| t == topic) {
                return Ok(());
            }
            subscriptions.push(topic.to_string());
        }
        debug!("Subscribing to {}", topic);
        self.client.subscribe(topic, QoS::AtMostOnce).await
    }

    /// Subscribes to every registered topic and announces `running=true`.
    ///
    /// Waits for room in the request queue, so it must not run on the task
    /// that polls the event loop.
    pub async fn restore_session(&self) -> Result<(), ClientError> {
        let topics = self.subscriptions().await;
        for topic in topics {
            debug!("Subscribing to {}", topic);
            self.client.subscribe(topic, QoS::AtMostOnce).await?;
        }
        self.client
            .publish(running_topic(), QoS::AtMostOnce, true, running_payload(true))
            .await
    }

    async fn restore_on_connect(self, connected: Arc<Notify>) {
        loop {
            connected.notified().await;
            if let Err(e) = self.restore_session().await {
                warn!("Failed to restore subscriptions: {}", e);
            }
        }
    }

    /// Drives the event loop until the broker accepts the connection.
    pub async fn wait_for_connection(&self, eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!("Connected to MQTT broker: {:?}", ack.code);
                    return Ok(());
                }
                event => trace!("MQTT event before connect: {:?}", event),
            }
        }
    }

    /// Handles inbound traffic for the rest of the process lifetime. Commands
    /// are forwarded on their own tasks so the event loop keeps polling while
    /// the API answers.
    pub async fn run(self, mut eventloop: EventLoop, api: ApiClient) {
        debug!("Listening for MQTT events");
        let connected = Arc::new(Notify::new());
        tokio::spawn(self.clone().restore_on_connect(connected.clone()));
        // The first ConnAck was consumed by wait_for_connection
        connected.notify_one();

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to MQTT broker");
                    connected.notify_one();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("Received message on {}", publish.topic);
                    let api = api.clone();
                    tokio::spawn(async move {
                        handle_command(&api, &publish.topic, &publish.payload).await;
                    });
                }
                Ok(event) => trace!("MQTT event: {:?}", event),
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

impl Publisher for MqttBridge {
    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), ClientError> {
        trace!("Publishing to {} (retain={}): {}", topic, retain, payload);
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await
    }
}
