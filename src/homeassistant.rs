//! Home Assistant MQTT discovery payloads.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::{Device, DeviceMetadata, MetricInventory, SettingInventory};
use crate::mqtt::{command_topic, config_topic, state_topic, value_template};

const DEVICE_NAME: &str = "Qvantum Värmepump";

const SETTING_FIELDS: &[&str] = &["name", "value", "read_only"];
const CONNECTIVITY_FIELDS: &[&str] = &["connected", "timestamp", "disconnect_reason"];

/// Metrics listed in the inventory that never carry a live value.
const UNAVAILABLE_METRICS: &[&str] = &[
    "compressorenergy",
    "additionalenergy",
    "tap_water_start",
    "tap_water_stop",
];

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Temperature,
    Connectivity,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HaDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
}

impl HaDevice {
    pub fn new(device: &Device, metadata: Option<&DeviceMetadata>) -> Self {
        Self {
            identifiers: vec![device.id.clone()],
            name: DEVICE_NAME.to_string(),
            manufacturer: device.vendor.clone(),
            model: device.model.clone(),
            serial_number: device.serial.clone(),
            sw_version: metadata.and_then(|m| m.display_fw_version.clone()),
            // The inverter firmware is always reported as 0, the control
            // card version stands in for the hardware revision.
            hw_version: metadata.and_then(|m| m.cc_fw_version.clone()),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Availability {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub value_template: String,
}

/// Fields every entity kind shares.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EntityBase {
    /// Setting or metric name the entity was built from.
    #[serde(skip)]
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    pub unique_id: String,
    pub object_id: String,
    pub device: HaDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SensorConfig {
    #[serde(flatten)]
    pub base: EntityBase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NumberConfig {
    #[serde(flatten)]
    pub base: EntityBase,
    pub command_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SwitchConfig {
    #[serde(flatten)]
    pub base: EntityBase,
    pub command_topic: String,
    pub payload_on: String,
    pub payload_off: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BinarySensorConfig {
    #[serde(flatten)]
    pub base: EntityBase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
    pub payload_on: String,
    pub payload_off: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum EntityConfig {
    Sensor(SensorConfig),
    Number(NumberConfig),
    Switch(SwitchConfig),
    BinarySensor(BinarySensorConfig),
}

impl EntityConfig {
    /// Discovery component, also the second segment of the config topic.
    pub fn component(&self) -> &'static str {
        match self {
            EntityConfig::Sensor(_) => "sensor",
            EntityConfig::Number(_) => "number",
            EntityConfig::Switch(_) => "switch",
            EntityConfig::BinarySensor(_) => "binary_sensor",
        }
    }

    pub fn base(&self) -> &EntityBase {
        match self {
            EntityConfig::Sensor(c) => &c.base,
            EntityConfig::Number(c) => &c.base,
            EntityConfig::Switch(c) => &c.base,
            EntityConfig::BinarySensor(c) => &c.base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingBounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Accepted range of the writable numeric settings. The inventory does not
/// carry these.
pub fn setting_bounds(name: &str) -> Option<SettingBounds> {
    let (min, max, step) = match name {
        "tap_water_capacity_target" => (0.0, 5.0, 1.0),
        "tap_water_start" => (40.0, 70.0, 1.0),
        "tap_water_stop" => (40.0, 99.0, 1.0),
        "indoor_temperature_target" => (15.0, 25.0, 1.0),
        "indoor_temperature_offset" => (-9.0, 9.0, 1.0),
        _ => return None,
    };
    Some(SettingBounds { min, max, step })
}

/// Maps each field to `{{ value_json.<field> }}` so the whole state message
/// shows up as entity attributes.
pub fn attributes_template(fields: &[&str]) -> String {
    let map: Map<String, Value> = fields
        .iter()
        .map(|field| (field.to_string(), Value::from(value_template(field))))
        .collect();
    Value::Object(map).to_string()
}

/// Everything needed to describe the entities of one heat pump.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device_id: String,
    pub device: HaDevice,
    pub availability: Availability,
}

impl DeviceContext {
    pub fn new(device: &Device, metadata: Option<&DeviceMetadata>) -> Self {
        Self {
            device_id: device.id.clone(),
            device: HaDevice::new(device, metadata),
            availability: Availability {
                topic: state_topic(&device.id, "status", "connectivity"),
                payload_available: "True".to_string(),
                payload_not_available: "False".to_string(),
                value_template: value_template("connected"),
            },
        }
    }

    pub fn config_topic(&self, prefix: &str, entity: &EntityConfig) -> String {
        config_topic(prefix, entity.component(), &self.device_id, &entity.base().key)
    }

    fn base(&self, key: &str, name: Option<String>, state_topic: String) -> EntityBase {
        EntityBase {
            key: key.to_string(),
            name,
            state_topic,
            value_template: None,
            unique_id: format!("qvantum_{}_{}", self.device_id, key),
            object_id: format!("{}_{}", self.device_id, key),
            device: self.device.clone(),
            json_attributes_topic: None,
            json_attributes_template: None,
            availability: Some(self.availability.clone()),
        }
    }

    /// Entity for one inventory setting, chosen by its data type. Unknown
    /// data types yield `None`.
    pub fn setting_entity(&self, setting: &SettingInventory) -> Option<EntityConfig> {
        let state = state_topic(&self.device_id, "settings", &setting.name);
        let command = command_topic(&self.device_id, "settings", &setting.name);
        let name = Some(
            setting
                .display_name
                .clone()
                .unwrap_or_else(|| setting.name.clone()),
        );
        let base = EntityBase {
            value_template: Some(value_template("value")),
            json_attributes_topic: Some(state.clone()),
            json_attributes_template: Some(attributes_template(SETTING_FIELDS)),
            ..self.base(&setting.name, name, state)
        };

        let entity = match setting.data_type.as_deref()? {
            "number" => {
                let bounds = setting_bounds(&setting.name);
                EntityConfig::Number(NumberConfig {
                    base,
                    command_topic: command,
                    min: bounds.map(|b| b.min),
                    max: bounds.map(|b| b.max),
                    step: bounds.map(|b| b.step),
                })
            }
            "boolean" if setting.read_only => EntityConfig::BinarySensor(BinarySensorConfig {
                base,
                device_class: None,
                payload_on: "on".to_string(),
                payload_off: "off".to_string(),
            }),
            "boolean" => EntityConfig::Switch(SwitchConfig {
                base,
                command_topic: command,
                payload_on: "on".to_string(),
                payload_off: "off".to_string(),
            }),
            "string" => EntityConfig::Sensor(SensorConfig {
                base,
                device_class: None,
                unit_of_measurement: None,
            }),
            _ => return None,
        };
        Some(entity)
    }

    pub fn connectivity_entity(&self) -> EntityConfig {
        let state = state_topic(&self.device_id, "status", "connectivity");
        let base = EntityBase {
            value_template: Some(value_template("connected")),
            json_attributes_topic: Some(state.clone()),
            json_attributes_template: Some(attributes_template(CONNECTIVITY_FIELDS)),
            ..self.base("connectivity", Some("connectivity".to_string()), state)
        };
        // Availability would point at this very topic.
        let base = EntityBase {
            availability: None,
            ..base
        };

        EntityConfig::BinarySensor(BinarySensorConfig {
            base,
            device_class: Some(DeviceClass::Connectivity),
            payload_on: "True".to_string(),
            payload_off: "False".to_string(),
        })
    }

    /// Sensor reading one field of the shared metrics state message.
    pub fn metric_entity(&self, metric: &MetricInventory) -> Option<EntityConfig> {
        if UNAVAILABLE_METRICS.contains(&metric.name.as_str()) {
            return None;
        }

        let state = state_topic(&self.device_id, "status", "metrics");
        let base = EntityBase {
            value_template: Some(value_template(&metric.name)),
            ..self.base(&metric.name, Some(metric.name.clone()), state)
        };
        let device_class = match metric.unit.as_deref() {
            Some("°C") | Some("C") => Some(DeviceClass::Temperature),
            _ => None,
        };

        Some(EntityConfig::Sensor(SensorConfig {
            base,
            device_class,
            unit_of_measurement: metric.unit.clone(),
        }))
    }
}
