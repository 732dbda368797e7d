use log::debug;
use paho_mqtt::{AsyncClient, Message};
use serde::Serialize;

use crate::{
    config,
    ksem::catalog::{DeviceClass, DeviceKind, RegisterCatalog, RegisterDefinition},
    rest::{ChargeMode, KsemDeviceInfo},
};

use paho_mqtt::QOS_1 as QOS_AT_LEAST_ONCE;

const MQTT_DISCOVERY_TOPIC: &str = "homeassistant";

/// System gauges served by the REST status endpoint.
pub const SYSTEM_SENSOR_TYPES: [(&str, &str, &str); 8] = [
    ("CpuLoad", "CPU Load", "%"),
    ("CpuTemp", "CPU Temperature", "°C"),
    ("RamFree", "RAM Free", "MB"),
    ("RamTotal", "RAM Total", "MB"),
    ("FlashAppFree", "Flash App Free", "MB"),
    ("FlashAppTotal", "Flash App Total", "MB"),
    ("FlashDataFree", "Flash Data Free", "MB"),
    ("FlashDataTotal", "Flash Data Total", "MB"),
];

fn mqtt_avail_topic(client_id: &str) -> String {
    format!("{client_id}/bridge/state")
}

pub async fn register_devices(client: &AsyncClient, payloads: &[ConfigPayload]) -> anyhow::Result<()> {
    for payload in payloads {
        debug!(
            "MQTT publish: topic '{}' payload '{}'",
            payload.config_topic,
            serde_json::to_string(payload).unwrap()
        );

        client
            .publish(Message::new_retained(
                &payload.config_topic,
                serde_json::to_vec(payload).unwrap(),
                QOS_AT_LEAST_ONCE,
            ))
            .await?;

        match &payload.specific {
            DeviceSpecificConfig::Select { command_topic, .. }
            | DeviceSpecificConfig::Number { command_topic, .. } => {
                client.subscribe(command_topic, QOS_AT_LEAST_ONCE).await?;
            }
            DeviceSpecificConfig::Sensor { .. } => {}
        }
    }

    Ok(())
}

pub async fn announce_online(client_id: &str, client: &AsyncClient) -> anyhow::Result<()> {
    client
        .publish(Message::new_retained(
            mqtt_avail_topic(client_id),
            b"online".to_owned(),
            QOS_AT_LEAST_ONCE,
        ))
        .await?;
    Ok(())
}

pub fn offline_message(client_id: &str) -> Message {
    Message::new_retained(mqtt_avail_topic(client_id), "offline".to_owned(), QOS_AT_LEAST_ONCE)
}

pub async fn announce_offline(client_id: &str, client: &AsyncClient) -> anyhow::Result<()> {
    client.publish(offline_message(client_id)).await?;
    Ok(())
}

pub async fn publish_state<S: Into<String>>(
    client: &AsyncClient,
    topic: S,
    payload: &impl Serialize,
) -> anyhow::Result<()> {
    let topic = topic.into();

    debug!(
        "MQTT publish topic: '{}' payload: '{}'",
        topic,
        serde_json::to_string(payload).unwrap()
    );

    client
        .publish(Message::new(
            topic,
            serde_json::to_vec(payload).unwrap(),
            QOS_AT_LEAST_ONCE,
        ))
        .await?;

    Ok(())
}

pub fn state_topic_for_dev_id(client_id: &str, dev_id: &config::Identifier) -> String {
    format!("{client_id}/{dev_id}/state", dev_id = dev_id.0)
}

pub fn system_state_topic_for_dev_id(client_id: &str, dev_id: &config::Identifier) -> String {
    format!("{client_id}/{dev_id}/system/state", dev_id = dev_id.0)
}

pub fn charge_mode_command_topic(client_id: &str, dev_id: &config::Identifier) -> String {
    format!("{client_id}/{dev_id}/charge_mode/set", dev_id = dev_id.0)
}

pub fn min_pv_command_topic(client_id: &str, dev_id: &config::Identifier) -> String {
    format!("{client_id}/{dev_id}/min_pv_power/set", dev_id = dev_id.0)
}

pub fn min_charging_command_topic(client_id: &str, dev_id: &config::Identifier) -> String {
    format!("{client_id}/{dev_id}/min_charging_power/set", dev_id = dev_id.0)
}

#[derive(Serialize, Debug, Clone)]
pub struct AvailabilityPayload {
    topic: String,
}

#[derive(Serialize, Debug, Default, Clone)]
pub struct DevicePayload {
    name: String,
    identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connections: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hw_version: Option<String>,
}

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Whether a reading is a monotonically-increasing total or an
/// instantaneous measurement, derived from the catalog metadata alone.
pub fn state_class_for(def: &RegisterDefinition) -> Option<StateClass> {
    if def.enum_map.is_some() {
        return None;
    }
    match def.unit.as_str() {
        "Wh" | "kWh" => Some(StateClass::TotalIncreasing),
        _ => Some(StateClass::Measurement),
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum DeviceSpecificConfig {
    Sensor {
        state_topic: String,

        #[serde(skip_serializing_if = "Option::is_none")]
        state_class: Option<StateClass>,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit_of_measurement: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value_template: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_class: Option<DeviceClass>,
    },
    Select {
        command_topic: String,
        options: Vec<String>,
    },
    Number {
        command_topic: String,
        min: u32,
        max: u32,
        step: u32,
    },
}

#[derive(Serialize, Debug, Clone)]
pub struct ConfigPayload {
    pub name: String,
    pub unique_id: String,
    pub availability: Vec<AvailabilityPayload>,
    pub device: DevicePayload,
    pub config_topic: String,

    #[serde(flatten)]
    pub specific: DeviceSpecificConfig,
}

impl ConfigPayload {
    /// Discovery payloads for one bridge entry: a sensor per catalog
    /// definition grouped under its owning device, plus the charge-mode
    /// select, quota numbers and system sensors when the REST side is
    /// configured.
    pub fn from_ksem(
        client_id: &str,
        conf: &config::KsemConfig,
        catalog: &RegisterCatalog,
        info: Option<&KsemDeviceInfo>,
        with_control: bool,
    ) -> Vec<Self> {
        let dev_id = &conf.device.identifier;
        let unique_id = format!("{client_id}_{dev_id}", dev_id = dev_id.0);
        let state_topic = state_topic_for_dev_id(client_id, dev_id);
        let availability = vec![AvailabilityPayload { topic: mqtt_avail_topic(client_id) }];

        let mut meter_identifiers = vec![dev_id.0.clone()];
        if let Some(serial) = info.and_then(|info| info.serial.clone()) {
            meter_identifiers.push(serial);
        }

        let meter_device = DevicePayload {
            name: conf.name.clone(),
            identifiers: meter_identifiers,
            connections: info
                .and_then(|info| info.mac.clone())
                .map(|mac| vec![("mac".to_owned(), mac)])
                .unwrap_or_default(),
            manufacturer: conf.device.manufacturer.clone(),
            model: conf
                .device
                .model
                .clone()
                .or_else(|| info.and_then(|info| info.product_name.clone())),
            sw_version: conf
                .device
                .sw_version
                .clone()
                .or_else(|| info.and_then(|info| info.firmware_version.clone())),
            hw_version: info.and_then(|info| info.device_type.clone()),
        };

        let wallbox_device = DevicePayload {
            name: format!("{} Wallbox", conf.name),
            identifiers: vec![format!("{}_wallbox", dev_id.0)],
            manufacturer: conf.device.manufacturer.clone(),
            ..Default::default()
        };

        let mut payloads: Vec<Self> = catalog
            .iter()
            .map(|def| Self {
                config_topic: format!(
                    "{MQTT_DISCOVERY_TOPIC}/sensor/{unique_id}/{reg}/config",
                    reg = def.name
                ),
                unique_id: format!("{unique_id}_{reg}", reg = def.name),
                name: format!("{} {reg}", conf.name, reg = def.name),
                availability: availability.clone(),
                device: match def.device {
                    DeviceKind::Meter => meter_device.clone(),
                    DeviceKind::Wallbox => wallbox_device.clone(),
                },
                specific: DeviceSpecificConfig::Sensor {
                    state_topic: state_topic.clone(),
                    state_class: state_class_for(def),
                    unit_of_measurement: (!def.unit.is_empty()).then(|| def.unit.clone()),
                    value_template: Some(format!("{{{{ value_json.{} }}}}", def.name)),
                    device_class: def.device_class,
                },
            })
            .collect();

        if with_control {
            let system_state_topic = system_state_topic_for_dev_id(client_id, dev_id);

            payloads.extend(SYSTEM_SENSOR_TYPES.iter().map(|(key, name, unit)| Self {
                config_topic: format!(
                    "{MQTT_DISCOVERY_TOPIC}/sensor/{unique_id}/{key}/config",
                    key = key.to_lowercase()
                ),
                unique_id: format!("{unique_id}_{key}", key = key.to_lowercase()),
                name: format!("{} {name}", conf.name),
                availability: availability.clone(),
                device: meter_device.clone(),
                specific: DeviceSpecificConfig::Sensor {
                    state_topic: system_state_topic.clone(),
                    state_class: Some(StateClass::Measurement),
                    unit_of_measurement: Some((*unit).to_owned()),
                    value_template: Some(format!("{{{{ value_json.{key} }}}}")),
                    device_class: None,
                },
            }));

            payloads.push(Self {
                config_topic: format!("{MQTT_DISCOVERY_TOPIC}/select/{unique_id}/charge_mode/config"),
                unique_id: format!("{unique_id}_charge_mode"),
                name: format!("{} Charge Mode", conf.name),
                availability: availability.clone(),
                device: wallbox_device.clone(),
                specific: DeviceSpecificConfig::Select {
                    command_topic: charge_mode_command_topic(client_id, dev_id),
                    options: ChargeMode::ALL.iter().map(|mode| mode.label().to_owned()).collect(),
                },
            });

            payloads.push(Self {
                config_topic: format!("{MQTT_DISCOVERY_TOPIC}/number/{unique_id}/min_pv_power/config"),
                unique_id: format!("{unique_id}_min_pv_power"),
                name: format!("{} Min PV Power", conf.name),
                availability: availability.clone(),
                device: wallbox_device.clone(),
                specific: DeviceSpecificConfig::Number {
                    command_topic: min_pv_command_topic(client_id, dev_id),
                    min: 0,
                    max: 100,
                    step: 10,
                },
            });

            payloads.push(Self {
                config_topic: format!(
                    "{MQTT_DISCOVERY_TOPIC}/number/{unique_id}/min_charging_power/config"
                ),
                unique_id: format!("{unique_id}_min_charging_power"),
                name: format!("{} Min Charging Power", conf.name),
                availability,
                device: wallbox_device,
                specific: DeviceSpecificConfig::Number {
                    command_topic: min_charging_command_topic(client_id, dev_id),
                    min: 0,
                    max: 100,
                    step: 25,
                },
            });
        }

        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ksem::catalog::{self, DataType};

    fn test_def(name: &str, unit: &str) -> RegisterDefinition {
        RegisterDefinition {
            name: name.to_owned(),
            address: 0,
            ty: DataType::U32,
            scale: 1.0,
            unit: unit.to_owned(),
            device_class: None,
            device: DeviceKind::Meter,
            enum_map: None,
        }
    }

    fn sample_conf() -> config::KsemConfig {
        serde_yaml::from_str(
            r#"
            name: Smartmeter
            device:
              identifier: ksem_garage
            host: 192.168.1.2
            "#,
        )
        .unwrap()
    }

    #[test]
    fn energy_units_are_total_increasing() {
        let mut def = test_def("energy", "Wh");
        assert_eq!(state_class_for(&def), Some(StateClass::TotalIncreasing));

        def.unit = "kWh".to_owned();
        assert_eq!(state_class_for(&def), Some(StateClass::TotalIncreasing));

        def.unit = "W".to_owned();
        assert_eq!(state_class_for(&def), Some(StateClass::Measurement));

        def.unit = String::new();
        def.device_class = Some(DeviceClass::Enum);
        def.enum_map = Some([(0, "idle".to_owned())].into_iter().collect());
        assert_eq!(state_class_for(&def), None);
    }

    #[test]
    fn discovery_covers_the_whole_catalog() {
        let conf = sample_conf();
        let catalog = catalog::default_catalog();

        let payloads = ConfigPayload::from_ksem("bridge", &conf, &catalog, None, false);

        assert_eq!(payloads.len(), catalog.len());
        for payload in &payloads {
            assert!(payload.config_topic.starts_with("homeassistant/sensor/"));
        }
    }

    #[test]
    fn control_entities_appear_only_with_rest_configured() {
        let conf = sample_conf();
        let catalog = catalog::default_catalog();

        let without = ConfigPayload::from_ksem("bridge", &conf, &catalog, None, false);
        let with = ConfigPayload::from_ksem("bridge", &conf, &catalog, None, true);

        let extras = with.len() - without.len();
        assert_eq!(extras, SYSTEM_SENSOR_TYPES.len() + 3);
        assert!(with
            .iter()
            .any(|payload| matches!(payload.specific, DeviceSpecificConfig::Select { .. })));
    }
}
