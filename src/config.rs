use lazy_static::lazy_static;
use serde::{de::Error, Deserialize, Deserializer, Serialize};

use crate::ksem::catalog::RegisterDefinition;

lazy_static! {
    static ref IDENTIFIER_REGEX: regex::Regex = regex::Regex::new("^[a-zA-Z0-9_]+$").unwrap();
}

const fn default_mqtt_port() -> u16 {
    1883
}
const fn default_modbus_port() -> u16 {
    502
}
const fn default_unit_id() -> u8 {
    1
}
const fn default_max_gap() -> u16 {
    2
}
const fn default_poll_interval_s() -> u64 {
    30
}
fn default_client_id() -> String {
    "ksem2mqtt_bridge".to_owned()
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "default_client_id")]
    pub client_id: String,

    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,

    pub ksem: Option<Vec<KsemConfig>>,
}

#[derive(Serialize, Debug)]
pub struct Identifier(pub String);

#[derive(Serialize, Deserialize, Debug)]
pub struct Device {
    pub identifier: Identifier,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = String::deserialize(de)?;

        if IDENTIFIER_REGEX.is_match(&id) {
            Ok(Identifier(id))
        } else {
            Err(Error::custom("identifier must match [a-zA-Z0-9_]+"))
        }
    }
}

#[derive(Deserialize)]
pub struct KsemConfig {
    pub name: String,
    pub device: Device,
    pub host: String,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Web API password; REST features stay off without it.
    pub password: Option<String>,

    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,

    #[serde(default = "default_max_gap")]
    pub max_gap: u16,

    /// Register catalog override; the built-in KSEM map applies otherwise.
    pub registers: Option<Vec<RegisterDefinition>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ksem::catalog::{DataType, DeviceKind};

    #[test]
    fn parses_a_full_config() {
        let config: Config = serde_yaml::from_str(
            r#"
            broker: 192.168.1.5
            ksem:
              - name: Smartmeter
                device:
                  identifier: ksem_garage
                  manufacturer: Kostal
                host: 192.168.1.2
                password: secret
                registers:
                  - name: active_power_plus
                    address: 0
                    ty: u32
                    scale: 0.1
                    unit: W
                    device_class: power
                    device: meter
                  - name: wallbox_status
                    address: 49206
                    ty: u64
                    device_class: enum
                    device: wallbox
                    enum_map:
                      0: idle
                      2: charging
            "#,
        )
        .unwrap();

        assert_eq!(config.client_id, "ksem2mqtt_bridge");
        assert_eq!(config.broker_port, 1883);

        let ksem = &config.ksem.unwrap()[0];
        assert_eq!(ksem.port, 502);
        assert_eq!(ksem.unit_id, 1);
        assert_eq!(ksem.max_gap, 2);
        assert_eq!(ksem.poll_interval_s, 30);

        let registers = ksem.registers.as_ref().unwrap();
        assert_eq!(registers[0].ty, DataType::U32);
        assert_eq!(registers[0].scale, 0.1);
        assert_eq!(registers[1].device, DeviceKind::Wallbox);
        assert_eq!(registers[1].scale, 1.0);
        assert_eq!(
            registers[1].enum_map.as_ref().unwrap().get(&2),
            Some(&"charging".to_owned())
        );
    }

    #[test]
    fn rejects_bad_identifiers() {
        let result: Result<Identifier, _> = serde_yaml::from_str("\"nö\"");
        assert!(result.is_err());
    }
}
