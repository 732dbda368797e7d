use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_modbus::{Address, Quantity};

use super::decode::RawValue;
use super::Value;

/// Register data type. Word count and signedness are fixed by the variant;
/// the KSEM data map only carries integer quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    U32,
    U64,
    I16,
    I32,
    I64,
}

impl DataType {
    pub const fn word_count(self) -> Quantity {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 => 2,
            DataType::U64 | DataType::I64 => 4,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    ApparentPower,
    Current,
    Energy,
    Enum,
    Frequency,
    Power,
    PowerFactor,
    ReactivePower,
    Voltage,
}

/// Physical device a register belongs to: the meter itself or the
/// Enector wallbox attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Meter,
    Wallbox,
}

const fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDefinition {
    pub name: String,
    pub address: Address,
    pub ty: DataType,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub unit: String,

    pub device_class: Option<DeviceClass>,
    pub device: DeviceKind,

    /// Code-to-label mapping, paired with `device_class: enum`.
    pub enum_map: Option<BTreeMap<i64, String>>,
}

impl RegisterDefinition {
    /// Last word address covered by this definition.
    pub fn span_end(&self) -> Address {
        self.address + self.ty.word_count() - 1
    }

    /// Turn a decoded raw register value into the published value: mapped
    /// definitions resolve the truncated integer code to its label (an
    /// unknown code yields a fallback label, not an error), unmapped ones
    /// scale into a float.
    pub fn apply(&self, raw: RawValue) -> Value {
        match &self.enum_map {
            Some(map) => match map.get(&raw.enum_key()) {
                Some(label) => Value::Label(label.clone()),
                None => Value::Label(format!("unmapped code {raw}")),
            },
            None => Value::Number(raw.as_f64() * self.scale),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("register `{second}` overlaps the word span of `{first}`")]
    OverlappingSpans { first: String, second: String },

    #[error("register `{name}` exceeds the 16-bit address range")]
    AddressRange { name: String },

    #[error("register `{name}` must pair `enum_map` with device_class `enum`")]
    EnumMapping { name: String },
}

/// Address-ordered register definitions for one device connection.
/// Immutable once constructed; shared read-only between the poll loop and
/// the discovery layer.
#[derive(Debug, Clone)]
pub struct RegisterCatalog {
    defs: BTreeMap<Address, RegisterDefinition>,
}

impl RegisterCatalog {
    pub fn new(defs: Vec<RegisterDefinition>) -> Result<Self, CatalogError> {
        let mut by_addr: BTreeMap<Address, RegisterDefinition> = BTreeMap::new();

        for def in defs {
            if u32::from(def.address) + u32::from(def.ty.word_count()) - 1 > u32::from(Address::MAX) {
                return Err(CatalogError::AddressRange { name: def.name });
            }
            if def.enum_map.is_some() != (def.device_class == Some(DeviceClass::Enum)) {
                return Err(CatalogError::EnumMapping { name: def.name });
            }
            if let Some(existing) = by_addr.get(&def.address) {
                return Err(CatalogError::OverlappingSpans {
                    first: existing.name.clone(),
                    second: def.name,
                });
            }
            by_addr.insert(def.address, def);
        }

        let mut prev: Option<&RegisterDefinition> = None;
        for def in by_addr.values() {
            if let Some(prev) = prev {
                if def.address <= prev.span_end() {
                    return Err(CatalogError::OverlappingSpans {
                        first: prev.name.clone(),
                        second: def.name.clone(),
                    });
                }
            }
            prev = Some(def);
        }

        Ok(Self { defs: by_addr })
    }

    /// Definitions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDefinition> {
        self.defs.values()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Register map of a KSEM with an Enector wallbox attached. Meter
/// quantities mirror the OBIS-named registers of the built-in data map,
/// the wallbox sits in the 49xxx range.
pub fn default_catalog() -> RegisterCatalog {
    let def = |name: &str, address, ty, scale, unit: &str, device_class, device| RegisterDefinition {
        name: name.to_owned(),
        address,
        ty,
        scale,
        unit: unit.to_owned(),
        device_class,
        device,
        enum_map: None,
    };

    let status_labels = [
        (0, "idle"),
        (1, "vehicle detected"),
        (2, "charging"),
        (3, "charging paused"),
        (4, "charging finished"),
        (5, "error"),
    ];

    let mut defs = vec![
        def("active_power_plus", 0, DataType::U32, 0.1, "W", Some(DeviceClass::Power), DeviceKind::Meter),
        def("active_power_minus", 2, DataType::U32, 0.1, "W", Some(DeviceClass::Power), DeviceKind::Meter),
        def("reactive_power_plus", 4, DataType::U32, 0.1, "var", Some(DeviceClass::ReactivePower), DeviceKind::Meter),
        def("reactive_power_minus", 6, DataType::U32, 0.1, "var", Some(DeviceClass::ReactivePower), DeviceKind::Meter),
        def("apparent_power_plus", 16, DataType::U32, 0.1, "VA", Some(DeviceClass::ApparentPower), DeviceKind::Meter),
        def("apparent_power_minus", 18, DataType::U32, 0.1, "VA", Some(DeviceClass::ApparentPower), DeviceKind::Meter),
        def("power_factor", 24, DataType::I32, 0.001, "", Some(DeviceClass::PowerFactor), DeviceKind::Meter),
        def("supply_frequency", 26, DataType::U32, 0.001, "Hz", Some(DeviceClass::Frequency), DeviceKind::Meter),
        def("active_energy_plus", 512, DataType::U64, 0.1, "Wh", Some(DeviceClass::Energy), DeviceKind::Meter),
        def("active_energy_minus", 516, DataType::U64, 0.1, "Wh", Some(DeviceClass::Energy), DeviceKind::Meter),
        def("wallbox_current_l1", 49218, DataType::U32, 0.001, "A", Some(DeviceClass::Current), DeviceKind::Wallbox),
        def("wallbox_current_l2", 49220, DataType::U32, 0.001, "A", Some(DeviceClass::Current), DeviceKind::Wallbox),
        def("wallbox_current_l3", 49222, DataType::U32, 0.001, "A", Some(DeviceClass::Current), DeviceKind::Wallbox),
        def("wallbox_charging_power", 49246, DataType::U64, 0.001, "W", Some(DeviceClass::Power), DeviceKind::Wallbox),
        def("wallbox_charged_energy", 49254, DataType::U64, 0.001, "Wh", Some(DeviceClass::Energy), DeviceKind::Wallbox),
    ];

    defs.push(RegisterDefinition {
        name: "wallbox_status".to_owned(),
        address: 49206,
        ty: DataType::U64,
        scale: 1.0,
        unit: String::new(),
        device_class: Some(DeviceClass::Enum),
        device: DeviceKind::Wallbox,
        enum_map: Some(
            status_labels
                .into_iter()
                .map(|(code, label)| (code, label.to_owned()))
                .collect(),
        ),
    });

    RegisterCatalog::new(defs).expect("built-in register catalog is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(name: &str, address: Address, ty: DataType) -> RegisterDefinition {
        RegisterDefinition {
            name: name.to_owned(),
            address,
            ty,
            scale: 1.0,
            unit: String::new(),
            device_class: None,
            device: DeviceKind::Meter,
            enum_map: None,
        }
    }

    #[test]
    fn rejects_overlapping_spans() {
        let result = RegisterCatalog::new(vec![
            plain("a", 100, DataType::U32),
            plain("b", 101, DataType::U16),
        ]);

        assert_eq!(
            result.unwrap_err(),
            CatalogError::OverlappingSpans { first: "a".to_owned(), second: "b".to_owned() }
        );
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let result = RegisterCatalog::new(vec![
            plain("a", 100, DataType::U16),
            plain("b", 100, DataType::U16),
        ]);

        assert!(matches!(result, Err(CatalogError::OverlappingSpans { .. })));
    }

    #[test]
    fn rejects_enum_map_without_enum_class() {
        let mut def = plain("status", 10, DataType::U16);
        def.enum_map = Some([(0, "off".to_owned())].into_iter().collect());

        assert_eq!(
            RegisterCatalog::new(vec![def]).unwrap_err(),
            CatalogError::EnumMapping { name: "status".to_owned() }
        );
    }

    #[test]
    fn rejects_span_past_address_range() {
        let result = RegisterCatalog::new(vec![plain("a", Address::MAX - 1, DataType::U64)]);

        assert_eq!(result.unwrap_err(), CatalogError::AddressRange { name: "a".to_owned() });
    }

    #[test]
    fn apply_scales_into_float() {
        let mut def = plain("energy", 0, DataType::U32);
        def.scale = 0.001;

        assert_eq!(def.apply(RawValue::Unsigned(1000)), Value::Number(1.0));
    }

    #[test]
    fn apply_resolves_enum_label() {
        let mut def = plain("status", 0, DataType::U16);
        def.device_class = Some(DeviceClass::Enum);
        def.enum_map = Some(
            [(0, "A".to_owned()), (1, "B".to_owned())].into_iter().collect(),
        );

        assert_eq!(def.apply(RawValue::Unsigned(1)), Value::Label("B".to_owned()));
    }

    #[test]
    fn apply_falls_back_on_unmapped_code() {
        let mut def = plain("status", 0, DataType::U16);
        def.device_class = Some(DeviceClass::Enum);
        def.enum_map = Some(
            [(0, "A".to_owned()), (1, "B".to_owned())].into_iter().collect(),
        );

        let Value::Label(label) = def.apply(RawValue::Unsigned(9)) else {
            panic!("expected a label");
        };
        assert!(label.contains('9'), "fallback label should embed the code: {label}");
    }

    #[test]
    fn default_catalog_is_valid_and_ordered() {
        let catalog = default_catalog();

        assert!(!catalog.is_empty());
        let addrs: Vec<Address> = catalog.iter().map(|def| def.address).collect();
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        assert_eq!(addrs, sorted);
    }
}
