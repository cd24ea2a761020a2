//! Decoded measurement snapshots handed to publishers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::events::EventRecord;
use super::models::DeviceType;

/// A single decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Named fields of one register block
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    /// Insert only when the register held a value
    pub fn set_opt<V: Into<FieldValue>>(&mut self, name: &str, value: Option<V>) {
        if let Some(v) = value {
            self.set(name, v);
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

/// One MPPT input (Model 160 module)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MpptString {
    /// 1-based string number
    pub index: u16,
    pub label: String,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
    pub temperature: Option<f64>,
}

/// Output of decoding one device block
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Readings {
    pub fields: Fields,
    /// Present only while a vendor event is active
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventRecord>,
}

/// Immutable snapshot of one device for one poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub unit_id: u8,
    pub device_type: DeviceType,
    pub model_id: u16,
    pub captured_at: DateTime<Utc>,
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventRecord>,
    pub strings: Vec<MpptString>,
    pub storage: Option<Fields>,
    pub controls: Option<Fields>,
}

impl Measurement {
    pub fn new(
        unit_id: u8,
        device_type: DeviceType,
        model_id: u16,
        captured_at: DateTime<Utc>,
        readings: Readings,
    ) -> Self {
        Self {
            unit_id,
            device_type,
            model_id,
            captured_at,
            fields: readings.fields,
            events: readings.events,
            strings: Vec::new(),
            storage: None,
            controls: None,
        }
    }

    pub fn with_strings(mut self, strings: Vec<MpptString>) -> Self {
        self.strings = strings;
        self
    }

    pub fn with_storage(mut self, storage: Option<Fields>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_controls(mut self, controls: Option<Fields>) -> Self {
        self.controls = controls;
        self
    }

    /// Publisher-facing flat field map
    pub fn flatten(&self) -> BTreeMap<String, FieldValue> {
        let mut out: BTreeMap<String, FieldValue> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for record in &self.events {
            let prefix = format!("event{}", record.group);
            let codes: Vec<String> = record.codes.iter().map(u16::to_string).collect();
            out.insert(format!("{prefix}_codes"), codes.join(",").into());
            out.insert(
                format!("{prefix}_descriptions"),
                record.descriptions.join("; ").into(),
            );
            out.insert(format!("{prefix}_class"), record.class.as_str().into());
        }

        if !self.strings.is_empty() {
            out.insert("mppt_strings".to_string(), (self.strings.len() as i64).into());
        }
        for string in &self.strings {
            let prefix = format!("string{}", string.index);
            if !string.label.is_empty() {
                out.insert(format!("{prefix}_label"), string.label.as_str().into());
            }
            let values = [
                ("current", string.current),
                ("voltage", string.voltage),
                ("power", string.power),
                ("energy", string.energy),
                ("temperature", string.temperature),
            ];
            for (name, value) in values {
                if let Some(v) = value {
                    out.insert(format!("{prefix}_{name}"), v.into());
                }
            }
        }

        for (prefix, group) in [("storage", &self.storage), ("controls", &self.controls)] {
            if let Some(fields) = group {
                for (name, value) in fields.iter() {
                    out.insert(format!("{prefix}_{name}"), value.clone());
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sunspec::events::EventClass;

    fn sample() -> Measurement {
        let mut fields = Fields::new();
        fields.set("ac_power", 1520.0);
        fields.set("status_code", 4i64);
        Measurement::new(
            1,
            DeviceType::Inverter,
            103,
            Utc::now(),
            Readings {
                fields,
                events: vec![EventRecord {
                    group: 1,
                    codes: vec![307, 522],
                    descriptions: vec!["a".into(), "b".into()],
                    class: EventClass::Warning,
                }],
            },
        )
    }

    #[test]
    fn test_field_value_accessors() {
        let m = sample();
        assert_eq!(m.fields.get("status_code").and_then(FieldValue::as_i64), Some(4));
        assert_eq!(m.fields.get("status_code").and_then(FieldValue::as_bool), None);
        assert_eq!(FieldValue::Bool(true).as_bool(), Some(true));
        assert_eq!(FieldValue::Int(7).as_f64(), Some(7.0));
    }

    #[test]
    fn test_flatten_names_strings_by_index() {
        let strings = vec![
            MpptString {
                index: 1,
                current: Some(4.2),
                ..Default::default()
            },
            MpptString {
                index: 2,
                voltage: Some(512.0),
                ..Default::default()
            },
        ];
        let flat = sample().with_strings(strings).flatten();

        assert_eq!(flat.get("string1_current"), Some(&FieldValue::Float(4.2)));
        assert_eq!(flat.get("string2_voltage"), Some(&FieldValue::Float(512.0)));
        assert!(!flat.contains_key("string1_voltage"));
        assert!(!flat.keys().any(|k| k.starts_with("string3_")));
        assert_eq!(flat.get("mppt_strings"), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn test_flatten_events_and_groups() {
        let mut controls = Fields::new();
        controls.set("power_limit_pct", 100.0);
        let flat = sample().with_controls(Some(controls)).flatten();

        assert_eq!(
            flat.get("event1_codes"),
            Some(&FieldValue::Text("307,522".into()))
        );
        assert_eq!(
            flat.get("event1_class"),
            Some(&FieldValue::Text("Warning".into()))
        );
        assert_eq!(
            flat.get("controls_power_limit_pct"),
            Some(&FieldValue::Float(100.0))
        );
        assert!(!flat.contains_key("event2_codes"));
    }

    #[test]
    fn test_serialized_snapshot_omits_inactive_events() {
        let quiet = Measurement::new(
            240,
            DeviceType::Meter,
            203,
            Utc::now(),
            Readings::default(),
        );
        let json = serde_json::to_value(&quiet).unwrap();
        assert!(json.get("events").is_none());
        let back: Measurement = serde_json::from_value(json).unwrap();
        assert_eq!(back, quiet);

        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["events"][0]["codes"], serde_json::json!([307, 522]));
    }

    #[test]
    fn test_fields_skip_missing_values() {
        let mut fields = Fields::new();
        fields.set_opt::<f64>("ac_current", None);
        fields.set_opt("ac_power", Some(10.0));
        assert!(!fields.contains("ac_current"));
        assert_eq!(fields.f64("ac_power"), Some(10.0));
        assert_eq!(fields.len(), 1);
    }
}
