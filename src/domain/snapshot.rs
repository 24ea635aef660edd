use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Origin of a raw snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    Inverter,
    Weather,
    Forecast,
    Devices,
}

/// A single raw or carried-over field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view; numeric strings (as some inverter firmwares report them) are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) if v.is_finite() => Some(*v),
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Number(v) => Some(*v != 0.0),
            FieldValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
        }
    }

    /// Rendering used by the flat-file sink.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Ephemeral per-cycle reading from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub source: SourceKind,
    /// Unix seconds at which polling started.
    pub captured_at: i64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawSnapshot {
    pub fn new(source: SourceKind, captured_at: i64) -> Self {
        Self {
            source,
            captured_at,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<FieldValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_f64)
    }

    /// First key in `keys` holding a usable number.
    pub fn number_any(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|k| self.number(k))
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.number(key).map(|v| v.round() as i64)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_strings_are_parsed() {
        let snap = RawSnapshot::new(SourceKind::Inverter, 0)
            .with("battery_voltage", "26.4")
            .with("working_mode", "LINE MODE")
            .with("pv1_power", f64::NAN);

        assert_eq!(snap.number("battery_voltage"), Some(26.4));
        assert_eq!(snap.number("working_mode"), None);
        assert_eq!(snap.number("pv1_power"), None);
        assert_eq!(snap.text("working_mode"), Some("LINE MODE"));
    }

    #[test]
    fn test_number_any_uses_first_available_alias() {
        let snap = RawSnapshot::new(SourceKind::Weather, 0).with("wind_speed", 3.5);
        assert_eq!(snap.number_any(&["wind_speed_mps", "wind_speed"]), Some(3.5));
    }

    #[test]
    fn test_field_value_untagged_serde() {
        let json = r#"{"a": true, "b": 1.5, "c": "x"}"#;
        let map: BTreeMap<String, FieldValue> = serde_json::from_str(json).unwrap();
        assert_eq!(map["a"], FieldValue::Bool(true));
        assert_eq!(map["b"], FieldValue::Number(1.5));
        assert_eq!(map["c"], FieldValue::Text("x".into()));
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(SourceKind::Devices.to_string(), "devices");
        assert_eq!("weather".parse::<SourceKind>().unwrap(), SourceKind::Weather);
    }
}
