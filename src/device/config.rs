use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceConfigError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("device is not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, DeviceConfigError>;

/// Flat, kind-specific settings for one device. Values may arrive as JSON
/// strings or numbers; the getters accept both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, Value>);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copy every key of `other` over this map.
    pub fn extend(&mut self, other: DeviceConfig) {
        self.0.extend(other.0);
    }

    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Value::as_str).filter(|name| !name.is_empty())
    }

    /// Non-empty string value.
    pub fn opt_str(&self, field: &'static str) -> Result<Option<String>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(invalid(field, format!("expected a string, got {other}"))),
        }
    }

    pub fn require_str(&self, field: &'static str) -> Result<String> {
        self.opt_str(field)?.ok_or(DeviceConfigError::Missing(field))
    }

    pub fn opt_u64(&self, field: &'static str) -> Result<Option<u64>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| invalid(field, format!("{n} is not a whole number"))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(field, format!("'{s}' is not a whole number"))),
            Some(other) => Err(invalid(field, format!("expected a number, got {other}"))),
        }
    }

    pub fn opt_port(&self, field: &'static str) -> Result<Option<u16>> {
        match self.opt_u64(field)? {
            None => Ok(None),
            Some(0) => Err(invalid(field, "port must be non-zero".to_string())),
            Some(port) => u16::try_from(port)
                .map(Some)
                .map_err(|_| invalid(field, format!("{port} is out of range"))),
        }
    }

    pub fn port_or(&self, field: &'static str, default: u16) -> Result<u16> {
        Ok(self.opt_port(field)?.unwrap_or(default))
    }

    pub fn require_port(&self, field: &'static str) -> Result<u16> {
        self.opt_port(field)?.ok_or(DeviceConfigError::Missing(field))
    }

    pub fn f64_or(&self, field: &'static str, default: f64) -> Result<f64> {
        let value = match self.get(field) {
            None => return Ok(default),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(default),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(invalid(field, "expected a non-negative number".to_string())),
        }
    }

    pub fn bool_or(&self, field: &'static str, default: bool) -> Result<bool> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(n.as_u64().is_some_and(|v| v != 0)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" | "" => Ok(false),
                other => Err(invalid(field, format!("'{other}' is not a boolean"))),
            },
            Some(other) => Err(invalid(field, format!("expected a boolean, got {other}"))),
        }
    }

    pub fn opt_ip(&self, field: &'static str) -> Result<Option<IpAddr>> {
        match self.opt_str(field)? {
            None => Ok(None),
            Some(ip) => ip
                .parse()
                .map(Some)
                .map_err(|_| invalid(field, format!("'{ip}' is not an IP address"))),
        }
    }
}

impl FromIterator<(String, Value)> for DeviceConfig {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn invalid(field: &'static str, reason: String) -> DeviceConfigError {
    DeviceConfigError::Invalid { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_getters_accept_strings_and_numbers() {
        let config = DeviceConfig::new()
            .with("port", "9993")
            .with("listen_port", 8026)
            .with("delay", "1.5")
            .with("playback", "false");

        assert_eq!(config.require_port("port").unwrap(), 9993);
        assert_eq!(config.port_or("listen_port", 1).unwrap(), 8026);
        assert_eq!(config.f64_or("delay", 0.0).unwrap(), 1.5);
        assert!(!config.bool_or("playback", true).unwrap());
        assert!(config.bool_or("missing", true).unwrap());
    }

    #[test]
    fn test_missing_and_invalid() {
        let config = DeviceConfig::new().with("host", "").with("port", 70000);
        assert_eq!(config.require_str("host"), Err(DeviceConfigError::Missing("host")));
        assert!(matches!(
            config.require_port("port"),
            Err(DeviceConfigError::Invalid { field: "port", .. })
        ));
        assert!(DeviceConfig::new().with("ip", "nope").opt_ip("ip").is_err());
    }

    #[test]
    fn test_json_shape_is_flat_map() {
        let config: DeviceConfig =
            serde_json::from_value(json!({"name": "deck", "host": "10.0.0.2"})).unwrap();
        assert_eq!(config.name(), Some("deck"));
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"host": "10.0.0.2", "name": "deck"})
        );
    }
}
