//! Typed vs raw device configuration.
//!
//! The raw blob mirrors whatever the device exposes; the typed model names
//! the sections we reason about (WiFi, MQTT, Auth, System, Network, Cloud).
//! Conversions are total on the intersection and unknown keys ride along
//! in `extra`, so raw→typed→raw loses nothing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudConfig>,
    /// Keys the typed model does not name, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eco_mode: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `dhcp` or `static`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw blob → typed model. Unknown keys land in `extra`.
pub fn raw_to_typed(raw: &Value) -> Result<TypedConfig> {
    Ok(serde_json::from_value(raw.clone())?)
}

/// Typed model → raw blob, including everything `extra` carried.
pub fn typed_to_raw(typed: &TypedConfig) -> Result<Value> {
    Ok(serde_json::to_value(typed)?)
}

/// Map a live device config into the canonical typed shape. Gen1 exposes
/// `wifi_sta`/`login`; Gen2+ nests under `wifi.sta` and `sys.device`.
pub fn normalize_device_config(raw: &Value, generation: u8) -> TypedConfig {
    let mut typed = TypedConfig::default();
    if generation == 1 {
        if let Some(sta) = raw.get("wifi_sta") {
            typed.wifi = Some(WifiConfig {
                enabled: sta.get("enabled").and_then(Value::as_bool),
                ssid: str_field(sta, "ssid"),
                password: None,
                ip: str_field(sta, "ip"),
                netmask: str_field(sta, "mask"),
                gateway: str_field(sta, "gw"),
                extra: Map::new(),
            });
        }
        if let Some(mqtt) = raw.get("mqtt") {
            typed.mqtt = Some(MqttConfig {
                enabled: mqtt.get("enable").and_then(Value::as_bool),
                server: str_field(mqtt, "server"),
                user: str_field(mqtt, "user"),
                client_id: str_field(mqtt, "id"),
                extra: Map::new(),
            });
        }
        if let Some(login) = raw.get("login") {
            typed.auth = Some(AuthConfig {
                enabled: login.get("enabled").and_then(Value::as_bool),
                username: str_field(login, "username"),
                extra: Map::new(),
            });
        }
        typed.system = Some(SystemConfig {
            name: str_field(raw, "name"),
            timezone: str_field(raw, "timezone"),
            lat: raw.get("lat").and_then(Value::as_f64),
            lng: raw.get("lng").and_then(Value::as_f64),
            eco_mode: raw.get("eco_mode_enabled").and_then(Value::as_bool),
            extra: Map::new(),
        });
        if let Some(cloud) = raw.get("cloud") {
            typed.cloud = Some(CloudConfig {
                enabled: cloud.get("enabled").and_then(Value::as_bool),
                server: str_field(cloud, "server"),
                extra: Map::new(),
            });
        }
    } else {
        if let Some(sta) = raw.get("wifi").and_then(|w| w.get("sta")) {
            typed.wifi = Some(WifiConfig {
                enabled: sta.get("enable").and_then(Value::as_bool),
                ssid: str_field(sta, "ssid"),
                password: None,
                ip: str_field(sta, "ip"),
                netmask: str_field(sta, "netmask"),
                gateway: str_field(sta, "gw"),
                extra: Map::new(),
            });
        }
        if let Some(mqtt) = raw.get("mqtt") {
            typed.mqtt = Some(MqttConfig {
                enabled: mqtt.get("enable").and_then(Value::as_bool),
                server: str_field(mqtt, "server"),
                user: str_field(mqtt, "user"),
                client_id: str_field(mqtt, "client_id"),
                extra: Map::new(),
            });
        }
        if let Some(device) = raw.get("sys").and_then(|s| s.get("device")) {
            typed.system = Some(SystemConfig {
                name: str_field(device, "name"),
                timezone: raw
                    .get("sys")
                    .and_then(|s| s.get("location"))
                    .and_then(|l| l.get("tz"))
                    .and_then(Value::as_str)
                    .map(String::from),
                lat: None,
                lng: None,
                eco_mode: device.get("eco_mode").and_then(Value::as_bool),
                extra: Map::new(),
            });
        }
        if let Some(cloud) = raw.get("cloud") {
            typed.cloud = Some(CloudConfig {
                enabled: cloud.get("enable").and_then(Value::as_bool),
                server: str_field(cloud, "server"),
                extra: Map::new(),
            });
        }
    }
    typed
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// JSON-schema-like introspection document, enough to drive a form.
pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "wifi": {
                "type": "object",
                "description": "Station WiFi settings",
                "properties": {
                    "enabled": {"type": "boolean"},
                    "ssid": {"type": "string"},
                    "password": {"type": "string", "writeOnly": true},
                    "ip": {"type": "string", "format": "ipv4"},
                    "netmask": {"type": "string"},
                    "gateway": {"type": "string", "format": "ipv4"}
                }
            },
            "mqtt": {
                "type": "object",
                "description": "MQTT uplink",
                "properties": {
                    "enabled": {"type": "boolean"},
                    "server": {"type": "string"},
                    "user": {"type": "string"},
                    "client_id": {"type": "string"}
                }
            },
            "auth": {
                "type": "object",
                "description": "Local HTTP authentication",
                "properties": {
                    "enabled": {"type": "boolean"},
                    "username": {"type": "string"}
                }
            },
            "system": {
                "type": "object",
                "description": "Device identity and locale",
                "properties": {
                    "name": {"type": "string"},
                    "timezone": {"type": "string"},
                    "lat": {"type": "number"},
                    "lng": {"type": "number"},
                    "eco_mode": {"type": "boolean"}
                }
            },
            "network": {
                "type": "object",
                "description": "Static IPv4 overrides",
                "properties": {
                    "ipv4_method": {"type": "string", "enum": ["dhcp", "static"]},
                    "ip": {"type": "string", "format": "ipv4"},
                    "netmask": {"type": "string"},
                    "gateway": {"type": "string", "format": "ipv4"},
                    "dns": {"type": "string"}
                }
            },
            "cloud": {
                "type": "object",
                "description": "Shelly cloud uplink",
                "properties": {
                    "enabled": {"type": "boolean"},
                    "server": {"type": "string"}
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_raw_round_trip_identity() {
        let typed = TypedConfig {
            wifi: Some(WifiConfig {
                enabled: Some(true),
                ssid: Some("lab".into()),
                ..Default::default()
            }),
            system: Some(SystemConfig { name: Some("Living".into()), ..Default::default() }),
            ..Default::default()
        };
        let raw = typed_to_raw(&typed).unwrap();
        let back = raw_to_typed(&raw).unwrap();
        assert_eq!(typed, back);
    }

    #[test]
    fn test_raw_round_trip_preserves_unknown_keys() {
        let raw = json!({
            "wifi": {"ssid": "lab", "roaming": {"rssi_thr": -80}},
            "ble": {"enable": true},
            "fw_mode": "stable"
        });
        let typed = raw_to_typed(&raw).unwrap();
        // Unknown top-level keys live in extra.
        assert!(typed.extra.contains_key("ble"));
        assert!(typed.extra.contains_key("fw_mode"));
        // Unknown nested keys survive inside the section.
        let wifi = typed.wifi.as_ref().unwrap();
        assert!(wifi.extra.contains_key("roaming"));

        let back = typed_to_raw(&typed).unwrap();
        assert_eq!(back["ble"], raw["ble"]);
        assert_eq!(back["wifi"]["roaming"], raw["wifi"]["roaming"]);
        assert_eq!(back["wifi"]["ssid"], "lab");
    }

    #[test]
    fn test_normalize_gen1() {
        let raw = json!({
            "name": "kitchen",
            "timezone": "Europe/Sofia",
            "wifi_sta": {"enabled": true, "ssid": "lab", "ip": "10.0.0.5"},
            "login": {"enabled": true, "username": "admin"},
            "mqtt": {"enable": false, "server": "10.0.0.2:1883"}
        });
        let typed = normalize_device_config(&raw, 1);
        assert_eq!(typed.wifi.as_ref().unwrap().ssid.as_deref(), Some("lab"));
        assert_eq!(typed.auth.as_ref().unwrap().enabled, Some(true));
        assert_eq!(typed.system.as_ref().unwrap().name.as_deref(), Some("kitchen"));
        assert_eq!(typed.mqtt.as_ref().unwrap().enabled, Some(false));
    }

    #[test]
    fn test_normalize_gen2() {
        let raw = json!({
            "wifi": {"sta": {"enable": true, "ssid": "lab"}},
            "sys": {"device": {"name": "garage", "eco_mode": true},
                     "location": {"tz": "Europe/Sofia"}},
            "cloud": {"enable": false}
        });
        let typed = normalize_device_config(&raw, 2);
        assert_eq!(typed.wifi.as_ref().unwrap().ssid.as_deref(), Some("lab"));
        assert_eq!(typed.system.as_ref().unwrap().name.as_deref(), Some("garage"));
        assert_eq!(typed.system.as_ref().unwrap().timezone.as_deref(), Some("Europe/Sofia"));
        assert_eq!(typed.cloud.as_ref().unwrap().enabled, Some(false));
    }

    #[test]
    fn test_schema_lists_all_sections() {
        let doc = schema();
        let props = doc["properties"].as_object().unwrap();
        for section in ["wifi", "mqtt", "auth", "system", "network", "cloud"] {
            assert!(props.contains_key(section), "missing {}", section);
        }
    }
}
