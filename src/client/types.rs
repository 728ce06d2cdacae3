//! Wire and normalized types shared by both client generations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized device identity, derived from `/shelly` (Gen1) or
/// `Shelly.GetDeviceInfo` (Gen2+).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable device id, e.g. `shelly1-aabbccddeeff` or `shellyplusht-08b61fcb7f3c`.
    pub id: String,
    pub mac: String,
    pub model: String,
    pub generation: u8,
    pub firmware: String,
    pub auth_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
}

/// Body of `GET /shelly`. Gen1 reports `type`; Gen2+ reports `id` and `gen`.
#[derive(Debug, Deserialize)]
pub struct ProbeIdentity {
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub gen: Option<u8>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub auth: Option<bool>,
    #[serde(default)]
    pub auth_en: Option<bool>,
    #[serde(default)]
    pub fw: Option<String>,
    #[serde(default)]
    pub fw_id: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
}

impl ProbeIdentity {
    /// Gen1 devices may omit `gen` entirely.
    pub fn generation(&self) -> Option<u8> {
        match self.gen {
            Some(gen) => Some(gen),
            None if self.device_type.as_deref().is_some_and(|t| !t.is_empty()) => Some(1),
            None => None,
        }
    }

    pub fn firmware(&self) -> String {
        self.ver
            .clone()
            .or_else(|| self.fw.clone())
            .or_else(|| self.fw_id.clone())
            .unwrap_or_default()
    }
}

/// Gen2+ `Shelly.GetDeviceInfo` result.
#[derive(Debug, Deserialize)]
pub struct Gen2DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub id: String,
    pub mac: String,
    #[serde(default)]
    pub model: String,
    pub gen: u8,
    #[serde(default)]
    pub fw_id: String,
    #[serde(default)]
    pub ver: String,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub auth_en: bool,
}

/// Point-in-time power metrics, normalized across generations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_v: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_a: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_total_wh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

/// Per-channel energy counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyReading {
    pub channel: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_w: Option<f64>,
    pub total_wh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub has_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
}

// ── JSON-RPC envelope (Gen2+) ───────────────────────────

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub id: i64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_identity_gen1_without_gen_field() {
        let body = r#"{"type":"SHSW-25","mac":"AABBCCDDEEFF","auth":false,"fw":"20230913-112003"}"#;
        let probe: ProbeIdentity = serde_json::from_str(body).unwrap();
        assert_eq!(probe.generation(), Some(1));
        assert_eq!(probe.firmware(), "20230913-112003");
    }

    #[test]
    fn test_probe_identity_gen2() {
        let body = r#"{"id":"shellyplus1-a8032ab12cd4","mac":"A8032AB12CD4","gen":2,"ver":"1.0.3"}"#;
        let probe: ProbeIdentity = serde_json::from_str(body).unwrap();
        assert_eq!(probe.generation(), Some(2));
        assert_eq!(probe.firmware(), "1.0.3");
    }

    #[test]
    fn test_probe_identity_unknown() {
        let probe: ProbeIdentity = serde_json::from_str("{}").unwrap();
        assert_eq!(probe.generation(), None);
    }

    #[test]
    fn test_rpc_response_error_arm() {
        let body = r#"{"id":3,"error":{"code":401,"message":"Unauthorized"}}"#;
        let resp: RpcResponse = serde_json::from_str(body).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.as_ref().unwrap().code, 401);
    }
}
