//! Fleet data model.
//!
//! Relations are plain ids; joins happen at the store boundary. Blobs the
//! devices report (settings, desired config, overrides) stay opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Devices ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// A managed device. MAC is the natural key and never mutates; IP may be
/// rewritten by discovery. Name, overrides and template assignments are
/// user-owned and survive discovery updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    pub firmware: String,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    /// Live settings blob last read from the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    /// Stored desired configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_config: Option<Value>,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default)]
    pub template_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a new device row is created from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDevice {
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub settings: Option<Value>,
}

// ── Discovery ───────────────────────────────────────────

/// Transient scan result. Many rows may reference one eventual Device;
/// the TTL sweep removes rows past `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: i64,
    pub mac: String,
    /// Which scanner produced the record (`http-scan`, `mdns`).
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub discovered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ── Templates ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Device-type selector this template applies to (empty = any).
    #[serde(default)]
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u8>,
    /// Inheritance parent. The chain must stay acyclic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    /// Variable name → type tag (`string`, `number`, `bool`).
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    pub body: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Drift ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftOp {
    Add,
    Remove,
    Change,
}

/// Fixed classification: security > network > feature > cosmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Security,
    Network,
    Feature,
    Cosmetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEntry {
    pub path: String,
    pub op: DriftOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    pub severity: DriftSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub id: i64,
    pub device_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<i64>,
    pub entries: Vec<DriftEntry>,
    /// Set when drift detection itself failed for this device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftSchedule {
    pub id: i64,
    pub name: String,
    /// Standard 5-field cron expression.
    pub cron: String,
    /// `all`, `device:<id>[,<id>…]`, or `tag:<tag>`.
    pub selector: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Sync audit ──────────────────────────────────────────

/// One export or import run, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: i64,
    pub plugin: String,
    pub format: String,
    pub success: bool,
    pub record_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
}

// ── Notifications ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Webhook,
    Slack,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Slack => "slack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(ChannelKind::Email),
            "webhook" => Some(ChannelKind::Webhook),
            "slack" => Some(ChannelKind::Slack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    /// Kind-specific settings (webhook url, smtp host, slack channel…).
    pub settings: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: i64,
    pub name: String,
    /// Event type this rule matches (`drift.detected`, `import.completed`…).
    pub event_type: String,
    pub channel_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<DriftSeverity>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
    pub channel_id: i64,
    pub event_type: String,
    pub payload: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [DeviceStatus::Online, DeviceStatus::Offline, DeviceStatus::Unknown] {
            assert_eq!(DeviceStatus::parse(s.as_str()), s);
        }
        assert_eq!(DeviceStatus::parse("garbage"), DeviceStatus::Unknown);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(DriftSeverity::Security < DriftSeverity::Network);
        assert!(DriftSeverity::Network < DriftSeverity::Feature);
        assert!(DriftSeverity::Feature < DriftSeverity::Cosmetic);
    }

    #[test]
    fn test_device_serializes_type_field() {
        let device = Device {
            id: 1,
            mac: "AABBCCDDEEFF".into(),
            ip: "192.168.1.10".into(),
            device_type: "SHSW-1".into(),
            name: "Living".into(),
            firmware: "1.0.0".into(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            settings: None,
            desired_config: None,
            applied: false,
            overrides: None,
            template_ids: vec![2, 3],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let v = serde_json::to_value(&device).unwrap();
        assert_eq!(v["type"], "SHSW-1");
        assert_eq!(v["status"], "online");
        assert_eq!(v["template_ids"], serde_json::json!([2, 3]));
    }
}
