//! Configuration drift detection.
//!
//! Both sides are normalized (volatile, device-managed fields dropped; map
//! keys already sort under serde_json) and compared semantically: numbers
//! within tolerance are equal, booleans match their string spellings.
//! Severity is a fixed classification of the drifted path.

use serde_json::{Map, Value};

use crate::model::{DriftEntry, DriftOp, DriftSeverity};

/// Fields the device mutates on its own; never drift.
const VOLATILE_KEYS: &[&str] = &[
    "uptime",
    "time",
    "unixtime",
    "ram_free",
    "ram_total",
    "ram_size",
    "fs_free",
    "fs_size",
    "cfg_rev",
    "nonce",
    "session",
    "serial",
    "rssi",
    "apower",
    "voltage",
    "current",
    "aenergy",
    "temperature",
    "by_minute",
    "minute_ts",
    "has_update",
    "new_version",
    "available_updates",
];

const RELATIVE_TOLERANCE: f64 = 1e-6;

/// Strip volatile fields recursively. serde_json objects iterate in key
/// order, so the result is canonical.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if VOLATILE_KEYS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), normalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Semantic equality: numeric tolerance, boolean/string equivalence,
/// numeric strings equal their numbers.
pub fn semantically_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => {
                let scale = x.abs().max(y.abs()).max(1.0);
                (x - y).abs() <= RELATIVE_TOLERANCE * scale
            }
            _ => x == y,
        },
        (Value::Bool(b1), Value::String(s)) | (Value::String(s), Value::Bool(b1)) => {
            matches!(
                (b1, s.to_ascii_lowercase().as_str()),
                (true, "true") | (true, "on") | (false, "false") | (false, "off")
            )
        }
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            matches!((s.parse::<f64>(), n.as_f64()), (Ok(parsed), Some(num))
                if {
                    let scale = parsed.abs().max(num.abs()).max(1.0);
                    (parsed - num).abs() <= RELATIVE_TOLERANCE * scale
                })
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| semantically_equal(v, w)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(v, w)| semantically_equal(v, w))
        }
        (x, y) => x == y,
    }
}

/// Fixed severity classification: security > network > feature > cosmetic.
pub fn classify_severity(path: &str) -> DriftSeverity {
    let lower = path.to_ascii_lowercase();
    let head = lower.split(['.', ':']).next().unwrap_or("");

    const SECURITY: &[&str] = &["auth", "login", "password", "user", "key", "token", "https"];
    const NETWORK: &[&str] = &["wifi", "wifi_sta", "wifi_ap", "ap", "eth", "mqtt", "cloud", "ws", "sntp", "dns", "static_ip"];
    const COSMETIC: &[&str] = &["name", "led", "display", "ui", "night_mode"];

    if SECURITY.iter().any(|k| head == *k || lower.contains(&format!(".{}", k))) {
        return DriftSeverity::Security;
    }
    if NETWORK.iter().any(|k| head == *k) {
        return DriftSeverity::Network;
    }
    if COSMETIC.iter().any(|k| head == *k || lower.ends_with(&format!(".{}", k))) {
        return DriftSeverity::Cosmetic;
    }
    DriftSeverity::Feature
}

/// Structured semantic diff between desired and live configuration.
/// Both inputs should already be normalized.
pub fn diff(desired: &Value, live: &Value) -> Vec<DriftEntry> {
    let mut entries = Vec::new();
    walk("", desired, live, &mut entries);
    entries
}

fn push(entries: &mut Vec<DriftEntry>, path: &str, op: DriftOp, old: Option<&Value>, new: Option<&Value>) {
    entries.push(DriftEntry {
        path: path.to_string(),
        op,
        old: old.cloned(),
        new: new.cloned(),
        severity: classify_severity(path),
    });
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn walk(prefix: &str, desired: &Value, live: &Value, entries: &mut Vec<DriftEntry>) {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            for (key, want_value) in want {
                let path = child_path(prefix, key);
                match have.get(key) {
                    Some(have_value) => walk(&path, want_value, have_value, entries),
                    None => push(entries, &path, DriftOp::Remove, Some(want_value), None),
                }
            }
            for (key, have_value) in have {
                if !want.contains_key(key) {
                    let path = child_path(prefix, key);
                    push(entries, &path, DriftOp::Add, None, Some(have_value));
                }
            }
        }
        (Value::Array(want), Value::Array(have)) => {
            let shared = want.len().min(have.len());
            for i in 0..shared {
                walk(&child_path(prefix, &i.to_string()), &want[i], &have[i], entries);
            }
            for (i, missing) in want.iter().enumerate().skip(shared) {
                push(
                    entries,
                    &child_path(prefix, &i.to_string()),
                    DriftOp::Remove,
                    Some(missing),
                    None,
                );
            }
            for (i, extra) in have.iter().enumerate().skip(shared) {
                push(
                    entries,
                    &child_path(prefix, &i.to_string()),
                    DriftOp::Add,
                    None,
                    Some(extra),
                );
            }
        }
        (want, have) => {
            if !semantically_equal(want, have) {
                push(entries, prefix, DriftOp::Change, Some(want), Some(have));
            }
        }
    }
}

/// Normalize both sides and diff them.
pub fn detect(desired: &Value, live: &Value) -> Vec<DriftEntry> {
    diff(&normalize(desired), &normalize(live))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_drops_volatile() {
        let raw = json!({
            "wifi": {"ssid": "lab", "rssi": -60},
            "uptime": 4711,
            "sys": {"time": "12:00", "name": "x"}
        });
        let normalized = normalize(&raw);
        assert!(normalized.get("uptime").is_none());
        assert!(normalized["wifi"].get("rssi").is_none());
        assert!(normalized["sys"].get("time").is_none());
        assert_eq!(normalized["sys"]["name"], "x");
    }

    #[test]
    fn test_semantic_number_tolerance() {
        assert!(semantically_equal(&json!(1.0), &json!(1.0 + 1e-9)));
        assert!(!semantically_equal(&json!(1.0), &json!(1.1)));
        assert!(semantically_equal(&json!(1000000.0), &json!(1000000.5)));
    }

    #[test]
    fn test_semantic_bool_string() {
        assert!(semantically_equal(&json!(true), &json!("true")));
        assert!(semantically_equal(&json!("off"), &json!(false)));
        assert!(!semantically_equal(&json!(true), &json!("false")));
    }

    #[test]
    fn test_semantic_numeric_string() {
        assert!(semantically_equal(&json!("42"), &json!(42)));
        assert!(!semantically_equal(&json!("42a"), &json!(42)));
    }

    #[test]
    fn test_diff_change_remove_add() {
        let desired = json!({"wifi": {"ssid": "lab"}, "mqtt": {"enable": true}});
        let live = json!({"wifi": {"ssid": "guest"}, "ble": {"enable": true}});
        let entries = detect(&desired, &live);

        let change = entries.iter().find(|e| e.path == "wifi.ssid").unwrap();
        assert_eq!(change.op, DriftOp::Change);
        assert_eq!(change.severity, DriftSeverity::Network);

        let removed = entries.iter().find(|e| e.path == "mqtt").unwrap();
        assert_eq!(removed.op, DriftOp::Remove);

        let added = entries.iter().find(|e| e.path == "ble").unwrap();
        assert_eq!(added.op, DriftOp::Add);
        assert_eq!(added.new, Some(json!({"enable": true})));
    }

    #[test]
    fn test_diff_empty_when_equivalent() {
        let desired = json!({"relay": {"auto_off": true, "timeout": 30}});
        let live = json!({"relay": {"auto_off": "true", "timeout": 30.0000001}, "uptime": 5});
        assert!(detect(&desired, &live).is_empty());
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(classify_severity("auth.enabled"), DriftSeverity::Security);
        assert_eq!(classify_severity("login.username"), DriftSeverity::Security);
        assert_eq!(classify_severity("wifi.ssid"), DriftSeverity::Network);
        assert_eq!(classify_severity("mqtt.server"), DriftSeverity::Network);
        assert_eq!(classify_severity("relay.auto_off"), DriftSeverity::Feature);
        assert_eq!(classify_severity("name"), DriftSeverity::Cosmetic);
        assert_eq!(classify_severity("sys.device.name"), DriftSeverity::Cosmetic);
    }

    #[test]
    fn test_nested_auth_is_security() {
        assert_eq!(classify_severity("sys.auth.enabled"), DriftSeverity::Security);
    }

    #[test]
    fn test_array_diff_by_index() {
        let desired = json!({"relays": [{"ison": true}, {"ison": false}]});
        let live = json!({"relays": [{"ison": true}]});
        let entries = detect(&desired, &live);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "relays.1");
        assert_eq!(entries[0].op, DriftOp::Remove);
    }
}
