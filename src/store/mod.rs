//! Persistence adapter.
//!
//! A capability trait (`Provider`) fronts the database so the concrete
//! engine is a mechanical swap. All mutations flow through the provider,
//! which serializes writers and logs one structured record per operation.

mod sqlite;

pub use sqlite::SqliteProvider;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::model::{
    ConfigTemplate, Device, DiscoveredDevice, DriftReport, DriftSchedule, NewDevice,
    NotificationChannel, NotificationEvent, NotificationRule, SyncHistory,
};

/// Shared handle the rest of the crate holds.
pub type SharedStore = Arc<dyn Provider>;

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub provider: String,
    pub path: String,
    pub size_bytes: u64,
    pub device_count: u64,
    pub template_count: u64,
    pub drift_report_count: u64,
}

/// Integrity summary for a backup file.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub path: String,
    pub size_bytes: u64,
    pub record_count: u64,
    pub integrity_ok: bool,
}

/// Partial update for user-editable and discovery-updatable device fields.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub ip: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub firmware: Option<String>,
    pub status: Option<crate::model::DeviceStatus>,
    pub settings: Option<Value>,
    pub overrides: Option<Value>,
    pub template_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigHistoryEntry {
    pub id: i64,
    pub device_id: i64,
    pub config: Value,
    /// Where the config came from (`user`, `template`, `import`, `device`).
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftTrendBucket {
    pub day: String,
    pub reports: u64,
    pub unresolved: u64,
}

/// Optional point-in-time backup capability.
pub trait BackupProvider: Send + Sync {
    fn backup_to(&self, path: &std::path::Path) -> Result<BackupReport>;
    fn validate_backup(&self, path: &std::path::Path) -> Result<BackupReport>;
    fn restore_from(&self, path: &std::path::Path) -> Result<u64>;
}

/// The persistence capability contract. Synchronous by design: the SQLite
/// engine serializes writers anyway, and every caller owns a request-scoped
/// deadline above this layer.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn migrate(&self) -> Result<()>;
    fn ping(&self) -> Result<()>;
    fn stats(&self) -> Result<StoreStats>;
    fn backup_provider(&self) -> Option<&dyn BackupProvider>;

    // ── Devices ─────────────────────────────────────────
    fn list_devices(&self) -> Result<Vec<Device>>;
    fn get_device(&self, id: i64) -> Result<Device>;
    fn get_device_by_mac(&self, mac: &str) -> Result<Option<Device>>;
    fn insert_device(&self, device: &NewDevice) -> Result<Device>;
    fn update_device(&self, id: i64, update: &DeviceUpdate) -> Result<Device>;
    fn delete_device(&self, id: i64) -> Result<bool>;
    /// Insert-or-update keyed by MAC. Existing rows only take ip, type,
    /// firmware, status and last_seen; user fields are preserved.
    fn upsert_device_from_discovery(
        &self,
        found: &DiscoveredDevice,
        fallback_name: &str,
    ) -> Result<Device>;
    fn set_desired_config(&self, id: i64, config: &Value) -> Result<()>;
    fn set_applied(&self, id: i64, applied: bool) -> Result<()>;
    fn set_device_settings(&self, id: i64, settings: &Value) -> Result<()>;
    fn append_config_history(&self, device_id: i64, config: &Value, source: &str) -> Result<()>;
    fn list_config_history(&self, device_id: i64, limit: usize) -> Result<Vec<ConfigHistoryEntry>>;

    // ── Tags ────────────────────────────────────────────
    fn device_tags(&self, device_id: i64) -> Result<Vec<String>>;
    fn add_device_tag(&self, device_id: i64, tag: &str) -> Result<()>;
    fn remove_device_tag(&self, device_id: i64, tag: &str) -> Result<bool>;
    fn devices_by_tag(&self, tag: &str) -> Result<Vec<Device>>;

    // ── Discovery ───────────────────────────────────────
    fn insert_discovered(&self, record: &DiscoveredDevice) -> Result<i64>;
    /// Rows still inside their TTL at `now`.
    fn list_discovered(&self, now: DateTime<Utc>) -> Result<Vec<DiscoveredDevice>>;
    fn cleanup_expired_discovered(&self, now: DateTime<Utc>) -> Result<u64>;

    // ── Templates ───────────────────────────────────────
    fn list_templates(&self) -> Result<Vec<ConfigTemplate>>;
    fn get_template(&self, id: i64) -> Result<ConfigTemplate>;
    fn get_template_by_name(&self, name: &str) -> Result<Option<ConfigTemplate>>;
    fn insert_template(&self, template: &ConfigTemplate) -> Result<ConfigTemplate>;
    fn update_template(&self, template: &ConfigTemplate) -> Result<ConfigTemplate>;
    fn delete_template(&self, id: i64) -> Result<bool>;

    // ── Drift schedules & reports ───────────────────────
    fn list_drift_schedules(&self) -> Result<Vec<DriftSchedule>>;
    fn get_drift_schedule(&self, id: i64) -> Result<DriftSchedule>;
    fn insert_drift_schedule(&self, schedule: &DriftSchedule) -> Result<DriftSchedule>;
    fn update_drift_schedule(&self, schedule: &DriftSchedule) -> Result<DriftSchedule>;
    fn delete_drift_schedule(&self, id: i64) -> Result<bool>;
    fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<bool>;
    fn set_schedule_runs(
        &self,
        id: i64,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn insert_drift_report(&self, report: &DriftReport) -> Result<DriftReport>;
    fn list_drift_reports(
        &self,
        device_id: Option<i64>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<DriftReport>>;
    fn resolve_drift_report(&self, id: i64, note: &str) -> Result<bool>;
    /// (total, unresolved)
    fn drift_counts(&self) -> Result<(u64, u64)>;
    fn drift_trends(&self, days: u32) -> Result<Vec<DriftTrendBucket>>;

    // ── Sync audit ──────────────────────────────────────
    fn append_sync_history(&self, kind: &str, entry: &SyncHistory) -> Result<()>;
    fn list_sync_history(&self, kind: &str, limit: usize) -> Result<Vec<SyncHistory>>;

    // ── Notifications ───────────────────────────────────
    fn list_channels(&self) -> Result<Vec<NotificationChannel>>;
    fn get_channel(&self, id: i64) -> Result<NotificationChannel>;
    fn insert_channel(&self, channel: &NotificationChannel) -> Result<NotificationChannel>;
    fn delete_channel(&self, id: i64) -> Result<bool>;
    fn list_rules(&self) -> Result<Vec<NotificationRule>>;
    fn rules_for_event(&self, event_type: &str) -> Result<Vec<NotificationRule>>;
    fn insert_rule(&self, rule: &NotificationRule) -> Result<NotificationRule>;
    fn delete_rule(&self, id: i64) -> Result<bool>;
    fn append_notification_event(&self, event: &NotificationEvent) -> Result<()>;
    fn list_notification_events(&self, limit: usize) -> Result<Vec<NotificationEvent>>;

    // ── Settings (opaque key/value, used by archive export) ──
    fn get_setting(&self, key: &str) -> Result<Option<Value>>;
    fn set_setting(&self, key: &str, value: &Value) -> Result<()>;
    fn all_settings(&self) -> Result<serde_json::Map<String, Value>>;

    /// (total, online, offline)
    fn device_counts(&self) -> Result<(u64, u64, u64)>;
}

/// Choose and open a provider from config. The `sqlite` provider is the
/// default; when no provider flags are set the legacy single-file path is
/// used as the DSN.
pub fn open(cfg: &DatabaseConfig) -> Result<SharedStore> {
    let provider_name = if cfg.provider.is_empty() { "sqlite" } else { cfg.provider.as_str() };
    match provider_name {
        "sqlite" => {
            let path = if let Some(dsn) = &cfg.dsn {
                PathBuf::from(dsn)
            } else {
                cfg.path.clone()
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let provider = SqliteProvider::open(&path, cfg.slow_query_ms)?;
            provider.migrate()?;
            tracing::info!(path = %path.display(), "opened sqlite store");
            Ok(Arc::new(provider))
        }
        "postgres" => Err(Error::Storage(
            "provider 'postgres' is not available in this build".to_string(),
        )),
        other => Err(Error::Storage(format!("unknown database provider '{}'", other))),
    }
}
