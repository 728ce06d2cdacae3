//! Export/import plugin registry.
//!
//! The registry is a type-indexed map `type → (name → plugin)`. Every
//! plugin declares its info, a config schema, and capabilities; sync
//! plugins add export/preview/import. Registration publishes a plugin only
//! after `initialize` succeeds, and health checks aggregate across all of
//! them.

pub mod backup;
pub mod gitops;
pub mod sma;
pub mod structured;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ConfigTemplate, Device, DiscoveredDevice};

// ── Shared data view ────────────────────────────────────

/// The stable fleet view handed to sync plugins, explicitly ordered:
/// devices and templates sort by id, discovered rows by MAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncData {
    pub metadata: SyncMetadata,
    pub devices: Vec<Device>,
    pub templates: Vec<ConfigTemplate>,
    pub discovered_devices: Vec<DiscoveredDevice>,
    pub network_settings: Value,
    pub plugin_configurations: Value,
    pub system_settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub exported_at: DateTime<Utc>,
    pub manager_version: String,
    pub device_count: u64,
    pub template_count: u64,
}

impl SyncData {
    pub fn record_count(&self) -> u64 {
        (self.devices.len() + self.templates.len() + self.discovered_devices.len()) as u64
    }
}

// ── Plugin contracts ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Sync,
    Backup,
    Notification,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigProperty {
    #[serde(rename = "type")]
    pub prop_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigSchema {
    pub properties: BTreeMap<String, ConfigProperty>,
}

impl ConfigSchema {
    pub fn validate(&self, cfg: &Value) -> Result<()> {
        let obj = match cfg {
            Value::Null => return self.check_required(&serde_json::Map::new()),
            Value::Object(obj) => obj,
            _ => return Err(Error::Validation("plugin config must be an object".into())),
        };
        self.check_required(obj)?;
        for (key, value) in obj {
            let Some(prop) = self.properties.get(key) else { continue };
            let ok = match prop.prop_type.as_str() {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(Error::Validation(format!(
                    "config property '{}' must be a {}",
                    key, prop.prop_type
                )));
            }
            if let (Some(allowed), Some(s)) = (&prop.enum_values, value.as_str()) {
                if !allowed.iter().any(|a| a == s) {
                    return Err(Error::Validation(format!(
                        "config property '{}' must be one of {:?}",
                        key, allowed
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_required(&self, obj: &serde_json::Map<String, Value>) -> Result<()> {
        for (key, prop) in &self.properties {
            if prop.required && !obj.contains_key(key) {
                return Err(Error::Validation(format!("config property '{}' is required", key)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub supports_incremental: bool,
    pub supports_scheduling: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_data_size: Option<u64>,
    pub concurrency_level: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_incremental: false,
            supports_scheduling: true,
            max_data_size: None,
            concurrency_level: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginHealth {
    pub status: HealthStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl PluginHealth {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: "ok".into(), checked_at: Utc::now() }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: message.into(), checked_at: Utc::now() }
    }
}

// ── Sync results ────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ImportSource {
    File(PathBuf),
    Data(Vec<u8>),
}

impl ImportSource {
    /// Materialize the source bytes.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            ImportSource::File(path) => Ok(std::fs::read(path)?),
            ImportSource::Data(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub validate_only: bool,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub backup_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEntry {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub resource: String,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub success: bool,
    pub records_imported: u64,
    pub records_skipped: u64,
    pub changes: Vec<ChangeEntry>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ImportResult {
    pub fn empty() -> Self {
        Self {
            success: true,
            records_imported: 0,
            records_skipped: 0,
            changes: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub plugin: String,
    pub format: String,
    pub record_count: u64,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub output_path: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewFile {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub files: Vec<PreviewFile>,
    pub record_count: u64,
    pub summary: String,
}

// ── Traits ──────────────────────────────────────────────

#[async_trait]
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;
    fn config_schema(&self) -> ConfigSchema;
    fn capabilities(&self) -> Capabilities;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> PluginHealth {
        PluginHealth::healthy()
    }

    fn validate_config(&self, cfg: &Value) -> Result<()> {
        self.config_schema().validate(cfg)
    }
}

#[async_trait]
pub trait SyncPlugin: Plugin {
    async fn export(&self, data: &SyncData, cfg: &Value) -> Result<ExportResult>;
    async fn preview(&self, data: &SyncData, cfg: &Value) -> Result<PreviewResult>;
    async fn import(
        &self,
        source: &ImportSource,
        cfg: &Value,
        opts: &ImportOptions,
    ) -> Result<ImportResult>;
}

// ── Shared fleet upsert (used by the archive-shaped plugins) ──

/// Upsert templates by name: create when missing, update under
/// `force_overwrite`, otherwise skip. Dry runs only record changes.
pub(crate) fn upsert_templates(
    store: &crate::store::SharedStore,
    templates: &[ConfigTemplate],
    opts: &ImportOptions,
    result: &mut ImportResult,
) -> Result<()> {
    for template in templates {
        match store.get_template_by_name(&template.name)? {
            Some(current) => {
                if !opts.force_overwrite {
                    result.records_skipped += 1;
                    result.changes.push(ChangeEntry {
                        change_type: ChangeType::Skip,
                        resource: "template".into(),
                        resource_id: template.name.clone(),
                        old: None,
                        new: None,
                    });
                    continue;
                }
                if !opts.dry_run {
                    let mut updated = template.clone();
                    updated.id = current.id;
                    store.update_template(&updated)?;
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Update,
                    resource: "template".into(),
                    resource_id: template.name.clone(),
                    old: Some(Value::String(current.body.clone())),
                    new: Some(Value::String(template.body.clone())),
                });
            }
            None => {
                if !opts.dry_run {
                    store.insert_template(template)?;
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Create,
                    resource: "template".into(),
                    resource_id: template.name.clone(),
                    old: None,
                    new: None,
                });
            }
        }
    }
    Ok(())
}

/// Upsert devices by MAC with the same create/update/skip semantics.
pub(crate) fn upsert_devices(
    store: &crate::store::SharedStore,
    devices: &[Device],
    opts: &ImportOptions,
    result: &mut ImportResult,
) -> Result<()> {
    for device in devices {
        match store.get_device_by_mac(&device.mac)? {
            Some(current) => {
                if !opts.force_overwrite {
                    result.records_skipped += 1;
                    result.changes.push(ChangeEntry {
                        change_type: ChangeType::Skip,
                        resource: "device".into(),
                        resource_id: device.mac.clone(),
                        old: None,
                        new: None,
                    });
                    continue;
                }
                if !opts.dry_run {
                    store.update_device(
                        current.id,
                        &crate::store::DeviceUpdate {
                            name: Some(device.name.clone()),
                            ip: Some(device.ip.clone()),
                            device_type: Some(device.device_type.clone()),
                            firmware: Some(device.firmware.clone()),
                            status: None,
                            settings: device.settings.clone(),
                            overrides: device.overrides.clone(),
                            template_ids: Some(device.template_ids.clone()),
                        },
                    )?;
                    if let Some(desired) = &device.desired_config {
                        store.set_desired_config(current.id, desired)?;
                    }
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Update,
                    resource: "device".into(),
                    resource_id: device.mac.clone(),
                    old: Some(Value::String(current.name.clone())),
                    new: Some(Value::String(device.name.clone())),
                });
            }
            None => {
                if !opts.dry_run {
                    let created = store.insert_device(&crate::model::NewDevice {
                        mac: device.mac.clone(),
                        ip: device.ip.clone(),
                        device_type: device.device_type.clone(),
                        name: device.name.clone(),
                        firmware: device.firmware.clone(),
                        settings: device.settings.clone(),
                    })?;
                    if let Some(desired) = &device.desired_config {
                        store.set_desired_config(created.id, desired)?;
                    }
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Create,
                    resource: "device".into(),
                    resource_id: device.mac.clone(),
                    old: None,
                    new: None,
                });
            }
        }
    }
    Ok(())
}

// ── Registry ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unavailable: usize,
    pub unknown: usize,
    pub plugins: BTreeMap<String, PluginHealth>,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<PluginType, HashMap<String, Arc<dyn SyncPlugin>>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register after a successful `initialize`. Duplicate `(type, name)`
    /// and empty names are rejected.
    pub async fn register(&self, plugin_type: PluginType, plugin: Arc<dyn SyncPlugin>) -> Result<()> {
        let name = plugin.info().name;
        if name.is_empty() {
            return Err(Error::Validation("plugin name must not be empty".into()));
        }
        {
            let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
            if plugins.get(&plugin_type).is_some_and(|m| m.contains_key(&name)) {
                return Err(Error::Conflict(format!(
                    "plugin '{}' already registered for {:?}",
                    name, plugin_type
                )));
            }
        }

        plugin
            .initialize()
            .await
            .map_err(|e| Error::Plugin(format!("plugin '{}' failed to initialize: {}", name, e)))?;

        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        let by_name = plugins.entry(plugin_type).or_default();
        if by_name.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "plugin '{}' already registered for {:?}",
                name, plugin_type
            )));
        }
        tracing::info!(plugin = %name, "registered plugin");
        by_name.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, plugin_type: PluginType, name: &str) -> Option<Arc<dyn SyncPlugin>> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.get(&plugin_type).and_then(|m| m.get(name)).cloned()
    }

    pub fn list(&self) -> Vec<(PluginType, PluginInfo)> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<(PluginType, PluginInfo)> = plugins
            .iter()
            .flat_map(|(t, m)| m.values().map(|p| (*t, p.info())))
            .collect();
        all.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        all
    }

    /// Poll every plugin's health and aggregate.
    pub async fn health_check(&self) -> HealthSummary {
        let snapshot: Vec<(String, Arc<dyn SyncPlugin>)> = {
            let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
            plugins
                .values()
                .flat_map(|m| m.iter().map(|(n, p)| (n.clone(), p.clone())))
                .collect()
        };

        let mut summary = HealthSummary {
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unavailable: 0,
            unknown: 0,
            plugins: BTreeMap::new(),
        };
        for (name, plugin) in snapshot {
            let health = plugin.health().await;
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            summary.plugins.insert(name, health);
        }
        summary
    }
}
