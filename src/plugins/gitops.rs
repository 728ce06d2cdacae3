//! GitOps plugin: a YAML directory tree fit for committing to a repo.
//!
//! Layout: `common.yaml`, `groups/<group>/group.yaml`,
//! `groups/<group>/<type>/common.yaml`, `groups/<group>/<type>/<slug>.yaml`,
//! `templates/<name>.yaml`, `export-summary.yaml`. Grouping is by
//! location (keyword match on the device name), type, or custom (first
//! device tag). Import is the inverse walk with the same grouping
//! semantics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ConfigTemplate, Device, NewDevice};
use crate::store::{DeviceUpdate, SharedStore};

use super::{
    Capabilities, ChangeEntry, ChangeType, ConfigProperty, ConfigSchema, ExportResult,
    ImportOptions, ImportResult, ImportSource, Plugin, PluginHealth, PluginInfo, PreviewFile,
    PreviewResult, SyncData, SyncPlugin,
};

const LOCATION_KEYWORDS: &[&str] = &[
    "living", "kitchen", "bedroom", "bathroom", "garage", "office", "hallway", "basement",
    "attic", "outdoor", "garden", "dining", "laundry", "balcony", "porch", "entry", "cellar",
];

/// Lowercase, `[a-z0-9-]`, other characters become `-`, runs collapse,
/// trimmed, capped at 63 chars; empty falls back to "shelly-device".
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(63).collect();
    let trimmed = trimmed.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "shelly-device".to_string()
    } else {
        trimmed
    }
}

/// Keyword-matched location from a device name.
pub fn extract_location(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    LOCATION_KEYWORDS.iter().find(|k| lower.contains(*k)).copied()
}

/// Per-device YAML document; also the unit the import walk parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GitopsDevice {
    name: String,
    mac: String,
    #[serde(default)]
    ip: String,
    #[serde(rename = "type", default)]
    device_type: String,
    #[serde(default)]
    firmware: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    desired_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    overrides: Option<Value>,
}

impl From<&Device> for GitopsDevice {
    fn from(d: &Device) -> Self {
        Self {
            name: d.name.clone(),
            mac: d.mac.clone(),
            ip: d.ip.clone(),
            device_type: d.device_type.clone(),
            firmware: d.firmware.clone(),
            desired_config: d.desired_config.clone(),
            overrides: d.overrides.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GitopsTemplate {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "device_type", default)]
    device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation: Option<u8>,
    #[serde(default)]
    variables: serde_json::Map<String, Value>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    is_default: bool,
}

pub struct GitopsPlugin {
    store: SharedStore,
}

impl GitopsPlugin {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn group_of(&self, device: &Device, group_by: &str) -> String {
        match group_by {
            "type" => sanitize_filename(&device.device_type),
            "custom" => self
                .store
                .device_tags(device.id)
                .ok()
                .and_then(|tags| tags.into_iter().next())
                .map(|tag| sanitize_filename(&tag))
                .unwrap_or_else(|| "ungrouped".to_string()),
            // location is the default
            _ => extract_location(&device.name)
                .map(String::from)
                .unwrap_or_else(|| "ungrouped".to_string()),
        }
    }

    /// Materialize the whole tree as (relative path, content) pairs.
    fn render_tree(&self, data: &SyncData, cfg: &Value) -> Result<Vec<(PathBuf, String)>> {
        let group_by = cfg.get("group_by").and_then(Value::as_str).unwrap_or("location");
        if !matches!(group_by, "location" | "type" | "custom") {
            return Err(Error::Validation(format!("unknown group_by '{}'", group_by)));
        }

        let mut files: Vec<(PathBuf, String)> = Vec::new();

        let common = serde_json::json!({
            "manager_version": data.metadata.manager_version,
            "exported_at": data.metadata.exported_at.to_rfc3339(),
            "defaults": {
                "wifi_password": "{{ secret \"wifi_password\" }}",
                "mqtt_password": "{{ secret \"mqtt_password\" }}",
                "admin_password": "{{ secret \"admin_password\" }}",
            },
        });
        files.push((PathBuf::from("common.yaml"), to_yaml(&common)?));

        // group → type-slug → devices
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<&Device>>> = BTreeMap::new();
        for device in &data.devices {
            let group = self.group_of(device, group_by);
            let type_slug = sanitize_filename(&device.device_type);
            grouped.entry(group).or_default().entry(type_slug).or_default().push(device);
        }

        for (group, types) in &grouped {
            let device_count: usize = types.values().map(Vec::len).sum();
            let group_doc = serde_json::json!({"name": group, "device_count": device_count});
            files.push((
                PathBuf::from("groups").join(group).join("group.yaml"),
                to_yaml(&group_doc)?,
            ));

            for (type_slug, devices) in types {
                let type_doc = serde_json::json!({
                    "type": devices[0].device_type,
                    "device_count": devices.len(),
                });
                files.push((
                    PathBuf::from("groups").join(group).join(type_slug).join("common.yaml"),
                    to_yaml(&type_doc)?,
                ));
                for device in devices {
                    let slug = sanitize_filename(&device.name);
                    files.push((
                        PathBuf::from("groups")
                            .join(group)
                            .join(type_slug)
                            .join(format!("{}.yaml", slug)),
                        to_yaml(&GitopsDevice::from(*device))?,
                    ));
                }
            }
        }

        for template in &data.templates {
            let doc = GitopsTemplate {
                name: template.name.clone(),
                description: template.description.clone(),
                device_type: template.device_type.clone(),
                generation: template.generation,
                variables: template.variables.clone(),
                body: template.body.clone(),
                is_default: template.is_default,
            };
            files.push((
                PathBuf::from("templates").join(format!("{}.yaml", sanitize_filename(&template.name))),
                to_yaml(&doc)?,
            ));
        }

        let summary = serde_json::json!({
            "exported_at": data.metadata.exported_at.to_rfc3339(),
            "group_by": group_by,
            "groups": grouped.keys().collect::<Vec<_>>(),
            "device_count": data.devices.len(),
            "template_count": data.templates.len(),
            "file_count": files.len() + 1,
            "files": files.iter().map(|(p, _)| p.display().to_string()).collect::<Vec<_>>(),
        });
        files.push((PathBuf::from("export-summary.yaml"), to_yaml(&summary)?));

        Ok(files)
    }

    fn import_device(&self, doc: &GitopsDevice, opts: &ImportOptions, result: &mut ImportResult) -> Result<()> {
        if doc.mac.is_empty() {
            result.warnings.push(format!("device '{}' has no mac, skipped", doc.name));
            result.records_skipped += 1;
            return Ok(());
        }
        match self.store.get_device_by_mac(&doc.mac)? {
            Some(current) => {
                if !opts.force_overwrite {
                    result.records_skipped += 1;
                    result.changes.push(ChangeEntry {
                        change_type: ChangeType::Skip,
                        resource: "device".into(),
                        resource_id: doc.mac.clone(),
                        old: None,
                        new: None,
                    });
                    return Ok(());
                }
                if !opts.dry_run {
                    self.store.update_device(
                        current.id,
                        &DeviceUpdate {
                            name: Some(doc.name.clone()),
                            ip: Some(doc.ip.clone()),
                            device_type: Some(doc.device_type.clone()),
                            firmware: Some(doc.firmware.clone()),
                            status: None,
                            settings: None,
                            overrides: doc.overrides.clone(),
                            template_ids: None,
                        },
                    )?;
                    if let Some(desired) = &doc.desired_config {
                        self.store.set_desired_config(current.id, desired)?;
                    }
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Update,
                    resource: "device".into(),
                    resource_id: doc.mac.clone(),
                    old: Some(Value::String(current.name.clone())),
                    new: Some(Value::String(doc.name.clone())),
                });
            }
            None => {
                if !opts.dry_run {
                    let created = self.store.insert_device(&NewDevice {
                        mac: doc.mac.clone(),
                        ip: doc.ip.clone(),
                        device_type: doc.device_type.clone(),
                        name: doc.name.clone(),
                        firmware: doc.firmware.clone(),
                        settings: None,
                    })?;
                    if let Some(desired) = &doc.desired_config {
                        self.store.set_desired_config(created.id, desired)?;
                    }
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Create,
                    resource: "device".into(),
                    resource_id: doc.mac.clone(),
                    old: None,
                    new: None,
                });
            }
        }
        Ok(())
    }

    fn import_template(
        &self,
        doc: &GitopsTemplate,
        opts: &ImportOptions,
        result: &mut ImportResult,
    ) -> Result<()> {
        let incoming = ConfigTemplate {
            id: 0,
            name: doc.name.clone(),
            description: doc.description.clone(),
            device_type: doc.device_type.clone(),
            generation: doc.generation,
            parent_id: None,
            variables: doc.variables.clone(),
            body: doc.body.clone(),
            is_default: doc.is_default,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match self.store.get_template_by_name(&doc.name)? {
            Some(current) => {
                if !opts.force_overwrite {
                    result.records_skipped += 1;
                    result.changes.push(ChangeEntry {
                        change_type: ChangeType::Skip,
                        resource: "template".into(),
                        resource_id: doc.name.clone(),
                        old: None,
                        new: None,
                    });
                    return Ok(());
                }
                if !opts.dry_run {
                    let mut updated = incoming;
                    updated.id = current.id;
                    self.store.update_template(&updated)?;
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Update,
                    resource: "template".into(),
                    resource_id: doc.name.clone(),
                    old: None,
                    new: None,
                });
            }
            None => {
                if !opts.dry_run {
                    self.store.insert_template(&incoming)?;
                }
                result.records_imported += 1;
                result.changes.push(ChangeEntry {
                    change_type: ChangeType::Create,
                    resource: "template".into(),
                    resource_id: doc.name.clone(),
                    old: None,
                    new: None,
                });
            }
        }
        Ok(())
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_yaml::to_string(value)?)
}

#[async_trait]
impl Plugin for GitopsPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "gitops".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Grouped YAML tree for committing fleet state to Git".into(),
            category: "gitops".into(),
            formats: vec!["yaml-tree".into()],
        }
    }

    fn config_schema(&self) -> ConfigSchema {
        let mut schema = ConfigSchema::default();
        schema.properties.insert(
            "output_path".into(),
            ConfigProperty {
                prop_type: "string".into(),
                required: true,
                default: None,
                enum_values: None,
                description: "Root directory of the generated tree".into(),
            },
        );
        schema.properties.insert(
            "group_by".into(),
            ConfigProperty {
                prop_type: "string".into(),
                required: false,
                default: Some(Value::String("location".into())),
                enum_values: Some(vec!["location".into(), "type".into(), "custom".into()]),
                description: "Device grouping strategy".into(),
            },
        );
        schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_incremental: true, ..Default::default() }
    }

    async fn health(&self) -> PluginHealth {
        PluginHealth::healthy()
    }
}

#[async_trait]
impl SyncPlugin for GitopsPlugin {
    async fn export(&self, data: &SyncData, cfg: &Value) -> Result<ExportResult> {
        let root = cfg
            .get("output_path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("output_path is required".into()))?;
        let files = self.render_tree(data, cfg)?;

        let mut total_bytes = 0u64;
        for (relative, content) in &files {
            let path = Path::new(root).join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content)?;
            total_bytes += content.len() as u64;
        }
        tracing::info!(root, files = files.len(), "wrote GitOps tree");

        Ok(ExportResult {
            plugin: "gitops".into(),
            format: "yaml-tree".into(),
            record_count: (data.devices.len() + data.templates.len()) as u64,
            file_size: total_bytes,
            checksum: None,
            output_path: root.to_string(),
            warnings: Vec::new(),
        })
    }

    async fn preview(&self, data: &SyncData, cfg: &Value) -> Result<PreviewResult> {
        let files = self.render_tree(data, cfg)?;
        Ok(PreviewResult {
            record_count: (data.devices.len() + data.templates.len()) as u64,
            summary: format!("{} files across {} devices", files.len(), data.devices.len()),
            files: files
                .into_iter()
                .map(|(path, content)| PreviewFile {
                    path: path.display().to_string(),
                    size_bytes: content.len() as u64,
                })
                .collect(),
        })
    }

    /// Inverse walk: templates first, then device leaves under `groups/`.
    async fn import(
        &self,
        source: &ImportSource,
        _cfg: &Value,
        opts: &ImportOptions,
    ) -> Result<ImportResult> {
        let ImportSource::File(root) = source else {
            return Err(Error::Validation("gitops import needs a directory path".into()));
        };
        if !root.is_dir() {
            return Err(Error::Validation(format!(
                "gitops import root '{}' is not a directory",
                root.display()
            )));
        }

        let mut result = ImportResult::empty();

        let templates_dir = root.join("templates");
        if templates_dir.is_dir() {
            for entry in sorted_yaml_files(&templates_dir)? {
                let raw = std::fs::read_to_string(&entry)?;
                match serde_yaml::from_str::<GitopsTemplate>(&raw) {
                    Ok(doc) => self.import_template(&doc, opts, &mut result)?,
                    Err(e) => result
                        .errors
                        .push(format!("{}: {}", entry.display(), e)),
                }
            }
        }

        let groups_dir = root.join("groups");
        if groups_dir.is_dir() {
            for group in sorted_dirs(&groups_dir)? {
                for type_dir in sorted_dirs(&group)? {
                    for entry in sorted_yaml_files(&type_dir)? {
                        if entry.file_name().is_some_and(|n| n == "common.yaml") {
                            continue;
                        }
                        let raw = std::fs::read_to_string(&entry)?;
                        match serde_yaml::from_str::<GitopsDevice>(&raw) {
                            Ok(doc) => self.import_device(&doc, opts, &mut result)?,
                            Err(e) => result
                                .errors
                                .push(format!("{}: {}", entry.display(), e)),
                        }
                    }
                }
            }
        }

        result.success = result.errors.is_empty();
        Ok(result)
    }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn sorted_yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::plugins::SyncMetadata;
    use crate::store::SqliteProvider;
    use std::sync::Arc;

    fn store() -> SharedStore {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        Arc::new(provider)
    }

    fn device(name: &str, mac: &str, device_type: &str) -> Device {
        Device {
            id: 0,
            mac: mac.into(),
            ip: format!("10.0.1.{}", mac.as_bytes()[0]),
            device_type: device_type.into(),
            name: name.into(),
            firmware: "1.0".into(),
            status: crate::model::DeviceStatus::Online,
            last_seen: Utc::now(),
            settings: None,
            desired_config: None,
            applied: false,
            overrides: None,
            template_ids: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sync_data(devices: Vec<Device>) -> SyncData {
        SyncData {
            metadata: SyncMetadata {
                exported_at: Utc::now(),
                manager_version: "test".into(),
                device_count: devices.len() as u64,
                template_count: 0,
            },
            devices,
            templates: vec![],
            discovered_devices: vec![],
            network_settings: serde_json::json!({}),
            plugin_configurations: serde_json::json!({}),
            system_settings: serde_json::json!({}),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Living Room Light"), "living-room-light");
        assert_eq!(sanitize_filename("SHSW-1"), "shsw-1");
        assert_eq!(sanitize_filename("--weird__name--"), "weird-name");
        assert_eq!(sanitize_filename("???"), "shelly-device");
        assert_eq!(sanitize_filename(""), "shelly-device");
        let long = "x".repeat(100);
        assert_eq!(sanitize_filename(&long).len(), 63);
    }

    #[test]
    fn test_extract_location() {
        assert_eq!(extract_location("Living Room Light"), Some("living"));
        assert_eq!(extract_location("KITCHEN switch"), Some("kitchen"));
        assert_eq!(extract_location("Mystery Device"), None);
    }

    #[tokio::test]
    async fn test_export_tree_layout_for_two_devices() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fleet");
        let plugin = GitopsPlugin::new(store());
        let data = sync_data(vec![
            device("Living Room Light", "AA", "SHSW-1"),
            device("Kitchen Switch", "BB", "SHSW-1"),
        ]);
        let cfg = serde_json::json!({
            "output_path": root.to_string_lossy(),
            "group_by": "location",
        });

        let result = plugin.export(&data, &cfg).await.unwrap();
        assert_eq!(result.record_count, 2);

        for expected in [
            "common.yaml",
            "groups/living/group.yaml",
            "groups/living/shsw-1/common.yaml",
            "groups/living/shsw-1/living-room-light.yaml",
            "groups/kitchen/group.yaml",
            "groups/kitchen/shsw-1/common.yaml",
            "groups/kitchen/shsw-1/kitchen-switch.yaml",
            "export-summary.yaml",
        ] {
            assert!(root.join(expected).exists(), "missing {}", expected);
        }

        let preview = plugin.preview(&data, &cfg).await.unwrap();
        assert!(preview.files.len() >= 6);
    }

    #[tokio::test]
    async fn test_unmatched_device_lands_in_ungrouped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fleet");
        let plugin = GitopsPlugin::new(store());
        let data = sync_data(vec![device("Mystery Device", "AA", "SHPLG-S")]);
        let cfg = serde_json::json!({"output_path": root.to_string_lossy()});
        plugin.export(&data, &cfg).await.unwrap();
        assert!(root.join("groups/ungrouped/shplg-s/mystery-device.yaml").exists());
    }

    #[tokio::test]
    async fn test_group_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fleet");
        let plugin = GitopsPlugin::new(store());
        let data = sync_data(vec![device("Living Plug", "AA", "SHPLG-S")]);
        let cfg = serde_json::json!({
            "output_path": root.to_string_lossy(),
            "group_by": "type",
        });
        plugin.export(&data, &cfg).await.unwrap();
        assert!(root.join("groups/shplg-s/shplg-s/living-plug.yaml").exists());
    }

    #[tokio::test]
    async fn test_import_is_inverse_of_export() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fleet");
        let exporter = GitopsPlugin::new(store());
        let mut living = device("Living Room Light", "AA", "SHSW-1");
        living.desired_config = Some(serde_json::json!({"relay": {"auto_off": true}}));
        let data = sync_data(vec![living, device("Kitchen Switch", "BB", "SHSW-1")]);
        let cfg = serde_json::json!({"output_path": root.to_string_lossy()});
        exporter.export(&data, &cfg).await.unwrap();

        let target = store();
        let importer = GitopsPlugin::new(target.clone());

        // Dry run first: all creates, nothing written.
        let preview = importer
            .import(
                &ImportSource::File(root.clone()),
                &cfg,
                &ImportOptions { dry_run: true, ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(preview.records_imported, 2);
        assert!(preview.changes.iter().all(|c| c.change_type == ChangeType::Create));
        assert!(target.list_devices().unwrap().is_empty());

        let outcome = importer
            .import(&ImportSource::File(root), &cfg, &ImportOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.records_imported, 2);
        let restored = target.get_device_by_mac("AA").unwrap().unwrap();
        assert_eq!(restored.name, "Living Room Light");
        assert_eq!(
            restored.desired_config,
            Some(serde_json::json!({"relay": {"auto_off": true}}))
        );
    }
}
