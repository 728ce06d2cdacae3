//! JSON and YAML sync plugins.
//!
//! Both marshal the stable `{metadata, devices, templates}` view with
//! explicit ordering, support `none | gzip | zip` compression, and emit a
//! SHA-256 checksum of the uncompressed payload as a sidecar.

use std::io::{Read, Write};
use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{ConfigTemplate, Device};
use crate::store::SharedStore;

use super::{
    Capabilities, ConfigProperty, ConfigSchema, ExportResult, ImportOptions, ImportResult,
    ImportSource, Plugin, PluginHealth, PluginInfo, PreviewFile, PreviewResult, SyncData,
    SyncMetadata, SyncPlugin,
};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredFormat {
    Json,
    Yaml,
}

impl StructuredFormat {
    fn name(&self) -> &'static str {
        match self {
            StructuredFormat::Json => "json",
            StructuredFormat::Yaml => "yaml",
        }
    }
}

/// The stable export view: devices and templates ordered by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StructuredExport {
    metadata: SyncMetadata,
    devices: Vec<Device>,
    templates: Vec<ConfigTemplate>,
}

pub struct StructuredPlugin {
    format: StructuredFormat,
    store: SharedStore,
}

impl StructuredPlugin {
    pub fn json(store: SharedStore) -> Self {
        Self { format: StructuredFormat::Json, store }
    }

    pub fn yaml(store: SharedStore) -> Self {
        Self { format: StructuredFormat::Yaml, store }
    }

    fn serialize(&self, data: &SyncData) -> Result<String> {
        let mut view = StructuredExport {
            metadata: data.metadata.clone(),
            devices: data.devices.clone(),
            templates: data.templates.clone(),
        };
        view.devices.sort_by_key(|d| d.id);
        view.templates.sort_by_key(|t| t.id);
        match self.format {
            StructuredFormat::Json => Ok(serde_json::to_string_pretty(&view)?),
            StructuredFormat::Yaml => Ok(serde_yaml::to_string(&view)?),
        }
    }

    fn parse(&self, payload: &[u8]) -> Result<StructuredExport> {
        match self.format {
            StructuredFormat::Json => serde_json::from_slice(payload).map_err(|e| {
                Error::Validation(format!("not a valid JSON export: {}", e))
            }),
            StructuredFormat::Yaml => serde_yaml::from_slice(payload).map_err(|e| {
                Error::Validation(format!("not a valid YAML export: {}", e))
            }),
        }
    }

    fn compress(&self, payload: &[u8], mode: &str) -> Result<(Vec<u8>, &'static str)> {
        match mode {
            "none" => Ok((payload.to_vec(), "")),
            "gzip" => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(payload)?;
                Ok((encoder.finish()?, ".gz"))
            }
            "zip" => {
                let cursor = std::io::Cursor::new(Vec::new());
                let mut writer = zip::ZipWriter::new(cursor);
                writer
                    .start_file(
                        format!("export.{}", self.format.name()),
                        zip::write::SimpleFileOptions::default(),
                    )
                    .map_err(|e| Error::Plugin(format!("zip write failed: {}", e)))?;
                writer.write_all(payload)?;
                let cursor = writer
                    .finish()
                    .map_err(|e| Error::Plugin(format!("zip finish failed: {}", e)))?;
                Ok((cursor.into_inner(), ".zip"))
            }
            other => Err(Error::Validation(format!("unknown compression '{}'", other))),
        }
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() >= 4 && bytes[..4] == ZIP_MAGIC {
            let cursor = std::io::Cursor::new(bytes);
            let mut archive = zip::ZipArchive::new(cursor)
                .map_err(|e| Error::Validation(format!("bad zip archive: {}", e)))?;
            if archive.is_empty() {
                return Err(Error::Validation("zip archive is empty".into()));
            }
            let mut file = archive
                .by_index(0)
                .map_err(|e| Error::Validation(format!("bad zip entry: {}", e)))?;
            let mut out = Vec::new();
            file.read_to_end(&mut out)?;
            return Ok(out);
        }
        if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            return Ok(out);
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Plugin for StructuredPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.format.name().to_string(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: format!("Fleet export as {} with optional compression", self.format.name()),
            category: "structured".into(),
            formats: vec![self.format.name().to_string()],
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
                description: "Target file path".into(),
            },
        );
        schema.properties.insert(
            "compression".into(),
            ConfigProperty {
                prop_type: "string".into(),
                required: false,
                default: Some(Value::String("none".into())),
                enum_values: Some(vec!["none".into(), "gzip".into(), "zip".into()]),
                description: "Payload compression".into(),
            },
        );
        schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn health(&self) -> PluginHealth {
        match self.store.ping() {
            Ok(()) => PluginHealth::healthy(),
            Err(e) => PluginHealth::unhealthy(format!("store unavailable: {}", e)),
        }
    }
}

#[async_trait]
impl SyncPlugin for StructuredPlugin {
    async fn export(&self, data: &SyncData, cfg: &Value) -> Result<ExportResult> {
        let output_path = cfg
            .get("output_path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("output_path is required".into()))?;
        let mode = cfg.get("compression").and_then(Value::as_str).unwrap_or("none");

        let payload = self.serialize(data)?;
        let checksum = hex::encode(Sha256::digest(payload.as_bytes()));
        let (bytes, suffix) = self.compress(payload.as_bytes(), mode)?;

        let path = format!("{}{}", output_path, suffix);
        let path = Path::new(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &bytes)?;
        std::fs::write(format!("{}.sha256", path.display()), &checksum)?;
        tracing::info!(
            path = %path.display(),
            format = self.format.name(),
            compression = mode,
            bytes = bytes.len(),
            "wrote structured export"
        );

        Ok(ExportResult {
            plugin: self.format.name().to_string(),
            format: self.format.name().to_string(),
            record_count: (data.devices.len() + data.templates.len()) as u64,
            file_size: bytes.len() as u64,
            checksum: Some(format!("sha256:{}", checksum)),
            output_path: path.display().to_string(),
            warnings: Vec::new(),
        })
    }

    async fn preview(&self, data: &SyncData, cfg: &Value) -> Result<PreviewResult> {
        let mode = cfg.get("compression").and_then(Value::as_str).unwrap_or("none");
        let payload = self.serialize(data)?;
        let (bytes, suffix) = self.compress(payload.as_bytes(), mode)?;
        let path = format!(
            "{}{}",
            cfg.get("output_path").and_then(Value::as_str).unwrap_or("fleet"),
            suffix
        );
        Ok(PreviewResult {
            files: vec![PreviewFile { path, size_bytes: bytes.len() as u64 }],
            record_count: (data.devices.len() + data.templates.len()) as u64,
            summary: format!(
                "{} devices, {} templates as {}",
                data.devices.len(),
                data.templates.len(),
                self.format.name()
            ),
        })
    }

    async fn import(
        &self,
        source: &ImportSource,
        _cfg: &Value,
        opts: &ImportOptions,
    ) -> Result<ImportResult> {
        let bytes = source.bytes()?;
        let payload = self.decompress(&bytes)?;
        let view = self.parse(&payload)?;

        if opts.validate_only {
            let mut result = ImportResult::empty();
            result.warnings.push(format!(
                "payload valid: {} devices, {} templates",
                view.devices.len(),
                view.templates.len()
            ));
            return Ok(result);
        }

        let mut result = ImportResult::empty();
        super::upsert_templates(&self.store, &view.templates, opts, &mut result)?;
        super::upsert_devices(&self.store, &view.devices, opts, &mut result)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::store::SqliteProvider;
    use chrono::Utc;
    use std::sync::Arc;

    fn store() -> SharedStore {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        Arc::new(provider)
    }

    fn sync_data() -> SyncData {
        let device = Device {
            id: 1,
            mac: "AABB".into(),
            ip: "10.0.0.1".into(),
            device_type: "SHSW-1".into(),
            name: "Living".into(),
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
        };
        SyncData {
            metadata: SyncMetadata {
                exported_at: Utc::now(),
                manager_version: "test".into(),
                device_count: 1,
                template_count: 0,
            },
            devices: vec![device],
            templates: vec![],
            discovered_devices: vec![],
            network_settings: serde_json::json!({}),
            plugin_configurations: serde_json::json!({}),
            system_settings: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_json_export_with_sidecar_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fleet.json");
        let plugin = StructuredPlugin::json(store());
        let cfg = serde_json::json!({"output_path": out.to_string_lossy()});

        let result = plugin.export(&sync_data(), &cfg).await.unwrap();
        assert_eq!(result.record_count, 1);
        assert!(out.exists());

        let payload = std::fs::read(&out).unwrap();
        let sidecar =
            std::fs::read_to_string(format!("{}.sha256", out.display())).unwrap();
        assert_eq!(sidecar, hex::encode(Sha256::digest(&payload)));
        assert_eq!(result.checksum.unwrap(), format!("sha256:{}", sidecar));
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fleet.json");
        let plugin = StructuredPlugin::json(store());
        let cfg = serde_json::json!({
            "output_path": out.to_string_lossy(),
            "compression": "gzip",
        });
        plugin.export(&sync_data(), &cfg).await.unwrap();

        let compressed = dir.path().join("fleet.json.gz");
        assert!(compressed.exists());

        let target = store();
        let importer = StructuredPlugin::json(target.clone());
        let outcome = importer
            .import(
                &ImportSource::File(compressed),
                &serde_json::json!({}),
                &ImportOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.records_imported, 1);
        assert_eq!(target.list_devices().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fleet.yaml");
        let plugin = StructuredPlugin::yaml(store());
        let cfg = serde_json::json!({
            "output_path": out.to_string_lossy(),
            "compression": "zip",
        });
        plugin.export(&sync_data(), &cfg).await.unwrap();

        let compressed = dir.path().join("fleet.yaml.zip");
        assert!(compressed.exists());

        let target = store();
        let importer = StructuredPlugin::yaml(target.clone());
        let outcome = importer
            .import(
                &ImportSource::File(compressed),
                &serde_json::json!({}),
                &ImportOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.records_imported, 1);
    }

    #[tokio::test]
    async fn test_yaml_validate_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("fleet.yaml");
        let plugin = StructuredPlugin::yaml(store());
        let cfg = serde_json::json!({"output_path": out.to_string_lossy()});
        plugin.export(&sync_data(), &cfg).await.unwrap();

        let target = store();
        let importer = StructuredPlugin::yaml(target.clone());
        let outcome = importer
            .import(
                &ImportSource::File(out),
                &serde_json::json!({}),
                &ImportOptions { validate_only: true, ..Default::default() },
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.warnings[0].contains("1 devices"));
        assert!(target.list_devices().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_compression_rejected() {
        let plugin = StructuredPlugin::json(store());
        let cfg = serde_json::json!({"output_path": "/tmp/x", "compression": "rar"});
        assert!(matches!(
            plugin.export(&sync_data(), &cfg).await,
            Err(Error::Validation(_))
        ));
    }
}
