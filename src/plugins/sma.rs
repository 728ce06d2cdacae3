//! SMA (Shelly Manager Archive) plugin.
//!
//! A gzip-compressed, version-tagged JSON document with an integrity
//! block. The canonical serialization is serde_json pretty printing
//! (2-space indent, struct declaration order); the checksum is SHA-256
//! over that canonical form with the checksum field cleared, and it is a
//! hard gate on import.

use std::io::{Read, Write};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{ConfigTemplate, Device, DiscoveredDevice};
use crate::store::SharedStore;

use super::{
    Capabilities, ConfigProperty, ConfigSchema, ExportResult, ImportOptions, ImportResult,
    ImportSource, Plugin, PluginHealth, PluginInfo, PreviewFile, PreviewResult, SyncData,
    SyncPlugin,
};

pub const SMA_VERSION: &str = "1.0";
pub const FORMAT_VERSION: &str = "2024.1";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ── Archive document ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmaArchive {
    pub sma_version: String,
    pub format_version: String,
    pub metadata: SmaMetadata,
    pub devices: Vec<Device>,
    pub templates: Vec<ConfigTemplate>,
    pub discovered_devices: Vec<DiscoveredDevice>,
    pub network_settings: Value,
    pub plugin_configurations: Value,
    pub system_settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmaMetadata {
    pub export_id: String,
    pub created_at: String,
    pub export_type: String,
    pub system_info: SystemInfo,
    pub integrity: Integrity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub database_type: String,
    pub hostname: String,
    pub total_size_bytes: u64,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integrity {
    /// `sha256:<hex>` over the canonical form with this field empty.
    pub checksum: String,
    pub record_count: u64,
    pub file_count: u64,
}

/// Canonical serialization: 2-space pretty JSON in struct order.
pub fn canonical_json(archive: &SmaArchive) -> Result<String> {
    Ok(serde_json::to_string_pretty(archive)?)
}

/// `sha256:<hex>` over the canonical form with the checksum cleared.
pub fn compute_checksum(archive: &SmaArchive) -> Result<String> {
    let mut cleared = archive.clone();
    cleared.metadata.integrity.checksum = String::new();
    let canon = canonical_json(&cleared)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(canon.as_bytes()))))
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip_if_needed(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Build a sealed archive from the fleet view.
pub fn build_archive(data: &SyncData, hostname: &str) -> Result<SmaArchive> {
    let mut archive = SmaArchive {
        sma_version: SMA_VERSION.to_string(),
        format_version: FORMAT_VERSION.to_string(),
        metadata: SmaMetadata {
            export_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339(),
            export_type: "full".to_string(),
            system_info: SystemInfo {
                version: env!("CARGO_PKG_VERSION").to_string(),
                database_type: "sqlite".to_string(),
                hostname: hostname.to_string(),
                total_size_bytes: 0,
                compression_ratio: 0.0,
            },
            integrity: Integrity {
                checksum: String::new(),
                record_count: data.record_count(),
                file_count: 1,
            },
        },
        devices: data.devices.clone(),
        templates: data.templates.clone(),
        discovered_devices: data.discovered_devices.clone(),
        network_settings: data.network_settings.clone(),
        plugin_configurations: data.plugin_configurations.clone(),
        system_settings: data.system_settings.clone(),
    };

    // Size and ratio are estimated from the pre-checksum form.
    let first_pass = canonical_json(&archive)?;
    archive.metadata.system_info.total_size_bytes = first_pass.len() as u64;
    let compressed = gzip(first_pass.as_bytes())?;
    archive.metadata.system_info.compression_ratio =
        (compressed.len() as f64 / first_pass.len() as f64 * 1000.0).round() / 1000.0;

    archive.metadata.integrity.checksum = compute_checksum(&archive)?;
    Ok(archive)
}

/// Parse and verify an archive. Version, record count and checksum are
/// all hard gates.
pub fn open_archive(bytes: &[u8]) -> Result<SmaArchive> {
    let raw = gunzip_if_needed(bytes)?;
    let archive: SmaArchive = serde_json::from_slice(&raw)
        .map_err(|e| Error::Validation(format!("not a valid SMA document: {}", e)))?;

    if archive.sma_version != SMA_VERSION {
        return Err(Error::UnsupportedArchiveVersion(archive.sma_version));
    }
    if archive.metadata.export_id.is_empty() {
        return Err(Error::Validation("archive metadata is empty".into()));
    }

    let declared = archive.metadata.integrity.record_count;
    let found = (archive.devices.len()
        + archive.templates.len()
        + archive.discovered_devices.len()) as u64;
    if declared != found {
        return Err(Error::RecordCountMismatch { declared, found });
    }

    let expected = archive.metadata.integrity.checksum.clone();
    let actual = compute_checksum(&archive)?;
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(archive)
}

// ── Plugin ──────────────────────────────────────────────

pub struct SmaPlugin {
    store: SharedStore,
}

impl SmaPlugin {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Apply archive contents: templates before devices, both upserted
    /// by their natural keys.
    fn apply(&self, archive: &SmaArchive, opts: &ImportOptions) -> Result<ImportResult> {
        let mut result = ImportResult::empty();
        super::upsert_templates(&self.store, &archive.templates, opts, &mut result)?;
        super::upsert_devices(&self.store, &archive.devices, opts, &mut result)?;
        Ok(result)
    }
}

#[async_trait]
impl Plugin for SmaPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "sma".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Shelly Manager Archive — integrity-checked gzip JSON fleet snapshot".into(),
            category: "archive".into(),
            formats: vec!["sma".into()],
        }
    }

    fn config_schema(&self) -> ConfigSchema {
        let mut schema = ConfigSchema::default();
        schema.properties.insert(
            "output_path".into(),
            ConfigProperty {
                prop_type: "string".into(),
                required: false,
                default: None,
                enum_values: None,
                description: "Target file; defaults to the export directory".into(),
            },
        );
        schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_incremental: false, supports_scheduling: true, ..Default::default() }
    }

    async fn health(&self) -> PluginHealth {
        match self.store.ping() {
            Ok(()) => PluginHealth::healthy(),
            Err(e) => PluginHealth::unhealthy(format!("store unavailable: {}", e)),
        }
    }
}

#[async_trait]
impl SyncPlugin for SmaPlugin {
    async fn export(&self, data: &SyncData, cfg: &Value) -> Result<ExportResult> {
        let output_path = cfg
            .get("output_path")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("output_path is required".into()))?;

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "shelly-manager".into());
        let archive = build_archive(data, &hostname)?;
        let canonical = canonical_json(&archive)?;
        let compressed = gzip(canonical.as_bytes())?;

        let path = Path::new(output_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &compressed)?;
        tracing::info!(
            path = %path.display(),
            records = archive.metadata.integrity.record_count,
            bytes = compressed.len(),
            "wrote SMA archive"
        );

        Ok(ExportResult {
            plugin: "sma".into(),
            format: "sma".into(),
            record_count: archive.metadata.integrity.record_count,
            file_size: compressed.len() as u64,
            checksum: Some(archive.metadata.integrity.checksum.clone()),
            output_path: path.display().to_string(),
            warnings: Vec::new(),
        })
    }

    async fn preview(&self, data: &SyncData, cfg: &Value) -> Result<PreviewResult> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "shelly-manager".into());
        let archive = build_archive(data, &hostname)?;
        let canonical = canonical_json(&archive)?;
        let compressed = gzip(canonical.as_bytes())?;
        let path = cfg
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or("fleet.sma")
            .to_string();
        Ok(PreviewResult {
            files: vec![PreviewFile { path, size_bytes: compressed.len() as u64 }],
            record_count: archive.metadata.integrity.record_count,
            summary: format!(
                "{} devices, {} templates, {} discovered",
                archive.devices.len(),
                archive.templates.len(),
                archive.discovered_devices.len()
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
        let archive = open_archive(&bytes)?;

        if opts.validate_only {
            let mut result = ImportResult::empty();
            result.warnings.push(format!(
                "archive valid: {} records, checksum {}",
                archive.metadata.integrity.record_count, archive.metadata.integrity.checksum
            ));
            return Ok(result);
        }

        self.apply(&archive, opts)
    }
}
