//! Database backup plugin.
//!
//! Delegates to the store provider's backup capability: full snapshot to a
//! file, integrity validation, and restore. A validate-only import reports
//! record count and integrity without touching state.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::SharedStore;

use super::{
    Capabilities, ConfigProperty, ConfigSchema, ExportResult, ImportOptions, ImportResult,
    ImportSource, Plugin, PluginHealth, PluginInfo, PreviewFile, PreviewResult, SyncData,
    SyncPlugin,
};

pub struct BackupPlugin {
    store: SharedStore,
}

impl BackupPlugin {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn backup_provider(&self) -> Result<&dyn crate::store::BackupProvider> {
        self.store
            .backup_provider()
            .ok_or_else(|| Error::Plugin("store provider has no backup capability".into()))
    }
}

#[async_trait]
impl Plugin for BackupPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "backup".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Full database snapshot with integrity validation and restore".into(),
            category: "backup".into(),
            formats: vec!["sqlite".into()],
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
                description: "Snapshot file; defaults to the export directory".into(),
            },
        );
        schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_scheduling: true, ..Default::default() }
    }

    async fn health(&self) -> PluginHealth {
        match self.store.ping() {
            Ok(()) => PluginHealth::healthy(),
            Err(e) => PluginHealth::unhealthy(format!("store unavailable: {}", e)),
        }
    }
}

#[async_trait]
impl SyncPlugin for BackupPlugin {
    async fn export(&self, _data: &SyncData, cfg: &Value) -> Result<ExportResult> {
        let output_path = match cfg.get("output_path").and_then(Value::as_str) {
            Some(path) => path.to_string(),
            None => format!("backup-{}.db", Utc::now().format("%Y%m%d%H%M%S")),
        };
        let report = self.backup_provider()?.backup_to(std::path::Path::new(&output_path))?;
        if !report.integrity_ok {
            return Err(Error::Plugin(format!(
                "snapshot failed integrity check: {}",
                report.path
            )));
        }
        Ok(ExportResult {
            plugin: "backup".into(),
            format: "sqlite".into(),
            record_count: report.record_count,
            file_size: report.size_bytes,
            checksum: None,
            output_path: report.path,
            warnings: Vec::new(),
        })
    }

    async fn preview(&self, _data: &SyncData, cfg: &Value) -> Result<PreviewResult> {
        let stats = self.store.stats()?;
        let path = cfg
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or("backup.db")
            .to_string();
        let record_count = stats.device_count + stats.template_count;
        Ok(PreviewResult {
            files: vec![PreviewFile { path, size_bytes: stats.size_bytes }],
            record_count,
            summary: format!(
                "snapshot of {} ({} bytes on disk)",
                stats.path, stats.size_bytes
            ),
        })
    }

    async fn import(
        &self,
        source: &ImportSource,
        _cfg: &Value,
        opts: &ImportOptions,
    ) -> Result<ImportResult> {
        let ImportSource::File(path) = source else {
            return Err(Error::Validation("backup restore needs a snapshot file".into()));
        };
        let provider = self.backup_provider()?;

        let report = provider.validate_backup(path)?;
        let mut result = ImportResult::empty();
        result.warnings.push(format!(
            "snapshot {}: {} records, integrity {}",
            report.path,
            report.record_count,
            if report.integrity_ok { "ok" } else { "FAILED" }
        ));

        if !report.integrity_ok {
            result.success = false;
            result.errors.push("snapshot failed integrity check".into());
            return Ok(result);
        }
        if opts.validate_only || opts.dry_run {
            return Ok(result);
        }

        let restored = provider.restore_from(path)?;
        result.records_imported = restored;
        Ok(result)
    }
}
