//! Export/import engine.
//!
//! Delegates to registered plugins by name, resolves the three source
//! kinds (file, url, data), snapshots the fleet view for exporters, and
//! records every run in the audit history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::model::SyncHistory;
use crate::notify::Notifier;
use crate::plugins::{
    ExportResult, ImportOptions, ImportResult, ImportSource, PluginRegistry, PluginType,
    PreviewResult, SyncData, SyncMetadata,
};
use crate::store::SharedStore;

/// How an import body names its payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    File { path: String },
    Url { url: String },
    Data { data: String },
}

pub struct SyncEngine {
    store: SharedStore,
    registry: Arc<PluginRegistry>,
    notifier: Arc<Notifier>,
    output_dir: PathBuf,
    http: reqwest::Client,
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        registry: Arc<PluginRegistry>,
        notifier: Arc<Notifier>,
        output_dir: PathBuf,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self { store, registry, notifier, output_dir, http })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    fn plugin(&self, name: &str) -> Result<Arc<dyn crate::plugins::SyncPlugin>> {
        self.registry
            .get(PluginType::Sync, name)
            .or_else(|| self.registry.get(PluginType::Backup, name))
            .ok_or(Error::NotFound { resource: "plugin", id: name.to_string() })
    }

    /// Snapshot the fleet in stable order for exporters.
    pub fn collect_data(&self) -> Result<SyncData> {
        let mut devices = self.store.list_devices()?;
        devices.sort_by_key(|d| d.id);
        let mut templates = self.store.list_templates()?;
        templates.sort_by_key(|t| t.id);
        let mut discovered = self.store.list_discovered(Utc::now())?;
        discovered.sort_by(|a, b| a.mac.cmp(&b.mac));

        let network_settings =
            self.store.get_setting("network")?.unwrap_or_else(|| json!({}));
        let plugin_configurations =
            self.store.get_setting("plugins")?.unwrap_or_else(|| json!({}));
        let system_settings = Value::Object(self.store.all_settings()?);

        Ok(SyncData {
            metadata: SyncMetadata {
                exported_at: Utc::now(),
                manager_version: env!("CARGO_PKG_VERSION").to_string(),
                device_count: devices.len() as u64,
                template_count: templates.len() as u64,
            },
            devices,
            templates,
            discovered_devices: discovered,
            network_settings,
            plugin_configurations,
            system_settings,
        })
    }

    /// Default output file for a plugin when the caller names none.
    fn default_output_path(&self, plugin_name: &str, format: &str) -> PathBuf {
        let extension = match format {
            "sma" => "sma",
            "json" => "json",
            "yaml" => "yaml",
            "sqlite" => "db",
            // directory-shaped outputs
            _ => "",
        };
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        if extension.is_empty() {
            self.output_dir.join(format!("{}-{}", plugin_name, stamp))
        } else {
            self.output_dir.join(format!("{}-{}.{}", plugin_name, stamp, extension))
        }
    }

    fn with_output_path(&self, plugin_name: &str, format: &str, cfg: Value) -> Value {
        let mut cfg = match cfg {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => return other,
        };
        if !cfg.contains_key("output_path") {
            cfg.insert(
                "output_path".to_string(),
                Value::String(
                    self.default_output_path(plugin_name, format).display().to_string(),
                ),
            );
        }
        Value::Object(cfg)
    }

    pub async fn export(
        &self,
        plugin_name: &str,
        cfg: Value,
        requested_by: &str,
    ) -> Result<ExportResult> {
        let plugin = self.plugin(plugin_name)?;
        let info = plugin.info();
        let format = info.formats.first().cloned().unwrap_or_default();
        let cfg = self.with_output_path(plugin_name, &format, cfg);
        plugin.validate_config(&cfg)?;

        let data = self.collect_data()?;
        let started = Instant::now();
        let outcome = plugin.export(&data, &cfg).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = match &outcome {
            Ok(result) => SyncHistory {
                id: 0,
                plugin: plugin_name.to_string(),
                format: result.format.clone(),
                success: true,
                record_count: result.record_count,
                file_size: Some(result.file_size),
                duration_ms,
                error: None,
                requested_by: requested_by.to_string(),
                created_at: Utc::now(),
            },
            Err(e) => SyncHistory {
                id: 0,
                plugin: plugin_name.to_string(),
                format,
                success: false,
                record_count: 0,
                file_size: None,
                duration_ms,
                error: Some(e.to_string()),
                requested_by: requested_by.to_string(),
                created_at: Utc::now(),
            },
        };
        self.store.append_sync_history("export", &entry)?;

        if let Ok(result) = &outcome {
            self.notifier
                .dispatch(
                    "export.completed",
                    json!({
                        "plugin": plugin_name,
                        "records": result.record_count,
                        "output_path": result.output_path,
                    }),
                    None,
                )
                .await;
        }
        outcome
    }

    pub async fn preview(&self, plugin_name: &str, cfg: Value) -> Result<PreviewResult> {
        let plugin = self.plugin(plugin_name)?;
        let info = plugin.info();
        let format = info.formats.first().cloned().unwrap_or_default();
        let cfg = self.with_output_path(plugin_name, &format, cfg);
        let data = self.collect_data()?;
        plugin.preview(&data, &cfg).await
    }

    async fn resolve_source(&self, spec: &SourceSpec) -> Result<ImportSource> {
        match spec {
            SourceSpec::File { path } => Ok(ImportSource::File(PathBuf::from(path))),
            SourceSpec::Data { data } => Ok(ImportSource::Data(data.clone().into_bytes())),
            SourceSpec::Url { url } => {
                let resp = self.http.get(url).send().await?;
                if !resp.status().is_success() {
                    return Err(Error::Validation(format!(
                        "source url returned HTTP {}",
                        resp.status()
                    )));
                }
                Ok(ImportSource::Data(resp.bytes().await?.to_vec()))
            }
        }
    }

    pub async fn import(
        &self,
        plugin_name: &str,
        spec: &SourceSpec,
        cfg: Value,
        opts: &ImportOptions,
        requested_by: &str,
    ) -> Result<ImportResult> {
        let plugin = self.plugin(plugin_name)?;
        let source = self.resolve_source(spec).await?;

        if opts.backup_before && !opts.dry_run && !opts.validate_only {
            if let Some(backup) = self.store.backup_provider() {
                let path = self
                    .output_dir
                    .join(format!("pre-import-{}.db", Utc::now().format("%Y%m%d-%H%M%S")));
                let report = backup.backup_to(&path)?;
                tracing::info!(path = %report.path, "wrote pre-import backup");
            }
        }

        let started = Instant::now();
        let outcome = plugin.import(&source, &cfg, opts).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = match &outcome {
            Ok(result) => SyncHistory {
                id: 0,
                plugin: plugin_name.to_string(),
                format: plugin.info().formats.first().cloned().unwrap_or_default(),
                success: result.success,
                record_count: result.records_imported,
                file_size: None,
                duration_ms,
                error: result.errors.first().cloned(),
                requested_by: requested_by.to_string(),
                created_at: Utc::now(),
            },
            Err(e) => SyncHistory {
                id: 0,
                plugin: plugin_name.to_string(),
                format: plugin.info().formats.first().cloned().unwrap_or_default(),
                success: false,
                record_count: 0,
                file_size: None,
                duration_ms,
                error: Some(e.to_string()),
                requested_by: requested_by.to_string(),
                created_at: Utc::now(),
            },
        };
        self.store.append_sync_history("import", &entry)?;

        if let Ok(result) = &outcome {
            if !opts.dry_run {
                self.notifier
                    .dispatch(
                        "import.completed",
                        json!({
                            "plugin": plugin_name,
                            "imported": result.records_imported,
                            "skipped": result.records_skipped,
                        }),
                        None,
                    )
                    .await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::model::NewDevice;
    use crate::plugins::sma::SmaPlugin;
    use crate::plugins::ChangeType;
    use crate::store::SqliteProvider;

    async fn engine(dir: &std::path::Path) -> (Arc<SyncEngine>, SharedStore) {
        let provider = SqliteProvider::open(&dir.join("fleet.db"), 1000).unwrap();
        provider.migrate().unwrap();
        let store: SharedStore = Arc::new(provider);
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(PluginType::Sync, Arc::new(SmaPlugin::new(store.clone())))
            .await
            .unwrap();
        let notifier = Notifier::new(store.clone());
        let engine =
            SyncEngine::new(store.clone(), registry, notifier, dir.join("exports"));
        (engine, store)
    }

    #[tokio::test]
    async fn test_export_records_history_and_defaults_path() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = engine(dir.path()).await;
        store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();

        let result = engine.export("sma", Value::Null, "test").await.unwrap();
        assert_eq!(result.record_count, 1);
        assert!(result.output_path.contains("exports"));
        assert!(std::path::Path::new(&result.output_path).exists());

        let history = store.list_sync_history("export", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].plugin, "sma");
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path()).await;
        assert!(matches!(
            engine.export("nope", Value::Null, "test").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sma_dry_run_round_trip_yields_no_changes_on_identical_store() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = engine(dir.path()).await;
        store
            .insert_device(&NewDevice {
                mac: "AA".into(),
                ip: "10.0.0.1".into(),
                name: "Living".into(),
                ..Default::default()
            })
            .unwrap();

        let exported = engine.export("sma", Value::Null, "test").await.unwrap();

        // Importing back into the same store (dry run, no force): the only
        // change kind is skip — zero creates, zero updates.
        let outcome = engine
            .import(
                "sma",
                &SourceSpec::File { path: exported.output_path },
                Value::Null,
                &ImportOptions { dry_run: true, ..Default::default() },
                "test",
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.changes.iter().filter(|c| c.change_type == ChangeType::Create).count(),
            0
        );
        assert_eq!(
            outcome.changes.iter().filter(|c| c.change_type == ChangeType::Update).count(),
            0
        );

        let history = store.list_sync_history("import", 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_import_from_url_source() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let dir = tempfile::tempdir().unwrap();
        let (source_engine, store) = engine(dir.path()).await;
        store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();
        let exported = source_engine.export("sma", Value::Null, "test").await.unwrap();
        let archive_bytes = std::fs::read(&exported.output_path).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fleet.sma"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive_bytes))
            .mount(&server)
            .await;

        let target_dir = tempfile::tempdir().unwrap();
        let (target_engine, target_store) = engine(target_dir.path()).await;
        let outcome = target_engine
            .import(
                "sma",
                &SourceSpec::Url { url: format!("{}/fleet.sma", server.uri()) },
                Value::Null,
                &ImportOptions::default(),
                "test",
            )
            .await
            .unwrap();
        assert_eq!(outcome.records_imported, 1);
        assert_eq!(target_store.list_devices().unwrap().len(), 1);
    }
}
