//! SQLite provider.
//!
//! Single connection behind a mutex with WAL mode; schema created with one
//! `execute_batch` at migration time. Every operation is timed and logged;
//! queries slower than the configured threshold are flagged.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{
    ChannelKind, ConfigTemplate, Device, DeviceStatus, DiscoveredDevice, DriftReport,
    DriftSchedule, NewDevice, NotificationChannel, NotificationEvent, NotificationRule,
    SyncHistory,
};

use super::{
    BackupProvider, BackupReport, ConfigHistoryEntry, DeviceUpdate, DriftTrendBucket, Provider,
    StoreStats,
};

pub struct SqliteProvider {
    conn: Mutex<Connection>,
    path: PathBuf,
    slow_query_ms: u64,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        mac          TEXT NOT NULL UNIQUE,
        ip           TEXT UNIQUE,
        type         TEXT NOT NULL DEFAULT '',
        name         TEXT NOT NULL DEFAULT '',
        firmware     TEXT NOT NULL DEFAULT '',
        status       TEXT NOT NULL DEFAULT 'unknown',
        last_seen    TEXT NOT NULL,
        settings     TEXT,
        desired_config TEXT,
        applied      INTEGER NOT NULL DEFAULT 0,
        overrides    TEXT,
        template_ids TEXT NOT NULL DEFAULT '[]',
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS discovered_devices (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        mac           TEXT NOT NULL,
        agent_id      TEXT NOT NULL,
        ssid          TEXT,
        model         TEXT,
        generation    INTEGER,
        ip            TEXT,
        signal        INTEGER,
        discovered_at TEXT NOT NULL,
        expires_at    TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_discovered_expires
        ON discovered_devices(expires_at);
    CREATE INDEX IF NOT EXISTS idx_discovered_mac
        ON discovered_devices(mac);

    CREATE TABLE IF NOT EXISTS config_templates (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        device_type TEXT NOT NULL DEFAULT '',
        generation  INTEGER,
        parent_id   INTEGER,
        variables   TEXT NOT NULL DEFAULT '{}',
        body        TEXT NOT NULL DEFAULT '',
        is_default  INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS device_tags (
        device_id INTEGER NOT NULL,
        tag       TEXT NOT NULL,
        PRIMARY KEY (device_id, tag)
    );

    CREATE TABLE IF NOT EXISTS device_config_history (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id  INTEGER NOT NULL,
        config     TEXT NOT NULL,
        source     TEXT NOT NULL DEFAULT 'user',
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_config_history_device
        ON device_config_history(device_id, created_at);

    CREATE TABLE IF NOT EXISTS drift_schedules (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        name       TEXT NOT NULL DEFAULT '',
        cron       TEXT NOT NULL,
        selector   TEXT NOT NULL DEFAULT 'all',
        enabled    INTEGER NOT NULL DEFAULT 1,
        last_run   TEXT,
        next_run   TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS drift_reports (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id       INTEGER NOT NULL,
        schedule_id     INTEGER,
        entries         TEXT NOT NULL DEFAULT '[]',
        error           TEXT,
        resolved        INTEGER NOT NULL DEFAULT 0,
        resolution_note TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_drift_reports_device
        ON drift_reports(device_id, created_at);

    CREATE TABLE IF NOT EXISTS export_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        plugin       TEXT NOT NULL,
        format       TEXT NOT NULL DEFAULT '',
        success      INTEGER NOT NULL,
        record_count INTEGER NOT NULL DEFAULT 0,
        file_size    INTEGER,
        duration_ms  INTEGER NOT NULL DEFAULT 0,
        error        TEXT,
        requested_by TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS import_history (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        plugin       TEXT NOT NULL,
        format       TEXT NOT NULL DEFAULT '',
        success      INTEGER NOT NULL,
        record_count INTEGER NOT NULL DEFAULT 0,
        file_size    INTEGER,
        duration_ms  INTEGER NOT NULL DEFAULT 0,
        error        TEXT,
        requested_by TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS notification_channels (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        name       TEXT NOT NULL UNIQUE,
        kind       TEXT NOT NULL,
        settings   TEXT NOT NULL DEFAULT '{}',
        enabled    INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS notification_rules (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT NOT NULL DEFAULT '',
        event_type   TEXT NOT NULL,
        channel_id   INTEGER NOT NULL,
        min_severity TEXT,
        enabled      INTEGER NOT NULL DEFAULT 1,
        created_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS notification_events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id    INTEGER,
        channel_id INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        payload    TEXT NOT NULL DEFAULT '{}',
        success    INTEGER NOT NULL,
        error      TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS settings (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

fn ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(ts)
}

fn json_or_null(s: Option<String>) -> Option<Value> {
    s.and_then(|raw| serde_json::from_str(&raw).ok())
}

impl SqliteProvider {
    pub fn open(path: &Path, slow_query_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            slow_query_ms,
        })
    }

    /// In-memory provider for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            slow_query_ms: 1000,
        })
    }

    /// Run `f` with the connection held, logging one structured record
    /// per operation.
    fn with_conn<T>(
        &self,
        operation: &str,
        table: &str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let start = Instant::now();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = f(&conn);
        let duration_ms = start.elapsed().as_millis() as u64;
        let rows = conn.changes();
        match &result {
            Ok(_) if duration_ms >= self.slow_query_ms => {
                tracing::warn!(operation, table, duration_ms, rows, "slow query");
            }
            Ok(_) => {
                tracing::debug!(operation, table, duration_ms, rows, "store op");
            }
            Err(e) => {
                tracing::error!(operation, table, duration_ms, error = %e, "store op failed");
            }
        }
        result
    }

    fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRow> {
        Ok(DeviceRow {
            id: row.get(0)?,
            mac: row.get(1)?,
            ip: row.get::<_, Option<String>>(2)?,
            device_type: row.get(3)?,
            name: row.get(4)?,
            firmware: row.get(5)?,
            status: row.get(6)?,
            last_seen: row.get(7)?,
            settings: row.get(8)?,
            desired_config: row.get(9)?,
            applied: row.get::<_, i64>(10)? != 0,
            overrides: row.get(11)?,
            template_ids: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

const DEVICE_COLS: &str = "id, mac, ip, type, name, firmware, status, last_seen, settings, \
     desired_config, applied, overrides, template_ids, created_at, updated_at";

struct DeviceRow {
    id: i64,
    mac: String,
    ip: Option<String>,
    device_type: String,
    name: String,
    firmware: String,
    status: String,
    last_seen: String,
    settings: Option<String>,
    desired_config: Option<String>,
    applied: bool,
    overrides: Option<String>,
    template_ids: String,
    created_at: String,
    updated_at: String,
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        Device {
            id: r.id,
            mac: r.mac,
            ip: r.ip.unwrap_or_default(),
            device_type: r.device_type,
            name: r.name,
            firmware: r.firmware,
            status: DeviceStatus::parse(&r.status),
            last_seen: ts(r.last_seen),
            settings: json_or_null(r.settings),
            desired_config: json_or_null(r.desired_config),
            applied: r.applied,
            overrides: json_or_null(r.overrides),
            template_ids: serde_json::from_str(&r.template_ids).unwrap_or_default(),
            created_at: ts(r.created_at),
            updated_at: ts(r.updated_at),
        }
    }
}

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemplateRow> {
    Ok(TemplateRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        device_type: row.get(3)?,
        generation: row.get(4)?,
        parent_id: row.get(5)?,
        variables: row.get(6)?,
        body: row.get(7)?,
        is_default: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

struct TemplateRow {
    id: i64,
    name: String,
    description: String,
    device_type: String,
    generation: Option<u8>,
    parent_id: Option<i64>,
    variables: String,
    body: String,
    is_default: bool,
    created_at: String,
    updated_at: String,
}

impl From<TemplateRow> for ConfigTemplate {
    fn from(r: TemplateRow) -> Self {
        ConfigTemplate {
            id: r.id,
            name: r.name,
            description: r.description,
            device_type: r.device_type,
            generation: r.generation,
            parent_id: r.parent_id,
            variables: serde_json::from_str(&r.variables).unwrap_or_default(),
            body: r.body,
            is_default: r.is_default,
            created_at: ts(r.created_at),
            updated_at: ts(r.updated_at),
        }
    }
}

const TEMPLATE_COLS: &str = "id, name, description, device_type, generation, parent_id, \
     variables, body, is_default, created_at, updated_at";

fn sync_table(kind: &str) -> Result<&'static str> {
    match kind {
        "export" => Ok("export_history"),
        "import" => Ok("import_history"),
        other => Err(Error::Internal(format!("unknown sync history kind '{}'", other))),
    }
}

impl Provider for SqliteProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn("migrate", "*", |conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    fn ping(&self) -> Result<()> {
        self.with_conn("ping", "*", |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn stats(&self) -> Result<StoreStats> {
        let size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.with_conn("stats", "*", |conn| {
            let count = |table: &str| -> rusqlite::Result<u64> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            };
            Ok(StoreStats {
                provider: "sqlite".to_string(),
                path: self.path.display().to_string(),
                size_bytes,
                device_count: count("devices")?,
                template_count: count("config_templates")?,
                drift_report_count: count("drift_reports")?,
            })
        })
    }

    fn backup_provider(&self) -> Option<&dyn BackupProvider> {
        Some(self)
    }

    // ── Devices ─────────────────────────────────────────

    fn list_devices(&self) -> Result<Vec<Device>> {
        self.with_conn("select", "devices", |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLS))?;
            let rows = stmt.query_map([], Self::device_from_row)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?.into());
            }
            Ok(devices)
        })
    }

    fn get_device(&self, id: i64) -> Result<Device> {
        self.with_conn("select", "devices", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLS),
                params![id],
                Self::device_from_row,
            )
            .optional()?
            .map(Into::into)
            .ok_or(Error::NotFound { resource: "device", id: id.to_string() })
        })
    }

    fn get_device_by_mac(&self, mac: &str) -> Result<Option<Device>> {
        self.with_conn("select", "devices", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM devices WHERE mac = ?1", DEVICE_COLS),
                    params![mac],
                    Self::device_from_row,
                )
                .optional()?
                .map(Into::into))
        })
    }

    fn insert_device(&self, device: &NewDevice) -> Result<Device> {
        if device.mac.is_empty() {
            return Err(Error::Validation("mac is required".into()));
        }
        let id = self.with_conn("insert", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO devices (mac, ip, type, name, firmware, status, last_seen,
                     settings, created_at, updated_at)
                 VALUES (?1, NULLIF(?2, ''), ?3, ?4, ?5, 'unknown', ?6, ?7, ?6, ?6)",
                params![
                    device.mac,
                    device.ip,
                    device.device_type,
                    device.name,
                    device.firmware,
                    now,
                    device.settings.as_ref().map(|v| v.to_string()),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_device(id)
    }

    fn update_device(&self, id: i64, update: &DeviceUpdate) -> Result<Device> {
        self.with_conn("update", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            if let Some(name) = &update.name {
                conn.execute("UPDATE devices SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, now, id])?;
            }
            if let Some(ip) = &update.ip {
                conn.execute(
                    "UPDATE devices SET ip = NULL WHERE ip = ?1 AND id != ?2",
                    params![ip, id],
                )?;
                conn.execute("UPDATE devices SET ip = NULLIF(?1, ''), updated_at = ?2 WHERE id = ?3",
                    params![ip, now, id])?;
            }
            if let Some(device_type) = &update.device_type {
                conn.execute("UPDATE devices SET type = ?1, updated_at = ?2 WHERE id = ?3",
                    params![device_type, now, id])?;
            }
            if let Some(firmware) = &update.firmware {
                conn.execute("UPDATE devices SET firmware = ?1, updated_at = ?2 WHERE id = ?3",
                    params![firmware, now, id])?;
            }
            if let Some(status) = &update.status {
                conn.execute(
                    "UPDATE devices SET status = ?1, last_seen = ?2, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id],
                )?;
            }
            if let Some(settings) = &update.settings {
                conn.execute("UPDATE devices SET settings = ?1, updated_at = ?2 WHERE id = ?3",
                    params![settings.to_string(), now, id])?;
            }
            if let Some(overrides) = &update.overrides {
                conn.execute("UPDATE devices SET overrides = ?1, updated_at = ?2 WHERE id = ?3",
                    params![overrides.to_string(), now, id])?;
            }
            if let Some(template_ids) = &update.template_ids {
                conn.execute("UPDATE devices SET template_ids = ?1, updated_at = ?2 WHERE id = ?3",
                    params![serde_json::to_string(template_ids).unwrap_or_else(|_| "[]".into()), now, id])?;
            }
            Ok(())
        })?;
        self.get_device(id)
    }

    fn delete_device(&self, id: i64) -> Result<bool> {
        self.with_conn("delete", "devices", |conn| {
            conn.execute("DELETE FROM device_tags WHERE device_id = ?1", params![id])?;
            let deleted = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    fn upsert_device_from_discovery(
        &self,
        found: &DiscoveredDevice,
        fallback_name: &str,
    ) -> Result<Device> {
        if found.mac.is_empty() {
            return Err(Error::Validation("discovered record has no mac".into()));
        }
        self.with_conn("upsert", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            let ip = found.ip.clone().unwrap_or_default();
            let model = found.model.clone().unwrap_or_default();

            if !ip.is_empty() {
                // The IP moved to this device; detach it from any other row.
                conn.execute(
                    "UPDATE devices SET ip = NULL WHERE ip = ?1 AND mac != ?2",
                    params![ip, found.mac],
                )?;
            }

            let existing: Option<i64> = conn
                .query_row("SELECT id FROM devices WHERE mac = ?1", params![found.mac], |r| {
                    r.get(0)
                })
                .optional()?;

            match existing {
                Some(id) => {
                    // Only runtime fields; name/overrides/settings/templates
                    // are user-owned and must survive rediscovery.
                    conn.execute(
                        "UPDATE devices SET
                            ip = COALESCE(NULLIF(?1, ''), ip),
                            type = COALESCE(NULLIF(?2, ''), type),
                            status = 'online',
                            last_seen = ?3,
                            updated_at = ?3
                         WHERE id = ?4",
                        params![ip, model, now, id],
                    )?;
                    Ok(id)
                }
                None => {
                    conn.execute(
                        "INSERT INTO devices (mac, ip, type, name, status, last_seen,
                             created_at, updated_at)
                         VALUES (?1, NULLIF(?2, ''), ?3, ?4, 'online', ?5, ?5, ?5)",
                        params![found.mac, ip, model, fallback_name, now],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            }
        })
        .and_then(|id| self.get_device(id))
    }

    fn set_desired_config(&self, id: i64, config: &Value) -> Result<()> {
        self.with_conn("update", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE devices SET desired_config = ?1, applied = 0, updated_at = ?2 WHERE id = ?3",
                params![config.to_string(), now, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound { resource: "device", id: id.to_string() });
            }
            Ok(())
        })
    }

    fn set_applied(&self, id: i64, applied: bool) -> Result<()> {
        self.with_conn("update", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE devices SET applied = ?1, updated_at = ?2 WHERE id = ?3",
                params![applied as i64, now, id],
            )?;
            Ok(())
        })
    }

    fn set_device_settings(&self, id: i64, settings: &Value) -> Result<()> {
        self.with_conn("update", "devices", |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE devices SET settings = ?1, updated_at = ?2 WHERE id = ?3",
                params![settings.to_string(), now, id],
            )?;
            Ok(())
        })
    }

    fn append_config_history(&self, device_id: i64, config: &Value, source: &str) -> Result<()> {
        self.with_conn("insert", "device_config_history", |conn| {
            conn.execute(
                "INSERT INTO device_config_history (device_id, config, source, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![device_id, config.to_string(), source, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn list_config_history(&self, device_id: i64, limit: usize) -> Result<Vec<ConfigHistoryEntry>> {
        self.with_conn("select", "device_config_history", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, config, source, created_at
                 FROM device_config_history
                 WHERE device_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![device_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (id, device_id, config, source, created_at) = row?;
                entries.push(ConfigHistoryEntry {
                    id,
                    device_id,
                    config: serde_json::from_str(&config).unwrap_or(Value::Null),
                    source,
                    created_at: ts(created_at),
                });
            }
            Ok(entries)
        })
    }

    // ── Tags ────────────────────────────────────────────

    fn device_tags(&self, device_id: i64) -> Result<Vec<String>> {
        self.with_conn("select", "device_tags", |conn| {
            let mut stmt =
                conn.prepare("SELECT tag FROM device_tags WHERE device_id = ?1 ORDER BY tag")?;
            let rows = stmt.query_map(params![device_id], |row| row.get(0))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    fn add_device_tag(&self, device_id: i64, tag: &str) -> Result<()> {
        self.with_conn("insert", "device_tags", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO device_tags (device_id, tag) VALUES (?1, ?2)",
                params![device_id, tag],
            )?;
            Ok(())
        })
    }

    fn remove_device_tag(&self, device_id: i64, tag: &str) -> Result<bool> {
        self.with_conn("delete", "device_tags", |conn| {
            let deleted = conn.execute(
                "DELETE FROM device_tags WHERE device_id = ?1 AND tag = ?2",
                params![device_id, tag],
            )?;
            Ok(deleted > 0)
        })
    }

    fn devices_by_tag(&self, tag: &str) -> Result<Vec<Device>> {
        self.with_conn("select", "devices", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM devices
                 WHERE id IN (SELECT device_id FROM device_tags WHERE tag = ?1)
                 ORDER BY id",
                DEVICE_COLS
            ))?;
            let rows = stmt.query_map(params![tag], Self::device_from_row)?;
            let mut devices = Vec::new();
            for row in rows {
                devices.push(row?.into());
            }
            Ok(devices)
        })
    }

    // ── Discovery ───────────────────────────────────────

    fn insert_discovered(&self, record: &DiscoveredDevice) -> Result<i64> {
        if record.expires_at <= record.discovered_at {
            return Err(Error::Validation("expires_at must be after discovered_at".into()));
        }
        self.with_conn("insert", "discovered_devices", |conn| {
            conn.execute(
                "INSERT INTO discovered_devices
                     (mac, agent_id, ssid, model, generation, ip, signal, discovered_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.mac,
                    record.agent_id,
                    record.ssid,
                    record.model,
                    record.generation,
                    record.ip,
                    record.signal,
                    record.discovered_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn list_discovered(&self, now: DateTime<Utc>) -> Result<Vec<DiscoveredDevice>> {
        self.with_conn("select", "discovered_devices", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mac, agent_id, ssid, model, generation, ip, signal,
                        discovered_at, expires_at
                 FROM discovered_devices
                 WHERE expires_at > ?1
                 ORDER BY discovered_at DESC",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339()], |row| {
                Ok(DiscoveredDevice {
                    id: row.get(0)?,
                    mac: row.get(1)?,
                    agent_id: row.get(2)?,
                    ssid: row.get(3)?,
                    model: row.get(4)?,
                    generation: row.get(5)?,
                    ip: row.get(6)?,
                    signal: row.get(7)?,
                    discovered_at: ts(row.get(8)?),
                    expires_at: ts(row.get(9)?),
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }

    fn cleanup_expired_discovered(&self, now: DateTime<Utc>) -> Result<u64> {
        self.with_conn("delete", "discovered_devices", |conn| {
            let deleted = conn.execute(
                "DELETE FROM discovered_devices WHERE expires_at <= ?1",
                params![now.to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })
    }

    // ── Templates ───────────────────────────────────────

    fn list_templates(&self) -> Result<Vec<ConfigTemplate>> {
        self.with_conn("select", "config_templates", |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM config_templates ORDER BY id", TEMPLATE_COLS))?;
            let rows = stmt.query_map([], template_from_row)?;
            let mut templates = Vec::new();
            for row in rows {
                templates.push(row?.into());
            }
            Ok(templates)
        })
    }

    fn get_template(&self, id: i64) -> Result<ConfigTemplate> {
        self.with_conn("select", "config_templates", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM config_templates WHERE id = ?1", TEMPLATE_COLS),
                params![id],
                template_from_row,
            )
            .optional()?
            .map(Into::into)
            .ok_or(Error::NotFound { resource: "template", id: id.to_string() })
        })
    }

    fn get_template_by_name(&self, name: &str) -> Result<Option<ConfigTemplate>> {
        self.with_conn("select", "config_templates", |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM config_templates WHERE name = ?1", TEMPLATE_COLS),
                    params![name],
                    template_from_row,
                )
                .optional()?
                .map(Into::into))
        })
    }

    fn insert_template(&self, template: &ConfigTemplate) -> Result<ConfigTemplate> {
        if template.name.is_empty() {
            return Err(Error::Validation("template name is required".into()));
        }
        let id = self.with_conn("insert", "config_templates", |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO config_templates
                     (name, description, device_type, generation, parent_id, variables,
                      body, is_default, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    template.name,
                    template.description,
                    template.device_type,
                    template.generation,
                    template.parent_id,
                    serde_json::to_string(&template.variables)
                        .unwrap_or_else(|_| "{}".into()),
                    template.body,
                    template.is_default as i64,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_template(id)
    }

    fn update_template(&self, template: &ConfigTemplate) -> Result<ConfigTemplate> {
        self.with_conn("update", "config_templates", |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE config_templates SET
                     name = ?1, description = ?2, device_type = ?3, generation = ?4,
                     parent_id = ?5, variables = ?6, body = ?7, is_default = ?8,
                     updated_at = ?9
                 WHERE id = ?10",
                params![
                    template.name,
                    template.description,
                    template.device_type,
                    template.generation,
                    template.parent_id,
                    serde_json::to_string(&template.variables)
                        .unwrap_or_else(|_| "{}".into()),
                    template.body,
                    template.is_default as i64,
                    now,
                    template.id,
                ],
            )?;
            if changed == 0 {
                return Err(Error::NotFound {
                    resource: "template",
                    id: template.id.to_string(),
                });
            }
            Ok(())
        })?;
        self.get_template(template.id)
    }

    fn delete_template(&self, id: i64) -> Result<bool> {
        self.with_conn("delete", "config_templates", |conn| {
            let deleted = conn.execute("DELETE FROM config_templates WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    // ── Drift schedules & reports ───────────────────────

    fn list_drift_schedules(&self) -> Result<Vec<DriftSchedule>> {
        self.with_conn("select", "drift_schedules", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, cron, selector, enabled, last_run, next_run,
                        created_at, updated_at
                 FROM drift_schedules ORDER BY id",
            )?;
            let rows = stmt.query_map([], schedule_from_row)?;
            let mut schedules = Vec::new();
            for row in rows {
                schedules.push(row?);
            }
            Ok(schedules)
        })
    }

    fn get_drift_schedule(&self, id: i64) -> Result<DriftSchedule> {
        self.with_conn("select", "drift_schedules", |conn| {
            conn.query_row(
                "SELECT id, name, cron, selector, enabled, last_run, next_run,
                        created_at, updated_at
                 FROM drift_schedules WHERE id = ?1",
                params![id],
                schedule_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound { resource: "drift schedule", id: id.to_string() })
        })
    }

    fn insert_drift_schedule(&self, schedule: &DriftSchedule) -> Result<DriftSchedule> {
        let id = self.with_conn("insert", "drift_schedules", |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO drift_schedules
                     (name, cron, selector, enabled, last_run, next_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    schedule.name,
                    schedule.cron,
                    schedule.selector,
                    schedule.enabled as i64,
                    schedule.last_run.map(|d| d.to_rfc3339()),
                    schedule.next_run.map(|d| d.to_rfc3339()),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_drift_schedule(id)
    }

    fn update_drift_schedule(&self, schedule: &DriftSchedule) -> Result<DriftSchedule> {
        self.with_conn("update", "drift_schedules", |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE drift_schedules SET
                     name = ?1, cron = ?2, selector = ?3, enabled = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    schedule.name,
                    schedule.cron,
                    schedule.selector,
                    schedule.enabled as i64,
                    now,
                    schedule.id,
                ],
            )?;
            if changed == 0 {
                return Err(Error::NotFound {
                    resource: "drift schedule",
                    id: schedule.id.to_string(),
                });
            }
            Ok(())
        })?;
        self.get_drift_schedule(schedule.id)
    }

    fn delete_drift_schedule(&self, id: i64) -> Result<bool> {
        self.with_conn("delete", "drift_schedules", |conn| {
            let deleted = conn.execute("DELETE FROM drift_schedules WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        self.with_conn("update", "drift_schedules", |conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE drift_schedules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, now, id],
            )?;
            Ok(changed > 0)
        })
    }

    fn set_schedule_runs(
        &self,
        id: i64,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn("update", "drift_schedules", |conn| {
            conn.execute(
                "UPDATE drift_schedules SET last_run = ?1, next_run = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    last_run.map(|d| d.to_rfc3339()),
                    next_run.map(|d| d.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?;
            Ok(())
        })
    }

    fn insert_drift_report(&self, report: &DriftReport) -> Result<DriftReport> {
        let id = self.with_conn("insert", "drift_reports", |conn| {
            conn.execute(
                "INSERT INTO drift_reports
                     (device_id, schedule_id, entries, error, resolved, resolution_note, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    report.device_id,
                    report.schedule_id,
                    serde_json::to_string(&report.entries).unwrap_or_else(|_| "[]".into()),
                    report.error,
                    report.resolved as i64,
                    report.resolution_note,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with_conn("select", "drift_reports", |conn| {
            conn.query_row(
                "SELECT id, device_id, schedule_id, entries, error, resolved,
                        resolution_note, created_at
                 FROM drift_reports WHERE id = ?1",
                params![id],
                report_from_row,
            )
            .map_err(Into::into)
        })
    }

    fn list_drift_reports(
        &self,
        device_id: Option<i64>,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<DriftReport>> {
        self.with_conn("select", "drift_reports", |conn| {
            let mut sql = String::from(
                "SELECT id, device_id, schedule_id, entries, error, resolved,
                        resolution_note, created_at
                 FROM drift_reports WHERE 1=1",
            );
            if device_id.is_some() {
                sql.push_str(" AND device_id = :device_id");
            }
            if unresolved_only {
                sql.push_str(" AND resolved = 0");
            }
            sql.push_str(" ORDER BY created_at DESC LIMIT :limit");

            let mut stmt = conn.prepare(&sql)?;
            let mut reports = Vec::new();
            let limit = limit as i64;
            let rows: Vec<rusqlite::Result<DriftReport>> = if let Some(device_id) = device_id {
                stmt.query_map(
                    rusqlite::named_params! { ":device_id": device_id, ":limit": limit },
                    report_from_row,
                )?
                .collect()
            } else {
                stmt.query_map(rusqlite::named_params! { ":limit": limit }, report_from_row)?
                    .collect()
            };
            for row in rows {
                reports.push(row?);
            }
            Ok(reports)
        })
    }

    fn resolve_drift_report(&self, id: i64, note: &str) -> Result<bool> {
        self.with_conn("update", "drift_reports", |conn| {
            let changed = conn.execute(
                "UPDATE drift_reports SET resolved = 1, resolution_note = ?1 WHERE id = ?2",
                params![note, id],
            )?;
            Ok(changed > 0)
        })
    }

    fn drift_counts(&self) -> Result<(u64, u64)> {
        self.with_conn("select", "drift_reports", |conn| {
            let total: u64 =
                conn.query_row("SELECT COUNT(*) FROM drift_reports", [], |r| r.get(0))?;
            let unresolved: u64 = conn.query_row(
                "SELECT COUNT(*) FROM drift_reports WHERE resolved = 0",
                [],
                |r| r.get(0),
            )?;
            Ok((total, unresolved))
        })
    }

    fn drift_trends(&self, days: u32) -> Result<Vec<DriftTrendBucket>> {
        self.with_conn("select", "drift_reports", |conn| {
            let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
            let mut stmt = conn.prepare(
                "SELECT substr(created_at, 1, 10) AS day,
                        COUNT(*),
                        SUM(CASE WHEN resolved = 0 THEN 1 ELSE 0 END)
                 FROM drift_reports
                 WHERE created_at >= ?1
                 GROUP BY day ORDER BY day",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(DriftTrendBucket {
                    day: row.get(0)?,
                    reports: row.get(1)?,
                    unresolved: row.get::<_, Option<u64>>(2)?.unwrap_or(0),
                })
            })?;
            let mut buckets = Vec::new();
            for row in rows {
                buckets.push(row?);
            }
            Ok(buckets)
        })
    }

    // ── Sync audit ──────────────────────────────────────

    fn append_sync_history(&self, kind: &str, entry: &SyncHistory) -> Result<()> {
        let table = sync_table(kind)?;
        self.with_conn("insert", table, |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (plugin, format, success, record_count, file_size,
                         duration_ms, error, requested_by, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    table
                ),
                params![
                    entry.plugin,
                    entry.format,
                    entry.success as i64,
                    entry.record_count,
                    entry.file_size,
                    entry.duration_ms,
                    entry.error,
                    entry.requested_by,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn list_sync_history(&self, kind: &str, limit: usize) -> Result<Vec<SyncHistory>> {
        let table = sync_table(kind)?;
        self.with_conn("select", table, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, plugin, format, success, record_count, file_size,
                        duration_ms, error, requested_by, created_at
                 FROM {} ORDER BY created_at DESC LIMIT ?1",
                table
            ))?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(SyncHistory {
                    id: row.get(0)?,
                    plugin: row.get(1)?,
                    format: row.get(2)?,
                    success: row.get::<_, i64>(3)? != 0,
                    record_count: row.get(4)?,
                    file_size: row.get(5)?,
                    duration_ms: row.get(6)?,
                    error: row.get(7)?,
                    requested_by: row.get(8)?,
                    created_at: ts(row.get(9)?),
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    // ── Notifications ───────────────────────────────────

    fn list_channels(&self) -> Result<Vec<NotificationChannel>> {
        self.with_conn("select", "notification_channels", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, kind, settings, enabled, created_at
                 FROM notification_channels ORDER BY id",
            )?;
            let rows = stmt.query_map([], channel_from_row)?;
            let mut channels = Vec::new();
            for row in rows {
                channels.push(row?);
            }
            Ok(channels)
        })
    }

    fn get_channel(&self, id: i64) -> Result<NotificationChannel> {
        self.with_conn("select", "notification_channels", |conn| {
            conn.query_row(
                "SELECT id, name, kind, settings, enabled, created_at
                 FROM notification_channels WHERE id = ?1",
                params![id],
                channel_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound { resource: "notification channel", id: id.to_string() })
        })
    }

    fn insert_channel(&self, channel: &NotificationChannel) -> Result<NotificationChannel> {
        let id = self.with_conn("insert", "notification_channels", |conn| {
            conn.execute(
                "INSERT INTO notification_channels (name, kind, settings, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    channel.name,
                    channel.kind.as_str(),
                    channel.settings.to_string(),
                    channel.enabled as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_channel(id)
    }

    fn delete_channel(&self, id: i64) -> Result<bool> {
        self.with_conn("delete", "notification_channels", |conn| {
            conn.execute("DELETE FROM notification_rules WHERE channel_id = ?1", params![id])?;
            let deleted =
                conn.execute("DELETE FROM notification_channels WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    fn list_rules(&self) -> Result<Vec<NotificationRule>> {
        self.with_conn("select", "notification_rules", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, event_type, channel_id, min_severity, enabled, created_at
                 FROM notification_rules ORDER BY id",
            )?;
            let rows = stmt.query_map([], rule_from_row)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(row?);
            }
            Ok(rules)
        })
    }

    fn rules_for_event(&self, event_type: &str) -> Result<Vec<NotificationRule>> {
        self.with_conn("select", "notification_rules", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, event_type, channel_id, min_severity, enabled, created_at
                 FROM notification_rules WHERE event_type = ?1 AND enabled = 1",
            )?;
            let rows = stmt.query_map(params![event_type], rule_from_row)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(row?);
            }
            Ok(rules)
        })
    }

    fn insert_rule(&self, rule: &NotificationRule) -> Result<NotificationRule> {
        let id = self.with_conn("insert", "notification_rules", |conn| {
            conn.execute(
                "INSERT INTO notification_rules
                     (name, event_type, channel_id, min_severity, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rule.name,
                    rule.event_type,
                    rule.channel_id,
                    rule.min_severity
                        .map(|s| serde_json::to_string(&s).unwrap_or_default().replace('"', "")),
                    rule.enabled as i64,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with_conn("select", "notification_rules", |conn| {
            conn.query_row(
                "SELECT id, name, event_type, channel_id, min_severity, enabled, created_at
                 FROM notification_rules WHERE id = ?1",
                params![id],
                rule_from_row,
            )
            .map_err(Into::into)
        })
    }

    fn delete_rule(&self, id: i64) -> Result<bool> {
        self.with_conn("delete", "notification_rules", |conn| {
            let deleted =
                conn.execute("DELETE FROM notification_rules WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
    }

    fn append_notification_event(&self, event: &NotificationEvent) -> Result<()> {
        self.with_conn("insert", "notification_events", |conn| {
            conn.execute(
                "INSERT INTO notification_events
                     (rule_id, channel_id, event_type, payload, success, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.rule_id,
                    event.channel_id,
                    event.event_type,
                    event.payload.to_string(),
                    event.success as i64,
                    event.error,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn list_notification_events(&self, limit: usize) -> Result<Vec<NotificationEvent>> {
        self.with_conn("select", "notification_events", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, rule_id, channel_id, event_type, payload, success, error, created_at
                 FROM notification_events ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(NotificationEvent {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: serde_json::from_str::<Value>(
                        &row.get::<_, String>(4)?,
                    )
                    .unwrap_or(Value::Null),
                    success: row.get::<_, i64>(5)? != 0,
                    error: row.get(6)?,
                    created_at: ts(row.get(7)?),
                })
            })?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
    }

    // ── Settings ────────────────────────────────────────

    fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        self.with_conn("select", "settings", |conn| {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| {
                    r.get::<_, String>(0)
                })
                .optional()?
                .and_then(|raw| serde_json::from_str(&raw).ok()))
        })
    }

    fn set_setting(&self, key: &str, value: &Value) -> Result<()> {
        self.with_conn("upsert", "settings", |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value.to_string()],
            )?;
            Ok(())
        })
    }

    fn all_settings(&self) -> Result<serde_json::Map<String, Value>> {
        self.with_conn("select", "settings", |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut map = serde_json::Map::new();
            for row in rows {
                let (key, raw) = row?;
                map.insert(key, serde_json::from_str(&raw).unwrap_or(Value::Null));
            }
            Ok(map)
        })
    }

    fn device_counts(&self) -> Result<(u64, u64, u64)> {
        self.with_conn("select", "devices", |conn| {
            let total: u64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?;
            let online: u64 = conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE status = 'online'",
                [],
                |r| r.get(0),
            )?;
            let offline: u64 = conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE status = 'offline'",
                [],
                |r| r.get(0),
            )?;
            Ok((total, online, offline))
        })
    }
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DriftSchedule> {
    Ok(DriftSchedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        selector: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        last_run: opt_ts(row.get(5)?),
        next_run: opt_ts(row.get(6)?),
        created_at: ts(row.get(7)?),
        updated_at: ts(row.get(8)?),
    })
}

fn report_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DriftReport> {
    Ok(DriftReport {
        id: row.get(0)?,
        device_id: row.get(1)?,
        schedule_id: row.get(2)?,
        entries: serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
        error: row.get(4)?,
        resolved: row.get::<_, i64>(5)? != 0,
        resolution_note: row.get(6)?,
        created_at: ts(row.get(7)?),
    })
}

fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationChannel> {
    let kind: String = row.get(2)?;
    Ok(NotificationChannel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: ChannelKind::parse(&kind).unwrap_or(ChannelKind::Webhook),
        settings: serde_json::from_str::<Value>(&row.get::<_, String>(3)?)
            .unwrap_or(Value::Null),
        enabled: row.get::<_, i64>(4)? != 0,
        created_at: ts(row.get(5)?),
    })
}

fn rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRule> {
    let min_severity: Option<String> = row.get(4)?;
    Ok(NotificationRule {
        id: row.get(0)?,
        name: row.get(1)?,
        event_type: row.get(2)?,
        channel_id: row.get(3)?,
        min_severity: min_severity
            .and_then(|s| serde_json::from_str(&format!("\"{}\"", s)).ok()),
        enabled: row.get::<_, i64>(5)? != 0,
        created_at: ts(row.get(6)?),
    })
}

impl BackupProvider for SqliteProvider {
    fn backup_to(&self, path: &Path) -> Result<BackupReport> {
        self.with_conn("backup", "*", |conn| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            conn.execute("VACUUM INTO ?1", params![path.to_string_lossy()])?;
            Ok(())
        })?;
        self.validate_backup(path)
    }

    fn validate_backup(&self, path: &Path) -> Result<BackupReport> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|e| Error::Validation(format!("backup file unreadable: {}", e)))?
            .len();
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let integrity: String =
            conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        let count = |table: &str| -> u64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .unwrap_or(0)
        };
        let record_count =
            count("devices") + count("config_templates") + count("discovered_devices");
        Ok(BackupReport {
            path: path.display().to_string(),
            size_bytes,
            record_count,
            integrity_ok: integrity == "ok",
        })
    }

    fn restore_from(&self, path: &Path) -> Result<u64> {
        let report = self.validate_backup(path)?;
        if !report.integrity_ok {
            return Err(Error::Validation(format!(
                "backup failed integrity check: {}",
                path.display()
            )));
        }
        let src = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let backup = rusqlite::backup::Backup::new(&src, &mut conn)
            .map_err(|e| Error::Storage(e.to_string()))?;
        backup
            .run_to_completion(256, Duration::from_millis(5), None)
            .map_err(|e| Error::Storage(e.to_string()))?;
        tracing::info!(path = %path.display(), records = report.record_count, "restored backup");
        Ok(report.record_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_store() -> SqliteProvider {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        provider
    }

    fn discovered(mac: &str, ip: &str) -> DiscoveredDevice {
        let now = Utc::now();
        DiscoveredDevice {
            id: 0,
            mac: mac.to_string(),
            agent_id: "http-scan".to_string(),
            ssid: None,
            model: Some("SHSW-1".to_string()),
            generation: Some(1),
            ip: Some(ip.to_string()),
            signal: None,
            discovered_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn test_insert_and_get_device() {
        let store = mem_store();
        let device = store
            .insert_device(&NewDevice {
                mac: "AABBCCDDEEFF".into(),
                ip: "192.168.1.10".into(),
                device_type: "SHSW-1".into(),
                name: "Living".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(device.id > 0);
        assert_eq!(device.mac, "AABBCCDDEEFF");
        let fetched = store.get_device(device.id).unwrap();
        assert_eq!(fetched.name, "Living");
    }

    #[test]
    fn test_duplicate_mac_conflicts() {
        let store = mem_store();
        let new = NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() };
        store.insert_device(&new).unwrap();
        let dup = NewDevice { mac: "AA".into(), ip: "10.0.0.2".into(), ..Default::default() };
        let err = store.insert_device(&dup).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_discovery_upsert_preserves_user_fields() {
        let store = mem_store();
        let device = store
            .insert_device(&NewDevice {
                mac: "AA".into(),
                ip: "10.0.0.1".into(),
                name: "Living".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .update_device(
                device.id,
                &DeviceUpdate {
                    overrides: Some(serde_json::json!({"x": 1})),
                    ..Default::default()
                },
            )
            .unwrap();

        let updated = store
            .upsert_device_from_discovery(&discovered("AA", "10.0.0.5"), "shelly-new")
            .unwrap();
        assert_eq!(updated.id, device.id);
        assert_eq!(updated.name, "Living");
        assert_eq!(updated.overrides, Some(serde_json::json!({"x": 1})));
        assert_eq!(updated.ip, "10.0.0.5");
        assert_eq!(updated.status, DeviceStatus::Online);
    }

    #[test]
    fn test_discovery_upsert_inserts_new() {
        let store = mem_store();
        let device = store
            .upsert_device_from_discovery(&discovered("BB", "10.0.0.9"), "shelly-bb")
            .unwrap();
        assert_eq!(device.name, "shelly-bb");
        assert_eq!(device.device_type, "SHSW-1");
    }

    #[test]
    fn test_discovered_ttl_visibility_and_sweep() {
        let store = mem_store();
        store.insert_discovered(&discovered("AA", "10.0.0.1")).unwrap();

        let now = Utc::now();
        assert_eq!(store.list_discovered(now).unwrap().len(), 1);

        // Past the TTL the row is invisible and the sweep removes it.
        let later = now + chrono::Duration::minutes(10);
        assert_eq!(store.list_discovered(later).unwrap().len(), 0);
        assert_eq!(store.cleanup_expired_discovered(later).unwrap(), 1);
        assert_eq!(store.cleanup_expired_discovered(later).unwrap(), 0);
    }

    #[test]
    fn test_discovered_rejects_inverted_ttl() {
        let store = mem_store();
        let mut record = discovered("AA", "10.0.0.1");
        record.expires_at = record.discovered_at - chrono::Duration::seconds(1);
        assert!(matches!(
            store.insert_discovered(&record),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_template_crud() {
        let store = mem_store();
        let template = ConfigTemplate {
            id: 0,
            name: "base".into(),
            description: "base defaults".into(),
            device_type: String::new(),
            generation: None,
            parent_id: None,
            variables: serde_json::Map::new(),
            body: "{}".into(),
            is_default: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let saved = store.insert_template(&template).unwrap();
        assert!(saved.id > 0);
        assert!(store.get_template_by_name("base").unwrap().is_some());

        let mut updated = saved.clone();
        updated.description = "changed".into();
        assert_eq!(store.update_template(&updated).unwrap().description, "changed");

        assert!(store.delete_template(saved.id).unwrap());
        assert!(matches!(
            store.get_template(saved.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_drift_report_round_trip() {
        let store = mem_store();
        let report = DriftReport {
            id: 0,
            device_id: 1,
            schedule_id: None,
            entries: vec![crate::model::DriftEntry {
                path: "wifi.ssid".into(),
                op: crate::model::DriftOp::Change,
                old: Some(serde_json::json!("old")),
                new: Some(serde_json::json!("new")),
                severity: crate::model::DriftSeverity::Network,
            }],
            error: None,
            resolved: false,
            resolution_note: None,
            created_at: Utc::now(),
        };
        let saved = store.insert_drift_report(&report).unwrap();
        assert_eq!(saved.entries.len(), 1);

        let listed = store.list_drift_reports(Some(1), true, 10).unwrap();
        assert_eq!(listed.len(), 1);

        assert!(store.resolve_drift_report(saved.id, "fixed").unwrap());
        assert!(store.list_drift_reports(Some(1), true, 10).unwrap().is_empty());
        assert_eq!(store.drift_counts().unwrap(), (1, 0));
    }

    #[test]
    fn test_sync_history_kinds() {
        let store = mem_store();
        let entry = SyncHistory {
            id: 0,
            plugin: "sma".into(),
            format: "sma".into(),
            success: true,
            record_count: 12,
            file_size: Some(2048),
            duration_ms: 40,
            error: None,
            requested_by: "api".into(),
            created_at: Utc::now(),
        };
        store.append_sync_history("export", &entry).unwrap();
        assert_eq!(store.list_sync_history("export", 10).unwrap().len(), 1);
        assert!(store.list_sync_history("import", 10).unwrap().is_empty());
        assert!(store.append_sync_history("bogus", &entry).is_err());
    }

    #[test]
    fn test_settings_round_trip() {
        let store = mem_store();
        store.set_setting("network", &serde_json::json!({"dns": "1.1.1.1"})).unwrap();
        assert_eq!(
            store.get_setting("network").unwrap(),
            Some(serde_json::json!({"dns": "1.1.1.1"}))
        );
        store.set_setting("network", &serde_json::json!({"dns": "8.8.8.8"})).unwrap();
        let all = store.all_settings().unwrap();
        assert_eq!(all["network"]["dns"], "8.8.8.8");
    }

    #[test]
    fn test_tags_set_semantics() {
        let store = mem_store();
        let device = store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();
        store.add_device_tag(device.id, "lab").unwrap();
        store.add_device_tag(device.id, "lab").unwrap();
        assert_eq!(store.device_tags(device.id).unwrap(), vec!["lab".to_string()]);
        assert_eq!(store.devices_by_tag("lab").unwrap().len(), 1);
        assert!(store.remove_device_tag(device.id, "lab").unwrap());
        assert!(!store.remove_device_tag(device.id, "lab").unwrap());
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.db");
        let provider = SqliteProvider::open(&db_path, 1000).unwrap();
        provider.migrate().unwrap();
        provider
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();

        let backup_path = dir.path().join("backup.db");
        let report = provider.backup_to(&backup_path).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.record_count, 1);

        provider.delete_device(1).unwrap();
        assert!(provider.list_devices().unwrap().is_empty());

        let restored = provider.restore_from(&backup_path).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(provider.list_devices().unwrap().len(), 1);
    }
}
