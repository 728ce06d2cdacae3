//! Scheduled drift runs.
//!
//! One loop wakes at the earliest next-run across enabled schedules. A run
//! enumerates the schedule's selector and fans detection across a bounded
//! worker pool; per-device failures become reports, never abort the run.
//! Runs of the same schedule are serialized; different schedules may
//! overlap.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::ClientFactory;
use crate::drift;
use crate::error::{Error, Result};
use crate::model::{Device, DriftReport, DriftSchedule, DriftSeverity};
use crate::notify::Notifier;
use crate::store::SharedStore;

/// How long the loop sleeps when no schedule is due soon; keeps newly
/// created schedules from waiting behind a long sleep.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub schedule_id: Option<i64>,
    pub devices_checked: usize,
    pub devices_drifted: usize,
    pub errors: usize,
}

pub struct DriftScheduler {
    store: SharedStore,
    factory: Arc<ClientFactory>,
    notifier: Arc<Notifier>,
    /// Schedules currently mid-run; a due schedule already here is skipped.
    running: Mutex<HashSet<i64>>,
    concurrency: usize,
}

/// Parse a 5-field cron expression (the `cron` crate wants seconds).
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let fields = expr.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {}", expr),
        6 | 7 => expr.to_string(),
        _ => return Err(Error::Validation(format!("invalid cron expression '{}'", expr))),
    };
    CronSchedule::from_str(&full)
        .map_err(|e| Error::Validation(format!("invalid cron expression '{}': {}", expr, e)))
}

pub fn next_occurrence(expr: &str) -> Result<DateTime<Utc>> {
    parse_cron(expr)?
        .upcoming(Utc)
        .next()
        .ok_or_else(|| Error::Validation(format!("cron expression '{}' never fires", expr)))
}

impl DriftScheduler {
    pub fn new(
        store: SharedStore,
        factory: Arc<ClientFactory>,
        notifier: Arc<Notifier>,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            factory,
            notifier,
            running: Mutex::new(HashSet::new()),
            concurrency: concurrency.max(1),
        })
    }

    /// Resolve a schedule selector: `all`, `device:<id>[,<id>…]`, `tag:<tag>`.
    pub fn select_devices(&self, selector: &str) -> Result<Vec<Device>> {
        if selector.is_empty() || selector == "all" {
            return self.store.list_devices();
        }
        if let Some(ids) = selector.strip_prefix("device:") {
            let mut devices = Vec::new();
            for raw in ids.split(',') {
                let id: i64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad device selector '{}'", selector)))?;
                devices.push(self.store.get_device(id)?);
            }
            return Ok(devices);
        }
        if let Some(tag) = selector.strip_prefix("tag:") {
            return self.store.devices_by_tag(tag);
        }
        Err(Error::Validation(format!("unknown selector '{}'", selector)))
    }

    /// Detect drift for one device and persist the report. Devices with no
    /// desired config are skipped (`Ok(None)`).
    pub async fn detect_device(
        &self,
        device: &Device,
        schedule_id: Option<i64>,
    ) -> Result<Option<DriftReport>> {
        let Some(desired) = &device.desired_config else {
            return Ok(None);
        };

        let report = match self.fetch_live(device).await {
            Ok(live) => {
                let entries = drift::detect(desired, &live);
                self.store.set_applied(device.id, entries.is_empty())?;
                DriftReport {
                    id: 0,
                    device_id: device.id,
                    schedule_id,
                    entries,
                    error: None,
                    resolved: false,
                    resolution_note: None,
                    created_at: Utc::now(),
                }
            }
            Err(e) => DriftReport {
                id: 0,
                device_id: device.id,
                schedule_id,
                entries: Vec::new(),
                error: Some(e.to_string()),
                resolved: false,
                resolution_note: None,
                created_at: Utc::now(),
            },
        };

        let saved = self.store.insert_drift_report(&report)?;
        if !saved.entries.is_empty() {
            let worst: Option<DriftSeverity> = saved.entries.iter().map(|e| e.severity).min();
            self.notifier
                .dispatch(
                    "drift.detected",
                    json!({
                        "device_id": device.id,
                        "device_name": device.name,
                        "entries": saved.entries.len(),
                        "report_id": saved.id,
                    }),
                    worst,
                )
                .await;
        }
        Ok(Some(saved))
    }

    async fn fetch_live(&self, device: &Device) -> Result<serde_json::Value> {
        if device.ip.is_empty() {
            return Err(Error::DeviceUnreachable(format!("device {} has no ip", device.id)));
        }
        let client = self.factory.connect(&device.ip).await?;
        client.get_config().await
    }

    /// Run one schedule now. Per-schedule runs are serialized via the
    /// running set; a second trigger while one is in flight is a no-op.
    pub async fn run_schedule(self: &Arc<Self>, schedule: &DriftSchedule) -> Result<RunSummary> {
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if !running.insert(schedule.id) {
                tracing::debug!(schedule = schedule.id, "run already in flight, skipping");
                return Ok(RunSummary {
                    schedule_id: Some(schedule.id),
                    devices_checked: 0,
                    devices_drifted: 0,
                    errors: 0,
                });
            }
        }

        let outcome = self.run_schedule_inner(schedule).await;

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&schedule.id);
        outcome
    }

    async fn run_schedule_inner(self: &Arc<Self>, schedule: &DriftSchedule) -> Result<RunSummary> {
        let devices = self.select_devices(&schedule.selector)?;
        tracing::info!(
            schedule = schedule.id,
            devices = devices.len(),
            "starting drift run"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<(usize, usize)> = JoinSet::new();
        for device in devices.iter().cloned() {
            let scheduler = self.clone();
            let semaphore = semaphore.clone();
            let schedule_id = schedule.id;
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else { return (0, 1) };
                match scheduler.detect_device(&device, Some(schedule_id)).await {
                    Ok(Some(report)) if !report.entries.is_empty() => (1, 0),
                    Ok(_) => (0, 0),
                    Err(e) => {
                        tracing::warn!(device = device.id, error = %e, "drift detection failed");
                        (0, 1)
                    }
                }
            });
        }

        let mut drifted = 0;
        let mut errors = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((d, e)) => {
                    drifted += d;
                    errors += e;
                }
                Err(_) => errors += 1,
            }
        }

        let next = next_occurrence(&schedule.cron).ok();
        self.store.set_schedule_runs(schedule.id, Some(Utc::now()), next)?;

        let summary = RunSummary {
            schedule_id: Some(schedule.id),
            devices_checked: devices.len(),
            devices_drifted: drifted,
            errors,
        };
        tracing::info!(
            schedule = schedule.id,
            checked = summary.devices_checked,
            drifted = summary.devices_drifted,
            errors = summary.errors,
            "drift run finished"
        );
        Ok(summary)
    }

    /// The scheduler loop. Sleeps until the earliest next-run across
    /// enabled schedules, bounded so schedule edits are picked up.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            let sleep_for = match self.prepare_next_wake() {
                Ok(Some(when)) => {
                    let until = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    until.min(MAX_SLEEP)
                }
                Ok(None) => MAX_SLEEP,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler could not load schedules");
                    MAX_SLEEP
                }
            };
            tokio::time::sleep(sleep_for.max(Duration::from_secs(1))).await;

            let due = match self.due_schedules() {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(error = %e, "scheduler could not load due schedules");
                    continue;
                }
            };
            for schedule in due {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.run_schedule(&schedule).await {
                        tracing::error!(schedule = schedule.id, error = %e, "drift run failed");
                    }
                });
            }
        }
    }

    /// Make sure every enabled schedule has a next_run and return the
    /// earliest one.
    fn prepare_next_wake(&self) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for schedule in self.store.list_drift_schedules()? {
            if !schedule.enabled {
                continue;
            }
            let next = match schedule.next_run {
                Some(next) => next,
                None => {
                    let next = next_occurrence(&schedule.cron)?;
                    self.store
                        .set_schedule_runs(schedule.id, schedule.last_run, Some(next))?;
                    next
                }
            };
            earliest = Some(match earliest {
                Some(current) if current <= next => current,
                _ => next,
            });
        }
        Ok(earliest)
    }

    fn due_schedules(&self) -> Result<Vec<DriftSchedule>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_drift_schedules()?
            .into_iter()
            .filter(|s| s.enabled && s.next_run.is_some_and(|next| next <= now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::client::ClientOptions;
    use crate::model::NewDevice;
    use crate::store::SqliteProvider;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scheduler_with_store() -> (Arc<DriftScheduler>, SharedStore) {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        let store: SharedStore = Arc::new(provider);
        let factory = Arc::new(ClientFactory::new(ClientOptions {
            attempts: 1,
            timeout: Duration::from_secs(1),
            ..Default::default()
        }));
        let notifier = Notifier::new(store.clone());
        (DriftScheduler::new(store.clone(), factory, notifier, 4), store)
    }

    #[test]
    fn test_parse_cron_five_fields() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn test_next_occurrence_in_future() {
        let next = next_occurrence("0 0 * * *").unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn test_select_devices_variants() {
        let (scheduler, store) = scheduler_with_store();
        let a = store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();
        let b = store
            .insert_device(&NewDevice { mac: "BB".into(), ip: "10.0.0.2".into(), ..Default::default() })
            .unwrap();
        store.add_device_tag(b.id, "lab").unwrap();

        assert_eq!(scheduler.select_devices("all").unwrap().len(), 2);
        let picked = scheduler.select_devices(&format!("device:{}", a.id)).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].mac, "AA");
        let tagged = scheduler.select_devices("tag:lab").unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].mac, "BB");
        assert!(scheduler.select_devices("bogus:x").is_err());
    }

    #[tokio::test]
    async fn test_detect_skips_devices_without_desired_config() {
        let (scheduler, store) = scheduler_with_store();
        let device = store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();
        let result = scheduler.detect_device(&device, None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_device_failure_recorded_in_report() {
        let (scheduler, store) = scheduler_with_store();
        let device = store
            .insert_device(&NewDevice {
                // Unroutable: detection must fail and land in the report.
                mac: "AA".into(),
                ip: "127.0.0.1:1".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .set_desired_config(device.id, &serde_json::json!({"wifi": {"ssid": "lab"}}))
            .unwrap();
        let device = store.get_device(device.id).unwrap();

        let report = scheduler.detect_device(&device, None).await.unwrap().unwrap();
        assert!(report.error.is_some());
        assert!(report.entries.is_empty());
        assert_eq!(store.list_drift_reports(Some(device.id), true, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_run_produces_reports_and_updates_runs() {
        let server = MockServer::start().await;
        // The factory probes generation first, then fetches config.
        Mock::given(method("GET"))
            .and(path("/rpc/Shelly.GetDeviceInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":"shellyplus1-aa","mac":"AA","gen":2}"#,
                "application/json",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":1,"result":{"wifi":{"sta":{"ssid":"guest"}}}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let (scheduler, store) = scheduler_with_store();
        let authority = server.uri().trim_start_matches("http://").to_string();
        let device = store
            .insert_device(&NewDevice { mac: "AA".into(), ip: authority, ..Default::default() })
            .unwrap();
        store
            .set_desired_config(device.id, &serde_json::json!({"wifi": {"sta": {"ssid": "lab"}}}))
            .unwrap();

        let schedule = store
            .insert_drift_schedule(&DriftSchedule {
                id: 0,
                name: "nightly".into(),
                cron: "0 3 * * *".into(),
                selector: "all".into(),
                enabled: true,
                last_run: None,
                next_run: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .unwrap();

        let summary = scheduler.run_schedule(&schedule).await.unwrap();
        assert_eq!(summary.devices_checked, 1);
        assert_eq!(summary.devices_drifted, 1);
        assert_eq!(summary.errors, 0);

        let updated = store.get_drift_schedule(schedule.id).unwrap();
        assert!(updated.last_run.is_some());
        assert!(updated.next_run.is_some());
        assert!(updated.next_run.unwrap() > Utc::now());

        let reports = store.list_drift_reports(Some(device.id), true, 10).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].entries.len(), 1);
        assert_eq!(reports[0].entries[0].path, "wifi.sta.ssid");
    }
}
