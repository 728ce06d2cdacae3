//! Metrics collector.
//!
//! Samples system and fleet gauges at a fixed interval, keeps the latest
//! snapshot for late subscribers, publishes every sample on a broadcast
//! channel for the WebSocket hub, and mirrors the gauges into a
//! prometheus registry for the text exposition endpoint.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::store::SharedStore;

const LINUX_CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub devices: DeviceMetrics,
    pub drift: DriftMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_rss_kb: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceMetrics {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftMetrics {
    pub total_reports: u64,
    pub unresolved: u64,
}

struct PromGauges {
    cpu_percent: Gauge,
    memory_rss_kb: IntGauge,
    uptime_seconds: IntGauge,
    devices_total: IntGauge,
    devices_online: IntGauge,
    devices_offline: IntGauge,
    drift_reports_total: IntGauge,
    drift_unresolved: IntGauge,
}

pub struct Collector {
    store: SharedStore,
    interval: Duration,
    started_at: Instant,
    tx: broadcast::Sender<MetricsSnapshot>,
    latest: RwLock<Option<MetricsSnapshot>>,
    registry: Registry,
    gauges: PromGauges,
    /// (total process ticks, when read) from the previous sample.
    cpu_state: Mutex<Option<(u64, Instant)>>,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    // Names are static and valid; registration on a fresh registry cannot
    // collide.
    let gauge = IntGauge::new(name, help).expect("static gauge name");
    let _ = registry.register(Box::new(gauge.clone()));
    gauge
}

impl Collector {
    pub fn new(store: SharedStore, interval: Duration) -> std::sync::Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        let registry = Registry::new();

        let cpu_percent = Gauge::new(
            "shelly_manager_cpu_percent",
            "Process CPU usage percentage",
        )
        .expect("static gauge name");
        let _ = registry.register(Box::new(cpu_percent.clone()));

        let gauges = PromGauges {
            cpu_percent,
            memory_rss_kb: int_gauge(
                &registry,
                "shelly_manager_memory_rss_kb",
                "Resident set size in kilobytes",
            ),
            uptime_seconds: int_gauge(
                &registry,
                "shelly_manager_uptime_seconds",
                "Manager uptime in seconds",
            ),
            devices_total: int_gauge(
                &registry,
                "shelly_manager_devices_total",
                "Known devices",
            ),
            devices_online: int_gauge(
                &registry,
                "shelly_manager_devices_online",
                "Devices currently online",
            ),
            devices_offline: int_gauge(
                &registry,
                "shelly_manager_devices_offline",
                "Devices currently offline",
            ),
            drift_reports_total: int_gauge(
                &registry,
                "shelly_manager_drift_reports_total",
                "Drift reports recorded",
            ),
            drift_unresolved: int_gauge(
                &registry,
                "shelly_manager_drift_unresolved",
                "Unresolved drift reports",
            ),
        };

        std::sync::Arc::new(Self {
            store,
            interval,
            started_at: Instant::now(),
            tx,
            latest: RwLock::new(None),
            registry,
            gauges,
            cpu_state: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Take one sample: fleet counts from the store, process stats from
    /// /proc.
    pub fn sample(&self) -> MetricsSnapshot {
        let (total, online, offline) = self.store.device_counts().unwrap_or((0, 0, 0));
        let (reports, unresolved) = self.store.drift_counts().unwrap_or((0, 0));

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            system: SystemMetrics {
                cpu_percent: self.cpu_percent(),
                memory_rss_kb: read_rss_kb().unwrap_or(0),
                uptime_seconds: self.started_at.elapsed().as_secs(),
            },
            devices: DeviceMetrics { total, online, offline },
            drift: DriftMetrics { total_reports: reports, unresolved },
        };

        self.gauges.cpu_percent.set(snapshot.system.cpu_percent);
        self.gauges.memory_rss_kb.set(snapshot.system.memory_rss_kb as i64);
        self.gauges.uptime_seconds.set(snapshot.system.uptime_seconds as i64);
        self.gauges.devices_total.set(total as i64);
        self.gauges.devices_online.set(online as i64);
        self.gauges.devices_offline.set(offline as i64);
        self.gauges.drift_reports_total.set(reports as i64);
        self.gauges.drift_unresolved.set(unresolved as i64);

        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        snapshot
    }

    /// Sampling loop; every snapshot goes out on the broadcast channel.
    pub async fn run(self: std::sync::Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = self.sample();
            // No receivers is fine; the hub may have no subscribers.
            let _ = self.tx.send(snapshot);
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(ticks) = read_process_ticks() else { return 0.0 };
        let now = Instant::now();
        let mut state = self.cpu_state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = state.replace((ticks, now));
        let Some((prev_ticks, prev_at)) = previous else { return 0.0 };

        let elapsed = now.duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let used = (ticks.saturating_sub(prev_ticks)) as f64 / LINUX_CLOCK_TICKS_PER_SEC;
        (used / elapsed * 10000.0).round() / 100.0
    }

    /// Prometheus text exposition of the mirrored gauges.
    pub fn prometheus_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    /// Dashboard summary over the latest snapshot.
    pub fn dashboard(&self) -> serde_json::Value {
        let latest = self.latest();
        match latest {
            Some(snapshot) => json!({
                "updated_at": snapshot.timestamp,
                "devices": snapshot.devices,
                "drift": snapshot.drift,
                "system": snapshot.system,
                "health": if snapshot.drift.unresolved == 0 { "ok" } else { "drifted" },
            }),
            None => json!({"health": "starting"}),
        }
    }
}

/// VmRSS from /proc/self/status, in kilobytes.
fn read_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            return parts.get(1)?.parse().ok();
        }
    }
    None
}

/// utime + stime from /proc/self/stat, in clock ticks.
fn read_process_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // comm may contain spaces; fields start after the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Provider;
    use crate::model::NewDevice;
    use crate::store::SqliteProvider;
    use std::sync::Arc;

    fn collector() -> (Arc<Collector>, SharedStore) {
        let provider = SqliteProvider::open_in_memory().unwrap();
        provider.migrate().unwrap();
        let store: SharedStore = Arc::new(provider);
        (Collector::new(store.clone(), Duration::from_secs(1)), store)
    }

    #[test]
    fn test_sample_counts_devices() {
        let (collector, store) = collector();
        store
            .insert_device(&NewDevice { mac: "AA".into(), ip: "10.0.0.1".into(), ..Default::default() })
            .unwrap();
        let snapshot = collector.sample();
        assert_eq!(snapshot.devices.total, 1);
        assert_eq!(snapshot.devices.online, 0);
        assert!(collector.latest().is_some());
    }

    #[test]
    fn test_prometheus_text_contains_gauges() {
        let (collector, _) = collector();
        collector.sample();
        let text = collector.prometheus_text();
        assert!(text.contains("shelly_manager_devices_total"));
        assert!(text.contains("shelly_manager_memory_rss_kb"));
        assert!(text.contains("# HELP"));
    }

    #[test]
    fn test_dashboard_before_and_after_sample() {
        let (collector, _) = collector();
        assert_eq!(collector.dashboard()["health"], "starting");
        collector.sample();
        assert_eq!(collector.dashboard()["health"], "ok");
    }

    #[tokio::test]
    async fn test_snapshots_broadcast_in_order() {
        let (collector, _) = collector();
        let mut rx = collector.subscribe();
        let first = collector.sample();
        collector.tx.send(first.clone()).unwrap();
        let second = collector.sample();
        collector.tx.send(second.clone()).unwrap();

        let got_first = rx.recv().await.unwrap();
        let got_second = rx.recv().await.unwrap();
        assert!(got_first.timestamp <= got_second.timestamp);
    }
}
