//! Discovery engine: bounded-concurrency CIDR sweep plus mDNS probe,
//! merged and deduplicated by MAC. Hits become short-lived
//! `DiscoveredDevice` rows and upserts into the device table that never
//! touch user-owned fields.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::{pin_mut, StreamExt};
use ipnet::{IpNet, Ipv4Net};
use mdns::RecordKind;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::client::types::ProbeIdentity;
use crate::error::{Error, Result};
use crate::model::DiscoveredDevice;
use crate::store::SharedStore;

const MDNS_SERVICE: &str = "_shelly._tcp.local";
const MDNS_FALLBACK_SERVICE: &str = "_http._tcp.local";

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub concurrent_scans: usize,
    pub probe_timeout: Duration,
    /// TTL stamped onto discovered rows.
    pub ttl: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            concurrent_scans: 10,
            probe_timeout: Duration::from_secs(1),
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub found: Vec<DiscoveredDevice>,
    pub errors: Vec<String>,
}

/// Next IPv4 address in numeric order. `255.255.255.255` has no successor.
pub fn next_ip(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(ip).checked_add(1).map(Ipv4Addr::from)
}

/// Host addresses of a network. Network and broadcast addresses are
/// excluded for prefixes shorter than /31; /31 and /32 yield every address.
fn enumerate_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let mut hosts = Vec::new();
    if net.prefix_len() >= 31 {
        let mut cursor = Some(net.network());
        while let Some(ip) = cursor {
            if ip > net.broadcast() {
                break;
            }
            hosts.push(ip);
            cursor = next_ip(ip);
        }
        return hosts;
    }

    let mut cursor = next_ip(net.network());
    while let Some(ip) = cursor {
        if ip >= net.broadcast() {
            break;
        }
        hosts.push(ip);
        cursor = next_ip(ip);
    }
    hosts
}

fn probe_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build probe client: {}", e)))
}

/// `GET http://{authority}/shelly` and qualify the body: gen1 `type` or
/// gen2+ `id` must be present.
pub async fn probe_shelly(
    http: &reqwest::Client,
    authority: &str,
    agent_id: &str,
    ttl: Duration,
) -> Option<DiscoveredDevice> {
    let url = format!("http://{}/shelly", authority);
    let resp = http.get(&url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let probe: ProbeIdentity = resp.json().await.ok()?;

    let generation = probe.generation()?;
    let mac = probe.mac.clone()?.to_uppercase();
    // Gen1 reports the model as `type`; Gen2+ as `model` next to `id`.
    let model = if generation == 1 {
        probe.device_type.clone().filter(|t| !t.is_empty())
    } else {
        probe.id.as_ref()?;
        probe.model.clone().filter(|m| !m.is_empty()).or_else(|| probe.id.clone())
    };

    let now = Utc::now();
    Some(DiscoveredDevice {
        id: 0,
        mac,
        agent_id: agent_id.to_string(),
        ssid: None,
        model,
        generation: Some(generation),
        ip: Some(authority.split(':').next().unwrap_or(authority).to_string()),
        signal: None,
        discovered_at: now,
        expires_at: now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)),
    })
}

/// Sweep a CIDR with `concurrent_scans` workers. Results are appended
/// under one mutex; a deadline returns partial results plus an error.
pub async fn scan_network(
    cidr: &str,
    opts: &DiscoveryOptions,
    deadline: Option<Duration>,
) -> Result<ScanOutcome> {
    let net: IpNet = cidr
        .parse()
        .map_err(|_| Error::Validation(format!("invalid CIDR '{}'", cidr)))?;
    let IpNet::V4(net) = net else {
        return Err(Error::Validation("only IPv4 networks can be swept".into()));
    };

    let hosts = enumerate_hosts(net);
    tracing::info!(cidr, hosts = hosts.len(), workers = opts.concurrent_scans, "starting sweep");

    let http = probe_http_client(opts.probe_timeout)?;
    let semaphore = Arc::new(Semaphore::new(opts.concurrent_scans.max(1)));
    let results: Arc<Mutex<Vec<DiscoveredDevice>>> = Arc::new(Mutex::new(Vec::new()));
    let mut workers = JoinSet::new();

    for ip in hosts {
        let semaphore = semaphore.clone();
        let http = http.clone();
        let results = results.clone();
        let ttl = opts.ttl;
        workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else { return };
            if let Some(found) = probe_shelly(&http, &ip.to_string(), "http-scan", ttl).await {
                tracing::debug!(ip = %ip, mac = %found.mac, "sweep hit");
                results.lock().unwrap_or_else(|e| e.into_inner()).push(found);
            }
        });
    }

    let mut outcome = ScanOutcome::default();
    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    match deadline {
        Some(deadline) => {
            if tokio::time::timeout(deadline, drain).await.is_err() {
                workers.abort_all();
                outcome
                    .errors
                    .push(format!("scan of {} timed out; returning partial results", cidr));
            }
        }
        None => drain.await,
    }

    outcome.found = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
    tracing::info!(cidr, found = outcome.found.len(), "sweep finished");
    Ok(outcome)
}

/// Pick the best address from an mDNS response: IPv4 first, then
/// non-link-local IPv6, then a DNS lookup of the advertised host.
async fn best_address(records: &[RecordKind]) -> Option<IpAddr> {
    let mut v6: Option<IpAddr> = None;
    let mut hostname: Option<String> = None;

    for kind in records {
        match kind {
            RecordKind::A(addr) => return Some(IpAddr::V4(*addr)),
            RecordKind::AAAA(addr) => {
                if !addr.is_loopback() && (addr.segments()[0] & 0xffc0) != 0xfe80 {
                    v6.get_or_insert(IpAddr::V6(*addr));
                }
            }
            RecordKind::SRV { target, .. } => hostname = Some(target.clone()),
            _ => {}
        }
    }
    if v6.is_some() {
        return v6;
    }

    let host = hostname?;
    let addrs = tokio::net::lookup_host(format!("{}:80", host.trim_end_matches('.')))
        .await
        .ok()?;
    addrs.map(|sa| sa.ip()).next()
}

async fn mdns_service_sweep(
    service: &str,
    opts: &DiscoveryOptions,
    window: Duration,
) -> Vec<DiscoveredDevice> {
    let mut found = Vec::new();
    let Ok(http) = probe_http_client(opts.probe_timeout) else { return found };

    let discovery = match mdns::discover::all(service, Duration::from_secs(1)) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(service, error = %e, "mDNS discovery unavailable");
            return found;
        }
    };
    let stream = discovery.listen();
    pin_mut!(stream);

    let collect = async {
        while let Some(next) = stream.next().await {
            let response = match next {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(service, error = %e, "mDNS response error");
                    continue;
                }
            };
            let records: Vec<RecordKind> = response.records().map(|r| r.kind.clone()).collect();
            if let Some(addr) = best_address(&records).await {
                if let Some(mut hit) =
                    probe_shelly(&http, &addr.to_string(), "mdns", opts.ttl).await
                {
                    hit.ip = Some(addr.to_string());
                    found.push(hit);
                }
            }
        }
    };
    let _ = tokio::time::timeout(window, collect).await;
    found
}

/// Query `_shelly._tcp`, falling back to `_http._tcp`, confirming each
/// candidate with the HTTP probe.
pub async fn mdns_discover(opts: &DiscoveryOptions, window: Duration) -> Vec<DiscoveredDevice> {
    let found = mdns_service_sweep(MDNS_SERVICE, opts, window).await;
    if !found.is_empty() {
        return found;
    }
    mdns_service_sweep(MDNS_FALLBACK_SERVICE, opts, window).await
}

/// Merge scan results by MAC; the first record for a MAC wins.
pub fn merge_by_mac(batches: Vec<Vec<DiscoveredDevice>>) -> Vec<DiscoveredDevice> {
    let mut seen: HashMap<String, DiscoveredDevice> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for record in batches.into_iter().flatten() {
        if !seen.contains_key(&record.mac) {
            order.push(record.mac.clone());
            seen.insert(record.mac.clone(), record);
        }
    }
    order.into_iter().filter_map(|mac| seen.remove(&mac)).collect()
}

/// HTTP sweep on each network and mDNS, run in parallel and deduplicated.
pub async fn combined_discovery(
    networks: &[String],
    opts: &DiscoveryOptions,
    timeout: Duration,
) -> ScanOutcome {
    let mut sweeps = JoinSet::new();
    for cidr in networks {
        let cidr = cidr.clone();
        let opts = opts.clone();
        sweeps.spawn(async move { scan_network(&cidr, &opts, Some(timeout)).await });
    }
    let mdns_opts = opts.clone();
    let mdns_task = tokio::spawn(async move { mdns_discover(&mdns_opts, timeout).await });

    let mut batches = Vec::new();
    let mut errors = Vec::new();
    while let Some(joined) = sweeps.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                batches.push(outcome.found);
                errors.extend(outcome.errors);
            }
            Ok(Err(e)) => errors.push(e.to_string()),
            Err(e) => errors.push(format!("sweep task failed: {}", e)),
        }
    }
    match mdns_task.await {
        Ok(found) => batches.push(found),
        Err(e) => errors.push(format!("mDNS task failed: {}", e)),
    }

    ScanOutcome { found: merge_by_mac(batches), errors }
}

/// Default name for devices first seen by discovery.
pub fn initial_device_name(record: &DiscoveredDevice) -> String {
    let kind = classify_device_type(record.model.as_deref().unwrap_or(""));
    let mac = &record.mac;
    let tail = &mac[mac.len().saturating_sub(4)..];
    format!("{} {}", kind, tail)
}

/// Store every hit as a transient discovery row and upsert the device
/// table. Returns the number of device rows created or refreshed.
pub fn persist_results(store: &SharedStore, outcome: &ScanOutcome) -> Result<usize> {
    let mut updated = 0;
    for record in &outcome.found {
        store.insert_discovered(record)?;
        store.upsert_device_from_discovery(record, &initial_device_name(record))?;
        updated += 1;
    }
    Ok(updated)
}

/// Deterministic device-type classification from the model string: exact
/// Gen1 codes, Gen2+ prefixes, then keyword fallback.
pub fn classify_device_type(model: &str) -> &'static str {
    match model {
        "SHSW-1" | "SHSW-PM" | "SHSW-L" => return "Relay Switch",
        "SHSW-25" => return "Dual Relay Switch",
        "SHPLG-S" | "SHPLG-1" | "SHPLG-U1" => return "Smart Plug",
        "SHDM-1" | "SHDM-2" => return "Dimmer",
        "SHRGBW2" => return "RGBW Controller",
        "SHIX3-1" => return "Input Controller",
        "SHEM" | "SHEM-3" => return "Energy Meter",
        "SHHT-1" => return "Humidity & Temperature Sensor",
        "SHWT-1" => return "Flood Sensor",
        "SHDW-1" | "SHDW-2" => return "Door/Window Sensor",
        "SHBTN-1" | "SHBTN-2" => return "Button",
        "SHMOS-01" | "SHMOS-02" => return "Motion Sensor",
        "SHGS-1" => return "Gas Sensor",
        "SHTRV-01" => return "Thermostatic Valve",
        _ => {}
    }

    for (prefix, kind) in [
        ("SNSW-", "Plus Switch"),
        ("SNPL-", "Plus Plug"),
        ("SNSN-", "Plus Sensor"),
        ("SNDM-", "Plus Dimmer"),
        ("SNDC-", "Plus RGBW Controller"),
        ("SPSW-", "Pro Switch"),
        ("SPEM-", "Pro Energy Meter"),
        ("SPSH-", "Pro Shutter"),
    ] {
        if model.starts_with(prefix) {
            return kind;
        }
    }

    let lower = model.to_lowercase();
    for (keyword, kind) in [
        ("plug", "Smart Plug"),
        ("dimmer", "Dimmer"),
        ("rgbw", "RGBW Controller"),
        ("roller", "Roller Shutter"),
        ("door", "Door/Window Sensor"),
        ("motion", "Motion Sensor"),
        ("smoke", "Smoke Sensor"),
        ("button", "Button"),
        ("valve", "Valve"),
        ("em", "Energy Meter"),
        ("ht", "Humidity & Temperature Sensor"),
    ] {
        if lower.contains(keyword) {
            return kind;
        }
    }

    "Shelly Device"
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host_of(server: &MockServer) -> String {
        server.uri().trim_start_matches("http://").to_string()
    }

    #[test]
    fn test_next_ip_crosses_octet() {
        assert_eq!(
            next_ip(Ipv4Addr::new(192, 168, 1, 255)),
            Some(Ipv4Addr::new(192, 168, 2, 0))
        );
        assert_eq!(next_ip(Ipv4Addr::new(255, 255, 255, 255)), None);
    }

    #[test]
    fn test_enumerate_hosts_excludes_network_and_broadcast() {
        let net: Ipv4Net = "192.168.1.0/30".parse().unwrap();
        let hosts = enumerate_hosts(net);
        assert_eq!(hosts, vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]);
    }

    #[test]
    fn test_enumerate_hosts_point_to_point() {
        let net: Ipv4Net = "10.0.0.0/31".parse().unwrap();
        assert_eq!(enumerate_hosts(net).len(), 2);
        let net: Ipv4Net = "10.0.0.7/32".parse().unwrap();
        assert_eq!(enumerate_hosts(net), vec![Ipv4Addr::new(10, 0, 0, 7)]);
    }

    #[test]
    fn test_enumerate_hosts_spans_octets() {
        let net: Ipv4Net = "192.168.1.0/23".parse().unwrap();
        let hosts = enumerate_hosts(net);
        assert_eq!(hosts.len(), 510);
        assert!(hosts.contains(&Ipv4Addr::new(192, 168, 2, 0)));
    }

    #[tokio::test]
    async fn test_probe_qualifies_gen1() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"type":"SHSW-1","mac":"aabbccddeeff","auth":false,"fw":"v1.14"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let http = probe_http_client(Duration::from_secs(1)).unwrap();
        let hit = probe_shelly(&http, &host_of(&server), "http-scan", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(hit.mac, "AABBCCDDEEFF");
        assert_eq!(hit.generation, Some(1));
        assert_eq!(hit.model.as_deref(), Some("SHSW-1"));
        assert!(hit.expires_at > hit.discovered_at);
    }

    #[tokio::test]
    async fn test_probe_qualifies_gen2_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":"shellyplus1-a8032ab12cd4","mac":"A8032AB12CD4","model":"SNSW-001X16EU","gen":2}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let http = probe_http_client(Duration::from_secs(1)).unwrap();
        let hit = probe_shelly(&http, &host_of(&server), "mdns", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(hit.generation, Some(2));
        assert_eq!(hit.model.as_deref(), Some("SNSW-001X16EU"));
    }

    #[tokio::test]
    async fn test_probe_rejects_non_shelly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(r#"{"hello":"world"}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let http = probe_http_client(Duration::from_secs(1)).unwrap();
        assert!(probe_shelly(&http, &host_of(&server), "http-scan", Duration::from_secs(60))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_cidr() {
        let outcome = scan_network("not-a-cidr", &DiscoveryOptions::default(), None).await;
        assert!(matches!(outcome, Err(Error::Validation(_))));
    }

    #[test]
    fn test_merge_by_mac_first_wins() {
        let now = Utc::now();
        let record = |mac: &str, agent: &str| DiscoveredDevice {
            id: 0,
            mac: mac.to_string(),
            agent_id: agent.to_string(),
            ssid: None,
            model: None,
            generation: Some(2),
            ip: None,
            signal: None,
            discovered_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        };
        let merged = merge_by_mac(vec![
            vec![record("AA", "http-scan"), record("BB", "http-scan")],
            vec![record("AA", "mdns"), record("CC", "mdns")],
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].agent_id, "http-scan");
        assert_eq!(
            merged.iter().map(|r| r.mac.as_str()).collect::<Vec<_>>(),
            vec!["AA", "BB", "CC"]
        );
    }

    #[test]
    fn test_classify_exact_and_prefix() {
        assert_eq!(classify_device_type("SHSW-1"), "Relay Switch");
        assert_eq!(classify_device_type("SHPLG-S"), "Smart Plug");
        assert_eq!(classify_device_type("SNSN-0013A"), "Plus Sensor");
        assert_eq!(classify_device_type("SPEM-003CEBEU"), "Pro Energy Meter");
    }

    #[test]
    fn test_classify_keyword_fallback() {
        assert_eq!(classify_device_type("shellydimmer2"), "Dimmer");
        assert_eq!(classify_device_type("shellyplug-s"), "Smart Plug");
        assert_eq!(classify_device_type("SOMETHING-NEW"), "Shelly Device");
    }

    #[test]
    fn test_initial_device_name() {
        let now = Utc::now();
        let record = DiscoveredDevice {
            id: 0,
            mac: "AABBCCDDEEFF".into(),
            agent_id: "http-scan".into(),
            ssid: None,
            model: Some("SHSW-1".into()),
            generation: Some(1),
            ip: None,
            signal: None,
            discovered_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        };
        assert_eq!(initial_device_name(&record), "Relay Switch EEFF");
    }
}
