//! Gen1 client: path-based REST endpoints with HTTP Basic auth.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

use super::types::{DeviceInfo, DeviceMetrics, EnergyReading, ProbeIdentity, UpdateInfo};
use super::{send_with_retry, status_error, Client, ClientOptions};

pub struct Gen1Client {
    address: String,
    http: reqwest::Client,
    opts: ClientOptions,
}

impl Gen1Client {
    pub fn new(address: &str, opts: ClientOptions) -> Result<Self> {
        Ok(Self {
            address: address.to_string(),
            http: opts.build_http()?,
            opts,
        })
    }

    async fn get(&self, path_and_query: &str) -> Result<reqwest::Response> {
        let url = format!("http://{}{}", self.address, path_and_query);
        let mut req = self.http.get(&url);
        if let Some(creds) = &self.opts.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let resp = send_with_retry(&self.opts, req).await?;
        if resp.status().as_u16() == 401 {
            return if self.opts.credentials.is_some() {
                Err(Error::AuthFailed(format!("{} rejected basic credentials", self.address)))
            } else {
                Err(Error::AuthRequired)
            };
        }
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(resp)
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value> {
        let resp = self.get(path_and_query).await?;
        resp.json()
            .await
            .map_err(|e| Error::Protocol(format!("malformed device body: {}", e)))
    }

    /// Apply one settings section as query parameters.
    async fn apply_settings(&self, path: &str, section: &serde_json::Map<String, Value>) -> Result<()> {
        let params = scalar_params(section);
        if params.is_empty() {
            return Ok(());
        }
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencode(v)))
            .collect();
        self.get(&format!("{}?{}", path, query.join("&"))).await?;
        Ok(())
    }
}

/// Flatten scalar entries of a settings object into query parameters.
fn scalar_params(section: &serde_json::Map<String, Value>) -> Vec<(String, String)> {
    section
        .iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            Value::Bool(b) => Some((k.clone(), b.to_string())),
            Value::Number(n) => Some((k.clone(), n.to_string())),
            _ => None,
        })
        .collect()
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[async_trait]
impl Client for Gen1Client {
    fn generation(&self) -> u8 {
        1
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn get_info(&self) -> Result<DeviceInfo> {
        let resp = self.get("/shelly").await?;
        let probe: ProbeIdentity = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("malformed /shelly body: {}", e)))?;
        let device_type = probe.device_type.clone().unwrap_or_default();
        let mac = probe.mac.clone().unwrap_or_default();
        Ok(DeviceInfo {
            id: format!("shelly{}-{}", device_type.to_lowercase(), mac.to_lowercase()),
            mac,
            model: device_type,
            generation: 1,
            firmware: probe.firmware(),
            auth_enabled: probe.auth.unwrap_or(false),
            name: probe.name,
            app: None,
        })
    }

    async fn get_status(&self) -> Result<Value> {
        self.get_json("/status").await
    }

    async fn get_config(&self) -> Result<Value> {
        self.get_json("/settings").await
    }

    async fn set_config(&self, config: &Value) -> Result<()> {
        let obj = config
            .as_object()
            .ok_or_else(|| Error::Validation("config must be a JSON object".into()))?;

        // Root-level scalars go straight to /settings; sections map to
        // /settings/<section> and arrays to /settings/<section>/<n>.
        let root = serde_json::Map::from_iter(
            obj.iter()
                .filter(|(_, v)| !v.is_object() && !v.is_array())
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.apply_settings("/settings", &root).await?;

        for (section, value) in obj {
            match value {
                Value::Object(map) => {
                    self.apply_settings(&format!("/settings/{}", section), map).await?;
                }
                Value::Array(items) => {
                    for (idx, item) in items.iter().enumerate() {
                        if let Value::Object(map) = item {
                            self.apply_settings(&format!("/settings/{}/{}", section, idx), map)
                                .await?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn set_auth(&self, username: &str, password: &str) -> Result<()> {
        self.get(&format!(
            "/settings/login?enabled=true&username={}&password={}",
            urlencode(username),
            urlencode(password)
        ))
        .await?;
        Ok(())
    }

    async fn reset_auth(&self) -> Result<()> {
        self.get("/settings/login?enabled=false").await?;
        Ok(())
    }

    async fn set_switch(&self, channel: u32, on: bool) -> Result<()> {
        let turn = if on { "on" } else { "off" };
        self.get(&format!("/relay/{}?turn={}", channel, turn)).await?;
        Ok(())
    }

    async fn set_brightness(&self, channel: u32, brightness: u8) -> Result<()> {
        self.get(&format!("/light/{}?turn=on&brightness={}", channel, brightness.min(100)))
            .await?;
        Ok(())
    }

    async fn set_color(&self, channel: u32, r: u8, g: u8, b: u8) -> Result<()> {
        self.get(&format!("/color/{}?turn=on&red={}&green={}&blue={}", channel, r, g, b))
            .await?;
        Ok(())
    }

    async fn set_color_temp(&self, channel: u32, kelvin: u32) -> Result<()> {
        self.get(&format!("/light/{}?temp={}", channel, kelvin)).await?;
        Ok(())
    }

    async fn set_white(&self, channel: u32, brightness: u8) -> Result<()> {
        self.get(&format!("/white/{}?turn=on&brightness={}", channel, brightness.min(100)))
            .await?;
        Ok(())
    }

    async fn set_cover_position(&self, channel: u32, position: u8) -> Result<()> {
        self.get(&format!("/roller/{}?go=to_pos&roller_pos={}", channel, position.min(100)))
            .await?;
        Ok(())
    }

    async fn open_cover(&self, channel: u32) -> Result<()> {
        self.get(&format!("/roller/{}?go=open", channel)).await?;
        Ok(())
    }

    async fn close_cover(&self, channel: u32) -> Result<()> {
        self.get(&format!("/roller/{}?go=close", channel)).await?;
        Ok(())
    }

    async fn stop_cover(&self, channel: u32) -> Result<()> {
        self.get(&format!("/roller/{}?go=stop", channel)).await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.get("/reboot").await?;
        Ok(())
    }

    async fn factory_reset(&self) -> Result<()> {
        self.get("/reset").await?;
        Ok(())
    }

    async fn check_update(&self) -> Result<UpdateInfo> {
        let ota = self.get_json("/ota").await?;
        Ok(UpdateInfo {
            has_update: ota.get("has_update").and_then(Value::as_bool).unwrap_or(false),
            current_version: ota
                .get("old_version")
                .and_then(Value::as_str)
                .map(String::from),
            new_version: ota.get("new_version").and_then(Value::as_str).map(String::from),
        })
    }

    async fn perform_update(&self) -> Result<()> {
        self.get("/ota?update=true").await?;
        Ok(())
    }

    async fn get_metrics(&self) -> Result<DeviceMetrics> {
        let status = self.get_status().await?;
        let meter = status
            .get("meters")
            .and_then(Value::as_array)
            .and_then(|meters| meters.first());
        Ok(DeviceMetrics {
            power_w: meter.and_then(|m| m.get("power")).and_then(Value::as_f64),
            voltage_v: status.get("voltage").and_then(Value::as_f64),
            current_a: None,
            // Gen1 meters count watt-minutes.
            energy_total_wh: meter
                .and_then(|m| m.get("total"))
                .and_then(Value::as_f64)
                .map(|wm| wm / 60.0),
            temperature_c: status.get("temperature").and_then(Value::as_f64),
        })
    }

    async fn get_energy(&self, channel: u32) -> Result<EnergyReading> {
        let meter = self.get_json(&format!("/meter/{}", channel)).await?;
        Ok(EnergyReading {
            channel,
            power_w: meter.get("power").and_then(Value::as_f64),
            total_wh: meter
                .get("total")
                .and_then(Value::as_f64)
                .map(|wm| wm / 60.0)
                .unwrap_or(0.0),
            timestamp: meter.get("timestamp").and_then(Value::as_i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host_of(server: &MockServer) -> String {
        server.uri().trim_start_matches("http://").to_string()
    }

    fn fast_opts() -> ClientOptions {
        ClientOptions {
            attempts: 1,
            retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_info_normalizes_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"type":"SHSW-1","mac":"AABBCCDDEEFF","auth":true,"fw":"20230913-112003/v1.14.0"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = Gen1Client::new(&host_of(&server), fast_opts()).unwrap();
        let info = client.get_info().await.unwrap();
        assert_eq!(info.id, "shellyshsw-1-aabbccddeeff");
        assert_eq!(info.generation, 1);
        assert_eq!(info.model, "SHSW-1");
        assert!(info.auth_enabled);
        assert_eq!(info.firmware, "20230913-112003/v1.14.0");
    }

    #[tokio::test]
    async fn test_set_switch_hits_relay_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/relay/0"))
            .and(query_param("turn", "on"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(r#"{"ison":true}"#, "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Gen1Client::new(&host_of(&server), fast_opts()).unwrap();
        client.set_switch(0, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_auth_header_sent() {
        let server = MockServer::start().await;
        // admin:secret
        Mock::given(method("GET"))
            .and(path("/status"))
            .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let opts = fast_opts().with_credentials("admin", "secret");
        let client = Gen1Client::new(&host_of(&server), opts).unwrap();
        client.get_status().await.unwrap();
    }

    #[tokio::test]
    async fn test_401_without_credentials_is_auth_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = Gen1Client::new(&host_of(&server), fast_opts()).unwrap();
        assert!(matches!(client.get_status().await, Err(Error::AuthRequired)));
    }

    #[tokio::test]
    async fn test_gen1_energy_converts_watt_minutes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/meter/0"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"power":23.4,"total":7200,"timestamp":1700000000}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = Gen1Client::new(&host_of(&server), fast_opts()).unwrap();
        let energy = client.get_energy(0).await.unwrap();
        assert_eq!(energy.total_wh, 120.0);
        assert_eq!(energy.power_w, Some(23.4));
    }

    #[test]
    fn test_scalar_params_skip_nested() {
        let section = serde_json::json!({
            "name": "lamp",
            "max_power": 200,
            "enabled": true,
            "schedule_rules": ["0800-on"],
            "mqtt": {"enable": true}
        });
        let params = scalar_params(section.as_object().unwrap());
        assert_eq!(params.len(), 3);
        assert!(params.iter().any(|(k, v)| k == "max_power" && v == "200"));
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("safe-._~"), "safe-._~");
    }
}
