//! Gen2+ client: JSON-RPC over `POST /rpc` with Digest auth.
//!
//! Every call carries a client-chosen correlation id which the device must
//! echo. The first 401 triggers the digest handshake; the request is then
//! retried exactly once with the computed Authorization header.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};

use super::digest::{md5_hex, DigestSession};
use super::types::{
    DeviceInfo, DeviceMetrics, EnergyReading, Gen2DeviceInfo, RpcRequest, RpcResponse, UpdateInfo,
};
use super::{send_with_retry, status_error, Client, ClientOptions};

pub struct Gen2Client {
    address: String,
    generation: u8,
    http: reqwest::Client,
    opts: ClientOptions,
    next_id: AtomicI64,
    digest: Option<DigestSession>,
}

impl Gen2Client {
    pub fn new(address: &str, generation: u8, opts: ClientOptions) -> Result<Self> {
        let digest = opts
            .credentials
            .as_ref()
            .map(|c| DigestSession::new(c.username.clone(), c.password.clone()));
        Ok(Self {
            address: address.to_string(),
            generation,
            http: opts.build_http()?,
            opts,
            next_id: AtomicI64::new(1),
            digest,
        })
    }

    fn rpc_url(&self) -> String {
        format!("http://{}/rpc", self.address)
    }

    async fn rpc(&self, rpc_method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RpcRequest { id, method: rpc_method, params };

        let mut request = self.http.post(self.rpc_url()).json(&envelope);
        if let Some(session) = &self.digest {
            if let Some(authorization) = session.authorize("POST", "/rpc") {
                request = request.header("Authorization", authorization);
            }
        }

        let mut resp = send_with_retry(&self.opts, request).await?;

        if resp.status().as_u16() == 401 {
            let Some(session) = &self.digest else {
                return Err(Error::AuthRequired);
            };
            let challenge = resp
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::AuthFailed("401 without WWW-Authenticate".into()))?
                .to_string();
            session.accept_challenge(&challenge)?;
            let authorization = session
                .authorize("POST", "/rpc")
                .ok_or_else(|| Error::AuthFailed("could not build digest response".into()))?;

            let retry = self
                .http
                .post(self.rpc_url())
                .json(&envelope)
                .header("Authorization", authorization);
            resp = send_with_retry(&self.opts, retry).await?;
            if resp.status().as_u16() == 401 {
                return Err(Error::AuthFailed(format!(
                    "{} rejected digest credentials",
                    self.address
                )));
            }
        }

        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("malformed RPC body: {}", e)))?;
        if body.id != id {
            return Err(Error::Protocol(format!(
                "rpc id mismatch: sent {}, got {}",
                id, body.id
            )));
        }
        if let Some(err) = body.error {
            return Err(Error::Rpc { code: err.code, message: err.message });
        }
        body.result
            .ok_or_else(|| Error::Protocol("rpc response missing result".into()))
    }

    /// Split a full config blob into per-component `*.SetConfig` calls.
    async fn apply_component(&self, key: &str, config: &Value) -> Result<()> {
        let (component, id) = match key.split_once(':') {
            Some((name, idx)) => {
                let id = idx
                    .parse::<u32>()
                    .map_err(|_| Error::Validation(format!("bad component key '{}'", key)))?;
                (name, Some(id))
            }
            None => (key, None),
        };
        let method = format!("{}.SetConfig", component_rpc_name(component));
        let params = match id {
            Some(id) => json!({ "id": id, "config": config }),
            None => json!({ "config": config }),
        };
        self.rpc(&method, Some(params)).await?;
        Ok(())
    }
}

/// Component key → RPC namespace (`wifi` → `WiFi`, `switch` → `Switch`).
fn component_rpc_name(component: &str) -> String {
    match component {
        "wifi" => "WiFi".to_string(),
        "sys" => "Sys".to_string(),
        "mqtt" => "MQTT".to_string(),
        "ble" => "BLE".to_string(),
        "eth" => "Eth".to_string(),
        "cloud" => "Cloud".to_string(),
        "ws" => "WS".to_string(),
        "rgb" => "RGB".to_string(),
        "rgbw" => "RGBW".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        }
    }
}

#[async_trait]
impl Client for Gen2Client {
    fn generation(&self) -> u8 {
        self.generation
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn get_info(&self) -> Result<DeviceInfo> {
        let result = self.rpc("Shelly.GetDeviceInfo", None).await?;
        let info: Gen2DeviceInfo = serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("malformed device info: {}", e)))?;
        Ok(DeviceInfo {
            id: info.id,
            mac: info.mac,
            model: info.model,
            generation: info.gen,
            firmware: if info.ver.is_empty() { info.fw_id } else { info.ver },
            auth_enabled: info.auth_en,
            name: info.name,
            app: info.app,
        })
    }

    async fn get_status(&self) -> Result<Value> {
        self.rpc("Shelly.GetStatus", None).await
    }

    async fn get_config(&self) -> Result<Value> {
        self.rpc("Shelly.GetConfig", None).await
    }

    async fn set_config(&self, config: &Value) -> Result<()> {
        let obj = config
            .as_object()
            .ok_or_else(|| Error::Validation("config must be a JSON object".into()))?;
        for (key, value) in obj {
            if value.is_object() {
                self.apply_component(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_auth(&self, username: &str, password: &str) -> Result<()> {
        // Realm is the device id; the device stores HA1, not the password.
        let info = self.get_info().await?;
        let ha1 = md5_hex(&format!("{}:{}:{}", username, info.id, password));
        self.rpc(
            "Shelly.SetAuth",
            Some(json!({ "user": username, "realm": info.id, "ha1": ha1 })),
        )
        .await?;
        Ok(())
    }

    async fn reset_auth(&self) -> Result<()> {
        let info = self.get_info().await?;
        self.rpc(
            "Shelly.SetAuth",
            Some(json!({ "user": "admin", "realm": info.id, "ha1": Value::Null })),
        )
        .await?;
        Ok(())
    }

    async fn set_switch(&self, channel: u32, on: bool) -> Result<()> {
        self.rpc("Switch.Set", Some(json!({ "id": channel, "on": on }))).await?;
        Ok(())
    }

    async fn set_brightness(&self, channel: u32, brightness: u8) -> Result<()> {
        self.rpc(
            "Light.Set",
            Some(json!({ "id": channel, "on": true, "brightness": brightness.min(100) })),
        )
        .await?;
        Ok(())
    }

    async fn set_color(&self, channel: u32, r: u8, g: u8, b: u8) -> Result<()> {
        self.rpc("RGB.Set", Some(json!({ "id": channel, "on": true, "rgb": [r, g, b] })))
            .await?;
        Ok(())
    }

    async fn set_color_temp(&self, channel: u32, kelvin: u32) -> Result<()> {
        self.rpc("Light.Set", Some(json!({ "id": channel, "ct": kelvin }))).await?;
        Ok(())
    }

    async fn set_white(&self, channel: u32, brightness: u8) -> Result<()> {
        self.rpc(
            "Light.Set",
            Some(json!({ "id": channel, "on": true, "brightness": brightness.min(100) })),
        )
        .await?;
        Ok(())
    }

    async fn set_cover_position(&self, channel: u32, position: u8) -> Result<()> {
        self.rpc(
            "Cover.GoToPosition",
            Some(json!({ "id": channel, "pos": position.min(100) })),
        )
        .await?;
        Ok(())
    }

    async fn open_cover(&self, channel: u32) -> Result<()> {
        self.rpc("Cover.Open", Some(json!({ "id": channel }))).await?;
        Ok(())
    }

    async fn close_cover(&self, channel: u32) -> Result<()> {
        self.rpc("Cover.Close", Some(json!({ "id": channel }))).await?;
        Ok(())
    }

    async fn stop_cover(&self, channel: u32) -> Result<()> {
        self.rpc("Cover.Stop", Some(json!({ "id": channel }))).await?;
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.rpc("Shelly.Reboot", None).await?;
        Ok(())
    }

    async fn factory_reset(&self) -> Result<()> {
        self.rpc("Shelly.FactoryReset", None).await?;
        Ok(())
    }

    async fn check_update(&self) -> Result<UpdateInfo> {
        let result = self.rpc("Shelly.CheckForUpdate", None).await?;
        let new_version = result
            .get("stable")
            .and_then(|s| s.get("version"))
            .and_then(Value::as_str)
            .map(String::from);
        Ok(UpdateInfo {
            has_update: new_version.is_some(),
            current_version: None,
            new_version,
        })
    }

    async fn perform_update(&self) -> Result<()> {
        self.rpc("Shelly.Update", Some(json!({ "stage": "stable" }))).await?;
        Ok(())
    }

    async fn get_metrics(&self) -> Result<DeviceMetrics> {
        let status = self.get_status().await?;
        let switch = status.get("switch:0");
        Ok(DeviceMetrics {
            power_w: switch.and_then(|s| s.get("apower")).and_then(Value::as_f64),
            voltage_v: switch.and_then(|s| s.get("voltage")).and_then(Value::as_f64),
            current_a: switch.and_then(|s| s.get("current")).and_then(Value::as_f64),
            energy_total_wh: switch
                .and_then(|s| s.get("aenergy"))
                .and_then(|e| e.get("total"))
                .and_then(Value::as_f64),
            temperature_c: switch
                .and_then(|s| s.get("temperature"))
                .and_then(|t| t.get("tC"))
                .and_then(Value::as_f64),
        })
    }

    async fn get_energy(&self, channel: u32) -> Result<EnergyReading> {
        let status = self.rpc("Switch.GetStatus", Some(json!({ "id": channel }))).await?;
        Ok(EnergyReading {
            channel,
            power_w: status.get("apower").and_then(Value::as_f64),
            total_wh: status
                .get("aenergy")
                .and_then(|e| e.get("total"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            timestamp: status
                .get("aenergy")
                .and_then(|e| e.get("minute_ts"))
                .and_then(Value::as_i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
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

    fn rpc_result(id_expr: &str, result: &str) -> String {
        format!(r#"{{"id":{},"result":{}}}"#, id_expr, result)
    }

    #[tokio::test]
    async fn test_get_info_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({"method": "Shelly.GetDeviceInfo"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                rpc_result(
                    "1",
                    r#"{"id":"shellyplusht-08b61fcb7f3c","mac":"08B61FCB7F3C","model":"SNSN-0013A","gen":2,"fw_id":"20230913-111903","ver":"1.0.3","app":"PlusHT","auth_en":false}"#,
                ),
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = Gen2Client::new(&host_of(&server), 2, fast_opts()).unwrap();
        let info = client.get_info().await.unwrap();
        assert_eq!(info.model, "SNSN-0013A");
        assert_eq!(info.generation, 2);
        assert!(!info.auth_enabled);
        assert_eq!(info.firmware, "1.0.3");
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":1,"error":{"code":-103,"message":"Invalid argument"}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = Gen2Client::new(&host_of(&server), 2, fast_opts()).unwrap();
        let err = client.set_switch(0, true).await.unwrap_err();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, -103);
                assert_eq!(message, "Invalid argument");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_id_mismatch_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":999,"result":{}}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let client = Gen2Client::new(&host_of(&server), 2, fast_opts()).unwrap();
        assert!(matches!(client.get_status().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_digest_handshake_retries_once_with_authorization() {
        let server = MockServer::start().await;

        // First request (no Authorization header) gets the challenge.
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(
                ResponseTemplate::new(401).insert_header(
                    "WWW-Authenticate",
                    r#"Digest realm="shellyplus1-a8", nonce="5f9ea6b1", qop="auth""#,
                ),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        // The retry must carry a computed Authorization header.
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":1,"result":{"was_on":false}}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let opts = fast_opts().with_credentials("admin", "secret");
        let client = Gen2Client::new(&host_of(&server), 2, opts).unwrap();
        client.set_switch(0, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_401_without_credentials_is_auth_required() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Digest realm="r", nonce="n", qop="auth""#,
            ))
            .mount(&server)
            .await;

        let client = Gen2Client::new(&host_of(&server), 2, fast_opts()).unwrap();
        assert!(matches!(client.get_status().await, Err(Error::AuthRequired)));
    }

    #[tokio::test]
    async fn test_persistent_401_is_auth_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Digest realm="r", nonce="n", qop="auth""#,
            ))
            .mount(&server)
            .await;

        let opts = fast_opts().with_credentials("admin", "wrong");
        let client = Gen2Client::new(&host_of(&server), 2, opts).unwrap();
        assert!(matches!(client.get_status().await, Err(Error::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_set_config_splits_components() {
        let server = MockServer::start().await;
        // Component keys apply in sorted order: switch:0 first (rpc id 1),
        // then wifi (rpc id 2).
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({"method": "Switch.SetConfig", "params": {"id": 0}})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":1,"result":{"restart_required":false}}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({"method": "WiFi.SetConfig"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"id":2,"result":{"restart_required":false}}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = Gen2Client::new(&host_of(&server), 2, fast_opts()).unwrap();
        client
            .set_config(&json!({
                "wifi": {"sta": {"ssid": "lab"}},
                "switch:0": {"auto_off": true}
            }))
            .await
            .unwrap();
    }

    #[test]
    fn test_component_rpc_names() {
        assert_eq!(component_rpc_name("wifi"), "WiFi");
        assert_eq!(component_rpc_name("switch"), "Switch");
        assert_eq!(component_rpc_name("mqtt"), "MQTT");
        assert_eq!(component_rpc_name("cover"), "Cover");
    }
}
