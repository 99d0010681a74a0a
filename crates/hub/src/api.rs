//! HTTP client for the lamp's REST API.  `DeviceApi` is the seam the
//! reconciler talks through, so tests can stand in a scripted fake instead
//! of a live device.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Connect/read timeout for device calls.  Lamps live on the local network;
/// anything slower than this is as good as offline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DeviceApiError {
    /// Network or timeout failure — the device is treated as offline, not
    /// as an application error.
    #[error("device unreachable: {0}")]
    Unreachable(String),
    /// The device answered but refused the request (non-2xx).
    #[error("device rejected request: {0}")]
    Rejected(String),
}

impl DeviceApiError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "uvLightOn")]
    pub uv_light_on: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorReadings {
    pub temperature_c: Option<f32>,
    pub ph: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// Client seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn status(&self, host: &str, port: u16) -> Result<StatusResponse, DeviceApiError>;
    async fn turn_on(&self, host: &str, port: u16) -> Result<(), DeviceApiError>;
    async fn turn_off(&self, host: &str, port: u16) -> Result<(), DeviceApiError>;
    async fn sensors(&self, host: &str, port: u16) -> Result<SensorReadings, DeviceApiError>;
    async fn info(&self, host: &str, port: u16) -> Result<DeviceInfo, DeviceApiError>;
}

pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn url(host: &str, port: u16, path: &str) -> String {
        format!("http://{host}:{port}{path}")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<T, DeviceApiError> {
        let resp = self
            .http
            .get(Self::url(host, port, path))
            .send()
            .await
            .map_err(map_transport_err)?;
        let resp = check_status(resp)?;
        resp.json().await.map_err(map_transport_err)
    }

    async fn post(&self, host: &str, port: u16, path: &str) -> Result<(), DeviceApiError> {
        let resp = self
            .http
            .post(Self::url(host, port, path))
            .send()
            .await
            .map_err(map_transport_err)?;
        check_status(resp)?;
        Ok(())
    }
}

impl Default for HttpDeviceClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_transport_err(e: reqwest::Error) -> DeviceApiError {
    DeviceApiError::Unreachable(e.to_string())
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, DeviceApiError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(DeviceApiError::Rejected(format!("http status {status}")))
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceClient {
    async fn status(&self, host: &str, port: u16) -> Result<StatusResponse, DeviceApiError> {
        self.get_json(host, port, "/api/status").await
    }

    async fn turn_on(&self, host: &str, port: u16) -> Result<(), DeviceApiError> {
        self.post(host, port, "/api/on").await
    }

    async fn turn_off(&self, host: &str, port: u16) -> Result<(), DeviceApiError> {
        self.post(host, port, "/api/off").await
    }

    async fn sensors(&self, host: &str, port: u16) -> Result<SensorReadings, DeviceApiError> {
        self.get_json(host, port, "/api/sensors").await
    }

    async fn info(&self, host: &str, port: u16) -> Result<DeviceInfo, DeviceApiError> {
        self.get_json(host, port, "/api/info").await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- wire type deserialization -------------------------------------------

    #[test]
    fn status_response_deserializes() {
        let json = r#"{"uvLightOn":true,"status":"running","timestamp":1700000000}"#;
        let s: StatusResponse = serde_json::from_str(json).unwrap();
        assert!(s.uv_light_on);
    }

    #[test]
    fn status_response_missing_flag_fails() {
        assert!(serde_json::from_str::<StatusResponse>(r#"{"status":"ok"}"#).is_err());
    }

    #[test]
    fn sensor_readings_tolerate_nulls() {
        let json = r#"{"temperature_c":null,"ph":7.1,"ph_voltage":1.53,"turbidity_raw":210}"#;
        let s: SensorReadings = serde_json::from_str(json).unwrap();
        assert_eq!(s.temperature_c, None);
        assert_eq!(s.ph, Some(7.1));
    }

    #[test]
    fn device_info_extra_fields_ignored() {
        let json = r#"{"device_name":"tank-1","version":"2.3.0","mac":"aa:bb","ip":"10.0.0.9"}"#;
        let i: DeviceInfo = serde_json::from_str(json).unwrap();
        assert_eq!(i.device_name.as_deref(), Some("tank-1"));
        assert_eq!(i.version.as_deref(), Some("2.3.0"));
    }

    // -- error classification -------------------------------------------------

    #[test]
    fn unreachable_flag() {
        assert!(DeviceApiError::Unreachable("timeout".into()).is_unreachable());
        assert!(!DeviceApiError::Rejected("503".into()).is_unreachable());
    }

    #[test]
    fn url_building() {
        assert_eq!(
            HttpDeviceClient::url("192.168.1.40", 80, "/api/on"),
            "http://192.168.1.40:80/api/on"
        );
    }
}
