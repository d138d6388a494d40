// src/sync/providers/geotab.rs
//! JSON-RPC client for a MyGeotab-style telemetry API.
//!
//! Every call is a POST of `{"method", "params"}` to `https://<server>/apiv1`.
//! The session is acquired lazily and dropped as soon as the server rejects
//! it; the next call re-authenticates. Nothing is retried inside a call.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::sync::TelemetryConfig;
use crate::sync::types::{
    Entity, FeedBatch, FeedFetcher, FeedKind, FeedRecords, FeedStart, FetchError, OdometerReading,
    PositionSample,
};

pub const ODOMETER_DIAGNOSTIC_ID: &str = "DiagnosticOdometerId";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub database: String,
    pub user_name: String,
    pub session_id: String,
}

#[derive(Debug, Clone)]
struct Session {
    credentials: Credentials,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct AuthResult {
    credentials: Credentials,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDto {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    vehicle_identification_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogRecordDto {
    date_time: Option<DateTime<Utc>>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    device: Option<IdRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDataDto {
    date_time: Option<DateTime<Utc>>,
    data: Option<f64>,
    device: Option<IdRef>,
    diagnostic: Option<IdRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedResultDto<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    to_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    errors: Vec<RpcInnerError>,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcInnerError {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

pub struct GeotabClient {
    http: reqwest::Client,
    cfg: TelemetryConfig,
    results_limit: u32,
    timeout: Duration,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl GeotabClient {
    pub fn new(cfg: TelemetryConfig, results_limit: u32, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
            results_limit,
            timeout,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Replace the HTTP client, e.g. to tune proxies or TLS.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Authenticate and cache the session. Replaces any cached session.
    pub async fn authenticate(&self) -> Result<Credentials, FetchError> {
        let mut slot = self.session.lock().await;
        let session = self.open_session().await?;
        let creds = session.credentials.clone();
        *slot = Some(session);
        Ok(creds)
    }

    async fn open_session(&self) -> Result<Session, FetchError> {
        let endpoint = endpoint_for(&self.cfg.server);
        let params = json!({
            "database": self.cfg.database,
            "userName": self.cfg.username,
            "password": self.cfg.password,
        });
        let auth: AuthResult = self.call(&endpoint, "Authenticate", params).await?;

        let endpoint = match auth.path.as_deref() {
            Some(p) if !p.is_empty() && !p.eq_ignore_ascii_case("ThisServer") => endpoint_for(p),
            _ => endpoint,
        };
        tracing::info!(
            database = %auth.credentials.database,
            endpoint = %endpoint,
            "telemetry session acquired"
        );
        Ok(Session {
            credentials: auth.credentials,
            endpoint,
        })
    }

    /// List tracked devices. Missing labels stay `None`.
    pub async fn discover_entities(&self) -> Result<Vec<Entity>, FetchError> {
        let session = self.session().await?;
        let params = json!({
            "typeName": "Device",
            "credentials": session.credentials,
        });
        let devices: Vec<DeviceDto> = self
            .call_with_session(&session, "Get", params)
            .await?;
        Ok(devices.into_iter().map(entity_from_device).collect())
    }

    /// The cached session, authenticating first if there is none. The lock is
    /// held across `Authenticate`, so concurrent callers share one login.
    async fn session(&self) -> Result<Session, FetchError> {
        let mut slot = self.session.lock().await;
        if let Some(s) = slot.as_ref() {
            return Ok(s.clone());
        }
        let session = self.open_session().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn call_with_session<T: DeserializeOwned>(
        &self,
        session: &Session,
        method: &str,
        params: Value,
    ) -> Result<T, FetchError> {
        let res = self.call(&session.endpoint, method, params).await;
        if matches!(res, Err(FetchError::AuthRequired)) {
            // next call authenticates again, unless someone already did
            let mut slot = self.session.lock().await;
            let same = slot
                .as_ref()
                .is_some_and(|s| s.credentials.session_id == session.credentials.session_id);
            if same {
                *slot = None;
            }
        }
        res
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
    ) -> Result<T, FetchError> {
        let body = json!({ "method": method, "params": params });
        let resp = self
            .http
            .post(endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        check_status(method, resp.status())?;
        let text = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        decode_envelope(method, &text)
    }
}

/// Map a non-2xx HTTP status to the fetch error it stands for.
fn check_status(method: &str, status: reqwest::StatusCode) -> Result<(), FetchError> {
    match status.as_u16() {
        401 | 403 => Err(FetchError::AuthRequired),
        429 => Err(FetchError::QuotaExceeded(format!("HTTP {status}"))),
        _ if !status.is_success() => Err(FetchError::Transport(format!("{method}: HTTP {status}"))),
        _ => Ok(()),
    }
}

fn endpoint_for(server: &str) -> String {
    let host = server.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/apiv1")
    } else {
        format!("https://{host}/apiv1")
    }
}

fn decode_envelope<T: DeserializeOwned>(method: &str, text: &str) -> Result<T, FetchError> {
    let env: RpcEnvelope = serde_json::from_str(text.trim())
        .map_err(|e| FetchError::MalformedResponse(format!("{method}: {e}")))?;
    if let Some(err) = env.error {
        return Err(classify_rpc_error(&err));
    }
    let result = env
        .result
        .ok_or_else(|| FetchError::MalformedResponse(format!("{method}: no result")))?;
    serde_json::from_value(result)
        .map_err(|e| FetchError::MalformedResponse(format!("{method}: {e}")))
}

fn classify_rpc_error(err: &RpcError) -> FetchError {
    let names: Vec<&str> = err
        .name
        .as_deref()
        .into_iter()
        .chain(err.errors.iter().filter_map(|e| e.name.as_deref()))
        .chain(err.data.as_ref().and_then(|d| d.kind.as_deref()))
        .collect();
    let has = |needle: &str| names.iter().any(|n| n.contains(needle));

    if has("InvalidUser") || has("DbUnavailable") || has("Authentication") {
        FetchError::AuthRequired
    } else if has("OverLimit") {
        FetchError::QuotaExceeded(err.message.clone())
    } else {
        FetchError::MalformedResponse(format!("server error: {}", err.message))
    }
}

fn entity_from_device(d: DeviceDto) -> Entity {
    let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    Entity {
        id: d.id,
        name: clean(d.name),
        vin: clean(d.vehicle_identification_number),
    }
}

fn belongs_to(device: &Option<IdRef>, entity_id: &str) -> bool {
    // records without a device reference were already scoped by the search
    device.as_ref().map_or(true, |d| d.id == entity_id)
}

fn positions_from(entity_id: &str, data: Vec<LogRecordDto>) -> Vec<PositionSample> {
    let total = data.len();
    let out: Vec<PositionSample> = data
        .into_iter()
        .filter(|r| belongs_to(&r.device, entity_id))
        .filter_map(|r| {
            Some(PositionSample {
                entity_id: entity_id.to_string(),
                timestamp: r.date_time?,
                latitude: r.latitude?,
                longitude: r.longitude?,
            })
        })
        .collect();
    if out.len() < total {
        tracing::debug!(
            entity = entity_id,
            skipped = total - out.len(),
            "incomplete or foreign log records skipped"
        );
    }
    out
}

fn odometer_from(entity_id: &str, data: Vec<StatusDataDto>) -> Vec<OdometerReading> {
    let total = data.len();
    let out: Vec<OdometerReading> = data
        .into_iter()
        .filter(|r| belongs_to(&r.device, entity_id))
        .filter(|r| {
            r.diagnostic
                .as_ref()
                .map_or(true, |d| d.id == ODOMETER_DIAGNOSTIC_ID)
        })
        .filter_map(|r| {
            Some(OdometerReading {
                entity_id: entity_id.to_string(),
                timestamp: r.date_time?,
                value: r.data?,
            })
        })
        .collect();
    if out.len() < total {
        tracing::debug!(
            entity = entity_id,
            skipped = total - out.len(),
            "incomplete or foreign status data skipped"
        );
    }
    out
}

fn feed_params(
    credentials: &Credentials,
    entity_id: &str,
    kind: FeedKind,
    start: &FeedStart,
    results_limit: u32,
) -> Value {
    let type_name = match kind {
        FeedKind::Position => "LogRecord",
        FeedKind::Odometer => "StatusData",
    };
    let mut search = json!({ "deviceSearch": { "id": entity_id } });
    if kind == FeedKind::Odometer {
        search["diagnosticSearch"] = json!({ "id": ODOMETER_DIAGNOSTIC_ID });
    }

    let mut params = json!({
        "typeName": type_name,
        "credentials": credentials,
        "resultsLimit": results_limit,
    });
    match start {
        FeedStart::Version(v) => params["fromVersion"] = json!(v),
        FeedStart::Since(ts) => {
            search["fromDate"] = json!(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
    }
    params["search"] = search;
    params
}

#[async_trait::async_trait]
impl FeedFetcher for GeotabClient {
    async fn fetch(
        &self,
        entity: &Entity,
        kind: FeedKind,
        start: &FeedStart,
    ) -> Result<FeedBatch, FetchError> {
        let session = self.session().await?;
        let params = feed_params(
            &session.credentials,
            &entity.id,
            kind,
            start,
            self.results_limit,
        );

        let (records, to_version) = match kind {
            FeedKind::Position => {
                let r: FeedResultDto<LogRecordDto> =
                    self.call_with_session(&session, "GetFeed", params).await?;
                (FeedRecords::Positions(positions_from(&entity.id, r.data)), r.to_version)
            }
            FeedKind::Odometer => {
                let r: FeedResultDto<StatusDataDto> =
                    self.call_with_session(&session, "GetFeed", params).await?;
                (FeedRecords::Odometer(odometer_from(&entity.id, r.data)), r.to_version)
            }
        };
        Ok(FeedBatch {
            records,
            to_version,
        })
    }

    fn name(&self) -> &'static str {
        "geotab"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> Credentials {
        Credentials {
            database: "fleet".into(),
            user_name: "ops@example.com".into(),
            session_id: "s-1".into(),
        }
    }

    #[test]
    fn over_limit_is_quota() {
        let body = r#"{"error":{"message":"API calls quota exceeded","name":"JSONRPCError",
            "errors":[{"name":"OverLimitException","message":"quota"}]}}"#;
        let err = decode_envelope::<Value>("GetFeed", body).unwrap_err();
        assert!(matches!(err, FetchError::QuotaExceeded(_)));
    }

    #[test]
    fn invalid_user_is_auth() {
        let body = r#"{"error":{"message":"Incorrect login credentials",
            "data":{"type":"InvalidUserException"}}}"#;
        let err = decode_envelope::<Value>("GetFeed", body).unwrap_err();
        assert_eq!(err, FetchError::AuthRequired);
    }

    #[test]
    fn garbage_and_missing_result_are_malformed() {
        assert!(matches!(
            decode_envelope::<Value>("GetFeed", "<html>").unwrap_err(),
            FetchError::MalformedResponse(_)
        ));
        assert!(matches!(
            decode_envelope::<Value>("GetFeed", "{}").unwrap_err(),
            FetchError::MalformedResponse(_)
        ));
        assert!(matches!(
            decode_envelope::<FeedResultDto<LogRecordDto>>("GetFeed", r#"{"result":{"data":7}}"#)
                .unwrap_err(),
            FetchError::MalformedResponse(_)
        ));
    }

    #[test]
    fn feed_result_maps_and_skips_incomplete() {
        let body = r#"{"result":{"toVersion":"00000000000a1b2c","data":[
            {"id":"r1","dateTime":"2025-03-01T08:00:05.000Z","latitude":49.5,"longitude":16.25,"device":{"id":"b1"}},
            {"id":"r2","dateTime":"2025-03-01T08:00:10.000Z","latitude":49.6,"device":{"id":"b1"}},
            {"id":"r3","dateTime":"2025-03-01T08:00:15.000Z","latitude":49.7,"longitude":16.3,"device":{"id":"b2"}}
        ]}}"#;
        let r: FeedResultDto<LogRecordDto> = decode_envelope("GetFeed", body).unwrap();
        assert_eq!(r.to_version.as_deref(), Some("00000000000a1b2c"));
        let samples = positions_from("b1", r.data);
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].timestamp,
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 5).unwrap()
        );
    }

    #[test]
    fn odometer_keeps_only_odometer_diagnostic() {
        let body = r#"{"result":{"toVersion":"5","data":[
            {"dateTime":"2025-03-01T08:00:00Z","data":120500.0,"device":{"id":"b1"},"diagnostic":{"id":"DiagnosticOdometerId"}},
            {"dateTime":"2025-03-01T08:00:01Z","data":3.0,"device":{"id":"b1"},"diagnostic":{"id":"DiagnosticEngineSpeedId"}}
        ]}}"#;
        let r: FeedResultDto<StatusDataDto> = decode_envelope("GetFeed", body).unwrap();
        let readings = odometer_from("b1", r.data);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 120500.0);
    }

    #[test]
    fn empty_feed_is_not_an_error() {
        let r: FeedResultDto<StatusDataDto> =
            decode_envelope("GetFeed", r#"{"result":{"data":[],"toVersion":"9"}}"#).unwrap();
        assert!(r.data.is_empty());
        assert_eq!(r.to_version.as_deref(), Some("9"));
    }

    #[test]
    fn params_use_version_or_lookback() {
        let start = FeedStart::Version("42".into());
        let p = feed_params(&creds(), "b1", FeedKind::Position, &start, 500);
        assert_eq!(p["typeName"], "LogRecord");
        assert_eq!(p["fromVersion"], "42");
        assert!(p["search"].get("fromDate").is_none());

        let since = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let p = feed_params(&creds(), "b1", FeedKind::Odometer, &FeedStart::Since(since), 500);
        assert_eq!(p["typeName"], "StatusData");
        assert!(p.get("fromVersion").is_none());
        assert_eq!(p["search"]["fromDate"], "2025-03-01T00:00:00.000Z");
        assert_eq!(p["search"]["diagnosticSearch"]["id"], ODOMETER_DIAGNOSTIC_ID);
        assert_eq!(p["credentials"]["sessionId"], "s-1");
        assert_eq!(p["resultsLimit"], 500);
    }

    #[test]
    fn device_labels_are_trimmed() {
        let e = entity_from_device(DeviceDto {
            id: "b7".into(),
            name: Some(" Truck 7 ".into()),
            vehicle_identification_number: Some("".into()),
        });
        assert_eq!(e.name.as_deref(), Some("Truck 7"));
        assert_eq!(e.vin, None);
    }

    #[test]
    fn http_status_mapping() {
        use reqwest::StatusCode;
        assert_eq!(check_status("GetFeed", StatusCode::OK), Ok(()));
        assert_eq!(
            check_status("GetFeed", StatusCode::UNAUTHORIZED),
            Err(FetchError::AuthRequired)
        );
        assert_eq!(
            check_status("GetFeed", StatusCode::FORBIDDEN),
            Err(FetchError::AuthRequired)
        );
        assert!(matches!(
            check_status("GetFeed", StatusCode::TOO_MANY_REQUESTS),
            Err(FetchError::QuotaExceeded(_))
        ));
        assert!(matches!(
            check_status("GetFeed", StatusCode::BAD_GATEWAY),
            Err(FetchError::Transport(m)) if m.contains("502")
        ));
    }

    #[test]
    fn endpoint_accepts_host_or_url() {
        assert_eq!(endpoint_for("my.geotab.com"), "https://my.geotab.com/apiv1");
        assert_eq!(endpoint_for("http://127.0.0.1:9000/"), "http://127.0.0.1:9000/apiv1");
    }
}
