//! Transport seam to the remote ingestion endpoint.
//!
//! The rest of the crate only sees the [`Transport`] trait: a stateful
//! collaborator with connect/send/disconnect and a closed error taxonomy.
//! [`HttpTransport`] is the production implementation, posting JSON over
//! HTTPS with the routing metadata carried as request headers.

use crate::telemetry::TelemetryRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Device-type tag attached to every message.
pub const DEVICE_TYPE: &str = "screw-robot";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TransportError {
    /// Credential rejected. Fatal for the owning device, never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Session could not be established. Fatal for the owning device.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Connection dropped, timeout, or endpoint overload. Retried with
    /// backoff.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Endpoint rejected the message outright. Dropped without retry.
    #[error("send rejected: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// True for the error kinds that terminate the owning device loop.
    pub fn is_fatal_for_device(&self) -> bool {
        matches!(self, TransportError::Auth(_) | TransportError::Connect(_))
    }
}

/// Alert level routed with each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Normal,
    Warning,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Warning => "warning",
        }
    }
}

/// Quality-control status routed with each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityStatus {
    Ok,
    Nok,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Ok => "OK",
            QualityStatus::Nok => "NOK",
        }
    }
}

/// Per-message routing metadata, derived purely from the record's quality
/// outcome.
#[derive(Debug, Clone)]
pub struct RoutingMetadata {
    pub creation_time_utc: DateTime<Utc>,
    pub device_type: &'static str,
    pub alert_level: AlertLevel,
    pub quality_status: QualityStatus,
    pub error_code: String,
}

impl RoutingMetadata {
    pub fn for_record(record: &TelemetryRecord) -> Self {
        let (alert_level, quality_status) = if record.cycle_ok {
            (AlertLevel::Normal, QualityStatus::Ok)
        } else {
            (AlertLevel::Warning, QualityStatus::Nok)
        };
        Self {
            creation_time_utc: Utc::now(),
            device_type: DEVICE_TYPE,
            alert_level,
            quality_status,
            error_code: record.error_code.to_string(),
        }
    }
}

/// Opaque message sink. Implementations hold their own session state;
/// `connect` must succeed before `send` is called.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    async fn send(&mut self, payload: &str, metadata: &RoutingMetadata)
        -> Result<(), TransportError>;

    async fn disconnect(&mut self);
}

/// HTTPS transport posting to `https://{hostname}/devices/{id}/messages`.
pub struct HttpTransport {
    hostname: String,
    device_id: String,
    credential: String,
    session: Option<HttpSession>,
}

struct HttpSession {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            credential: credential.into(),
            session: None,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.credential.is_empty() {
            return Err(TransportError::Auth(format!(
                "{}: empty credential",
                self.device_id
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let url = format!(
            "https://{}/devices/{}/messages",
            self.hostname, self.device_id
        );

        self.session = Some(HttpSession { client, url });
        info!(device_id = %self.device_id, "transport session established");
        Ok(())
    }

    async fn send(
        &mut self,
        payload: &str,
        metadata: &RoutingMetadata,
    ) -> Result<(), TransportError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| TransportError::Connect("not connected".to_string()))?;

        let response = session
            .client
            .post(&session.url)
            .header("Authorization", format!("SharedAccessKey {}", self.credential))
            .header("Content-Type", "application/json")
            .header("x-creation-time-utc", metadata.creation_time_utc.to_rfc3339())
            .header("x-device-type", metadata.device_type)
            .header("x-alert-level", metadata.alert_level.as_str())
            .header("x-quality-status", metadata.quality_status.as_str())
            .header("x-error-code", &metadata.error_code)
            .body(payload.to_string())
            .send()
            .await
            // Network-level failures (dropped connection, timeout) are all
            // transient from the caller's point of view.
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn disconnect(&mut self) {
        if self.session.take().is_some() {
            debug!(device_id = %self.device_id, "transport session closed");
        }
    }
}

/// Maps an HTTP error status to the transport error taxonomy.
fn classify_status(status: StatusCode, body: String) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Auth(format!("{status}: {body}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Transient(format!("{status}: {body}"))
        }
        s if s.is_server_error() => TransportError::Transient(format!("{status}: {body}")),
        _ => TransportError::Fatal(format!("{status}: {body}")),
    }
}
