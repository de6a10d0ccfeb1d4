//! Per-device delivery channel: serialization, routing metadata, and
//! bounded retry with exponential backoff around the transport.

use crate::telemetry::TelemetryRecord;
use crate::transport::{RoutingMetadata, Transport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Send attempts per message before it is dropped.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Authentication or connection failure. Fatal for the owning device;
    /// never retried.
    #[error(transparent)]
    Fatal(TransportError),

    /// Payload serialization failed. Recoverable at the loop boundary.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Wraps one device's transport and applies the retry policy to each send.
pub struct DeliveryChannel<T: Transport> {
    device_id: String,
    transport: T,
}

impl<T: Transport> DeliveryChannel<T> {
    pub fn new(device_id: impl Into<String>, transport: T) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    /// Delivers one record. `Ok(true)` means confirmed acceptance;
    /// `Ok(false)` means the message was dropped (transient failures
    /// exhausted, or a non-retryable rejection). Auth/connect failures
    /// propagate as [`DeliveryError::Fatal`].
    pub async fn deliver(&mut self, record: &TelemetryRecord) -> Result<bool, DeliveryError> {
        let payload = serde_json::to_string(record)?;
        let metadata = RoutingMetadata::for_record(record);

        for attempt in 1..=MAX_ATTEMPTS {
            match self.transport.send(&payload, &metadata).await {
                Ok(()) => {
                    info!(
                        device_id = %self.device_id,
                        cycle_ok = record.cycle_ok,
                        error_code = record.error_code,
                        attempt,
                        "message sent"
                    );
                    return Ok(true);
                }
                Err(e) if e.is_fatal_for_device() => {
                    return Err(DeliveryError::Fatal(e));
                }
                Err(e) if e.is_transient() => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    warn!(
                        device_id = %self.device_id,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient send failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        device_id = %self.device_id,
                        error = %e,
                        "message rejected, dropping"
                    );
                    return Ok(false);
                }
            }
        }

        error!(
            device_id = %self.device_id,
            attempts = MAX_ATTEMPTS,
            "message dropped after retries"
        );
        Ok(false)
    }
}
