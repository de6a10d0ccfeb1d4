//! Per-device simulation loop.
//!
//! Drives one robot: reload config, generate a record, deliver it, sleep
//! with jitter, until cancelled. The loop moves through
//! Disconnected -> Connecting -> Running -> Stopping and always performs its
//! final disconnect and statistics report, no matter how it exited.

use crate::config::{ConfigSnapshot, ConfigState};
use crate::delivery::{DeliveryChannel, DeliveryError};
use crate::telemetry::{DeviceStats, TelemetryEngine};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Floor for the inter-operation sleep, regardless of jitter.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Pause after a recoverable in-loop error before continuing.
const RECOVERY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DeviceError {
    /// Authentication or connection failure; terminates this device only.
    #[error("{device_id}: fatal transport failure: {source}")]
    Transport {
        device_id: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Disconnected,
    Connecting,
    Running,
    Stopping,
}

impl LoopState {
    fn as_str(&self) -> &'static str {
        match self {
            LoopState::Disconnected => "disconnected",
            LoopState::Connecting => "connecting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        }
    }
}

/// One simulated robot: owns its telemetry engine and delivery channel,
/// shares the config handle with the rest of the fleet.
pub struct DeviceLoop<T: Transport> {
    device_id: String,
    config: Arc<ConfigState>,
    engine: TelemetryEngine,
    channel: DeliveryChannel<T>,
    shutdown: CancellationToken,
    state: LoopState,
    messages_sent: u64,
    messages_dropped: u64,
}

impl<T: Transport> DeviceLoop<T> {
    pub fn new(
        device_id: impl Into<String>,
        config: Arc<ConfigState>,
        transport: T,
        shutdown: CancellationToken,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            engine: TelemetryEngine::new(device_id.clone()),
            channel: DeliveryChannel::new(device_id.clone(), transport),
            device_id,
            config,
            shutdown,
            state: LoopState::Disconnected,
            messages_sent: 0,
            messages_dropped: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Runs the device until cancellation or a fatal transport failure.
    /// Returns the final statistics; on a fatal failure the statistics are
    /// still logged before the error propagates.
    pub async fn run(mut self) -> Result<DeviceStats, DeviceError> {
        let result = self.drive().await;

        self.transition(LoopState::Stopping);
        self.channel.disconnect().await;

        let stats = self.engine.statistics();
        info!(
            device_id = %self.device_id,
            messages_sent = self.messages_sent,
            messages_dropped = self.messages_dropped,
            operational_hours = format_args!("{:.2}", stats.operational_hours),
            total_operations = stats.total_operations,
            bit_rotation_counter = stats.bit_rotation_counter,
            motor_health = format_args!("{:.4}", stats.component_health.motor),
            bearing_health = format_args!("{:.4}", stats.component_health.bearing),
            sensor_health = format_args!("{:.4}", stats.component_health.sensor),
            "device stopped"
        );
        self.transition(LoopState::Disconnected);

        result.map(|_| stats)
    }

    async fn drive(&mut self) -> Result<(), DeviceError> {
        self.transition(LoopState::Connecting);
        self.channel.connect().await.map_err(|source| {
            error!(device_id = %self.device_id, error = %source, "connection failed");
            DeviceError::Transport {
                device_id: self.device_id.clone(),
                source,
            }
        })?;

        self.transition(LoopState::Running);
        info!(device_id = %self.device_id, "simulation loop started");

        while !self.shutdown.is_cancelled() {
            if self.config.check_and_reload() {
                info!(device_id = %self.device_id, "configuration reloaded, applying new settings");
            }
            let config = self.config.current();

            let record = self.engine.generate(&config);
            match self.channel.deliver(&record).await {
                Ok(true) => self.messages_sent += 1,
                Ok(false) => self.messages_dropped += 1,
                Err(DeliveryError::Fatal(source)) => {
                    return Err(DeviceError::Transport {
                        device_id: self.device_id.clone(),
                        source,
                    });
                }
                Err(e) => {
                    error!(
                        device_id = %self.device_id,
                        error = %e,
                        "error in simulation loop, backing off"
                    );
                    if !self.pause(RECOVERY_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            }

            let interval = self.next_interval(&config);
            if !self.pause(interval).await {
                break;
            }
        }

        Ok(())
    }

    /// Base interval with uniform jitter from the engine's RNG, floored at
    /// one second.
    fn next_interval(&mut self, config: &ConfigSnapshot) -> Duration {
        let jittered =
            config.interval_secs as f64 + self.engine.jitter(config.jitter_secs as f64);
        Duration::from_secs_f64(jittered.max(MIN_SLEEP.as_secs_f64()))
    }

    /// Sleeps for `duration` unless shutdown is requested first. Returns
    /// false when the sleep was interrupted by cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(
                device_id = %self.device_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "state transition"
            );
            self.state = next;
        }
    }
}
