//! Fleet orchestration: staggered startup and coordinated shutdown of all
//! device loops.

use crate::config::{ConfigSnapshot, ConfigState};
use crate::device::DeviceLoop;
use crate::telemetry::DeviceStats;
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Delay between successive device startups, to avoid a connection storm.
pub const STAGGER_DELAY: Duration = Duration::from_millis(1500);

/// Aggregate outcome of a fleet run.
#[derive(Debug, Default)]
pub struct FleetSummary {
    /// Devices that ran to a clean stop.
    pub completed: usize,
    /// Devices that terminated with a fatal error (or panicked).
    pub failed: usize,
    /// Final statistics of the devices that stopped cleanly.
    pub stats: Vec<DeviceStats>,
}

/// Owns the device loop handles: builds N loops sharing one config handle,
/// starts them staggered, and waits for all of them on shutdown. A fatal
/// error in one device never takes the rest of the fleet down.
pub struct FleetOrchestrator<T, F>
where
    T: Transport + Sync + 'static,
    F: Fn(&ConfigSnapshot, usize) -> T,
{
    config: Arc<ConfigState>,
    shutdown: CancellationToken,
    transport_factory: F,
}

impl FleetOrchestrator<HttpTransport, fn(&ConfigSnapshot, usize) -> HttpTransport> {
    /// Fleet backed by the production HTTP transport.
    pub fn new(config: Arc<ConfigState>, shutdown: CancellationToken) -> Self {
        Self::with_transport_factory(config, shutdown, http_transport_for)
    }
}

impl<T, F> FleetOrchestrator<T, F>
where
    T: Transport + Sync + 'static,
    F: Fn(&ConfigSnapshot, usize) -> T,
{
    /// Fleet with an injected transport factory (tests substitute mocks
    /// here).
    pub fn with_transport_factory(
        config: Arc<ConfigState>,
        shutdown: CancellationToken,
        transport_factory: F,
    ) -> Self {
        Self {
            config,
            shutdown,
            transport_factory,
        }
    }

    /// Starts every device and waits for all of them to stop. Returns once
    /// the whole fleet reached its terminal state.
    pub async fn run(&self) -> FleetSummary {
        let snapshot = self.config.current();
        info!(
            devices = snapshot.num_devices,
            interval_secs = snapshot.interval_secs,
            jitter_secs = snapshot.jitter_secs,
            "starting device fleet"
        );

        let mut tasks = JoinSet::new();
        for index in 0..snapshot.num_devices {
            if index > 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(STAGGER_DELAY) => {}
                }
            }

            let device_id = snapshot.device_id(index);
            let transport = (self.transport_factory)(&snapshot, index);
            let device = DeviceLoop::new(
                device_id.clone(),
                Arc::clone(&self.config),
                transport,
                self.shutdown.clone(),
            );
            info!(device_id = %device_id, "device starting");
            tasks.spawn(device.run());
        }
        info!(devices = tasks.len(), "fleet started");

        let mut summary = FleetSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(stats)) => {
                    summary.completed += 1;
                    summary.stats.push(stats);
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    error!(error = %e, "device terminated with fatal error");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(error = %e, "device task panicked");
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            "fleet shut down"
        );
        summary
    }
}

fn http_transport_for(snapshot: &ConfigSnapshot, index: usize) -> HttpTransport {
    HttpTransport::new(
        snapshot.hostname.clone(),
        snapshot.device_id(index),
        snapshot.device_key(index),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RoutingMetadata, TransportError};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct MockTransport {
        sends: Arc<AtomicU64>,
        fail_connect: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.fail_connect {
                Err(TransportError::Connect("refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn send(
            &mut self,
            _payload: &str,
            _metadata: &RoutingMetadata,
        ) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) {}
    }

    fn config_state(dir: &tempfile::TempDir, devices: usize) -> Arc<ConfigState> {
        let path = dir.path().join("sim.env");
        let mut content = format!(
            "HUB_HOSTNAME=hub.example.net\n\
             NUM_DEVICES={devices}\n\
             SCREWING_INTERVAL_SECONDS=1\n\
             INTERVAL_JITTER_SECONDS=0\n\
             ANOMALY_RATE=0.0\n"
        );
        for i in 1..=devices {
            content.push_str(&format!("DEVICE_KEY_{i}=key-{i}\n"));
        }
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        Arc::new(ConfigState::load(&path).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_runs_all_devices_and_stops_together() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_state(&dir, 3);
        let shutdown = CancellationToken::new();
        let sends = Arc::new(AtomicU64::new(0));

        let sends_for_factory = sends.clone();
        let orchestrator =
            FleetOrchestrator::with_transport_factory(config, shutdown.clone(), move |_, _| {
                MockTransport {
                    sends: sends_for_factory.clone(),
                    fail_connect: false,
                }
            });

        let handle = tokio::spawn(async move { orchestrator.run().await });

        // Each of the 3 devices sends roughly once per second.
        while sends.load(Ordering::SeqCst) < 9 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();

        let summary = handle.await.unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.stats.len(), 3);
        for stats in &summary.stats {
            assert!(stats.total_operations >= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_device_does_not_take_down_the_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_state(&dir, 2);
        let shutdown = CancellationToken::new();
        let sends = Arc::new(AtomicU64::new(0));

        let sends_for_factory = sends.clone();
        let orchestrator = FleetOrchestrator::with_transport_factory(
            config,
            shutdown.clone(),
            move |_, index| MockTransport {
                sends: sends_for_factory.clone(),
                // First device cannot connect; second keeps running.
                fail_connect: index == 0,
            },
        );

        let handle = tokio::spawn(async move { orchestrator.run().await });

        while sends.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();

        let summary = handle.await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn device_ids_follow_prefix_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_state(&dir, 2);
        let snapshot = config.current();
        assert_eq!(snapshot.device_id(0), "screw-robot-001");
        assert_eq!(snapshot.device_id(1), "screw-robot-002");
    }
}
