//! Industrial screw-robot fleet telemetry simulator.
//!
//! Simulates a fleet of automated screwing robots on a production line and
//! streams their operation telemetry to an HTTPS ingestion endpoint. Each
//! device runs its own loop: generate one screwing-operation record, deliver
//! it with bounded retries, sleep with jitter, repeat until shutdown.
//!
//! # Model
//! - `telemetry`: physical model of one robot, including gradual component
//!   wear and randomly injected anomalies
//! - `transport` / `delivery`: message sink seam plus the per-message retry
//!   policy
//! - `device` / `fleet`: one loop per robot, orchestrated with staggered
//!   startup and coordinated shutdown
//! - `config`: env-style file with validation and hot reload
//! - `export`: offline bulk generation of historical data as CSV
//!
//! # Usage
//! ```bash
//! # Stream live telemetry until Ctrl-C
//! screwsim run --config sim.env
//!
//! # Generate 30 days of history for 10 devices
//! screwsim export --devices 10 --days 30 --interval-minutes 1
//! ```

pub mod config;
pub mod delivery;
pub mod device;
pub mod export;
pub mod fleet;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigError, ConfigSnapshot, ConfigState};
pub use delivery::DeliveryChannel;
pub use device::DeviceLoop;
pub use export::{export_historical, ExportOptions};
pub use fleet::{FleetOrchestrator, FleetSummary};
pub use telemetry::{TelemetryEngine, TelemetryRecord};
pub use transport::{HttpTransport, Transport, TransportError};
