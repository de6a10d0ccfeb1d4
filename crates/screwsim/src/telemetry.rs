//! Synthetic telemetry generation for a single screw robot.
//!
//! [`TelemetryEngine`] owns the per-device operational state (cumulative
//! hours, operation counters, component health) and produces one
//! [`TelemetryRecord`] per screwing operation. Generation is a pure function
//! of (state, config snapshot, RNG draws); the RNG is injected so tests can
//! seed it for reproducible sequences.

use crate::config::ConfigSnapshot;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

/// Fixed product catalog the robots assemble.
pub const PRODUCT_CATALOG: &[&str] = &[
    "PROD-A100", "PROD-A200", "PROD-B150", "PROD-C300", "PROD-D250", "PROD-E175", "PROD-F225",
    "PROD-G190",
];

/// Encoder pulses per bit rotation.
const PULSES_PER_ROTATION: u64 = 4;

/// Component degradation rates, as health lost per 1000 operational hours.
const MOTOR_WEAR_RATE: f64 = 0.15;
const BEARING_WEAR_RATE: f64 = 0.12;
const SENSOR_WEAR_RATE: f64 = 0.05;

/// One screwing operation on the wire. Field order is significant for
/// downstream consumers and matches the serialized order exactly.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "MachineID")]
    pub machine_id: String,
    #[serde(rename = "ProductID")]
    pub product_id: &'static str,
    #[serde(rename = "ScrewPosition")]
    pub screw_position: u8,
    #[serde(rename = "TargetTorque")]
    pub target_torque: f64,
    #[serde(rename = "ActualTorque")]
    pub actual_torque: f64,
    #[serde(rename = "TargetAngle")]
    pub target_angle: i64,
    #[serde(rename = "ActualAngle")]
    pub actual_angle: i64,
    #[serde(rename = "PulseCount")]
    pub pulse_count: u64,
    #[serde(rename = "CycleOK")]
    pub cycle_ok: bool,
    #[serde(rename = "CycleTime_ms")]
    pub cycle_time_ms: u64,
    #[serde(rename = "SpindleRotationCounter")]
    pub spindle_rotation_counter: u64,
    #[serde(rename = "BitRotationCounter")]
    pub bit_rotation_counter: u64,
    #[serde(rename = "ErrorCode")]
    pub error_code: u8,
}

/// Health of the wear-prone components, each in [0.0, 1.0].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ComponentHealth {
    pub motor: f64,
    pub bearing: f64,
    pub sensor: f64,
}

impl ComponentHealth {
    fn pristine() -> Self {
        Self {
            motor: 1.0,
            bearing: 1.0,
            sensor: 1.0,
        }
    }
}

/// Final per-device statistics, reported when a device loop stops.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub machine_id: String,
    pub operational_hours: f64,
    pub total_operations: u64,
    pub bit_rotation_counter: u64,
    pub component_health: ComponentHealth,
}

/// Per-device telemetry generator. Session-scoped: all counters reset on
/// process restart.
pub struct TelemetryEngine<R: Rng = StdRng> {
    device_id: String,
    operational_hours: f64,
    total_operations: u64,
    bit_rotation_counter: u64,
    health: ComponentHealth,
    rng: R,
}

impl TelemetryEngine<StdRng> {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::with_rng(device_id, StdRng::from_entropy())
    }
}

impl<R: Rng> TelemetryEngine<R> {
    /// Builds an engine with a caller-supplied RNG (seed it for
    /// deterministic tests).
    pub fn with_rng(device_id: impl Into<String>, rng: R) -> Self {
        Self {
            device_id: device_id.into(),
            operational_hours: 0.0,
            total_operations: 0,
            bit_rotation_counter: 0,
            health: ComponentHealth::pristine(),
            rng,
        }
    }

    /// Generates one screwing operation and advances the wear state.
    ///
    /// Precondition: `config` passed [`crate::config::ConfigState`]
    /// validation; out-of-range rates or speeds are excluded there.
    pub fn generate(&mut self, config: &ConfigSnapshot) -> TelemetryRecord {
        let is_anomaly = self.rng.gen_bool(config.anomaly_rate);

        let duration = self.generate_duration(is_anomaly);
        let actual_speed = self.generate_speed(
            config.nominal_speed_rpm,
            is_anomaly,
            config.speed_variance_percent,
        );
        let rotation_count = ((actual_speed * duration) / 60.0) as u64;

        let temperature = self.generate_temperature(
            is_anomaly,
            config.temp_anomaly_threshold,
            config.enable_degradation,
        );
        let vibration = self.generate_vibration(
            is_anomaly,
            config.vibration_spike_threshold,
            config.enable_degradation,
        );
        // Power draw feeds the degradation model only; it is not part of
        // the emitted schema.
        let _power_kw = self.generate_power(actual_speed, config.enable_degradation);

        self.operational_hours += duration / 3600.0;
        if config.enable_degradation {
            self.apply_degradation(duration);
        }
        self.total_operations += 1;
        self.bit_rotation_counter += rotation_count;

        let product_id = PRODUCT_CATALOG[self.rng.gen_range(0..PRODUCT_CATALOG.len())];
        let screw_position: u8 = self.rng.gen_range(1..=8);

        let target_torque = round2(15.0 + (actual_speed / 1800.0) * 10.0);
        let torque_variance = if is_anomaly { 0.15 } else { 0.05 };
        let actual_torque = round2(
            target_torque
                * self
                    .rng
                    .gen_range(1.0 - torque_variance..1.0 + torque_variance),
        );

        let target_angle = rotation_count as i64 * 360;
        let angle_variance: i64 = if is_anomaly { 45 } else { 15 };
        let actual_angle = target_angle + self.rng.gen_range(-angle_variance..=angle_variance);

        let pulse_count = rotation_count * PULSES_PER_ROTATION;

        let torque_ok = (actual_torque - target_torque).abs() <= target_torque * 0.1;
        let angle_ok = (actual_angle - target_angle).abs() <= 30;
        let duration_ok = (1.0..=3.0).contains(&duration);
        let cycle_ok = torque_ok && angle_ok && duration_ok;
        let error_code = error_code(torque_ok, angle_ok, duration_ok);

        if is_anomaly {
            debug!(
                device_id = %self.device_id,
                kinds = %classify_anomaly(duration, temperature, vibration, actual_speed, config.nominal_speed_rpm),
                "anomalous operation"
            );
        }

        TelemetryRecord {
            timestamp: Utc::now(),
            machine_id: self.device_id.clone(),
            product_id,
            screw_position,
            target_torque,
            actual_torque,
            target_angle,
            actual_angle,
            pulse_count,
            cycle_ok,
            cycle_time_ms: (duration * 1000.0).round() as u64,
            spindle_rotation_counter: rotation_count,
            bit_rotation_counter: self.bit_rotation_counter,
            error_code,
        }
    }

    /// Uniform scheduling jitter in [-jitter_secs, jitter_secs], drawn from
    /// the engine's RNG so a seeded engine makes the whole loop
    /// reproducible, pacing included.
    pub fn jitter(&mut self, jitter_secs: f64) -> f64 {
        if jitter_secs > 0.0 {
            self.rng.gen_range(-jitter_secs..=jitter_secs)
        } else {
            0.0
        }
    }

    /// Operational statistics accumulated so far.
    pub fn statistics(&self) -> DeviceStats {
        DeviceStats {
            machine_id: self.device_id.clone(),
            operational_hours: self.operational_hours,
            total_operations: self.total_operations,
            bit_rotation_counter: self.bit_rotation_counter,
            component_health: self.health,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Normal operations take 1-3 s; anomalies split 50/50 between
    /// too-short and too-long cycles.
    fn generate_duration(&mut self, is_anomaly: bool) -> f64 {
        if is_anomaly {
            if self.rng.gen_bool(0.5) {
                self.rng.gen_range(0.3..0.9)
            } else {
                self.rng.gen_range(3.5..5.0)
            }
        } else {
            self.rng.gen_range(1.0..3.0)
        }
    }

    /// 30% of anomalies drag the speed below nominal by up to the
    /// configured variance; everything else is ±2% jitter.
    fn generate_speed(&mut self, nominal: f64, is_anomaly: bool, variance_percent: f64) -> f64 {
        if is_anomaly && self.rng.gen_bool(0.3) {
            let cap = (variance_percent / 100.0).max(0.0);
            let drop = if cap > 0.0 {
                self.rng.gen_range(0.0..cap)
            } else {
                0.0
            };
            nominal * (1.0 - drop)
        } else {
            nominal * (1.0 + self.rng.gen_range(-0.02..0.02))
        }
    }

    fn generate_temperature(
        &mut self,
        is_anomaly: bool,
        threshold: f64,
        enable_degradation: bool,
    ) -> f64 {
        let mut temp = self.rng.gen_range(60.0..75.0);
        if enable_degradation {
            // A worn motor runs hotter.
            temp += (1.0 - self.health.motor) * 15.0;
        }
        if is_anomaly && self.rng.gen_bool(0.4) {
            temp += uniform_between(&mut self.rng, threshold - temp, 25.0);
        }
        temp
    }

    fn generate_vibration(
        &mut self,
        is_anomaly: bool,
        threshold: f64,
        enable_degradation: bool,
    ) -> f64 {
        let mut vibration = self.rng.gen_range(0.2..0.6);
        if enable_degradation {
            // Worn bearings rattle.
            vibration += (1.0 - self.health.bearing) * 1.5;
        }
        if is_anomaly && self.rng.gen_bool(0.5) {
            vibration += uniform_between(&mut self.rng, threshold - vibration, threshold + 0.5);
        }
        vibration.max(0.1)
    }

    fn generate_power(&mut self, speed: f64, enable_degradation: bool) -> f64 {
        let mut power = 3.0 + (speed / 1800.0) * 3.0;
        if enable_degradation {
            power += (1.0 - self.health.motor) * 2.0;
        }
        power * self.rng.gen_range(0.95..1.05)
    }

    /// Wears each component proportionally to the operation's share of 1000
    /// hours, with ±20% randomness, clamped at zero.
    fn apply_degradation(&mut self, duration: f64) {
        let fraction = (duration / 3600.0) / 1000.0;
        let mut wear = |rate: f64| rate * fraction * self.rng.gen_range(0.8..1.2);
        self.health.motor = (self.health.motor - wear(MOTOR_WEAR_RATE)).max(0.0);
        self.health.bearing = (self.health.bearing - wear(BEARING_WEAR_RATE)).max(0.0);
        self.health.sensor = (self.health.sensor - wear(SENSOR_WEAR_RATE)).max(0.0);
    }
}

/// Maps quality-gate results to the error code: 0 OK, 1 torque, 2 angle,
/// 3 duration when exactly one gate fails; 4 whenever two or more fail.
fn error_code(torque_ok: bool, angle_ok: bool, duration_ok: bool) -> u8 {
    let failures = [!torque_ok, !angle_ok, !duration_ok]
        .into_iter()
        .filter(|&f| f)
        .count();
    match failures {
        0 => 0,
        1 if !torque_ok => 1,
        1 if !angle_ok => 2,
        1 => 3,
        _ => 4,
    }
}

/// Uniform draw tolerating an inverted or empty range, matching the loose
/// semantics the anomaly excursions rely on.
fn uniform_between<R: Rng>(rng: &mut R, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi - lo > f64::EPSILON {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

/// Diagnostic classification of an anomalous operation. Log-only: no
/// consumer reads it, so it is not part of the record.
fn classify_anomaly(
    duration: f64,
    temperature: f64,
    vibration: f64,
    actual_speed: f64,
    nominal_speed: f64,
) -> String {
    let mut kinds = Vec::new();
    if duration < 1.0 {
        kinds.push("duration_too_short");
    } else if duration > 3.0 {
        kinds.push("duration_too_long");
    }
    if temperature > 85.0 {
        kinds.push("temperature_spike");
    }
    if vibration > 2.0 {
        kinds.push("excessive_vibration");
    }
    if actual_speed < nominal_speed * 0.85 {
        kinds.push("speed_drop");
    }
    if kinds.is_empty() {
        "unspecified".to_string()
    } else {
        kinds.join(",")
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_DEVICES;

    fn snapshot(anomaly_rate: f64, enable_degradation: bool) -> ConfigSnapshot {
        ConfigSnapshot {
            hostname: "hub.example.net".to_string(),
            device_id_prefix: "screw-robot".to_string(),
            num_devices: 1,
            device_keys: vec!["key".to_string(); MAX_DEVICES],
            interval_secs: 60,
            jitter_secs: 10,
            nominal_speed_rpm: 1800.0,
            anomaly_rate,
            temp_anomaly_threshold: 85.0,
            vibration_spike_threshold: 2.0,
            speed_variance_percent: 15.0,
            enable_degradation,
            log_level: "info".to_string(),
        }
    }

    fn engine(seed: u64) -> TelemetryEngine<StdRng> {
        TelemetryEngine::with_rng("screw-robot-001", StdRng::seed_from_u64(seed))
    }

    #[test]
    fn clean_config_always_passes_gates() {
        // With no anomalies, torque variance is ±5% (gate ±10%), angle
        // variance ±15° (gate ±30°), and duration stays in [1,3] s, so
        // every cycle passes.
        let config = snapshot(0.0, false);
        let mut engine = engine(42);

        for _ in 0..1000 {
            let record = engine.generate(&config);
            assert!(record.cycle_ok);
            assert_eq!(record.error_code, 0);
            assert!((1000..=3000).contains(&record.cycle_time_ms));
        }
    }

    #[test]
    fn counters_advance_by_one_operation() {
        let config = snapshot(0.3, true);
        let mut engine = engine(7);
        let mut expected_ops = 0u64;
        let mut expected_rotations = 0u64;

        for _ in 0..200 {
            let record = engine.generate(&config);
            expected_ops += 1;
            expected_rotations += record.spindle_rotation_counter;

            let stats = engine.statistics();
            assert_eq!(stats.total_operations, expected_ops);
            assert_eq!(stats.bit_rotation_counter, expected_rotations);
            assert_eq!(record.bit_rotation_counter, expected_rotations);
        }
    }

    #[test]
    fn health_is_non_increasing_and_bounded() {
        let config = snapshot(0.5, true);
        let mut engine = engine(11);
        let mut previous = engine.statistics().component_health;

        for _ in 0..500 {
            engine.generate(&config);
            let health = engine.statistics().component_health;
            for (now, before) in [
                (health.motor, previous.motor),
                (health.bearing, previous.bearing),
                (health.sensor, previous.sensor),
            ] {
                assert!(now <= before);
                assert!(now >= 0.0);
            }
            previous = health;
        }

        // Degradation actually happened.
        assert!(previous.motor < 1.0);
        assert!(previous.bearing < 1.0);
        assert!(previous.sensor < 1.0);
    }

    #[test]
    fn health_is_untouched_without_degradation() {
        let config = snapshot(0.5, false);
        let mut engine = engine(3);
        for _ in 0..100 {
            engine.generate(&config);
        }
        let health = engine.statistics().component_health;
        assert_eq!(health.motor, 1.0);
        assert_eq!(health.bearing, 1.0);
        assert_eq!(health.sensor, 1.0);
    }

    #[test]
    fn operational_hours_accumulate() {
        let config = snapshot(0.0, false);
        let mut engine = engine(5);
        for _ in 0..10 {
            engine.generate(&config);
        }
        let stats = engine.statistics();
        // 10 operations of 1-3 s each.
        assert!(stats.operational_hours >= 10.0 / 3600.0);
        assert!(stats.operational_hours <= 30.0 / 3600.0);
    }

    #[test]
    fn record_fields_are_internally_consistent() {
        let config = snapshot(0.5, true);
        let mut engine = engine(99);

        for _ in 0..300 {
            let record = engine.generate(&config);
            assert_eq!(record.pulse_count, record.spindle_rotation_counter * 4);
            assert_eq!(
                record.target_angle,
                record.spindle_rotation_counter as i64 * 360
            );
            assert!((record.actual_angle - record.target_angle).abs() <= 45);
            assert!((1..=8).contains(&record.screw_position));
            assert!(PRODUCT_CATALOG.contains(&record.product_id));
            // Duration domain is 0.3..5.0 s.
            assert!((300..=5000).contains(&record.cycle_time_ms));
        }
    }

    #[test]
    fn error_code_tie_break() {
        assert_eq!(error_code(true, true, true), 0);
        assert_eq!(error_code(false, true, true), 1);
        assert_eq!(error_code(true, false, true), 2);
        assert_eq!(error_code(true, true, false), 3);
        assert_eq!(error_code(false, false, true), 4);
        assert_eq!(error_code(false, true, false), 4);
        assert_eq!(error_code(true, false, false), 4);
        assert_eq!(error_code(false, false, false), 4);
    }

    #[test]
    fn wire_field_order_is_stable() {
        let config = snapshot(0.0, false);
        let mut engine = engine(1);
        let json = serde_json::to_string(&engine.generate(&config)).unwrap();

        let order = [
            "\"Timestamp\"",
            "\"MachineID\"",
            "\"ProductID\"",
            "\"ScrewPosition\"",
            "\"TargetTorque\"",
            "\"ActualTorque\"",
            "\"TargetAngle\"",
            "\"ActualAngle\"",
            "\"PulseCount\"",
            "\"CycleOK\"",
            "\"CycleTime_ms\"",
            "\"SpindleRotationCounter\"",
            "\"BitRotationCounter\"",
            "\"ErrorCode\"",
        ];
        let positions: Vec<usize> = order.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
    }

    #[test]
    fn jitter_is_bounded_and_seeded() {
        let mut a = engine(8);
        let mut b = engine(8);
        for _ in 0..100 {
            let draw = a.jitter(10.0);
            assert!((-10.0..=10.0).contains(&draw));
            assert_eq!(draw, b.jitter(10.0));
        }
        assert_eq!(a.jitter(0.0), 0.0);
    }

    #[test]
    fn seeded_engines_are_reproducible() {
        let config = snapshot(0.2, true);
        let mut a = engine(1234);
        let mut b = engine(1234);
        for _ in 0..50 {
            let ra = a.generate(&config);
            let rb = b.generate(&config);
            assert_eq!(ra.actual_torque, rb.actual_torque);
            assert_eq!(ra.actual_angle, rb.actual_angle);
            assert_eq!(ra.cycle_time_ms, rb.cycle_time_ms);
            assert_eq!(ra.error_code, rb.error_code);
        }
    }
}
