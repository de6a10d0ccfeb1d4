//! Runtime configuration with hot-reload support.
//!
//! Configuration lives in an env-style `KEY=VALUE` file (`sim.env` by
//! default). [`ConfigState`] tracks the file's modification time and swaps in
//! a freshly validated [`ConfigSnapshot`] when the file changes; a snapshot
//! is either fully valid or never published, so readers keep seeing the last
//! good configuration across failed reloads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{error, info, warn};

/// Maximum number of devices a single process will simulate.
pub const MAX_DEVICES: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {}", violations.join("; "))]
    Invalid { violations: Vec<String> },
}

/// Immutable, validated configuration snapshot shared by all device loops.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    /// Ingestion endpoint hostname.
    pub hostname: String,
    /// Prefix for generated device ids (`{prefix}-001` ...).
    pub device_id_prefix: String,
    /// Number of devices to simulate (1..=10).
    pub num_devices: usize,
    /// Per-device credentials, indexed by device slot (always `MAX_DEVICES` entries).
    pub device_keys: Vec<String>,
    /// Base interval between screwing operations, in seconds.
    pub interval_secs: u64,
    /// Uniform jitter applied to the interval, in seconds.
    pub jitter_secs: u64,
    /// Nominal spindle speed in RPM.
    pub nominal_speed_rpm: f64,
    /// Probability that an operation is anomalous (0.0..=1.0).
    pub anomaly_rate: f64,
    /// Temperature above which an excursion counts as anomalous, in Celsius.
    pub temp_anomaly_threshold: f64,
    /// Vibration above which a spike counts as anomalous, in g.
    pub vibration_spike_threshold: f64,
    /// Maximum speed drop during anomalies, in percent of nominal.
    pub speed_variance_percent: f64,
    /// Whether long-run component degradation is simulated.
    pub enable_degradation: bool,
    /// Log verbosity (trace, debug, info, warn, error).
    pub log_level: String,
}

impl ConfigSnapshot {
    /// Device id for slot `index` (0-based), e.g. `screw-robot-003`.
    pub fn device_id(&self, index: usize) -> String {
        format!("{}-{:03}", self.device_id_prefix, index + 1)
    }

    /// Credential for slot `index` (0-based). Validation guarantees a
    /// non-empty key for every active slot.
    pub fn device_key(&self, index: usize) -> &str {
        &self.device_keys[index]
    }
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Shared configuration handle: single writer (reload), many readers.
#[derive(Debug)]
pub struct ConfigState {
    path: PathBuf,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    // Holds the last-seen mtime; also serializes reloads so only one
    // check is in flight at a time.
    last_mtime: Mutex<Option<SystemTime>>,
}

impl ConfigState {
    /// Loads and validates the initial snapshot. Fails hard: without one
    /// good snapshot there is nothing to fall back to.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        let snapshot = parse_snapshot(&path)?;
        info!(config = %path.display(), devices = snapshot.num_devices, "configuration loaded");
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            last_mtime: Mutex::new(Some(mtime)),
        })
    }

    /// Returns the current snapshot. Cheap (Arc clone) and safe to call
    /// concurrently with a reload in progress.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-parses the file if its mtime advanced since the last check.
    /// Returns true only when a new snapshot was installed. A snapshot that
    /// fails validation is logged and discarded; the previous one stays
    /// published.
    pub fn check_and_reload(&self) -> bool {
        let mut last = self.last_mtime.lock().unwrap_or_else(|e| e.into_inner());

        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!(config = %self.path.display(), error = %e, "configuration file not readable");
                return false;
            }
        };

        let changed = match *last {
            Some(seen) => mtime > seen,
            None => true,
        };
        if !changed {
            return false;
        }

        // Record the mtime before validating so a broken file is not
        // re-parsed on every cycle until it changes again.
        *last = Some(mtime);

        match parse_snapshot(&self.path) {
            Ok(new) => {
                let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                log_changes(&guard, &new);
                *guard = Arc::new(new);
                true
            }
            Err(e) => {
                error!(config = %self.path.display(), error = %e, "reload failed, keeping previous configuration");
                false
            }
        }
    }
}

/// Logs which non-sensitive fields changed between two snapshots.
fn log_changes(old: &ConfigSnapshot, new: &ConfigSnapshot) {
    let mut changes = Vec::new();

    macro_rules! diff {
        ($field:ident) => {
            if old.$field != new.$field {
                changes.push(format!(
                    "{}: {:?} -> {:?}",
                    stringify!($field),
                    old.$field,
                    new.$field
                ));
            }
        };
    }

    // hostname and device_keys are deliberately excluded from logs.
    diff!(device_id_prefix);
    diff!(num_devices);
    diff!(interval_secs);
    diff!(jitter_secs);
    diff!(nominal_speed_rpm);
    diff!(anomaly_rate);
    diff!(temp_anomaly_threshold);
    diff!(vibration_spike_threshold);
    diff!(speed_variance_percent);
    diff!(enable_degradation);
    diff!(log_level);

    if changes.is_empty() {
        info!("configuration reloaded (no effective changes)");
    } else {
        info!(changes = %changes.join(", "), "configuration changed");
    }
}

fn parse_snapshot(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_and_validate(&content)
}

/// Parses the env-style content and validates every field, collecting all
/// violations rather than stopping at the first.
fn parse_and_validate(content: &str) -> Result<ConfigSnapshot, ConfigError> {
    let values = parse_env_pairs(content);
    let mut violations = Vec::new();

    let hostname = values.get("HUB_HOSTNAME").cloned().unwrap_or_default();
    let device_id_prefix = values
        .get("DEVICE_ID_PREFIX")
        .cloned()
        .unwrap_or_else(|| "screw-robot".to_string());

    let num_devices =
        parse_field(&values, "NUM_DEVICES", MAX_DEVICES as i64, &mut violations).max(0) as usize;
    let interval = parse_field(&values, "SCREWING_INTERVAL_SECONDS", 60, &mut violations);
    let jitter = parse_field(&values, "INTERVAL_JITTER_SECONDS", 10, &mut violations);
    let nominal_speed_rpm: f64 = parse_field(&values, "CONSTANT_SPEED_RPM", 1800.0, &mut violations);
    let anomaly_rate: f64 = parse_field(&values, "ANOMALY_RATE", 0.05, &mut violations);
    let temp_anomaly_threshold: f64 =
        parse_field(&values, "TEMP_ANOMALY_THRESHOLD", 85.0, &mut violations);
    let vibration_spike_threshold: f64 =
        parse_field(&values, "VIBRATION_SPIKE_THRESHOLD", 2.0, &mut violations);
    let speed_variance_percent: f64 =
        parse_field(&values, "SPEED_VARIANCE_PERCENT", 15.0, &mut violations);

    let enable_degradation = values
        .get("ENABLE_DEGRADATION")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let log_level = values
        .get("LOG_LEVEL")
        .map(|v| v.to_lowercase())
        .unwrap_or_else(|| "info".to_string());

    let device_keys: Vec<String> = (1..=MAX_DEVICES)
        .map(|i| {
            values
                .get(format!("DEVICE_KEY_{i}").as_str())
                .cloned()
                .unwrap_or_default()
        })
        .collect();

    if hostname.is_empty() {
        violations.push("HUB_HOSTNAME is required".to_string());
    }
    if !(1..=MAX_DEVICES).contains(&num_devices) {
        violations.push(format!("NUM_DEVICES must be between 1 and {MAX_DEVICES}"));
    }
    if interval <= 0 {
        violations.push("SCREWING_INTERVAL_SECONDS must be positive".to_string());
    }
    if jitter < 0 {
        violations.push("INTERVAL_JITTER_SECONDS must be non-negative".to_string());
    }
    if !(0.0..=1.0).contains(&anomaly_rate) {
        violations.push("ANOMALY_RATE must be between 0.0 and 1.0".to_string());
    }
    if nominal_speed_rpm <= 0.0 {
        violations.push("CONSTANT_SPEED_RPM must be positive".to_string());
    }
    if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
        violations.push(format!(
            "LOG_LEVEL must be one of {VALID_LOG_LEVELS:?}, got {log_level:?}"
        ));
    }
    if (1..=MAX_DEVICES).contains(&num_devices) {
        for i in 0..num_devices {
            if device_keys[i].is_empty() {
                violations.push(format!(
                    "missing device key for device {} (DEVICE_KEY_{})",
                    i + 1,
                    i + 1
                ));
            }
        }
    }

    if !violations.is_empty() {
        return Err(ConfigError::Invalid { violations });
    }

    Ok(ConfigSnapshot {
        hostname,
        device_id_prefix,
        num_devices,
        device_keys,
        interval_secs: interval as u64,
        jitter_secs: jitter as u64,
        nominal_speed_rpm,
        anomaly_rate,
        temp_anomaly_threshold,
        vibration_spike_threshold,
        speed_variance_percent,
        enable_degradation,
        log_level,
    })
}

/// Parses a typed field, recording a violation (and falling back to the
/// default) when the value does not parse.
fn parse_field<T: std::str::FromStr + Copy>(
    values: &HashMap<String, String>,
    key: &str,
    default: T,
    violations: &mut Vec<String>,
) -> T {
    match values.get(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                violations.push(format!("{key} has invalid value {raw:?}"));
                default
            }
        },
    }
}

/// Splits env-style content into key/value pairs. Blank lines and `#`
/// comments are skipped; values may be wrapped in single or double quotes.
fn parse_env_pairs(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let value = value
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string();
            values.insert(key, value);
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn valid_config() -> String {
        let mut s = String::from(
            "HUB_HOSTNAME=hub.example.net\n\
             DEVICE_ID_PREFIX=screw-robot\n\
             NUM_DEVICES=2\n\
             SCREWING_INTERVAL_SECONDS=30\n\
             INTERVAL_JITTER_SECONDS=5\n\
             CONSTANT_SPEED_RPM=1800\n\
             ANOMALY_RATE=0.05\n\
             ENABLE_DEGRADATION=true\n\
             LOG_LEVEL=debug\n",
        );
        for i in 1..=2 {
            s.push_str(&format!("DEVICE_KEY_{i}=key-{i}\n"));
        }
        s
    }

    fn write_config(path: &Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    /// Bumps the file's mtime past the previously observed one so reload
    /// detection does not depend on filesystem timestamp resolution.
    fn touch_future(path: &Path) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(&path, &valid_config());

        let state = ConfigState::load(&path).unwrap();
        let snap = state.current();
        assert_eq!(snap.hostname, "hub.example.net");
        assert_eq!(snap.num_devices, 2);
        assert_eq!(snap.interval_secs, 30);
        assert_eq!(snap.jitter_secs, 5);
        assert!(snap.enable_degradation);
        assert_eq!(snap.log_level, "debug");
        assert_eq!(snap.device_id(0), "screw-robot-001");
        assert_eq!(snap.device_key(1), "key-2");
    }

    #[test]
    fn missing_hostname_is_named_and_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        let broken = valid_config().replace("HUB_HOSTNAME=hub.example.net\n", "");
        write_config(&path, &broken);

        let err = ConfigState::load(&path).unwrap_err();
        assert!(err.to_string().contains("HUB_HOSTNAME"));

        // Fixing the file makes a subsequent load succeed.
        write_config(&path, &valid_config());
        let state = ConfigState::load(&path).unwrap();
        assert_eq!(state.current().hostname, "hub.example.net");
    }

    #[test]
    fn load_reports_every_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(
            &path,
            "NUM_DEVICES=0\n\
             SCREWING_INTERVAL_SECONDS=0\n\
             ANOMALY_RATE=1.5\n\
             CONSTANT_SPEED_RPM=-10\n\
             LOG_LEVEL=loud\n",
        );

        let err = ConfigState::load(&path).unwrap_err();
        let msg = err.to_string();
        for needle in [
            "HUB_HOSTNAME",
            "NUM_DEVICES",
            "SCREWING_INTERVAL_SECONDS",
            "ANOMALY_RATE",
            "CONSTANT_SPEED_RPM",
            "LOG_LEVEL",
        ] {
            assert!(msg.contains(needle), "missing {needle} in: {msg}");
        }
    }

    #[test]
    fn unparseable_value_is_a_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(
            &path,
            &valid_config().replace("NUM_DEVICES=2", "NUM_DEVICES=two"),
        );

        let err = ConfigState::load(&path).unwrap_err();
        assert!(err.to_string().contains("NUM_DEVICES"));
    }

    #[test]
    fn check_and_reload_is_idempotent_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(&path, &valid_config());

        let state = ConfigState::load(&path).unwrap();
        assert!(!state.check_and_reload());
        assert!(!state.check_and_reload());
    }

    #[test]
    fn reload_picks_up_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(&path, &valid_config());
        let state = ConfigState::load(&path).unwrap();

        write_config(
            &path,
            &valid_config().replace("ANOMALY_RATE=0.05", "ANOMALY_RATE=0.5"),
        );
        touch_future(&path);

        assert!(state.check_and_reload());
        assert_eq!(state.current().anomaly_rate, 0.5);
        // And the next check is a no-op again.
        assert!(!state.check_and_reload());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.env");
        write_config(&path, &valid_config());
        let state = ConfigState::load(&path).unwrap();

        write_config(&path, "HUB_HOSTNAME=\nNUM_DEVICES=99\n");
        touch_future(&path);

        assert!(!state.check_and_reload());
        let snap = state.current();
        assert_eq!(snap.hostname, "hub.example.net");
        assert_eq!(snap.num_devices, 2);
    }

    #[test]
    fn env_pairs_skip_comments_and_quotes() {
        let pairs = parse_env_pairs(
            "# comment\n\
             \n\
             A=1\n\
             B = \"two\" \n\
             C='three'\n",
        );
        assert_eq!(pairs.get("A").unwrap(), "1");
        assert_eq!(pairs.get("B").unwrap(), "two");
        assert_eq!(pairs.get("C").unwrap(), "three");
    }
}
