use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::gesture::GestureConfig;
use vigil_core::MachineSettings;

/// Shortest tick cadence accepted; a zero interval would spin.
const MIN_TICK_INTERVAL_MS: u64 = 10;
const CALIBRATION_K_RANGE: (f32, f32) = (1.0, 10.0);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Optional keys of the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    tick_interval_ms: Option<u64>,
    bus: Option<BusKind>,
    absence_delay_secs: Option<u64>,
    lock_grace_period_secs: Option<u64>,
    lock_warning_secs: Option<u64>,
    auto_lock_enabled: Option<bool>,
    gesture_timeout_secs: Option<u64>,
    sensor_gap_ms: Option<u64>,
    nod_dim_level: Option<u8>,
    calibration_k: Option<f32>,
}

/// Daemon configuration: defaults, then the TOML file, then `VIGIL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cadence of deadline-only ticks between observations.
    pub tick_interval_ms: u64,
    pub bus: BusKind,
    pub settings: MachineSettings,
    pub gesture: GestureConfig,
}

impl Config {
    /// Load from `VIGIL_CONFIG` (or the XDG default path) and the process
    /// environment. A missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let path = env("VIGIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        let file = read_file(&path)?;
        Ok(Self::resolve(file, env))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = MachineSettings::default();

        let settings = MachineSettings {
            absence_delay_secs: parsed(&env, "VIGIL_ABSENCE_DELAY_SECS")
                .or(file.absence_delay_secs)
                .unwrap_or(defaults.absence_delay_secs),
            lock_grace_period_secs: parsed(&env, "VIGIL_LOCK_GRACE_PERIOD_SECS")
                .or(file.lock_grace_period_secs)
                .unwrap_or(defaults.lock_grace_period_secs),
            lock_warning_secs: parsed(&env, "VIGIL_LOCK_WARNING_SECS")
                .or(file.lock_warning_secs)
                .unwrap_or(defaults.lock_warning_secs),
            auto_lock_enabled: env("VIGIL_AUTO_LOCK_ENABLED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.auto_lock_enabled)
                .unwrap_or(defaults.auto_lock_enabled),
            gesture_timeout_secs: parsed(&env, "VIGIL_GESTURE_TIMEOUT_SECS")
                .or(file.gesture_timeout_secs)
                .unwrap_or(defaults.gesture_timeout_secs),
            sensor_gap_ms: parsed(&env, "VIGIL_SENSOR_GAP_MS")
                .or(file.sensor_gap_ms)
                .unwrap_or(defaults.sensor_gap_ms),
            nod_dim_level: parsed(&env, "VIGIL_NOD_DIM_LEVEL")
                .or(file.nod_dim_level)
                .unwrap_or(defaults.nod_dim_level),
        }
        .clamped();

        let gesture_defaults = GestureConfig::default();
        let gesture = GestureConfig {
            calibration_k: parsed(&env, "VIGIL_CALIBRATION_K")
                .or(file.calibration_k)
                .unwrap_or(gesture_defaults.calibration_k)
                .clamp(CALIBRATION_K_RANGE.0, CALIBRATION_K_RANGE.1),
            ..gesture_defaults
        };

        let db_path = env("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir(&env).join("vigil.db"));

        Self {
            db_path,
            tick_interval_ms: parsed(&env, "VIGIL_TICK_INTERVAL_MS")
                .or(file.tick_interval_ms)
                .unwrap_or(100)
                .max(MIN_TICK_INTERVAL_MS),
            bus: parsed(&env, "VIGIL_BUS").or(file.bus).unwrap_or(BusKind::Session),
            settings,
            gesture,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let file = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "config file loaded");
    Ok(file)
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("vigil/vigil.toml")
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".local/share"))
        .join("vigil")
}

/// Parse an environment variable, ignoring values that do not parse.
fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::resolve(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(c.tick_interval_ms, 100);
        assert_eq!(c.bus, BusKind::Session);
        assert_eq!(c.settings, MachineSettings::default());
        assert_eq!(c.db_path, PathBuf::from("/data/vigil/vigil.db"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file: FileConfig = toml::from_str(
            r#"
            absence_delay_secs = 20
            lock_grace_period_secs = 90
            bus = "system"
            auto_lock_enabled = false
            "#,
        )
        .unwrap();
        let c = Config::resolve(
            file,
            env_of(&[("VIGIL_ABSENCE_DELAY_SECS", "30"), ("VIGIL_DB_PATH", "/tmp/v.db")]),
        );
        assert_eq!(c.settings.absence_delay_secs, 30);
        assert_eq!(c.settings.lock_grace_period_secs, 90);
        assert!(!c.settings.auto_lock_enabled);
        assert_eq!(c.bus, BusKind::System);
        assert_eq!(c.db_path, PathBuf::from("/tmp/v.db"));
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let c = Config::resolve(
            FileConfig::default(),
            env_of(&[
                ("VIGIL_ABSENCE_DELAY_SECS", "0"),
                ("VIGIL_LOCK_GRACE_PERIOD_SECS", "9999"),
                ("VIGIL_TICK_INTERVAL_MS", "0"),
            ]),
        );
        assert_eq!(c.settings.absence_delay_secs, 1);
        assert_eq!(c.settings.lock_grace_period_secs, 300);
        assert_eq!(c.tick_interval_ms, MIN_TICK_INTERVAL_MS);
    }

    #[test]
    fn test_calibration_k_override() {
        let file: FileConfig = toml::from_str("calibration_k = 4.5").unwrap();
        let c = Config::resolve(file, env_of(&[]));
        assert_eq!(c.gesture.calibration_k, 4.5);

        let c = Config::resolve(FileConfig::default(), env_of(&[("VIGIL_CALIBRATION_K", "50")]));
        assert_eq!(c.gesture.calibration_k, CALIBRATION_K_RANGE.1);

        let c = Config::resolve(FileConfig::default(), env_of(&[]));
        assert_eq!(c.gesture.calibration_k, GestureConfig::default().calibration_k);
    }

    #[test]
    fn test_timing_guards_clamped() {
        let c = Config::resolve(
            FileConfig::default(),
            env_of(&[
                ("VIGIL_GESTURE_TIMEOUT_SECS", "99999999999"),
                ("VIGIL_SENSOR_GAP_MS", "0"),
            ]),
        );
        assert_eq!(c.settings.gesture_timeout_secs, 60);
        assert_eq!(c.settings.sensor_gap_ms, 100);
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let c = Config::resolve(
            FileConfig::default(),
            env_of(&[("VIGIL_SENSOR_GAP_MS", "soon"), ("VIGIL_AUTO_LOCK_ENABLED", "0")]),
        );
        assert_eq!(c.settings.sensor_gap_ms, 2000);
        assert!(!c.settings.auto_lock_enabled);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("absense_delay_secs = 5").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let file = read_file(Path::new("/nonexistent/vigil/vigil.toml")).unwrap();
        assert!(file.db_path.is_none());
    }
}
