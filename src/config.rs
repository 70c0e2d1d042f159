use crate::domain::codec::MAX_HEADER_LEN;
use crate::domain::value_objects::INDEX_HEADER_LEN;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Exact MAC key length the collector expects.
pub const PUSH_KEY_LEN: usize = 287;

/// Smallest sector that holds an index header and one event.
pub const MIN_SECTOR_SIZE: usize = INDEX_HEADER_LEN + MAX_HEADER_LEN + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("push key is not valid hex")]
    InvalidKeyHex,
    #[error("push key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
    #[error("push key is required when a push server is configured")]
    MissingKey,
    #[error("sensor id must be nonzero when a push server is configured")]
    ZeroSensorId,
    #[error("sector size {0} must be a multiple of 4 and at least {min}", min = MIN_SECTOR_SIZE)]
    SectorSize(usize),
    #[error("{key}={value} is out of range")]
    OutOfRange { key: String, value: u64 },
    #[error("flash ring needs at least two sectors, got {0}")]
    RingTooSmall(u32),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub debug: bool,

    // Flash settings
    /// Flash image file; an in-memory device is used when unset.
    pub flash_path: Option<String>,
    pub sector_size: usize,
    pub flash_first_sector: u32,
    pub flash_sectors: u32,
    pub recovery_window: u32,
    pub write_retries: u32,

    // Event log settings
    pub buffer_count: usize,
    pub tick_period_us: u64,
    pub quiescence_secs: u64,
    pub logging_default: bool,

    // Worker settings
    pub flash_interval_secs: u64,
    pub flash_startup_delay_secs: u64,
    pub push_interval_secs: u64,
    pub max_hold_off_secs: u64,

    // Push settings
    pub push_host: Option<String>,
    pub push_port: u16,
    pub push_path: String,
    pub sensor_id: u32,
    #[serde(skip)]
    pub push_key: Vec<u8>,
    pub chunk_size: usize,
    pub response_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub post_time_interval_secs: u32,
    pub clock_tolerance_secs: u32,

    // Admin API settings
    pub api_listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            flash_path: None,
            sector_size: 4096,
            flash_first_sector: 0,
            flash_sectors: 64,
            recovery_window: 128,
            write_retries: 8,
            buffer_count: 2,
            tick_period_us: 6,
            quiescence_secs: 120,
            logging_default: true,
            flash_interval_secs: 120,
            flash_startup_delay_secs: 180,
            push_interval_secs: 120,
            max_hold_off_secs: 30 * 60,
            push_host: None,
            push_port: 80,
            push_path: "/".to_string(),
            sensor_id: 0,
            push_key: Vec::new(),
            chunk_size: 288,
            response_timeout_secs: 60,
            drain_timeout_secs: 5,
            post_time_interval_secs: 60,
            clock_tolerance_secs: 4,
            api_listen_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

impl Config {
    /// Build a config from a variable lookup, falling back to defaults for
    /// unset or unparsable values. Numbers too large for their field are
    /// rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let num = |key: &str, default: u64| lookup_num(&lookup, key, default);
        let flag = |key: &str, default: bool| -> bool {
            lookup(key)
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(default)
        };

        let push_key = match lookup("SENSORLOG_PUSH_KEY") {
            Some(v) => hex::decode(v.trim()).map_err(|_| ConfigError::InvalidKeyHex)?,
            None => Vec::new(),
        };

        let config = Config {
            debug: lookup("DEBUG").is_some(),
            flash_path: lookup("SENSORLOG_FLASH_PATH"),
            sector_size: lookup_num(&lookup, "SENSORLOG_SECTOR_SIZE", defaults.sector_size)?,
            flash_first_sector: lookup_num(&lookup, "SENSORLOG_FLASH_FIRST_SECTOR", 0)?,
            flash_sectors: lookup_num(&lookup, "SENSORLOG_FLASH_SECTORS", defaults.flash_sectors)?,
            recovery_window: lookup_num(
                &lookup,
                "SENSORLOG_RECOVERY_WINDOW",
                defaults.recovery_window,
            )?,
            write_retries: lookup_num(&lookup, "SENSORLOG_WRITE_RETRIES", defaults.write_retries)?,
            buffer_count: lookup_num(&lookup, "SENSORLOG_BUFFER_COUNT", defaults.buffer_count)?,
            tick_period_us: num("SENSORLOG_TICK_PERIOD_US", defaults.tick_period_us)?.max(1),
            quiescence_secs: num("SENSORLOG_QUIESCENCE_SECS", defaults.quiescence_secs)?,
            logging_default: flag("SENSORLOG_LOGGING", defaults.logging_default),
            flash_interval_secs: num(
                "SENSORLOG_FLASH_INTERVAL_SECS",
                defaults.flash_interval_secs,
            )?,
            flash_startup_delay_secs: num(
                "SENSORLOG_FLASH_STARTUP_DELAY_SECS",
                defaults.flash_startup_delay_secs,
            )?,
            push_interval_secs: num("SENSORLOG_PUSH_INTERVAL_SECS", defaults.push_interval_secs)?,
            max_hold_off_secs: num("SENSORLOG_MAX_HOLD_OFF_SECS", defaults.max_hold_off_secs)?,
            push_host: lookup("SENSORLOG_PUSH_HOST").filter(|h| !h.is_empty()),
            push_port: lookup_num(&lookup, "SENSORLOG_PUSH_PORT", defaults.push_port)?,
            push_path: lookup("SENSORLOG_PUSH_PATH").unwrap_or(defaults.push_path),
            sensor_id: lookup_num(&lookup, "SENSORLOG_SENSOR_ID", 0)?,
            push_key,
            chunk_size: lookup_num(&lookup, "SENSORLOG_CHUNK_SIZE", defaults.chunk_size)?,
            response_timeout_secs: num(
                "SENSORLOG_RESPONSE_TIMEOUT_SECS",
                defaults.response_timeout_secs,
            )?,
            drain_timeout_secs: num("SENSORLOG_DRAIN_TIMEOUT_SECS", defaults.drain_timeout_secs)?,
            post_time_interval_secs: lookup_num(
                &lookup,
                "SENSORLOG_POST_TIME_INTERVAL_SECS",
                defaults.post_time_interval_secs,
            )?,
            clock_tolerance_secs: lookup_num(
                &lookup,
                "SENSORLOG_CLOCK_TOLERANCE_SECS",
                defaults.clock_tolerance_secs,
            )?,
            api_listen_addr: lookup("SENSORLOG_API_LISTEN_ADDR")
                .unwrap_or(defaults.api_listen_addr),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sector_size < MIN_SECTOR_SIZE || self.sector_size % 4 != 0 {
            return Err(ConfigError::SectorSize(self.sector_size));
        }
        if self.flash_sectors < 2 {
            return Err(ConfigError::RingTooSmall(self.flash_sectors));
        }
        if self.push_host.is_some() {
            if self.push_key.is_empty() {
                return Err(ConfigError::MissingKey);
            }
            if self.push_key.len() != PUSH_KEY_LEN {
                return Err(ConfigError::KeyLength {
                    expected: PUSH_KEY_LEN,
                    actual: self.push_key.len(),
                });
            }
            if self.sensor_id == 0 {
                return Err(ConfigError::ZeroSensorId);
            }
        }
        Ok(())
    }

    /// Replication runs only with a collector configured.
    pub fn push_enabled(&self) -> bool {
        self.push_host.is_some()
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_us)
    }
}

/// Parse `key` as a number that must fit `T`. Unset or unparsable values
/// fall back to `default`.
fn lookup_num<T: TryFrom<u64>>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key).and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(value) => T::try_from(value).map_err(|_| ConfigError::OutOfRange {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

pub fn load_config() -> anyhow::Result<Config> {
    Ok(Config::from_lookup(|key| std::env::var(key).ok())?)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    fn key_hex(len: usize) -> String {
        "ab".repeat(len)
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.sector_size, 4096);
        assert_eq!(cfg.buffer_count, 2);
        assert_eq!(cfg.chunk_size, 288);
        assert!(!cfg.push_enabled());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.api_listen_addr, "0.0.0.0:8081");
        assert_eq!(cfg.flash_startup_delay_secs, 180);
        assert_eq!(cfg.max_hold_off_secs, 1800);
        assert!(cfg.logging_default);
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_overrides() {
        let cfg = from_pairs(&[
            ("DEBUG", "1"),
            ("SENSORLOG_FLASH_PATH", "/tmp/flash.img"),
            ("SENSORLOG_FLASH_SECTORS", "16"),
            ("SENSORLOG_LOGGING", "false"),
            ("SENSORLOG_QUIESCENCE_SECS", "5"),
        ])
        .unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.flash_path.as_deref(), Some("/tmp/flash.img"));
        assert_eq!(cfg.flash_sectors, 16);
        assert!(!cfg.logging_default);
        assert_eq!(cfg.quiescence_secs, 5);
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        let cfg = from_pairs(&[("SENSORLOG_CHUNK_SIZE", "lots")]).unwrap();
        assert_eq!(cfg.chunk_size, 288);
    }

    #[test]
    fn test_push_settings() {
        let key = key_hex(PUSH_KEY_LEN);
        let cfg = from_pairs(&[
            ("SENSORLOG_PUSH_HOST", "collector.example"),
            ("SENSORLOG_PUSH_PORT", "8080"),
            ("SENSORLOG_PUSH_PATH", "/push"),
            ("SENSORLOG_SENSOR_ID", "42"),
            ("SENSORLOG_PUSH_KEY", &key),
        ])
        .unwrap();
        assert!(cfg.push_enabled());
        assert_eq!(cfg.push_port, 8080);
        assert_eq!(cfg.push_key.len(), PUSH_KEY_LEN);
        assert_eq!(cfg.push_key[0], 0xab);
    }

    #[test]
    fn test_push_key_validation() {
        let short = key_hex(32);
        let result = from_pairs(&[
            ("SENSORLOG_PUSH_HOST", "collector.example"),
            ("SENSORLOG_SENSOR_ID", "42"),
            ("SENSORLOG_PUSH_KEY", &short),
        ]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::KeyLength {
                expected: PUSH_KEY_LEN,
                actual: 32
            }
        );

        let result = from_pairs(&[("SENSORLOG_PUSH_KEY", "zz")]);
        assert_eq!(result.unwrap_err(), ConfigError::InvalidKeyHex);

        let result = from_pairs(&[("SENSORLOG_PUSH_HOST", "collector.example")]);
        assert_eq!(result.unwrap_err(), ConfigError::MissingKey);
    }

    #[test]
    fn test_push_requires_sensor_id() {
        let key = key_hex(PUSH_KEY_LEN);
        let result = from_pairs(&[
            ("SENSORLOG_PUSH_HOST", "collector.example"),
            ("SENSORLOG_PUSH_KEY", &key),
        ]);
        assert_eq!(result.unwrap_err(), ConfigError::ZeroSensorId);
    }

    #[test]
    fn test_flash_geometry_validation() {
        let result = from_pairs(&[("SENSORLOG_SECTOR_SIZE", "1022")]);
        assert_eq!(result.unwrap_err(), ConfigError::SectorSize(1022));
        let result = from_pairs(&[("SENSORLOG_FLASH_SECTORS", "1")]);
        assert_eq!(result.unwrap_err(), ConfigError::RingTooSmall(1));
    }

    #[test]
    fn test_sector_must_hold_header_and_event() {
        for size in ["0", "4", "8", "20"] {
            let result = from_pairs(&[("SENSORLOG_SECTOR_SIZE", size)]);
            assert_eq!(
                result.unwrap_err(),
                ConfigError::SectorSize(size.parse().unwrap())
            );
        }
        let cfg = from_pairs(&[("SENSORLOG_SECTOR_SIZE", "24")]).unwrap();
        assert_eq!(cfg.sector_size, MIN_SECTOR_SIZE);
    }

    #[test]
    fn test_out_of_range_numbers_rejected() {
        let result = from_pairs(&[("SENSORLOG_PUSH_PORT", "70000")]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::OutOfRange {
                key: "SENSORLOG_PUSH_PORT".to_string(),
                value: 70000
            }
        );

        let result = from_pairs(&[("SENSORLOG_SENSOR_ID", "4294967296")]);
        assert!(matches!(result, Err(ConfigError::OutOfRange { .. })));

        let cfg = from_pairs(&[("SENSORLOG_PUSH_PORT", "65535")]).unwrap();
        assert_eq!(cfg.push_port, 65535);
    }

    #[test]
    fn test_tick_period() {
        let cfg = from_pairs(&[("SENSORLOG_TICK_PERIOD_US", "0")]).unwrap();
        assert_eq!(cfg.tick_period(), Duration::from_micros(1));
    }
}
