//! Environment-backed configuration for `supervisor-smoke`.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use session_core::{DEFAULT_LOG_CAPACITY, InstanceId, ReconnectSettings};
use session_runtime::{ControllerSettings, DEFAULT_TEARDOWN_TIMEOUT};

const DEFAULT_DATA_DIR: &str = ".";
const DEFAULT_OBSERVER_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Root holding `auth_info/<id>/` and `data/`.
    pub data_dir: PathBuf,
    pub default_instance_id: InstanceId,
    pub log_capacity: usize,
    pub reconnect: ReconnectSettings,
    pub teardown_timeout: Duration,
    /// Frames queued per observer before it is dropped as slow.
    pub observer_buffer: usize,
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = ReconnectSettings::default();

        let data_dir = optional_trimmed_env("FLUXZAP_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let default_instance_id = InstanceId::sanitize(
            optional_trimmed_env("FLUXZAP_DEFAULT_INSTANCE", &mut lookup).as_deref(),
        );

        let log_capacity =
            parse_usize_or("FLUXZAP_LOG_CAPACITY", DEFAULT_LOG_CAPACITY, &mut lookup)?;
        let restart_base_delay_ms = parse_u64_or(
            "FLUXZAP_RESTART_BASE_DELAY_MS",
            defaults.restart_base_delay_ms,
            &mut lookup,
        )?;
        let restart_delay_step_ms = parse_u64_or(
            "FLUXZAP_RESTART_DELAY_STEP_MS",
            defaults.restart_delay_step_ms,
            &mut lookup,
        )?;
        let restart_max_delay_ms = parse_u64_or(
            "FLUXZAP_RESTART_MAX_DELAY_MS",
            defaults.restart_max_delay_ms,
            &mut lookup,
        )?;
        let unknown_retry_delay_ms = parse_u64_or(
            "FLUXZAP_UNKNOWN_RETRY_DELAY_MS",
            defaults.unknown_retry_delay_ms,
            &mut lookup,
        )?;
        let loop_window_secs = parse_u64_or(
            "FLUXZAP_LOOP_WINDOW_SECS",
            defaults.loop_window_ms / 1_000,
            &mut lookup,
        )?;
        let loop_threshold =
            parse_usize_or("FLUXZAP_LOOP_THRESHOLD", defaults.loop_threshold, &mut lookup)?;
        let teardown_timeout_ms = parse_u64_or(
            "FLUXZAP_TEARDOWN_TIMEOUT_MS",
            DEFAULT_TEARDOWN_TIMEOUT.as_millis() as u64,
            &mut lookup,
        )?;
        let observer_buffer =
            parse_usize_or("FLUXZAP_OBSERVER_BUFFER", DEFAULT_OBSERVER_BUFFER, &mut lookup)?;

        require_at_least_one("FLUXZAP_LOG_CAPACITY", log_capacity)?;
        require_at_least_one("FLUXZAP_LOOP_THRESHOLD", loop_threshold)?;
        require_at_least_one("FLUXZAP_OBSERVER_BUFFER", observer_buffer)?;
        require_at_least_one("FLUXZAP_LOOP_WINDOW_SECS", loop_window_secs as usize)?;
        if unknown_retry_delay_ms <= restart_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "FLUXZAP_UNKNOWN_RETRY_DELAY_MS",
                value: unknown_retry_delay_ms.to_string(),
                reason: format!(
                    "must exceed FLUXZAP_RESTART_BASE_DELAY_MS ({restart_base_delay_ms})"
                ),
            });
        }

        Ok(Self {
            data_dir,
            default_instance_id,
            log_capacity,
            reconnect: ReconnectSettings {
                restart_base_delay_ms,
                restart_delay_step_ms,
                restart_max_delay_ms,
                unknown_retry_delay_ms,
                loop_window_ms: loop_window_secs.saturating_mul(1_000),
                loop_threshold,
            },
            teardown_timeout: Duration::from_millis(teardown_timeout_ms),
            observer_buffer,
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            reconnect: self.reconnect,
            teardown_timeout: self.teardown_timeout,
            default_instance_id: self.default_instance_id.clone(),
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_or<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_usize_or<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn require_at_least_one(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SupervisorConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SupervisorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_library_defaults() {
        let cfg = config_from_pairs(&[]).expect("empty env should parse");

        assert_eq!(cfg.data_dir, PathBuf::from("."));
        assert_eq!(cfg.default_instance_id.as_str(), "default");
        assert_eq!(cfg.log_capacity, 50);
        assert_eq!(cfg.reconnect, ReconnectSettings::default());
        assert_eq!(cfg.teardown_timeout, Duration::from_secs(5));
        assert_eq!(cfg.observer_buffer, 64);
        assert_eq!(cfg.controller_settings(), ControllerSettings::default());
    }

    #[test]
    fn parses_overrides_and_sanitizes_default_instance() {
        let cfg = config_from_pairs(&[
            ("FLUXZAP_DATA_DIR", "/var/lib/fluxzap"),
            ("FLUXZAP_DEFAULT_INSTANCE", "main bot"),
            ("FLUXZAP_LOG_CAPACITY", "10"),
            ("FLUXZAP_RESTART_BASE_DELAY_MS", "1000"),
            ("FLUXZAP_RESTART_DELAY_STEP_MS", "250"),
            ("FLUXZAP_RESTART_MAX_DELAY_MS", "4000"),
            ("FLUXZAP_UNKNOWN_RETRY_DELAY_MS", "3000"),
            ("FLUXZAP_LOOP_WINDOW_SECS", "30"),
            ("FLUXZAP_LOOP_THRESHOLD", "3"),
            ("FLUXZAP_TEARDOWN_TIMEOUT_MS", "750"),
            ("FLUXZAP_OBSERVER_BUFFER", "8"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/fluxzap"));
        assert_eq!(cfg.default_instance_id.as_str(), "main_bot");
        assert_eq!(cfg.log_capacity, 10);
        assert_eq!(cfg.reconnect.restart_base_delay_ms, 1_000);
        assert_eq!(cfg.reconnect.restart_delay_step_ms, 250);
        assert_eq!(cfg.reconnect.restart_max_delay_ms, 4_000);
        assert_eq!(cfg.reconnect.unknown_retry_delay_ms, 3_000);
        assert_eq!(cfg.reconnect.loop_window_ms, 30_000);
        assert_eq!(cfg.reconnect.loop_threshold, 3);
        assert_eq!(cfg.teardown_timeout, Duration::from_millis(750));
        assert_eq!(cfg.observer_buffer, 8);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config_from_pairs(&[("FLUXZAP_LOG_CAPACITY", "  "), ("FLUXZAP_DATA_DIR", "")])
            .expect("blank values should fall back");
        assert_eq!(cfg.log_capacity, 50);
        assert_eq!(cfg.data_dir, PathBuf::from("."));
    }

    #[test]
    fn rejects_unparsable_numbers() {
        let err = config_from_pairs(&[("FLUXZAP_LOOP_THRESHOLD", "many")])
            .expect_err("non-numeric threshold must fail");
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "FLUXZAP_LOOP_THRESHOLD");
                assert_eq!(value, "many");
            }
        }
    }

    #[test]
    fn rejects_zero_capacities() {
        let err = config_from_pairs(&[("FLUXZAP_OBSERVER_BUFFER", "0")])
            .expect_err("zero buffer must fail");
        assert_eq!(
            err.to_string(),
            "invalid FLUXZAP_OBSERVER_BUFFER='0': must be at least 1"
        );
    }

    #[test]
    fn unknown_delay_must_exceed_restart_base_delay() {
        let err = config_from_pairs(&[
            ("FLUXZAP_RESTART_BASE_DELAY_MS", "2000"),
            ("FLUXZAP_UNKNOWN_RETRY_DELAY_MS", "2000"),
        ])
        .expect_err("equal delays must fail");
        assert!(err.to_string().contains("FLUXZAP_UNKNOWN_RETRY_DELAY_MS"));
    }
}
