use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::kernel::SelectionPolicy;

/// Runtime configuration of a [`Program`](crate::program::Program).
///
/// Every field has a default, so `{}` is a valid configuration file.
///
/// ```rust
/// # use bpsync::config::{ProgramConfig, DeadlockPolicy};
/// let config: ProgramConfig =
///     bpsync::config::from_str(r#"{"deadlock_policy": "error", "max_rounds": 50}"#).unwrap();
/// assert_eq!(config.deadlock_policy, DeadlockPolicy::Error);
/// assert_eq!(config.max_rounds, Some(50));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Capacity of the observation bus.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub fault_policy: FaultPolicy,

    #[serde(default)]
    pub deadlock_policy: DeadlockPolicy,

    /// On a round with nothing selectable, wait for the host to inject an
    /// external event instead of applying the deadlock policy.
    #[serde(default)]
    pub wait_for_external_events: bool,

    #[serde(default)]
    pub max_rounds: Option<u64>,

    /// Upper bound for a resumed b-thread to suspend again. Only a segment
    /// stalled on an `.await` can be interrupted.
    #[serde(default, with = "option_duration_ms")]
    pub segment_timeout: Option<Duration>,

    /// Keep the sequence of selected events in the run summary.
    #[serde(default = "default_true")]
    pub record_trace: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Seed for `seeded_random`; ignored by the other policies.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            seed: default_seed(),
        }
    }
}

/// What happens when a resumed b-thread fails.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultPolicy {
    /// Terminate only the faulting thread and keep scheduling the others.
    #[default]
    Isolate,
    /// End the run with `SchedulerError::BehaviorFault`.
    Abort,
}

/// What happens on a round with no selectable event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadlockPolicy {
    /// Stop scheduling and return a summary ending in `Termination::Deadlock`.
    #[default]
    Halt,
    /// Return `SchedulerError::DeadlockDetected` to the caller of `run`.
    Error,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("Failed to parse config: {message}")]
    Parse { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path.as_ref()).map_err(|e| ConfigError::Io {
        path: path.as_ref().display().to_string(),
        message: e.to_string(),
    })?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    serde_json::from_str(s).map_err(|e| ConfigError::Parse {
        message: e.to_string(),
    })
}

fn default_event_buffer_size() -> usize {
    1000
}

fn default_seed() -> u64 {
    0
}

fn default_true() -> bool {
    true
}

// Option<Duration> as optional milliseconds
mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            selection: SelectionConfig::default(),
            fault_policy: FaultPolicy::default(),
            deadlock_policy: DeadlockPolicy::default(),
            wait_for_external_events: false,
            max_rounds: None,
            segment_timeout: None,
            record_trace: default_true(),
        }
    }
}

impl ProgramConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_empty_object_is_default() {
        let config: ProgramConfig = from_str("{}").unwrap();
        assert_eq!(config, ProgramConfig::default());
        assert!(config.record_trace);
        assert_eq!(config.fault_policy, FaultPolicy::Isolate);
    }

    #[test]
    fn test_full_config() {
        let config: ProgramConfig = from_str(
            r#"{
                "event_buffer_size": 64,
                "selection": { "policy": "seeded_random", "seed": 7 },
                "fault_policy": "abort",
                "deadlock_policy": "error",
                "wait_for_external_events": true,
                "max_rounds": 10,
                "segment_timeout": 250,
                "record_trace": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.selection.policy, SelectionPolicy::SeededRandom);
        assert_eq!(config.selection.seed, 7);
        assert_eq!(config.fault_policy, FaultPolicy::Abort);
        assert_eq!(config.segment_timeout, Some(Duration::from_millis(250)));
        assert!(config.wait_for_external_events);
        assert!(!config.record_trace);
    }

    #[test]
    fn test_round_trip_keeps_timeout() {
        let config = ProgramConfig {
            segment_timeout: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProgramConfig = from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_policies_parse_from_cli_strings() {
        assert_eq!(FaultPolicy::from_str("abort").unwrap(), FaultPolicy::Abort);
        assert_eq!(DeadlockPolicy::Halt.to_string(), "halt");
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let result: ConfigResult<ProgramConfig> = from_str(r#"{"fault_policy": "explode"}"#);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        let result: ConfigResult<ProgramConfig> = from_file("/nonexistent/bpsync.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
