use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};
use thiserror::Error;

use crate::{
    correlator::{ReplyMatcher, ReplyTimeout},
    event_bus::ContentKind,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
}

/// Per-agent reply settings.
///
/// `reply_timeout` has no default: it has to match the agent's expected latency,
/// and an unbounded wait is not a valid mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    #[serde(with = "duration_ms")]
    pub reply_timeout: Duration,

    #[serde(default)]
    pub reply_kinds: Vec<ContentKind>,

    #[serde(default)]
    pub echo_token: bool,
}

impl AgentProfile {
    pub fn timeout(&self) -> Result<ReplyTimeout, ConfigError> {
        ReplyTimeout::try_from(self.reply_timeout).map_err(|_| ConfigError::InvalidValue {
            field: "reply_timeout".to_string(),
            message: "must be a positive number of milliseconds, at most one week".to_string(),
        })
    }

    /// Heuristic matcher for a reply from `agent` sent at or after `since`.
    pub fn matcher(&self, agent: &str, since: DateTime<Utc>) -> ReplyMatcher {
        ReplyMatcher::new()
            .from_sender(agent)
            .sent_after(since)
            .kinds(self.reply_kinds.iter().copied())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config value for {field}: {message}")]
    InvalidValue { field: String, message: String },
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ConfigResult<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ConfigResult<T> {
    Ok(serde_json::from_str(s)?)
}

// デフォルト値の定義
fn default_event_buffer_size() -> usize {
    1000
}
fn default_max_pending() -> usize {
    256
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            max_pending: default_max_pending(),
            agents: HashMap::new(),
        }
    }
}

impl CorrelatorConfig {
    /// Loads and validates a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(s: &str) -> ConfigResult<Self> {
        let config: Self = from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_buffer_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_pending == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        for (name, profile) in &self.agents {
            profile.timeout().map_err(|_| ConfigError::InvalidValue {
                field: format!("agents.{}.reply_timeout", name),
                message: "must be a positive number of milliseconds, at most one week".to_string(),
            })?;
        }
        Ok(())
    }

    pub fn profile(&self, agent: &str) -> ConfigResult<&AgentProfile> {
        self.agents
            .get(agent)
            .ok_or_else(|| ConfigError::UnknownAgent(agent.to_string()))
    }
}
