use std::str::FromStr;
use std::time::Duration;

use crate::errors::RelayError;

/// Loads `.env` from the working directory, if present. Existing process
/// variables win.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Reads a non-blank environment variable.
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Reads and parses an environment variable. Unset or blank is `Ok(None)`.
pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, RelayError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RelayError::Config(format!("{key} has an invalid value: {raw}"))),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, RelayError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => parse_bool(&raw)
            .map(Some)
            .ok_or_else(|| RelayError::Config(format!("{key} is not a boolean: {raw}"))),
    }
}

/// When a final message is considered an echo of what was already streamed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Suppress a final whose text equals the last emitted content.
    #[default]
    Exact,
    /// Also suppress a final equal to the deltas streamed since the previous
    /// final, concatenated. For upstreams that stream token deltas.
    Accumulated,
    /// Never suppress.
    Disabled,
}

impl FromStr for DedupPolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(DedupPolicy::Exact),
            "accumulated" => Ok(DedupPolicy::Accumulated),
            "disabled" | "off" | "none" => Ok(DedupPolicy::Disabled),
            other => Err(RelayError::Config(format!("unknown dedup policy: {other}"))),
        }
    }
}

/// Relay behaviour for one stream session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bounded queue size between producer and consumer.
    pub queue_capacity: usize,
    /// Longest single wait on the queue before the consumer treats it as a stall.
    pub poll_timeout: Duration,
    /// Upper bound on the whole stream. `None` waits indefinitely.
    pub session_timeout: Option<Duration>,
    /// Emit a `heartbeat` event on each stall.
    pub heartbeat_on_stall: bool,
    pub dedup: DedupPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            poll_timeout: Duration::from_secs(120),
            session_timeout: Some(Duration::from_secs(600)),
            heartbeat_on_stall: true,
            dedup: DedupPolicy::Exact,
        }
    }
}

impl RelayConfig {
    /// Reads overrides from the environment:
    ///
    /// - `RELAY_QUEUE_CAPACITY`
    /// - `RELAY_POLL_TIMEOUT_SECS`
    /// - `STREAM_TIMEOUT` (seconds, `0` disables)
    /// - `RELAY_HEARTBEAT_ON_STALL`
    /// - `RELAY_DEDUP_POLICY` (`exact`, `accumulated`, `disabled`)
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Some(capacity) = env_parse("RELAY_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(secs) = env_parse("RELAY_POLL_TIMEOUT_SECS")? {
            config.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STREAM_TIMEOUT")? {
            config.session_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = env_bool("RELAY_HEARTBEAT_ON_STALL")? {
            config.heartbeat_on_stall = flag;
        }
        if let Some(policy) = env_var("RELAY_DEDUP_POLICY") {
            config.dedup = policy.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn heartbeat_on_stall(mut self, enabled: bool) -> Self {
        self.heartbeat_on_stall = enabled;
        self
    }

    pub fn dedup(mut self, policy: DedupPolicy) -> Self {
        self.dedup = policy;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.queue_capacity == 0 {
            return Err(RelayError::Config(
                "queue_capacity must be greater than 0".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(RelayError::Config(
                "poll_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
