use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Turn orchestration settings.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Applied to every transcript write.
    pub retry: RetryPolicy,
    /// How long to keep draining events after the client disconnects.
    pub drain_timeout: Duration,
    /// Tool outputs longer than this many characters are cut.
    pub max_tool_output_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(30),
            max_tool_output_chars: 4_000,
        }
    }
}

impl TurnConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_tool_output_chars(mut self, chars: usize) -> Self {
        self.max_tool_output_chars = chars;
        self
    }

    /// Defaults overridden by `TURN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `TURN_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = parse(&lookup, "TURN_PERSIST_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse(&lookup, "TURN_PERSIST_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TURN_PERSIST_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TURN_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "TURN_MAX_TOOL_OUTPUT_CHARS")? {
            config.max_tool_output_chars = n;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
