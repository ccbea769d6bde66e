use std::time::Duration;

use regex::Regex;

use crate::errors::ConfigError;

const THROTTLE_MS_ENV: &str = "RELAY_THROTTLE_MS";
const BOUNDARY_PATTERN_ENV: &str = "RELAY_BOUNDARY_PATTERN";

/// Configuration for the delta batcher.
#[derive(Clone, Debug)]
pub struct BatcherConfig {
    /// Minimum time between two flushes.
    pub throttle: Duration,
    /// Semantic boundary a pending text/reasoning delta must match before it
    /// may be flushed. `None` lets every delta flush once throttling allows.
    pub boundary: Option<Regex>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            boundary: None,
        }
    }
}

impl BatcherConfig {
    /// Creates a config with the given throttle and no boundary matcher.
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            boundary: None,
        }
    }

    /// Builds a config from `RELAY_THROTTLE_MS` and `RELAY_BOUNDARY_PATTERN`,
    /// falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(THROTTLE_MS_ENV).filter(|v| !v.trim().is_empty()) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid(THROTTLE_MS_ENV, format!("{e}")))?;
            config.throttle = Duration::from_millis(millis);
        }
        if let Some(pattern) = lookup(BOUNDARY_PATTERN_ENV).filter(|v| !v.is_empty()) {
            config = config.boundary_pattern(&pattern)?;
        }
        Ok(config)
    }

    /// Overrides the throttle interval.
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the boundary matcher from a regex pattern.
    pub fn boundary_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigError::invalid(BOUNDARY_PATTERN_ENV, e.to_string()))?;
        self.boundary = Some(regex);
        Ok(self)
    }

    /// Matches on any whitespace, i.e. word boundaries.
    pub fn word_boundaries(mut self) -> Self {
        self.boundary = Some(Regex::new(r"\s").expect("static pattern"));
        self
    }
}
