//! Startup configuration, loaded from environment variables with documented defaults.
//!
//! Invalid values are rejected at construction rather than discovered at first use.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroValue(&'static str),
    InvalidInt { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroValue(field) => write!(f, "{} must be > 0", field),
            Self::InvalidInt { var, value } => {
                write!(f, "{} is not a valid integer: {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub wal_path: String,
    pub wal_max_bytes: u64,
    pub wal_buffer_bytes: usize,
    pub replay_interval: Duration,
    pub batch_size: usize,
    pub flush_age: Duration,
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_path: "tokens.wal".to_string(),
            wal_max_bytes: 100 * 1024 * 1024,
            wal_buffer_bytes: 1024 * 1024,
            replay_interval: Duration::from_secs(10),
            batch_size: 16,
            flush_age: Duration::from_secs(1),
            database_url: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("LLM_RELAY_WAL_PATH") {
            cfg.wal_path = v;
        }
        if let Some(v) = parse_env_u64("LLM_RELAY_WAL_MAX_BYTES")? {
            cfg.wal_max_bytes = v;
        }
        if let Some(v) = parse_env_usize("LLM_RELAY_WAL_BUFFER_BYTES")? {
            cfg.wal_buffer_bytes = v;
        }
        if let Some(v) = parse_env_u64("LLM_RELAY_REPLAY_INTERVAL_SECS")? {
            cfg.replay_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_env_usize("LLM_RELAY_BATCH_SIZE")? {
            cfg.batch_size = v;
        }
        if let Some(v) = parse_env_u64("LLM_RELAY_FLUSH_AGE_MS")? {
            cfg.flush_age = Duration::from_millis(v);
        }
        if let Ok(v) = std::env::var("LLM_RELAY_DATABASE_URL") {
            cfg.database_url = Some(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.wal_max_bytes == 0 {
            return Err(ConfigError::ZeroValue("wal_max_bytes"));
        }
        if self.wal_buffer_bytes == 0 {
            return Err(ConfigError::ZeroValue("wal_buffer_bytes"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroValue("batch_size"));
        }
        if self.flush_age.is_zero() {
            return Err(ConfigError::ZeroValue("flush_age"));
        }
        if self.replay_interval.is_zero() {
            return Err(ConfigError::ZeroValue("replay_interval"));
        }
        Ok(())
    }
}

/// `<PROVIDER>_CONCURRENCY` override, read once at startup (see [`crate::provider::ProviderRegistry`]).
pub fn provider_concurrency_override(provider: &str) -> Option<usize> {
    let var = format!("{}_CONCURRENCY", provider.to_uppercase());
    std::env::var(&var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse::<u64>().map(Some).map_err(|_| ConfigError::InvalidInt { var, value: v }),
        Err(_) => Ok(None),
    }
}

fn parse_env_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(v) => {
            v.parse::<usize>().map(Some).map_err(|_| ConfigError::InvalidInt { var, value: v })
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.flush_age, Duration::from_secs(1));
        assert_eq!(cfg.wal_max_bytes, 100 * 1024 * 1024);
        assert_eq!(cfg.replay_interval, Duration::from_secs(10));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = Config::default();
        cfg.batch_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroValue("batch_size")));
    }

    #[test]
    fn provider_concurrency_override_reads_uppercased_var() {
        std::env::set_var("TESTPROV_CONCURRENCY", "7");
        assert_eq!(provider_concurrency_override("testprov"), Some(7));
        std::env::remove_var("TESTPROV_CONCURRENCY");
    }
}
