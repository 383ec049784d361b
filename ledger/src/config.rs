//! Configuration for the purse ledger

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::PurseError;

/// Upper bound on purchase attempts per request.
pub const MAX_RETRY_ATTEMPTS: u32 = 16;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurseConfig {
    /// Postgres connection string
    pub database_url: Option<String>,

    /// Pool size
    pub max_connections: u32,

    /// Compare-and-set retry policy
    pub retry: RetryPolicy,
}

impl Default for PurseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry on compare-and-set conflicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Linear backoff step (milliseconds)
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn validate(&self) -> Result<(), PurseError> {
        if self.max_attempts == 0 {
            return Err(PurseError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(PurseError::Config(format!(
                "retry.max_attempts must be at most {}",
                MAX_RETRY_ATTEMPTS
            )));
        }
        Ok(())
    }
}

impl PurseConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, PurseError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PurseError::Config(format!("Failed to read config: {}", e)))?;
        let config: PurseConfig = toml::from_str(&content)
            .map_err(|e| PurseError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self, PurseError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PurseError> {
        let mut config = PurseConfig::default();

        if let Some(url) = lookup("PURSE_DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Some(raw) = lookup("PURSE_MAX_CONNECTIONS") {
            config.max_connections = parse_var("PURSE_MAX_CONNECTIONS", &raw)?;
        }

        if let Some(raw) = lookup("PURSE_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_var("PURSE_RETRY_MAX_ATTEMPTS", &raw)?;
        }

        if let Some(raw) = lookup("PURSE_RETRY_BACKOFF_MS") {
            config.retry.backoff_ms = parse_var("PURSE_RETRY_BACKOFF_MS", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PurseError> {
        if self.max_connections == 0 {
            return Err(PurseError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, PurseError> {
    raw.trim()
        .parse()
        .map_err(|_| PurseError::Config(format!("{} has an invalid value: {}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PurseConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_is_linear() {
        let retry = RetryPolicy::new(3, 10);
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(3), Duration::from_millis(30));
    }

    #[test]
    fn test_from_lookup() {
        let vars = HashMap::from([
            ("PURSE_DATABASE_URL", "postgres://localhost/purse"),
            ("PURSE_RETRY_MAX_ATTEMPTS", "3"),
        ]);
        let config = PurseConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/purse")
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_ms, 5);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = PurseConfig::from_lookup(|k| {
            (k == "PURSE_MAX_CONNECTIONS").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(PurseError::Config(_))));
    }

    #[test]
    fn test_retry_bounds() {
        assert!(RetryPolicy::new(0, 5).validate().is_err());
        assert!(RetryPolicy::new(MAX_RETRY_ATTEMPTS + 1, 5).validate().is_err());
        assert!(RetryPolicy::new(MAX_RETRY_ATTEMPTS, 5).validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_url = \"postgres://db/purse\"\n\n[retry]\nmax_attempts = 4"
        )
        .unwrap();

        let config = PurseConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://db/purse"));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.max_connections, 5);
    }
}
