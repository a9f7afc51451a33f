//! Application configuration loaded from environment variables.

use saga::channel::DEFAULT_PARTITIONS;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `SAGA_PARTITIONS`: ordered partitions of the saga channel (default: `8`)
/// - `DATABASE_URL`: Postgres state store; in-memory when unset
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub partitions: usize,
    pub database_url: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            partitions: lookup("SAGA_PARTITIONS")
                .and_then(|p| p.parse().ok())
                .filter(|&p: &usize| p > 0)
                .unwrap_or(defaults.partitions),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            partitions: DEFAULT_PARTITIONS,
            database_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.partitions, 8);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("PORT", "8080"),
            ("SAGA_PARTITIONS", "3"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.partitions, 3);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[("PORT", "http"), ("SAGA_PARTITIONS", "0"), ("DATABASE_URL", "")]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.partitions, 8);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
