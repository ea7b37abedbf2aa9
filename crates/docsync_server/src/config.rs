use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docsync_core::DocumentManagerOptions;
use docsync_core::cluster::ClusterOptions;
use docsync_core::container::ContainerOptions;
use docsync_core::persistence::PipelineOptions;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// SQLite database file; documents are kept in memory when unset
    pub database_path: Option<PathBuf>,
    /// Create documents on first access (default: true)
    pub auto_create: bool,
    /// Shared secret clients must present; the server is open when unset
    pub auth_token: Option<String>,
    pub cache_duration: Duration,
    pub store_delay: Duration,
    pub store_max_delay: Duration,
    pub max_parallel_writes: usize,
    pub presence_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Relay hub to join (e.g. ws://relay:3030/cluster); standalone when unset
    pub cluster_relay_url: Option<String>,
    /// Serve the relay hub on `/cluster`
    pub cluster_hub: bool,
    pub cluster_batch_size: usize,
    pub cluster_batch_delay: Duration,
    pub cluster_batch_max_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let port = match vars.get("PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => 3030,
        };

        Ok(Config {
            host: vars.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            database_path: vars.get("DATABASE_PATH").map(PathBuf::from),
            auto_create: vars.flag("AUTO_CREATE", true)?,
            auth_token: vars.get("AUTH_TOKEN"),
            cache_duration: Duration::from_secs(vars.parse("CACHE_DURATION_SECS", 60)?),
            store_delay: Duration::from_millis(vars.parse("STORE_DELAY_MS", 100)?),
            store_max_delay: Duration::from_millis(vars.parse("STORE_MAX_DELAY_MS", 1000)?),
            max_parallel_writes: vars.parse("MAX_PARALLEL_WRITES", 16)?,
            presence_timeout: Duration::from_secs(vars.parse("PRESENCE_TIMEOUT_SECS", 60)?),
            cleanup_interval: Duration::from_secs(vars.parse("CLEANUP_INTERVAL_SECS", 10)?),
            cluster_relay_url: vars.get("CLUSTER_RELAY_URL"),
            cluster_hub: vars.flag("CLUSTER_HUB", false)?,
            cluster_batch_size: vars.parse("CLUSTER_BATCH_SIZE", 100)?,
            cluster_batch_delay: Duration::from_millis(vars.parse("CLUSTER_BATCH_DELAY_MS", 10)?),
            cluster_batch_max_delay: Duration::from_millis(
                vars.parse("CLUSTER_BATCH_MAX_DELAY_MS", 50)?,
            ),
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn manager_options(&self) -> DocumentManagerOptions {
        DocumentManagerOptions {
            cache_duration: self.cache_duration,
            container: ContainerOptions {
                auto_create: self.auto_create,
                store_delay: self.store_delay,
                store_max_delay: self.store_max_delay,
            },
            pipeline: PipelineOptions {
                delay: self.store_delay,
                max_delay: self.store_max_delay,
                max_parallel_writes: self.max_parallel_writes,
            },
            presence_timeout: self.presence_timeout,
            cleanup_interval: self.cleanup_interval,
        }
    }

    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            batch_size: self.cluster_batch_size,
            batch_delay: self.cluster_batch_delay,
            batch_max_delay: self.cluster_batch_max_delay,
        }
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank variables both count as missing.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue { name, value }),
            },
            None => Ok(default),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidValue { name: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
            ConfigError::InvalidValue { name, value } => {
                write!(f, "Invalid {} environment variable: {:?}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3030");
        assert!(config.database_path.is_none());
        assert!(config.auto_create);
        assert!(config.auth_token.is_none());
        assert!(!config.cluster_hub);
        assert_eq!(config.cache_duration, Duration::from_secs(60));
        assert_eq!(config.max_parallel_writes, 16);
        assert_eq!(config.cluster_batch_max_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_overrides_flow_into_core_options() {
        let config = config(&[
            ("PORT", "8080"),
            ("AUTO_CREATE", "false"),
            ("STORE_DELAY_MS", "20"),
            ("MAX_PARALLEL_WRITES", "4"),
            ("CLUSTER_HUB", "yes"),
            ("CLUSTER_BATCH_SIZE", "5"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert!(config.cluster_hub);

        let options = config.manager_options();
        assert!(!options.container.auto_create);
        assert_eq!(options.container.store_delay, Duration::from_millis(20));
        assert_eq!(options.pipeline.max_parallel_writes, 4);
        assert_eq!(config.cluster_options().batch_size, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(config(&[("PORT", "http")]), Err(ConfigError::InvalidPort)));
        assert!(matches!(
            config(&[("AUTO_CREATE", "maybe")]),
            Err(ConfigError::InvalidValue { name: "AUTO_CREATE", .. })
        ));
        assert!(config(&[("STORE_DELAY_MS", "-1")]).is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("AUTH_TOKEN", "  "), ("HOST", "")]).unwrap();
        assert!(config.auth_token.is_none());
        assert_eq!(config.host, "0.0.0.0");
    }
}
