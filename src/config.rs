//! Runtime configuration.
//!
//! Loaded from `sqlweave.toml` (or the user config dir), then overridden by
//! environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DbError, DbResult};

pub const CONFIG_FILE: &str = "sqlweave.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_limit: u64,
    pub max_limit: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    /// Default TTL for memoized SELECT results
    pub ttl_secs: u64,
    /// TTL for `table_version:<name>` stamps
    pub version_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_secs: 60,
            version_ttl_secs: 86_400,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn version_ttl(&self) -> Duration {
        Duration::from_secs(self.version_ttl_secs)
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database connection URL; `None` means no database is configured
    pub database_url: Option<String>,

    pub pool_max_connections: u32,

    pub pagination: PaginationConfig,

    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_max_connections: 10,
            pagination: PaginationConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from `path`, else `./sqlweave.toml`, else the user config dir,
    /// else defaults; then apply environment overrides.
    pub fn load(path: Option<&Path>) -> DbResult<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_paths().into_iter().find(|p| p.exists()),
        };

        let mut config = match file {
            Some(p) => {
                tracing::debug!("Loading config from {}", p.display());
                Self::from_toml(&std::fs::read_to_string(&p)?)?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> DbResult<Self> {
        toml::from_str(content).map_err(|e| DbError::Config(e.to_string()))
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("sqlweave").join("config.toml"));
        }
        paths
    }

    /// Apply `APP_PAGINATION_*` and database overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(limit) = lookup("APP_PAGINATION_LIMIT").and_then(|v| v.trim().parse().ok()) {
            self.pagination.default_limit = limit;
        }
        if let Some(max) = lookup("APP_PAGINATION_MAX_LIMIT").and_then(|v| v.trim().parse().ok()) {
            self.pagination.max_limit = max;
        }

        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.is_empty()) {
            self.database_url = Some(url);
        } else if let (Some(host), Some(name)) =
            (lookup("APP_DATABASE_HOST"), lookup("APP_DATABASE_NAME"))
        {
            let user = lookup("APP_DATABASE_USER").unwrap_or_default();
            let password = lookup("APP_DATABASE_PASSWORD").unwrap_or_default();
            self.database_url = Some(format!(
                "mysql://{}:{}@{}/{}?charset=utf8mb4",
                user, password, host, name
            ));
        }
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn database(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = Some(url.into());
        self
    }

    pub fn pagination(mut self, default_limit: u64, max_limit: u64) -> Self {
        self.config.pagination = PaginationConfig {
            default_limit,
            max_limit,
        };
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.config.pool_max_connections = n;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
