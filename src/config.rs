use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub const INSTANCE_ID: &str = "CONVERSE_INSTANCE_ID";
pub const SESSION_TIMEOUT: &str = "CONVERSE_SESSION_TIMEOUT";
pub const ENTRY_FLOW: &str = "CONVERSE_ENTRY_FLOW";
pub const MIDDLEWARE_TIMEOUT_MS: &str = "CONVERSE_MIDDLEWARE_TIMEOUT_MS";
pub const LOCK_TTL_MS: &str = "CONVERSE_LOCK_TTL_MS";
pub const DATABASE_URL: &str = "CONVERSE_DATABASE_URL";
pub const FLOWS_DIR: &str = "CONVERSE_FLOWS_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
    #[error("could not persist {key}: {reason}")]
    Persist { key: String, reason: String },
}

/// Key/value configuration source.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Reads and parses `key`, falling back to `default` when unset.
    pub async fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.0.get(key).await {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(_) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        } else {
            warn!("no .env at {}, using the process environment", env_file.display())
        }

        Box::new(Self { env_file })
    }

    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| match line.split_once('=') {
                Some((k, _)) => k.trim() != key,
                None => true,
            })
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value)).map_err(|e| ConfigError::Persist {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            let _ = self.rewrite_env_file(key, None);
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// In-memory source, used by tests and embedders.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self { map: DashMap::new() })
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Typed settings for one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuntimeConfig {
    /// Identity of this instance inside the cluster (lock holder id).
    pub instance_id: String,
    /// Idle time after which a dialog session is forgotten, in seconds.
    pub session_timeout_secs: u64,
    /// Flow every new session starts in.
    pub entry_flow: String,
    /// Default deadline of a single middleware step.
    pub middleware_timeout_ms: u64,
    /// Default TTL of cluster locks taken by the runtime itself.
    pub lock_ttl_ms: u64,
    /// When set, the Postgres fabric is used instead of the in-process one.
    pub database_url: Option<String>,
    pub flows_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            session_timeout_secs: 1800,
            entry_flow: "main".to_string(),
            middleware_timeout_ms: 2000,
            lock_ttl_ms: 10_000,
            database_url: None,
            flows_dir: None,
        }
    }
}

impl RuntimeConfig {
    pub async fn from_manager(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            instance_id: config.parse_or(INSTANCE_ID, defaults.instance_id).await?,
            session_timeout_secs: config.parse_or(SESSION_TIMEOUT, defaults.session_timeout_secs).await?,
            entry_flow: config.parse_or(ENTRY_FLOW, defaults.entry_flow).await?,
            middleware_timeout_ms: config.parse_or(MIDDLEWARE_TIMEOUT_MS, defaults.middleware_timeout_ms).await?,
            lock_ttl_ms: config.parse_or(LOCK_TTL_MS, defaults.lock_ttl_ms).await?,
            database_url: config.0.get(DATABASE_URL).await.filter(|url| !url.is_empty()),
            flows_dir: config.0.get(FLOWS_DIR).await.filter(|dir| !dir.is_empty()).map(PathBuf::from),
        })
    }

    pub fn middleware_timeout(&self) -> Duration {
        Duration::from_millis(self.middleware_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}
