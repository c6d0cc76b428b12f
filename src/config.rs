//! Configuration types for tg-archive
//!
//! All three services read the same `config.json`; each consumes the
//! sections relevant to it. Missing required fields are fatal at startup.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Full configuration loaded from JSON
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub search_engine: SearchEngineConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub services: ServicesConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    /// Telegram API ID
    pub app_id: i32,

    /// Telegram API hash
    pub app_hash: String,

    /// Bot token for the query frontend
    pub bot_token: String,

    /// Owner user ID
    pub owner_id: i64,

    /// Optional SOCKS5 proxy URL ("socks5://host:port" or with user:pass@)
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub ipv6: bool,

    /// Directory for session files
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchEngineConfig {
    /// Engine type tag, informational ("http" is the only wired engine)
    pub engine: String,

    #[serde(default)]
    pub http: SearchHttpConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchHttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Retry attempts on 5xx
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SearchHttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Buffer size that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Seconds between time-triggered flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval: f64,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> f64 {
    1.0
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

/// One mode or a set of modes; `"group"` and `["private", "group"]` both parse.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ModeList {
    One(String),
    Many(Vec<String>),
}

impl ModeList {
    pub fn values(&self) -> Vec<String> {
        match self {
            ModeList::One(s) => vec![s.clone()],
            ModeList::Many(v) => v.clone(),
        }
    }
}

impl Default for ModeList {
    fn default() -> Self {
        ModeList::One("private".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BotConfig {
    /// Access mode(s): private, group, public
    #[serde(default)]
    pub mode: ModeList,

    #[serde(default)]
    pub allowed_groups: Vec<i64>,

    #[serde(default)]
    pub allowed_users: Vec<i64>,

    #[serde(default)]
    pub admins: Vec<i64>,

    /// Per-user set of group ids the user may search. JSON object keys are
    /// strings; parsed to i64 at validation time.
    #[serde(default)]
    pub user_group_permissions: HashMap<String, Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_privacy_file")]
    pub storage_file: PathBuf,
}

fn default_privacy_file() -> PathBuf {
    PathBuf::from("privacy.json")
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            storage_file: default_privacy_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("query_logs.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,

    /// Messages per batch during history sync
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_true")]
    pub retry_on_error: bool,

    #[serde(default = "default_sync_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_true")]
    pub resume_on_restart: bool,

    /// Throttle between batches, seconds
    #[serde(default = "default_batch_delay")]
    pub delay_between_batches: f64,

    /// Prune completed records when loading the checkpoint
    #[serde(default)]
    pub clear_completed: bool,
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("sync_checkpoint.json")
}

fn default_sync_batch_size() -> usize {
    100
}

fn default_sync_max_retries() -> u32 {
    3
}

fn default_batch_delay() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_file: default_checkpoint_file(),
            batch_size: default_sync_batch_size(),
            retry_on_error: true,
            max_retries: default_sync_max_retries(),
            resume_on_restart: true,
            delay_between_batches: default_batch_delay(),
            clear_completed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServicesConfig {
    pub bot: ServiceEndpoint,
    pub userbot: ServiceEndpoint,
    pub search: ServiceEndpoint,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEndpoint {
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub use_jwt: bool,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,

    #[serde(default)]
    pub public_key_path: Option<PathBuf>,

    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Inline PEM: single line with \n escapes, or a JSON array of lines
    #[serde(default)]
    pub public_key_inline: Option<String>,

    #[serde(default)]
    pub private_key_inline: Option<String>,

    /// Token TTL in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
}

fn default_token_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_bot_port")]
    pub bot_port: u16,

    #[serde(default = "default_userbot_port")]
    pub userbot_port: u16,

    #[serde(default = "default_search_port")]
    pub search_port: u16,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_bot_port() -> u16 {
    8081
}

fn default_userbot_port() -> u16 {
    8082
}

fn default_search_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bot_port: default_bot_port(),
            userbot_port: default_userbot_port(),
            search_port: default_search_port(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("configuration file {:?} not readable: {}", path, e))
        })?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid JSON in {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.telegram.app_id == 0 {
            return Err(Error::Config("telegram.app_id is required".into()));
        }
        if self.telegram.app_hash.is_empty() {
            return Err(Error::Config("telegram.app_hash is required".into()));
        }
        if self.telegram.bot_token.is_empty() {
            return Err(Error::Config("telegram.bot_token is required".into()));
        }
        if self.telegram.owner_id == 0 {
            return Err(Error::Config("telegram.owner_id is required".into()));
        }
        if self.search_engine.engine.is_empty() {
            return Err(Error::Config("search_engine.engine is required".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::Config("sync.batch_size must be positive".into()));
        }

        for mode in self.bot.mode.values() {
            match mode.as_str() {
                "private" | "group" | "public" => {}
                other => {
                    return Err(Error::Config(format!("unknown bot.mode value: {}", other)));
                }
            }
        }

        for key in self.bot.user_group_permissions.keys() {
            if key.parse::<i64>().is_err() {
                return Err(Error::Config(format!(
                    "bot.user_group_permissions key is not a user id: {}",
                    key
                )));
            }
        }

        if self.auth.use_jwt {
            let has_public =
                self.auth.public_key_inline.is_some() || self.auth.public_key_path.is_some();
            if !has_public {
                return Err(Error::Config(
                    "auth.use_jwt is set but no public key is configured".into(),
                ));
            }
            if let Some(path) = &self.auth.public_key_path
                && self.auth.public_key_inline.is_none()
                && !path.exists()
            {
                return Err(Error::Config(format!(
                    "auth.public_key_path does not exist: {:?}",
                    path
                )));
            }
        }

        Ok(())
    }

    /// Parsed per-user group permissions (validated string keys to i64).
    pub fn user_group_permissions(&self) -> HashMap<i64, Vec<i64>> {
        self.bot
            .user_group_permissions
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|uid| (uid, v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "telegram": {
                "app_id": 12345,
                "app_hash": "abcdef",
                "bot_token": "123:token",
                "owner_id": 100
            },
            "search_engine": {
                "engine": "http",
                "http": {"timeout": 15, "max_retries": 2},
                "batch": {"enabled": true, "size": 50, "flush_interval": 2.0}
            },
            "bot": {
                "mode": ["private", "group"],
                "allowed_groups": [-1001, -1002],
                "allowed_users": [200],
                "admins": [300],
                "user_group_permissions": {"200": [-1001]}
            },
            "services": {
                "bot": {"base_url": "http://127.0.0.1:8081"},
                "userbot": {"base_url": "http://127.0.0.1:8082"},
                "search": {"base_url": "http://127.0.0.1:8080"}
            }
        })
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = serde_json::from_value(sample_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.telegram.owner_id, 100);
        assert_eq!(config.search_engine.http.timeout, 15);
        assert_eq!(config.search_engine.batch.size, 50);
        assert_eq!(config.bot.mode.values(), vec!["private", "group"]);
        assert_eq!(config.http.userbot_port, 8082);
        assert_eq!(config.sync.batch_size, 100);
        assert!(!config.auth.use_jwt);

        let perms = config.user_group_permissions();
        assert_eq!(perms[&200], vec![-1001]);
    }

    #[test]
    fn test_mode_accepts_single_string() {
        let mut json = sample_json();
        json["bot"]["mode"] = serde_json::json!("public");
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.bot.mode.values(), vec!["public"]);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let mut json = sample_json();
        json["bot"]["mode"] = serde_json::json!("everyone");
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_owner() {
        let mut json = sample_json();
        json["telegram"]["owner_id"] = serde_json::json!(0);
        let config: Config = serde_json::from_value(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("owner_id"));
    }

    #[test]
    fn test_rejects_bad_permission_key() {
        let mut json = sample_json();
        json["bot"]["user_group_permissions"] = serde_json::json!({"alice": [-1001]});
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jwt_requires_public_key() {
        let mut json = sample_json();
        json["auth"] = serde_json::json!({"use_jwt": true});
        let config: Config = serde_json::from_value(json).unwrap();
        assert!(config.validate().is_err());
    }
}
