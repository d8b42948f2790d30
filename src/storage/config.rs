use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub sync: SyncConfig,
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// One provider account. `kind` selects the client; the credential fields
/// that apply depend on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountConfig {
    pub id: String,
    pub kind: AccountKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_cache: Option<PathBuf>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub request_conference_links: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Rest,
    Caldav,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub sync_past_days: u32,
    pub sync_future_days: u32,
    pub max_concurrent_calendars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulingConfig {
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    pub min_slot_minutes: u32,
    pub include_weekends: bool,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::from)
    }

    pub fn load_or_create() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
            .join("config.toml")
    }

    pub fn database_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calsync")
            .join("calsync.db")
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .expect("Failed to serialize config");
        std::fs::write(&config_path, content)?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: SyncConfig {
                sync_past_days: 90,
                sync_future_days: 365,
                max_concurrent_calendars: 4,
            },
            scheduling: SchedulingConfig {
                work_start_hour: 9,
                work_end_hour: 17,
                min_slot_minutes: 30,
                include_weekends: false,
            },
            accounts: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_syncs_90_days_past() {
        let config = Config::default();
        assert_eq!(config.sync.sync_past_days, 90);
    }

    #[test]
    fn default_config_syncs_365_days_future() {
        let config = Config::default();
        assert_eq!(config.sync.sync_future_days, 365);
    }

    #[test]
    fn default_config_has_no_accounts() {
        let config = Config::default();
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn parse_valid_toml_config() {
        let toml_content = r#"
            [sync]
            sync_past_days = 60
            sync_future_days = 180
            max_concurrent_calendars = 8

            [scheduling]
            work_start_hour = 8
            work_end_hour = 18
            min_slot_minutes = 15
            include_weekends = true

            [[accounts]]
            id = "work@example.com"
            kind = "rest"
            client_id = "cid"
            client_secret = "secret"
            token_cache = "/tmp/token.json"
            request_conference_links = true

            [[accounts]]
            id = "home@example.com"
            kind = "caldav"
            server_url = "https://dav.example.com/home/"
            username = "home"
            password = "app-specific"
        "#;

        let config = Config::from_toml(toml_content).unwrap();

        assert_eq!(config.sync.sync_past_days, 60);
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].kind, AccountKind::Rest);
        assert!(config.accounts[0].request_conference_links);
        assert_eq!(config.accounts[1].kind, AccountKind::Caldav);
        assert_eq!(
            config.accounts[1].server_url.as_deref(),
            Some("https://dav.example.com/home/")
        );
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid toml";
        let result = Config::from_toml(invalid_toml);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_account_kind_is_rejected() {
        let toml_content = r#"
            [sync]
            sync_past_days = 60
            sync_future_days = 180
            max_concurrent_calendars = 4

            [scheduling]
            work_start_hour = 9
            work_end_hour = 17
            min_slot_minutes = 30
            include_weekends = false

            [[accounts]]
            id = "x"
            kind = "exchange"
        "#;

        assert!(Config::from_toml(toml_content).is_err());
    }
}
