use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::dedup::{DEFAULT_CAPACITY, DEFAULT_SAFETY_WINDOW_SECS};
use crate::pager::DEFAULT_MAX_PAGES;
use crate::retry::RetryPolicy;
use crate::state::STATE_PATH;
use crate::{PORTALS_API_URL, TOKEN_FILE};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Upstream marketplace feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// File the browser-capture tool writes the authorization header into.
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    /// Reject token files older than this.
    #[serde(default)]
    pub token_max_age_secs: Option<u64>,
}

/// Notification channel. Both values may come from the environment instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// `@channel` username or numeric chat id.
    #[serde(default)]
    pub channel: Option<String>,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Polling cadence in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: u64,
    /// Attempt ceiling for fetches and deliveries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retry cadence while no usable credential is available.
    #[serde(default = "default_credential_retry")]
    pub credential_retry_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dedup_safety_window")]
    pub dedup_safety_window_secs: i64,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_tick: u32,
    /// Sales notified on a fresh start; older ones are only recorded.
    #[serde(default = "default_initial_backlog")]
    pub initial_backlog: usize,
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: usize,
    /// Pin messages for sales at or above this price (TON).
    #[serde(default)]
    pub pin_threshold: Option<Decimal>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_api_url() -> String {
    PORTALS_API_URL.to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_token_file() -> PathBuf {
    PathBuf::from(TOKEN_FILE)
}

fn default_check_interval() -> u64 {
    3
}

fn default_token_refresh_interval() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    15
}

fn default_credential_retry() -> u64 {
    10
}

fn default_dedup_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_dedup_safety_window() -> i64 {
    DEFAULT_SAFETY_WINDOW_SECS
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

fn default_initial_backlog() -> usize {
    5
}

fn default_max_messages_per_minute() -> usize {
    20
}

fn default_state_path() -> PathBuf {
    PathBuf::from(STATE_PATH)
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            page_size: default_page_size(),
            token_file: default_token_file(),
            token_max_age_secs: None,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            token_refresh_interval_secs: default_token_refresh_interval(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            credential_retry_secs: default_credential_retry(),
            dedup_capacity: default_dedup_capacity(),
            dedup_safety_window_secs: default_dedup_safety_window(),
            max_pages_per_tick: default_max_pages(),
            initial_backlog: default_initial_backlog(),
            max_messages_per_minute: default_max_messages_per_minute(),
            pin_threshold: None,
            state_path: default_state_path(),
        }
    }
}

impl SettingsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn credential_retry(&self) -> Duration {
        Duration::from_secs(self.credential_retry_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_retries)
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill publisher secrets from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHANNEL`
    /// when the file leaves them out.
    pub fn apply_env(&mut self) {
        if self.telegram.bot_token.is_none() {
            self.telegram.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
        }
        if self.telegram.channel.is_none() {
            self.telegram.channel = std::env::var("TELEGRAM_CHANNEL").ok();
        }
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.feed.api_url.trim().is_empty() {
            bail!("feed.api_url must not be empty");
        }
        if self.feed.page_size == 0 {
            bail!("feed.page_size must be positive");
        }
        if self.settings.max_retries == 0 {
            bail!("settings.max_retries must be at least 1");
        }
        if self.settings.dedup_capacity == 0 {
            bail!("settings.dedup_capacity must be positive");
        }
        if self.telegram_bot_token()?.is_empty() || self.telegram_channel()?.is_empty() {
            bail!("telegram.bot_token and telegram.channel must not be empty");
        }
        Ok(())
    }

    pub fn telegram_bot_token(&self) -> Result<&str> {
        self.telegram
            .bot_token
            .as_deref()
            .context("missing telegram.bot_token (or TELEGRAM_BOT_TOKEN)")
    }

    pub fn telegram_channel(&self) -> Result<&str> {
        self.telegram
            .channel
            .as_deref()
            .context("missing telegram.channel (or TELEGRAM_CHANNEL)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.check_interval_secs, 3);
        assert_eq!(config.settings.token_refresh_interval_secs, 1800);
        assert_eq!(config.settings.max_retries, 5);
        assert_eq!(config.settings.request_timeout_secs, 15);
        assert_eq!(config.feed.page_size, 20);
        assert_eq!(config.feed.api_url, PORTALS_API_URL);
    }

    #[test]
    fn parses_full_file() {
        let config: AppConfig = toml::from_str(
            r#"
            [feed]
            page_size = 50
            token_file = "tokens/portals.txt"

            [telegram]
            bot_token = "123:abc"
            channel = "@sales"

            [settings]
            check_interval_secs = 5
            max_retries = 2
            pin_threshold = "100"
            "#,
        )
        .unwrap();
        assert_eq!(config.feed.page_size, 50);
        assert_eq!(config.feed.token_file, PathBuf::from("tokens/portals.txt"));
        assert_eq!(config.settings.check_interval(), Duration::from_secs(5));
        assert_eq!(config.settings.retry_policy().max_attempts, 2);
        assert_eq!(config.settings.pin_threshold, Some(dec!(100)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_publisher_secrets_is_fatal() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retries_is_rejected() {
        let mut config = AppConfig::default();
        config.telegram.bot_token = Some("123:abc".into());
        config.telegram.channel = Some("@sales".into());
        config.settings.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings]\ncheck_interval_secs = 9\n").unwrap();
        let loaded = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.settings.check_interval_secs, 9);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings\n").unwrap();
        assert!(AppConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.settings.check_interval_secs, 3);
    }
}
