//! Configuration types.
//!
//! The relay is configured by a TOML document. A handful of deployment
//! settings can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::pipeline::types::DeliveryMode;

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "./relay.toml";

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub targets: TargetConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub ad_filter: AdFilterConfig,
    #[serde(default)]
    pub content_filter: ContentFilterConfig,
    #[serde(default)]
    pub replacements: Vec<ReplacementConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub link_checker: LinkCheckerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub mode: DeliveryMode,
    /// Walk history older than the checkpoint for sources without their own flag.
    pub backfill: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Forward,
            backfill: false,
        }
    }
}

/// One sending/receiving credential.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub token: SecretString,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Numeric id, handle or URL.
    pub reference: String,
    /// Overrides `forwarding.backfill`.
    #[serde(default)]
    pub backfill: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub default: String,
    #[serde(default)]
    pub default_topic_id: Option<i64>,
    #[serde(default)]
    pub rules: Vec<DistributionRuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DistributionRuleConfig {
    pub name: String,
    pub all_keywords: Vec<String>,
    pub any_keywords: Vec<String>,
    pub file_types: Vec<String>,
    pub file_name_patterns: Vec<String>,
    pub target: String,
    pub topic_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    pub enable: bool,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdFilterConfig {
    pub enable: bool,
    pub keywords_substring: Vec<String>,
    pub keywords_word: Vec<String>,
    pub file_name_keywords: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    pub enable: bool,
    pub patterns: Vec<String>,
    pub meaningless_words: Vec<String>,
    /// Minimum text length (chars) for messages without attachments.
    pub min_meaningful_length: usize,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            patterns: Vec::new(),
            meaningless_words: Vec::new(),
            min_meaningful_length: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enable: bool,
    pub retention_days: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enable: true,
            retention_days: 30,
        }
    }
}

/// Send, retry and queueing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_send_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive auth failures before a credential is disabled.
    pub max_auth_failures: u32,
    /// Extra seconds added to every rate-limit wait.
    pub rate_limit_padding_secs: u64,
    /// Pause before a receiver opens a new stream.
    pub reconnect_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_send_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_auth_failures: 3,
            rate_limit_padding_secs: 0,
            reconnect_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkCheckerConfig {
    pub enabled: bool,
    /// Cron expression with a seconds field.
    pub schedule: String,
    /// Hosts whose links are tracked.
    pub domains: Vec<String>,
    pub timeout_secs: u64,
    /// Max pending links checked per run.
    pub batch_size: usize,
    pub mode: LinkCheckMode,
    /// Appended after each dead link in `edit` mode.
    pub marker: String,
}

/// What happens to a delivered message whose link went dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkCheckMode {
    #[default]
    Log,
    Edit,
    Delete,
}

impl Default for LinkCheckerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: "0 0 3 * * *".to_string(),
            domains: vec![
                "pan.quark.cn".into(),
                "aliyundrive.com".into(),
                "alipan.com".into(),
                "115.com".into(),
                "pan.baidu.com".into(),
                "cloud.189.cn".into(),
                "drive.uc.cn".into(),
            ],
            timeout_secs: 10,
            batch_size: 200,
            mode: LinkCheckMode::Log,
            marker: "[link expired]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/feed-relay.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for a daily-rolling log file. Stdout only when unset.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl RelayConfig {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without validation or overrides.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `RELAY_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("RELAY_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Ok(bind) = std::env::var("RELAY_ADMIN_BIND") {
            self.admin.bind = bind;
            self.admin.enabled = true;
        }
        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Whether a given source walks its history.
    pub fn backfill_for(&self, source: &SourceConfig) -> bool {
        source.backfill.unwrap_or(self.forwarding.backfill)
    }

    /// Structural validation. Regex compilation and reference resolution
    /// happen when the engine snapshot is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.accounts.iter().any(|a| a.enabled) {
            return Err(ConfigError::MissingRequired {
                key: "accounts".into(),
                hint: "Configure at least one enabled account.".into(),
            });
        }

        let mut ids = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(ConfigError::invalid("accounts.id", "must not be empty"));
            }
            if !ids.insert(account.id.as_str()) {
                return Err(ConfigError::invalid(
                    "accounts.id",
                    format!("duplicate account id '{}'", account.id),
                ));
            }
        }

        if self.sources.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "sources".into(),
                hint: "Configure at least one source.".into(),
            });
        }
        for source in &self.sources {
            if source.reference.trim().is_empty() {
                return Err(ConfigError::invalid("sources.reference", "must not be empty"));
            }
        }

        if self.targets.default.trim().is_empty() {
            return Err(ConfigError::invalid("targets.default", "must not be empty"));
        }
        for (i, rule) in self.targets.rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("targets.rules[{i}].name"),
                    "must not be empty",
                ));
            }
            if rule.target.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("targets.rules[{i}].target"),
                    format!("rule '{}' has no target", rule.name),
                ));
            }
        }

        for (i, replacement) in self.replacements.iter().enumerate() {
            if replacement.pattern.is_empty() {
                return Err(ConfigError::invalid(
                    format!("replacements[{i}].pattern"),
                    "empty pattern would match between every character",
                ));
            }
        }

        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::invalid("dispatch.queue_capacity", "must be > 0"));
        }
        if self.dispatch.max_send_attempts == 0 {
            return Err(ConfigError::invalid("dispatch.max_send_attempts", "must be > 0"));
        }
        if self.dispatch.max_auth_failures == 0 {
            return Err(ConfigError::invalid("dispatch.max_auth_failures", "must be > 0"));
        }

        if self.link_checker.enabled {
            cron::Schedule::from_str(&self.link_checker.schedule).map_err(|e| {
                ConfigError::invalid("link_checker.schedule", format!("invalid cron: {e}"))
            })?;
            if self.link_checker.mode == LinkCheckMode::Edit && self.link_checker.marker.trim().is_empty() {
                return Err(ConfigError::invalid("link_checker.marker", "required in edit mode"));
            }
        }

        if self.admin.enabled && self.admin.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "admin.bind",
                format!("'{}' is not a socket address", self.admin.bind),
            ));
        }

        Ok(())
    }
}

/// Resolve the config path from an explicit value or `RELAY_CONFIG`.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var("RELAY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
