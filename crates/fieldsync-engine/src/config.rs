//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FIELDSYNC_CRM_WEBHOOK_URL=https://crm.example.com/hooks            │
//! │     FIELDSYNC_CRM_INBOUND_SECRET=...                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     explicit path, or                                                  │
//! │     ~/.config/fieldsync/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.fieldsync.fieldsync/sync.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │                                                                         │
//! │  validate() runs last; a production config without an inbound         │
//! │  webhook secret does not load.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [sync]
//! pull_batch_limit = 500
//! stale_after_secs = 604800
//!
//! [crm]
//! webhook_url = "https://crm.example.com/hooks/fieldsync"
//! outbound_secret = "..."
//! inbound_secret = "..."
//! max_attempts = 5
//!
//! [environment]
//! name = "production"
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Hard ceiling for a single pull page.
pub const MAX_PULL_BATCH_LIMIT: u32 = 5000;

/// Environment name that turns on every guard.
pub const PRODUCTION: &str = "production";

// =============================================================================
// Sync Settings
// =============================================================================

/// Device-facing sync behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Default (and maximum requested) number of records per pull.
    #[serde(default = "default_pull_batch_limit")]
    pub pull_batch_limit: u32,

    /// A device silent for longer than this is marked stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// How often the liveness sweep runs.
    #[serde(default = "default_liveness_sweep")]
    pub liveness_sweep_secs: u64,
}

fn default_pull_batch_limit() -> u32 {
    500
}
fn default_stale_after() -> u64 {
    7 * 24 * 60 * 60
}
fn default_liveness_sweep() -> u64 {
    60 * 60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            pull_batch_limit: default_pull_batch_limit(),
            stale_after_secs: default_stale_after(),
            liveness_sweep_secs: default_liveness_sweep(),
        }
    }
}

// =============================================================================
// CRM Settings
// =============================================================================

/// CRM bridge settings, both directions.
#[derive(Clone, Serialize, Deserialize)]
pub struct CrmSettings {
    /// Name of the external system; keys the delivery cursor.
    #[serde(default = "default_system")]
    pub system: String,

    /// Outbound webhook endpoint. Outbound delivery is off when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Sent as `x-webhook-secret` on outbound deliveries.
    #[serde(default)]
    pub outbound_secret: Option<String>,

    /// Expected in `x-webhook-secret` on inbound webhooks.
    #[serde(default)]
    pub inbound_secret: Option<String>,

    /// Delivery attempts per change before the channel halts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Fallback scan interval when no notification arrives.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Log records read per dispatcher scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Entity types delivered to the CRM.
    #[serde(default = "default_relevant_types")]
    pub relevant_entity_types: BTreeSet<String>,
}

fn default_system() -> String {
    fieldsync_core::CRM_SYSTEM.to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_batch_size() -> u32 {
    100
}
fn default_relevant_types() -> BTreeSet<String> {
    ["order", "contact", "deal"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for CrmSettings {
    fn default() -> Self {
        CrmSettings {
            system: default_system(),
            webhook_url: None,
            outbound_secret: None,
            inbound_secret: None,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            relevant_entity_types: default_relevant_types(),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for CrmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(secret: &Option<String>) -> &'static str {
            if secret.is_some() {
                "<redacted>"
            } else {
                "<unset>"
            }
        }

        f.debug_struct("CrmSettings")
            .field("system", &self.system)
            .field("webhook_url", &self.webhook_url)
            .field("outbound_secret", &redact(&self.outbound_secret))
            .field("inbound_secret", &redact(&self.inbound_secret))
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("batch_size", &self.batch_size)
            .field("relevant_entity_types", &self.relevant_entity_types)
            .finish()
    }
}

impl CrmSettings {
    /// Whether changes to this entity type go to the CRM.
    pub fn is_relevant(&self, entity_type: &str) -> bool {
        self.relevant_entity_types.contains(entity_type)
    }

    /// Whether outbound delivery is configured.
    pub fn outbound_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Delay schedule between delivery attempts.
    ///
    /// The attempt cap is enforced by the dispatcher, not by elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_backoff_ms),
            max_interval: Duration::from_secs(self.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// =============================================================================
// Environment Settings
// =============================================================================

/// Deployment environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    #[serde(default = "default_environment")]
    pub name: String,

    /// Accept inbound webhooks without the secret header.
    ///
    /// Only honoured outside production; validation rejects it there.
    #[serde(default)]
    pub allow_unsigned_webhooks: bool,
}

fn default_environment() -> String {
    PRODUCTION.to_string()
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        EnvironmentSettings {
            name: default_environment(),
            allow_unsigned_webhooks: false,
        }
    }
}

impl EnvironmentSettings {
    pub fn is_production(&self) -> bool {
        self.name == PRODUCTION
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device sync settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// CRM bridge settings.
    #[serde(default)]
    pub crm: CrmSettings,

    /// Deployment environment.
    #[serde(default)]
    pub environment: EnvironmentSettings,
}

impl SyncConfig {
    /// A non-production configuration with an inbound secret, for local
    /// runs and tests.
    pub fn development() -> Self {
        let mut config = Self::default();
        config.environment.name = "development".to_string();
        config.crm.inbound_secret = Some("dev-inbound-secret".to_string());
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        info!(
            environment = %config.environment.name,
            outbound = config.crm.outbound_enabled(),
            "Sync config loaded"
        );
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.pull_batch_limit == 0 || self.sync.pull_batch_limit > MAX_PULL_BATCH_LIMIT {
            return Err(SyncError::InvalidConfig(format!(
                "pull_batch_limit must be between 1 and {MAX_PULL_BATCH_LIMIT}"
            )));
        }
        if self.sync.stale_after_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "stale_after_secs must be greater than 0".into(),
            ));
        }
        if self.sync.liveness_sweep_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "liveness_sweep_secs must be greater than 0".into(),
            ));
        }

        if let Some(ref raw) = self.crm.webhook_url {
            let url = url::Url::parse(raw)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(SyncError::InvalidUrl(format!(
                    "Webhook URL must start with http:// or https://, got: {}",
                    raw
                )));
            }
        }
        if self.crm.system.trim().is_empty() {
            return Err(SyncError::InvalidConfig("crm.system must not be empty".into()));
        }
        if self.crm.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.crm.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.crm.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.crm.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.environment.is_production() {
            if self.environment.allow_unsigned_webhooks {
                return Err(SyncError::InvalidConfig(
                    "allow_unsigned_webhooks is not permitted in production".into(),
                ));
            }
            if self.crm.inbound_secret.as_deref().map_or(true, str::is_empty) {
                return Err(SyncError::InvalidConfig(
                    "crm.inbound_secret is required in production".into(),
                ));
            }
        }

        Ok(())
    }

    /// Whether inbound webhooks must carry the shared secret.
    pub fn requires_webhook_secret(&self) -> bool {
        self.environment.is_production() || !self.environment.allow_unsigned_webhooks
    }

    /// Clamps a requested pull size to the configured limit.
    pub fn pull_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.sync.pull_batch_limit)
            .clamp(1, self.sync.pull_batch_limit)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sync.stale_after_secs)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(limit) = var("FIELDSYNC_PULL_BATCH_LIMIT") {
            match limit.parse() {
                Ok(n) => self.sync.pull_batch_limit = n,
                Err(_) => warn!(value = %limit, "Ignoring invalid FIELDSYNC_PULL_BATCH_LIMIT"),
            }
        }

        if let Some(secs) = var("FIELDSYNC_STALE_AFTER_SECS") {
            match secs.parse() {
                Ok(n) => self.sync.stale_after_secs = n,
                Err(_) => warn!(value = %secs, "Ignoring invalid FIELDSYNC_STALE_AFTER_SECS"),
            }
        }

        if let Some(url) = var("FIELDSYNC_CRM_WEBHOOK_URL") {
            debug!(url = %url, "Overriding CRM webhook URL from environment");
            self.crm.webhook_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(secret) = var("FIELDSYNC_CRM_OUTBOUND_SECRET") {
            self.crm.outbound_secret = Some(secret);
        }

        if let Some(secret) = var("FIELDSYNC_CRM_INBOUND_SECRET") {
            self.crm.inbound_secret = Some(secret);
        }

        if let Some(attempts) = var("FIELDSYNC_CRM_MAX_ATTEMPTS") {
            match attempts.parse() {
                Ok(n) => self.crm.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid FIELDSYNC_CRM_MAX_ATTEMPTS"),
            }
        }

        if let Some(name) = var("FIELDSYNC_ENV") {
            debug!(environment = %name, "Overriding environment from environment");
            self.environment.name = name;
        }

        if let Some(flag) = var("FIELDSYNC_ALLOW_UNSIGNED_WEBHOOKS") {
            self.environment.allow_unsigned_webhooks =
                matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fieldsync", "fieldsync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.sync.pull_batch_limit, 500);
        assert_eq!(config.sync.stale_after_secs, 604_800);
        assert_eq!(config.crm.max_attempts, 5);
        assert!(config.crm.is_relevant("order"));
        assert!(!config.crm.is_relevant("invoice"));
        assert!(!config.crm.outbound_enabled());
        assert!(config.environment.is_production());
    }

    #[test]
    fn test_production_requires_inbound_secret() {
        let mut config = SyncConfig::default();
        assert!(config.validate().unwrap_err().is_config_error());

        config.crm.inbound_secret = Some("s3cret".into());
        assert!(config.validate().is_ok());

        config.environment.allow_unsigned_webhooks = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::development();
        assert!(config.validate().is_ok());

        config.crm.webhook_url = Some("ftp://crm.example.com".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.crm.webhook_url = Some("https://crm.example.com/hooks".into());
        assert!(config.validate().is_ok());

        config.crm.max_attempts = 0;
        assert!(config.validate().is_err());
        config.crm.max_attempts = 1;

        config.sync.pull_batch_limit = MAX_PULL_BATCH_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_webhook_guard_bypass_needs_both_flags() {
        let mut config = SyncConfig::development();
        assert!(config.requires_webhook_secret());

        config.environment.allow_unsigned_webhooks = true;
        assert!(!config.requires_webhook_secret());

        config.environment.name = PRODUCTION.into();
        assert!(config.requires_webhook_secret());
    }

    #[test]
    fn test_pull_limit_clamped() {
        let config = SyncConfig::development();
        assert_eq!(config.pull_limit(None), 500);
        assert_eq!(config.pull_limit(Some(20)), 20);
        assert_eq!(config.pull_limit(Some(0)), 1);
        assert_eq!(config.pull_limit(Some(100_000)), 500);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FIELDSYNC_CRM_WEBHOOK_URL", "https://crm.example.com/in"),
            ("FIELDSYNC_CRM_MAX_ATTEMPTS", "3"),
            ("FIELDSYNC_PULL_BATCH_LIMIT", "not-a-number"),
            ("FIELDSYNC_ENV", "staging"),
            ("FIELDSYNC_ALLOW_UNSIGNED_WEBHOOKS", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.crm.webhook_url.as_deref(), Some("https://crm.example.com/in"));
        assert_eq!(config.crm.max_attempts, 3);
        assert_eq!(config.sync.pull_batch_limit, 500);
        assert_eq!(config.environment.name, "staging");
        assert!(!config.requires_webhook_secret());
    }

    #[test]
    fn test_toml_parsing() {
        let config: SyncConfig = toml::from_str(
            r#"
            [crm]
            webhook_url = "https://crm.example.com/hooks"
            inbound_secret = "abc"
            relevant_entity_types = ["order"]
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert!(config.crm.is_relevant("order"));
        assert!(!config.crm.is_relevant("deal"));
        assert_eq!(config.crm.initial_backoff_ms, 500);
        assert_eq!(config.sync.pull_batch_limit, 500);
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let config: SyncConfig = toml::from_str(
            r#"
            [sync]
            liveness_sweep_secs = 0

            [crm]
            inbound_secret = "abc"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let mut config = SyncConfig::development();
        config.crm.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.crm.poll_interval_secs = 1;
        config.crm.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.crm.request_timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = SyncConfig::development();
        config.crm.outbound_secret = Some("hunter2".into());
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("dev-inbound-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
