use std::collections::HashMap;

use chrono::Duration;
use serde::Deserialize;

use crate::error::{DripError, DripResult};
use crate::types::FlowId;

/// Longest claim a worker may hold on a row.
pub const MAX_CLAIM_LEASE_SECS: u64 = 86_400;
/// Longest delay the retry backoff may grow to.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 30 * 86_400;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `DRIP__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Upper bound on due rows handled per invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Period between invocations when running as a loop.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub catalog_path: Option<String>,
    #[serde(default)]
    pub entries_path: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub sms: SmsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures after which a row is paused. `None` retries forever.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    /// Base backoff after a failure. Zero keeps the scheduled time unchanged.
    #[serde(default)]
    pub backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentConfig {
    #[serde(default = "default_welcome_flow")]
    pub welcome_flow: FlowId,
    #[serde(default = "default_follow_up_flow")]
    pub follow_up_flow: FlowId,
    #[serde(default = "default_ongoing_flow")]
    pub ongoing_flow: FlowId,
    #[serde(default = "default_entry_window_hours")]
    pub entry_window_hours: u32,
    #[serde(default = "default_follow_up_delay_hours")]
    pub follow_up_delay_hours: u32,
    #[serde(default = "default_chain_cooldown_days")]
    pub chain_cooldown_days: u32,
    /// Prize code -> coupon code. Keys match case-insensitively.
    #[serde(default = "default_prize_coupons")]
    pub prize_coupons: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposerConfig {
    /// Origin recognized as "our" link inside templates, and the base of
    /// freshly built links.
    #[serde(default = "default_link_base")]
    pub link_base: String,
    #[serde(default = "default_coupon_param")]
    pub coupon_param: String,
    #[serde(default = "default_tag_param")]
    pub tag_param: String,
    #[serde(default = "default_tracking_tag")]
    pub default_tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default)]
    pub marketing_from_number: Option<String>,
}

// Default functions
fn default_node_id() -> String {
    "drip-01".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_claim_lease_secs() -> u64 {
    300
}
fn default_interval_secs() -> u64 {
    300
}
fn default_max_attempts() -> Option<u32> {
    Some(10)
}
fn default_max_backoff_secs() -> u64 {
    86_400
}
fn default_welcome_flow() -> FlowId {
    FlowId::from("contest_welcome")
}
fn default_follow_up_flow() -> FlowId {
    FlowId::from("contest_follow_up")
}
fn default_ongoing_flow() -> FlowId {
    FlowId::from("contest_ongoing")
}
fn default_entry_window_hours() -> u32 {
    24
}
fn default_follow_up_delay_hours() -> u32 {
    72
}
fn default_chain_cooldown_days() -> u32 {
    7
}
fn default_prize_coupons() -> HashMap<String, String> {
    HashMap::from([
        ("FREE_SHOUTOUT".to_string(), "WINNER100".to_string()),
        ("HALF_OFF".to_string(), "WINNER50".to_string()),
        ("DISCOUNT_25".to_string(), "WINNER25".to_string()),
    ])
}
fn default_link_base() -> String {
    "https://example.com".to_string()
}
fn default_coupon_param() -> String {
    "coupon".to_string()
}
fn default_tag_param() -> String {
    "ref".to_string()
}
fn default_tracking_tag() -> String {
    "sms".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: 0,
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            welcome_flow: default_welcome_flow(),
            follow_up_flow: default_follow_up_flow(),
            ongoing_flow: default_ongoing_flow(),
            entry_window_hours: default_entry_window_hours(),
            follow_up_delay_hours: default_follow_up_delay_hours(),
            chain_cooldown_days: default_chain_cooldown_days(),
            prize_coupons: default_prize_coupons(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> DripResult<()> {
        if self.max_backoff_secs > MAX_RETRY_BACKOFF_SECS {
            return Err(DripError::Config(format!(
                "retry.max_backoff_secs must be at most {}",
                MAX_RETRY_BACKOFF_SECS
            )));
        }
        if self.backoff_secs > self.max_backoff_secs {
            return Err(DripError::Config(
                "retry.backoff_secs must not exceed retry.max_backoff_secs".into(),
            ));
        }
        Ok(())
    }
}

impl EnrollmentConfig {
    pub fn coupon_for_prize(&self, prize_code: &str) -> Option<&str> {
        self.prize_coupons
            .iter()
            .find(|(prize, _)| prize.eq_ignore_ascii_case(prize_code))
            .map(|(_, coupon)| coupon.as_str())
    }
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            link_base: default_link_base(),
            coupon_param: default_coupon_param(),
            tag_param: default_tag_param(),
            default_tag: default_tracking_tag(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            batch_size: default_batch_size(),
            claim_lease_secs: default_claim_lease_secs(),
            interval_secs: default_interval_secs(),
            catalog_path: None,
            entries_path: None,
            retry: RetryConfig::default(),
            enrollment: EnrollmentConfig::default(),
            composer: ComposerConfig::default(),
            sms: SmsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (which win).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DRIP")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations that cannot drive a sensible invocation.
    pub fn validate(&self) -> DripResult<()> {
        if self.batch_size == 0 {
            return Err(DripError::Config("batch_size must be positive".into()));
        }
        if !(1..=MAX_CLAIM_LEASE_SECS).contains(&self.claim_lease_secs) {
            return Err(DripError::Config(format!(
                "claim_lease_secs must be between 1 and {}",
                MAX_CLAIM_LEASE_SECS
            )));
        }
        if self.interval_secs == 0 {
            return Err(DripError::Config("interval_secs must be positive".into()));
        }
        self.retry.validate()?;
        let e = &self.enrollment;
        if e.welcome_flow == e.follow_up_flow
            || e.welcome_flow == e.ongoing_flow
            || e.follow_up_flow == e.ongoing_flow
        {
            return Err(DripError::Config(
                "welcome, follow-up and ongoing flows must be distinct".into(),
            ));
        }
        if url::Url::parse(&self.composer.link_base).is_err() {
            return Err(DripError::Config(format!(
                "composer.link_base is not a valid URL: {}",
                self.composer.link_base
            )));
        }
        Ok(())
    }

    pub fn claim_lease(&self) -> DripResult<Duration> {
        seconds("claim_lease_secs", self.claim_lease_secs)
    }
}

/// Converts a configured second count, failing instead of wrapping.
pub fn seconds(field: &str, secs: u64) -> DripResult<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| DripError::Config(format!("{} is out of range: {}", field, secs)))
}
