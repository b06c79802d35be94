//! Engine configuration
//!
//! Read once from the environment (after `dotenv`) and passed explicitly.

use crate::error::AnalyticsError;
use crate::knowledge;
use crate::models::{Precision, MAX_DECIMALS};
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Empty disables the Gemini oracle.
    pub gemini_api_key: String,
    /// `None` runs against the fallback dataset only.
    pub warehouse_base_url: Option<String>,
    pub entity_code: String,
    pub default_period: String,
    pub live_timeout: Duration,
    pub live_retry_delay: Duration,
    pub confidence_threshold: f32,
    pub allow_default_intent: bool,
    pub session_ttl: Duration,
    pub precision: Precision,
    pub fallback_dataset_path: Option<String>,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            warehouse_base_url: None,
            entity_code: knowledge::ENTITY.to_string(),
            default_period: knowledge::FISCAL_PERIOD.to_string(),
            live_timeout: Duration::from_secs(10),
            live_retry_delay: Duration::from_millis(500),
            confidence_threshold: 0.6,
            allow_default_intent: false,
            session_ttl: Duration::from_secs(60 * 60),
            precision: Precision::default(),
            fallback_dataset_path: None,
            port: 8080,
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AnalyticsError::Config(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AnalyticsError::Config(format!(
            "{} has invalid value '{}'",
            key, raw
        ))),
    }
}

fn parse_decimals(key: &str, raw: &str) -> Result<u32> {
    let decimals: u32 = parse(key, raw)?;
    if decimals > MAX_DECIMALS {
        return Err(AnalyticsError::Config(format!(
            "{} must be at most {}, got {}",
            key, MAX_DECIMALS, decimals
        )));
    }
    Ok(decimals)
}

impl EngineConfig {
    /// Build from environment variables; unset keys keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(var)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = lookup("GEMINI_API_KEY") {
            config.gemini_api_key = key;
        }
        config.warehouse_base_url = lookup("WAREHOUSE_API_BASE_URL");
        if let Some(entity) = lookup("ENTITY_CODE") {
            config.entity_code = entity;
        }
        if let Some(period) = lookup("DEFAULT_PERIOD") {
            config.default_period = period;
        }
        if let Some(raw) = lookup("LIVE_TIMEOUT_MS") {
            config.live_timeout = Duration::from_millis(parse("LIVE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("LIVE_RETRY_DELAY_MS") {
            config.live_retry_delay = Duration::from_millis(parse("LIVE_RETRY_DELAY_MS", &raw)?);
        }
        if let Some(raw) = lookup("CLASSIFIER_CONFIDENCE_THRESHOLD") {
            let threshold: f32 = parse("CLASSIFIER_CONFIDENCE_THRESHOLD", &raw)?;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(AnalyticsError::Config(format!(
                    "CLASSIFIER_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                    threshold
                )));
            }
            config.confidence_threshold = threshold;
        }
        if let Some(raw) = lookup("ALLOW_DEFAULT_INTENT") {
            config.allow_default_intent = parse_bool("ALLOW_DEFAULT_INTENT", &raw)?;
        }
        if let Some(raw) = lookup("SESSION_TTL_MINUTES") {
            let minutes: u64 = parse("SESSION_TTL_MINUTES", &raw)?;
            // chrono::Duration tops out at i64 milliseconds.
            let seconds = minutes
                .checked_mul(60)
                .filter(|s| *s <= i64::MAX as u64 / 1000)
                .ok_or_else(|| {
                    AnalyticsError::Config(format!("SESSION_TTL_MINUTES is too large: {}", minutes))
                })?;
            config.session_ttl = Duration::from_secs(seconds);
        }
        if let Some(raw) = lookup("MONETARY_DECIMALS") {
            config.precision.monetary_decimals = parse_decimals("MONETARY_DECIMALS", &raw)?;
        }
        if let Some(raw) = lookup("RATIO_DECIMALS") {
            config.precision.ratio_decimals = parse_decimals("RATIO_DECIMALS", &raw)?;
        }
        config.fallback_dataset_path = lookup("FALLBACK_DATASET_PATH");
        if let Some(raw) = lookup("PORT").or_else(|| lookup("API_PORT")) {
            config.port = parse("PORT", &raw)?;
        }

        Ok(config)
    }

    pub fn has_gemini(&self) -> bool {
        !self.gemini_api_key.is_empty()
    }
}
