use crate::error::{ThrottlerError, ThrottlerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

const ACCOUNT_MAX_API_CALLS: u64 = 30;
const ACCOUNT_MAX_API_CALLS_PERIOD: Duration = Duration::from_secs(60);
const NUMBER_MAX_SMS: u64 = 250;
const NUMBER_MAX_SMS_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MAX_CONCURRENT: usize = 10;
const DEFAULT_MIN_TIME: Duration = Duration::from_millis(500);

/// Settings for one limiter: its reservoir, concurrency cap, start spacing and drop ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LimiterConfig {
    /// Reservoir capacity, i.e. calls allowed per window.
    #[serde(alias = "sms_per_window")]
    #[validate(range(min = 1))]
    pub calls_per_window: u64,

    /// Refill interval of the reservoir.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub window: Duration,

    /// Units added per refill. Defaults to `calls_per_window`.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub refill_amount: Option<u64>,

    /// `None` means unbounded.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_concurrent: Option<usize>,

    /// Minimum spacing between two job starts.
    #[serde(default, with = "humantime_serde")]
    pub min_time: Duration,

    /// Backlog (queued + running) at which new jobs are dropped. `None` never drops.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_queued: Option<usize>,
}

fn validate_non_zero(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

impl LimiterConfig {
    /// Unbounded concurrency, no spacing and no drop ceiling.
    pub fn new(calls_per_window: u64, window: Duration) -> Self {
        Self {
            calls_per_window,
            window,
            refill_amount: None,
            max_concurrent: None,
            min_time: Duration::ZERO,
            max_queued: None,
        }
    }

    /// Account-wide limits: 30 calls per minute.
    pub fn account() -> Self {
        Self::new(ACCOUNT_MAX_API_CALLS, ACCOUNT_MAX_API_CALLS_PERIOD)
            .max_concurrent(DEFAULT_MAX_CONCURRENT)
            .min_time(DEFAULT_MIN_TIME)
    }

    /// Per sending number limits: 250 messages per day.
    pub fn number() -> Self {
        Self::new(NUMBER_MAX_SMS, NUMBER_MAX_SMS_PERIOD)
            .max_concurrent(DEFAULT_MAX_CONCURRENT)
            .min_time(DEFAULT_MIN_TIME)
    }

    pub fn refill_amount(mut self, amount: u64) -> Self {
        self.refill_amount = Some(amount);
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn unbounded_concurrency(mut self) -> Self {
        self.max_concurrent = None;
        self
    }

    pub fn min_time(mut self, min_time: Duration) -> Self {
        self.min_time = min_time;
        self
    }

    pub fn max_queued(mut self, ceiling: usize) -> Self {
        self.max_queued = Some(ceiling);
        self
    }

    pub fn effective_refill_amount(&self) -> u64 {
        self.refill_amount.unwrap_or(self.calls_per_window)
    }

    /// Overlay `{prefix}_*` variables found through `lookup` on top of `self`.
    fn overlay<F>(mut self, prefix: &str, lookup: &F) -> ThrottlerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", prefix, name));

        if let Some(value) = var("CALLS_PER_WINDOW").or_else(|| var("SMS_PER_WINDOW")) {
            self.calls_per_window = parse_number(prefix, "CALLS_PER_WINDOW", &value)?;
        }
        if let Some(value) = var("WINDOW") {
            self.window = parse_duration(prefix, "WINDOW", &value)?;
        }
        if let Some(value) = var("REFILL_AMOUNT") {
            self.refill_amount = Some(parse_number(prefix, "REFILL_AMOUNT", &value)?);
        }
        if let Some(value) = var("MAX_CONCURRENT") {
            self.max_concurrent = parse_limit(prefix, "MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = var("MIN_TIME") {
            self.min_time = parse_duration(prefix, "MIN_TIME", &value)?;
        }
        if let Some(value) = var("MAX_QUEUED") {
            self.max_queued = parse_limit(prefix, "MAX_QUEUED", &value)?;
        }

        Ok(self)
    }
}

fn parse_number<T: std::str::FromStr>(prefix: &str, name: &str, value: &str) -> ThrottlerResult<T> {
    value.trim().parse().map_err(|_| {
        ThrottlerError::Validation(format!("{}_{} must be a whole number, got '{}'", prefix, name, value))
    })
}

fn parse_duration(prefix: &str, name: &str, value: &str) -> ThrottlerResult<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim()).map_err(|e| {
        ThrottlerError::Validation(format!("{}_{} is not a duration ('{}'): {}", prefix, name, value, e))
    })
}

/// `unbounded` (or an empty value) clears the limit.
fn parse_limit(prefix: &str, name: &str, value: &str) -> ThrottlerResult<Option<usize>> {
    match value.trim() {
        "" | "unbounded" | "none" => Ok(None),
        other => parse_number(prefix, name, other).map(Some),
    }
}

/// Limits for the whole throttler: one account limiter over many per-number limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ThrottlerConfig {
    #[serde(default = "LimiterConfig::account")]
    #[validate(nested)]
    pub account: LimiterConfig,

    #[serde(default = "LimiterConfig::number")]
    #[validate(nested)]
    pub number: LimiterConfig,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            account: LimiterConfig::account(),
            number: LimiterConfig::number(),
        }
    }
}

impl ThrottlerConfig {
    /// Load configuration from `ACCOUNT_*` and `NUMBER_*` environment variables.
    pub fn from_env() -> ThrottlerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ThrottlerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            account: defaults.account.overlay("ACCOUNT", &lookup)?,
            number: defaults.number.overlay("NUMBER", &lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> ThrottlerResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ThrottlerError::Validation(format!("invalid configuration JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ThrottlerResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::Validation(format!("cannot read configuration file {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_business_limits() {
        let config = ThrottlerConfig::default();
        assert_eq!(config.account.calls_per_window, 30);
        assert_eq!(config.account.window, Duration::from_secs(60));
        assert_eq!(config.number.calls_per_window, 250);
        assert_eq!(config.number.window, Duration::from_secs(86_400));
        assert_eq!(config.account.max_queued, None);
        assert_eq!(config.number.max_queued, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refill_amount_defaults_to_capacity() {
        let config = LimiterConfig::new(5, Duration::from_secs(1));
        assert_eq!(config.effective_refill_amount(), 5);
        assert_eq!(config.refill_amount(2).effective_refill_amount(), 2);
    }

    #[test]
    fn test_invalid_limits_are_rejected() {
        assert!(LimiterConfig::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(LimiterConfig::new(5, Duration::ZERO).validate().is_err());
        assert!(LimiterConfig::new(5, Duration::from_secs(1))
            .max_concurrent(0)
            .validate()
            .is_err());
        assert!(LimiterConfig::new(5, Duration::from_secs(1))
            .max_queued(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_with_humantime_durations() {
        let config = ThrottlerConfig::from_json_str(
            r#"{
                "account": { "calls_per_window": 5, "window": "1s", "max_queued": 100 },
                "number": { "sms_per_window": 1, "window": "1s", "min_time": "250ms", "max_concurrent": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.account.calls_per_window, 5);
        assert_eq!(config.account.window, Duration::from_secs(1));
        assert_eq!(config.account.max_concurrent, None);
        assert_eq!(config.account.max_queued, Some(100));
        assert_eq!(config.number.calls_per_window, 1);
        assert_eq!(config.number.min_time, Duration::from_millis(250));
        assert_eq!(config.number.max_concurrent, Some(1));
    }

    #[test]
    fn test_json_missing_section_uses_preset() {
        let config = ThrottlerConfig::from_json_str(
            r#"{ "account": { "calls_per_window": 5, "window": "1s" } }"#,
        )
        .unwrap();
        assert_eq!(config.number, LimiterConfig::number());
    }

    #[test]
    fn test_json_failing_validation() {
        let result = ThrottlerConfig::from_json_str(
            r#"{ "account": { "calls_per_window": 0, "window": "1s" } }"#,
        );
        assert!(matches!(result, Err(ThrottlerError::Validation(_))));
    }

    #[test]
    fn test_env_overlay() {
        let config = ThrottlerConfig::from_lookup(lookup(&[
            ("ACCOUNT_CALLS_PER_WINDOW", "5"),
            ("ACCOUNT_WINDOW", "1s"),
            ("ACCOUNT_MAX_CONCURRENT", "unbounded"),
            ("ACCOUNT_MAX_QUEUED", "20"),
            ("NUMBER_SMS_PER_WINDOW", "1"),
            ("NUMBER_MIN_TIME", "1s"),
        ]))
        .unwrap();

        assert_eq!(config.account.calls_per_window, 5);
        assert_eq!(config.account.window, Duration::from_secs(1));
        assert_eq!(config.account.max_concurrent, None);
        assert_eq!(config.account.max_queued, Some(20));
        assert_eq!(config.account.min_time, DEFAULT_MIN_TIME);
        assert_eq!(config.number.calls_per_window, 1);
        assert_eq!(config.number.min_time, Duration::from_secs(1));
        assert_eq!(config.number.window, NUMBER_MAX_SMS_PERIOD);
    }

    #[test]
    fn test_env_bad_values() {
        let result = ThrottlerConfig::from_lookup(lookup(&[("ACCOUNT_WINDOW", "soon")]));
        assert!(matches!(result, Err(ThrottlerError::Validation(_))));

        let result = ThrottlerConfig::from_lookup(lookup(&[("NUMBER_MAX_QUEUED", "-1")]));
        assert!(matches!(result, Err(ThrottlerError::Validation(_))));
    }
}
