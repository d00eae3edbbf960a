use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::classifier::ClassifierThresholds;
use crate::variant::Technique;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const MAX_CONCURRENCY: usize = 50;
pub const DEFAULT_DELAY_SECONDS: f64 = 1.0;
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
pub const DEFAULT_PROBE_TIMEOUT_SECONDS: f64 = 5.0;
pub const DEFAULT_MAX_VARIANTS: usize = 100;
/// Upper bound for any configured duration (one week).
pub const MAX_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex");
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid email format: {0}")]
    InvalidEmail(String),

    #[error("a target URL is required unless running in variants-only mode")]
    MissingTarget,

    #[error("invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("invalid proxy URL {0}")]
    InvalidProxy(String),

    #[error("concurrency must be between 1 and {MAX_CONCURRENCY}, got {0}")]
    InvalidConcurrency(usize),

    #[error("{field} must be a non-negative number of seconds no larger than {MAX_SECONDS}, got {value}")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("{field} must be a finite number of at least {min}, got {value}")]
    InvalidThreshold {
        field: &'static str,
        value: f64,
        min: f64,
    },

    #[error("at least one technique must be enabled")]
    NoTechniques,

    #[error("scan-only and variants-only cannot be combined")]
    ConflictingModes,
}

/// Everything one run needs. Built once by the caller, then validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: Option<String>,
    pub email: String,
    pub concurrency: usize,
    pub delay_seconds: f64,
    pub stealth: bool,
    pub random_ua: bool,
    pub proxy: Option<String>,
    pub timeout_seconds: f64,
    pub probe_timeout_seconds: f64,
    pub max_variants: usize,
    pub scan_only: bool,
    pub variants_only: bool,
    pub techniques: Vec<Technique>,
    pub extra_paths: Vec<String>,
    pub seed: Option<u64>,
    pub deadline_seconds: Option<f64>,
    pub thresholds: ClassifierThresholds,
}

impl RunConfig {
    pub fn new(email: impl Into<String>) -> Self {
        RunConfig {
            target: None,
            email: email.into(),
            concurrency: DEFAULT_CONCURRENCY,
            delay_seconds: DEFAULT_DELAY_SECONDS,
            stealth: false,
            random_ua: false,
            proxy: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            probe_timeout_seconds: DEFAULT_PROBE_TIMEOUT_SECONDS,
            max_variants: DEFAULT_MAX_VARIANTS,
            scan_only: false,
            variants_only: false,
            techniques: Technique::ALL.to_vec(),
            extra_paths: Vec::new(),
            seed: None,
            deadline_seconds: None,
            thresholds: ClassifierThresholds::default(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Checks every field and normalises the target. Runs before any
    /// network activity.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.scan_only && self.variants_only {
            return Err(ConfigError::ConflictingModes);
        }
        if !validate_email(&self.email) {
            return Err(ConfigError::InvalidEmail(self.email));
        }

        match self.target.take() {
            Some(raw) => {
                let url = normalize_target(&raw)?;
                self.target = Some(url.to_string().trim_end_matches('/').to_string());
            }
            None if !self.variants_only => return Err(ConfigError::MissingTarget),
            None => {}
        }

        if let Some(proxy) = &self.proxy {
            if Url::parse(proxy).is_err() {
                return Err(ConfigError::InvalidProxy(proxy.clone()));
            }
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }

        check_seconds("delay", self.delay_seconds, true)?;
        check_seconds("timeout", self.timeout_seconds, false)?;
        check_seconds("probe timeout", self.probe_timeout_seconds, false)?;
        if let Some(deadline) = self.deadline_seconds {
            check_seconds("deadline", deadline, false)?;
        }

        let multiplier = self.thresholds.timing_multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ConfigError::InvalidThreshold {
                field: "timing multiplier",
                value: multiplier,
                min: 1.0,
            });
        }

        if self.techniques.is_empty() {
            return Err(ConfigError::NoTechniques);
        }

        Ok(self)
    }

    pub fn target_url(&self) -> Option<Url> {
        self.target.as_deref().and_then(|t| Url::parse(t).ok())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_seconds.min(self.timeout_seconds))
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_seconds.map(Duration::from_secs_f64)
    }

    /// Stealth mode always rotates user agents.
    pub fn rotates_user_agent(&self) -> bool {
        self.random_ua || self.stealth
    }
}

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Adds `https://` when no scheme is present and requires an http(s) host.
pub fn normalize_target(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.contains("://") {
        return Err(ConfigError::InvalidTarget {
            url: raw.to_string(),
            reason: "only http and https targets are supported".to_string(),
        });
    } else {
        format!("https://{}", raw)
    };

    let url = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidTarget {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidTarget {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn check_seconds(field: &'static str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let ok = (value > 0.0 || (allow_zero && value == 0.0))
        && value <= MAX_SECONDS
        && Duration::try_from_secs_f64(value).is_ok();
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidDuration { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn attack_config() -> RunConfig {
        RunConfig::new("admin@example.com").with_target("example.com/")
    }

    #[test]
    fn target_without_scheme_gets_https() {
        let config = assert_ok!(attack_config().validate());
        assert_eq!(config.target.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn trailing_slash_is_stripped_from_paths() {
        let config = assert_ok!(RunConfig::new("a@example.com")
            .with_target("http://127.0.0.1:8080/app/")
            .validate());
        assert_eq!(config.target.as_deref(), Some("http://127.0.0.1:8080/app"));
    }

    #[test]
    fn attack_without_target_is_rejected() {
        let result = RunConfig::new("admin@example.com").validate();
        assert_eq!(result.unwrap_err(), ConfigError::MissingTarget);
    }

    #[test]
    fn variants_only_does_not_need_a_target() {
        let mut config = RunConfig::new("admin@example.com");
        config.variants_only = true;
        assert_ok!(config.validate());
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert_err!(RunConfig::new("not-an-email").with_target("example.com").validate());
        assert_err!(RunConfig::new("a@example.com").with_target("ftp://example.com").validate());
        assert_err!(RunConfig::new("a@example.com").with_target("https://").validate());

        let mut config = attack_config();
        config.concurrency = 0;
        assert_err!(config.validate());

        let mut config = attack_config();
        config.delay_seconds = -1.0;
        assert_err!(config.validate());

        let mut config = attack_config();
        config.timeout_seconds = f64::NAN;
        assert_err!(config.validate());

        let mut config = attack_config();
        config.proxy = Some("not a url".to_string());
        assert_err!(config.validate());

        let mut config = attack_config();
        config.techniques.clear();
        assert_err!(config.validate());
    }

    #[test]
    fn durations_too_large_for_the_clock_are_rejected() {
        for value in [1e20, f64::INFINITY, MAX_SECONDS * 2.0] {
            let mut config = attack_config();
            config.timeout_seconds = value;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidDuration { field: "timeout", .. })
            ));

            let mut config = attack_config();
            config.delay_seconds = value;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidDuration { field: "delay", .. })
            ));

            let mut config = attack_config();
            config.deadline_seconds = Some(value);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidDuration { field: "deadline", .. })
            ));
        }

        let mut config = attack_config();
        config.timeout_seconds = MAX_SECONDS;
        config.deadline_seconds = Some(MAX_SECONDS);
        let config = assert_ok!(config.validate());
        assert_eq!(config.timeout(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.deadline(), Some(Duration::from_secs(7 * 24 * 3600)));
    }

    #[test]
    fn timing_multiplier_must_be_at_least_one() {
        for value in [f64::NAN, -3.0, 0.5, f64::INFINITY] {
            let mut config = attack_config();
            config.thresholds.timing_multiplier = value;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidThreshold { field: "timing multiplier", .. })
            ));
        }

        let mut config = attack_config();
        config.thresholds.timing_multiplier = 1.0;
        assert_ok!(config.validate());
    }

    #[test]
    fn modes_are_exclusive() {
        let mut config = attack_config();
        config.scan_only = true;
        config.variants_only = true;
        assert_eq!(config.validate().unwrap_err(), ConfigError::ConflictingModes);
    }

    #[test]
    fn stealth_forces_user_agent_rotation() {
        let mut config = attack_config();
        assert!(!config.rotates_user_agent());
        config.stealth = true;
        assert!(config.rotates_user_agent());
    }

    #[test]
    fn probe_timeout_never_exceeds_request_timeout() {
        let mut config = attack_config();
        config.timeout_seconds = 2.0;
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
    }
}
