use crate::error::{
    ConnectionError,
    Result,
};
use std::time::Duration;
use url::Url;

pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_CRASH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub const FAUCET_URL_ENV: &str = "PORTFOLIO_FAUCET_URL";
pub const APPLICATION_ID_ENV: &str = "PORTFOLIO_APPLICATION_ID";
pub const RECONNECT_COOLDOWN_ENV: &str = "PORTFOLIO_RECONNECT_COOLDOWN_MS";
pub const CRASH_RETRY_DELAY_ENV: &str = "PORTFOLIO_CRASH_RETRY_DELAY_MS";

/// Settings for the connection manager. The faucet URL and application id are
/// optional here so that a missing value is reported by `initialize()` rather
/// than at construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionConfig {
    pub faucet_url: Option<String>,
    pub application_id: Option<String>,
    pub reconnect_cooldown: Duration,
    pub crash_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            faucet_url: None,
            application_id: None,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            crash_retry_delay: DEFAULT_CRASH_RETRY_DELAY,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidatedConfig {
    pub faucet_url: Url,
    pub application_id: String,
}

impl ConnectionConfig {
    pub fn new(faucet_url: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            faucet_url: Some(faucet_url.into()),
            application_id: Some(application_id.into()),
            ..Self::default()
        }
    }

    pub fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }

    pub fn with_crash_retry_delay(mut self, delay: Duration) -> Self {
        self.crash_retry_delay = delay;
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            faucet_url: lookup(FAUCET_URL_ENV),
            application_id: lookup(APPLICATION_ID_ENV),
            ..Self::default()
        };
        if let Some(raw) = lookup(RECONNECT_COOLDOWN_ENV) {
            config.reconnect_cooldown = parse_millis(RECONNECT_COOLDOWN_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CRASH_RETRY_DELAY_ENV) {
            config.crash_retry_delay = parse_millis(CRASH_RETRY_DELAY_ENV, &raw)?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<ValidatedConfig> {
        let faucet_raw = required(self.faucet_url.as_deref(), "faucet URL")?;
        let faucet_url = Url::parse(faucet_raw).map_err(|e| {
            ConnectionError::Configuration(format!("invalid faucet URL '{faucet_raw}': {e}"))
        })?;
        if !matches!(faucet_url.scheme(), "http" | "https") {
            return Err(ConnectionError::Configuration(format!(
                "faucet URL must be http(s), got '{faucet_raw}'"
            )));
        }
        let application_id = required(self.application_id.as_deref(), "application id")?;
        Ok(ValidatedConfig {
            faucet_url,
            application_id: application_id.to_string(),
        })
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConnectionError::Configuration(format!("{what} is not configured"))),
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| {
            ConnectionError::Configuration(format!("{key} must be milliseconds: {e}"))
        })
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        pairs: &[(&'static str, &'static str)],
    ) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key: &str| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn validate__complete_config__returns_parsed_values() {
        // given
        let config = ConnectionConfig::new("https://faucet.example.com", "app-123");

        // when
        let validated = config.validate().unwrap();

        // then
        assert_eq!(validated.faucet_url.host_str(), Some("faucet.example.com"));
        assert_eq!(validated.application_id, "app-123");
    }

    #[test]
    fn validate__missing_faucet_url__is_configuration_error() {
        let config = ConnectionConfig {
            application_id: Some("app-123".to_string()),
            ..ConnectionConfig::default()
        };

        let err = config.validate().unwrap_err();

        assert!(matches!(err, ConnectionError::Configuration(msg) if msg.contains("faucet")));
    }

    #[test]
    fn validate__blank_application_id__is_configuration_error() {
        let config = ConnectionConfig::new("https://faucet.example.com", "   ");

        let err = config.validate().unwrap_err();

        assert!(
            matches!(err, ConnectionError::Configuration(msg) if msg.contains("application"))
        );
    }

    #[test]
    fn validate__non_http_faucet__is_configuration_error() {
        let config = ConnectionConfig::new("ftp://faucet.example.com", "app");

        let err = config.validate().unwrap_err();

        assert!(matches!(err, ConnectionError::Configuration(_)));
    }

    #[test]
    fn from_lookup__reads_values_and_overrides() {
        // given
        let lookup = lookup_from(&[
            (FAUCET_URL_ENV, "http://localhost:8079"),
            (APPLICATION_ID_ENV, "abc"),
            (RECONNECT_COOLDOWN_ENV, "2500"),
        ]);

        // when
        let config = ConnectionConfig::from_lookup(lookup).unwrap();

        // then
        assert_eq!(config.faucet_url.as_deref(), Some("http://localhost:8079"));
        assert_eq!(config.application_id.as_deref(), Some("abc"));
        assert_eq!(config.reconnect_cooldown, Duration::from_millis(2500));
        assert_eq!(config.crash_retry_delay, DEFAULT_CRASH_RETRY_DELAY);
    }

    #[test]
    fn from_lookup__bad_duration__is_configuration_error() {
        let lookup = lookup_from(&[(CRASH_RETRY_DELAY_ENV, "soon")]);

        let err = ConnectionConfig::from_lookup(lookup).unwrap_err();

        assert!(matches!(err, ConnectionError::Configuration(_)));
    }
}
