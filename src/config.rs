use dotenv::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::domain::services::relay::{RelaySettings, RetryPolicy};
use crate::domain::services::transport::AmqpSettings;

const APP_ID: &str = "RELAY_APP_ID";
const BROKER_PORT: &str = "RELAY_BROKER_PORT";
const BROKER_USER: &str = "RELAY_BROKER_USER";
const BROKER_PASSWORD: &str = "RELAY_BROKER_PASSWORD";
const BROKER_VHOST: &str = "RELAY_BROKER_VHOST";
const EXCHANGE: &str = "RELAY_EXCHANGE";
const HEARTBEAT_SECS: &str = "RELAY_HEARTBEAT_SECS";
const SUBSCRIBE_ATTEMPTS: &str = "RELAY_SUBSCRIBE_ATTEMPTS";
const SUBSCRIBE_RETRY_MS: &str = "RELAY_SUBSCRIBE_RETRY_MS";
const SUBSCRIBE_CEILING_MS: &str = "RELAY_SUBSCRIBE_CEILING_MS";
const UNSUBSCRIBE_GRACE_MS: &str = "RELAY_UNSUBSCRIBE_GRACE_MS";
const CONNECT_TIMEOUT_MS: &str = "RELAY_CONNECT_TIMEOUT_MS";
const TEARDOWN_TIMEOUT_MS: &str = "RELAY_TEARDOWN_TIMEOUT_MS";
const DRAIN_TIMEOUT_MS: &str = "RELAY_DRAIN_TIMEOUT_MS";
const EVENT_CAPACITY: &str = "RELAY_EVENT_CAPACITY";
const LOG_LEVEL: &str = "RELAY_LOG_LEVEL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse environment variable {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("environment variable {0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub app_id: String,
    pub broker_port: u16,
    pub broker_user: String,
    pub broker_password: String,
    pub broker_vhost: String,
    pub exchange: String,
    pub heartbeat_secs: u16,
    pub subscribe_attempts: u32,
    pub subscribe_retry: Duration,
    pub subscribe_ceiling: Duration,
    pub unsubscribe_grace: Duration,
    pub connect_timeout: Duration,
    pub teardown_timeout: Duration,
    pub drain_timeout: Duration,
    pub event_capacity: usize,
    pub log_level: String,
}

impl RelayConfig {
    pub fn from_env() -> RelayConfig {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_from_env() -> Result<RelayConfig, ConfigError> {
        // Load .env file
        dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!("Loaded relay configuration for app id {}", config.app_id);
        Ok(config)
    }

    /// Builds the configuration from `lookup`, falling back to defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<RelayConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let event_capacity = parse_or(&lookup, EVENT_CAPACITY, defaults.event_capacity)?;
        if event_capacity == 0 {
            return Err(ConfigError::Zero(EVENT_CAPACITY));
        }
        let subscribe_attempts = parse_or(&lookup, SUBSCRIBE_ATTEMPTS, defaults.subscribe_attempts)?;
        if subscribe_attempts == 0 {
            return Err(ConfigError::Zero(SUBSCRIBE_ATTEMPTS));
        }

        Ok(RelayConfig {
            app_id: text(APP_ID, defaults.app_id),
            broker_port: parse_or(&lookup, BROKER_PORT, defaults.broker_port)?,
            broker_user: text(BROKER_USER, defaults.broker_user),
            broker_password: text(BROKER_PASSWORD, defaults.broker_password),
            broker_vhost: text(BROKER_VHOST, defaults.broker_vhost),
            exchange: text(EXCHANGE, defaults.exchange),
            heartbeat_secs: parse_or(&lookup, HEARTBEAT_SECS, defaults.heartbeat_secs)?,
            subscribe_attempts,
            subscribe_retry: millis(SUBSCRIBE_RETRY_MS, defaults.subscribe_retry)?,
            subscribe_ceiling: millis(SUBSCRIBE_CEILING_MS, defaults.subscribe_ceiling)?,
            unsubscribe_grace: millis(UNSUBSCRIBE_GRACE_MS, defaults.unsubscribe_grace)?,
            connect_timeout: millis(CONNECT_TIMEOUT_MS, defaults.connect_timeout)?,
            teardown_timeout: millis(TEARDOWN_TIMEOUT_MS, defaults.teardown_timeout)?,
            drain_timeout: millis(DRAIN_TIMEOUT_MS, defaults.drain_timeout)?,
            event_capacity,
            log_level: text(LOG_LEVEL, defaults.log_level),
        })
    }

    pub fn amqp_settings(&self) -> AmqpSettings {
        AmqpSettings {
            port: self.broker_port,
            user: self.broker_user.clone(),
            password: self.broker_password.clone(),
            vhost: self.broker_vhost.clone(),
            exchange: self.exchange.clone(),
            heartbeat_secs: self.heartbeat_secs,
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            retry: RetryPolicy {
                attempts: self.subscribe_attempts,
                interval: self.subscribe_retry,
                ceiling: self.subscribe_ceiling,
            },
            unsubscribe_grace: self.unsubscribe_grace,
            connect_timeout: self.connect_timeout,
            teardown_timeout: self.teardown_timeout,
            drain_timeout: self.drain_timeout,
            event_capacity: self.event_capacity,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            app_id: "notify-relay".to_string(),
            broker_port: 5672,
            broker_user: "guest".to_string(),
            broker_password: "guest".to_string(),
            broker_vhost: "/".to_string(),
            exchange: "amq.topic".to_string(),
            heartbeat_secs: 30,
            subscribe_attempts: 4,
            subscribe_retry: Duration::from_millis(500),
            subscribe_ceiling: Duration::from_millis(2000),
            unsubscribe_grace: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(10_000),
            teardown_timeout: Duration::from_millis(5000),
            drain_timeout: Duration::from_millis(2000),
            event_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.relay_settings().retry.attempts, 4);
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
    }

    #[test]
    fn values_override_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[
            (APP_ID, "desktop"),
            (BROKER_PORT, "1883"),
            (UNSUBSCRIBE_GRACE_MS, " 250 "),
            (EXCHANGE, "notifications"),
        ]))
        .unwrap();

        assert_eq!(config.app_id, "desktop");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.unsubscribe_grace, Duration::from_millis(250));
        assert_eq!(config.amqp_settings().exchange, "notifications");
        assert_eq!(config.amqp_settings().port, 1883);
    }

    #[test]
    fn malformed_values_are_reported_with_their_key() {
        let err = RelayConfig::from_lookup(lookup(&[(BROKER_PORT, "not-a-port")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: BROKER_PORT,
                value: "not-a-port".to_string()
            }
        );
    }

    #[test]
    fn zero_attempts_and_capacity_are_refused() {
        assert_eq!(
            RelayConfig::from_lookup(lookup(&[(SUBSCRIBE_ATTEMPTS, "0")])).unwrap_err(),
            ConfigError::Zero(SUBSCRIBE_ATTEMPTS)
        );
        assert_eq!(
            RelayConfig::from_lookup(lookup(&[(EVENT_CAPACITY, "0")])).unwrap_err(),
            ConfigError::Zero(EVENT_CAPACITY)
        );
    }
}
