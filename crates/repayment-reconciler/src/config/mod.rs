use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::reconciliation::dispatch::{NotificationTargets, RetryPolicy};
use crate::reconciliation::domain::Channel;
use crate::reconciliation::ledger::{BucketPriority, ChannelPolicy, OverpaymentPolicy};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub reconciliation: ReconciliationConfig,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Read `.env` (if present) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let environment = AppEnvironment::from_str(&var("APP_ENV", "development"));

        let host = var("APP_HOST", "127.0.0.1");
        let port = var("APP_PORT", "3000")
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = var("APP_LOG_LEVEL", "info");

        let lock_timeout = Duration::from_millis(parse_number(
            "RECON_LOCK_TIMEOUT_MS",
            &var("RECON_LOCK_TIMEOUT_MS", "2000"),
        )?);

        let overpayment: OverpaymentPolicy = parse_setting(
            "RECON_DEFAULT_OVERPAYMENT",
            &var("RECON_DEFAULT_OVERPAYMENT", "credit"),
        )?;
        let default_policy = ChannelPolicy {
            overpayment,
            bucket_priority: BucketPriority::default(),
        };

        let mut channel_policies = BTreeMap::new();
        for (channel, policy) in parse_channel_map::<OverpaymentPolicy>(
            "RECON_CHANNEL_OVERPAYMENT",
            &var("RECON_CHANNEL_OVERPAYMENT", ""),
        )? {
            channel_policies
                .entry(channel)
                .or_insert(default_policy)
                .overpayment = policy;
        }
        for (channel, priority) in parse_channel_map::<BucketPriority>(
            "RECON_CHANNEL_BUCKETS",
            &var("RECON_CHANNEL_BUCKETS", ""),
        )? {
            channel_policies
                .entry(channel)
                .or_insert(default_policy)
                .bucket_priority = priority;
        }

        let retry = RetryPolicy {
            max_attempts: parse_number(
                "RECON_DISPATCH_MAX_ATTEMPTS",
                &var("RECON_DISPATCH_MAX_ATTEMPTS", "5"),
            )?,
            initial_backoff: Duration::from_millis(parse_number(
                "RECON_DISPATCH_BACKOFF_MS",
                &var("RECON_DISPATCH_BACKOFF_MS", "200"),
            )?),
            max_backoff: Duration::from_millis(parse_number(
                "RECON_DISPATCH_MAX_BACKOFF_MS",
                &var("RECON_DISPATCH_MAX_BACKOFF_MS", "10000"),
            )?),
        };
        let request_timeout = Duration::from_millis(parse_number(
            "RECON_DISPATCH_TIMEOUT_MS",
            &var("RECON_DISPATCH_TIMEOUT_MS", "5000"),
        )?);
        let max_in_flight: usize = parse_number(
            "RECON_DISPATCH_CONCURRENCY",
            &var("RECON_DISPATCH_CONCURRENCY", "16"),
        )?;

        let target = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let targets = NotificationTargets {
            crm: target("CRM_WEBHOOK_URL"),
            partner_ack: target("PARTNER_ACK_URL"),
            analytics: target("ANALYTICS_URL"),
            alerts: target("ALERT_WEBHOOK_URL"),
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            reconciliation: ReconciliationConfig {
                lock_timeout,
                default_policy,
                channel_policies,
            },
            dispatch: DispatchConfig {
                retry,
                targets,
                request_timeout,
                max_in_flight: max_in_flight.max(1),
            },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Lock and allocation policy for the reconciliation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    pub lock_timeout: Duration,
    pub default_policy: ChannelPolicy,
    pub channel_policies: BTreeMap<Channel, ChannelPolicy>,
}

impl ReconciliationConfig {
    pub fn policy_for(&self, channel: &Channel) -> ChannelPolicy {
        self.channel_policies
            .get(channel)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn with_channel_policy(mut self, channel: Channel, policy: ChannelPolicy) -> Self {
        self.channel_policies.insert(channel, policy);
        self
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            default_policy: ChannelPolicy::default(),
            channel_policies: BTreeMap::new(),
        }
    }
}

/// Side-effect delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    pub targets: NotificationTargets,
    pub request_timeout: Duration,
    /// Deliveries allowed to run at the same time.
    pub max_in_flight: usize,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost {
        source: std::net::AddrParseError,
    },
    InvalidNumber {
        key: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{key} must be a non-negative integer, got '{value}'")
            }
            ConfigError::InvalidSetting { key, value, reason } => {
                write!(f, "{key} has invalid value '{value}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidNumber { .. }
            | ConfigError::InvalidSetting { .. } => None,
        }
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: raw.to_string(),
    })
}

fn parse_setting<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|reason| ConfigError::InvalidSetting {
        key,
        value: raw.to_string(),
        reason,
    })
}

/// Parses `bca=credit,ovo=reject` style lists.
fn parse_channel_map<T>(key: &'static str, raw: &str) -> Result<Vec<(Channel, T)>, ConfigError>
where
    T: FromStr<Err = String>,
{
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (channel, value) =
                pair.split_once('=')
                    .ok_or_else(|| ConfigError::InvalidSetting {
                        key,
                        value: pair.to_string(),
                        reason: "expected channel=value".to_string(),
                    })?;
            if channel.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    key,
                    value: pair.to_string(),
                    reason: "channel must not be empty".to_string(),
                });
            }
            Ok((Channel::from_slug(channel), parse_setting(key, value)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::domain::LedgerBucket;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "RECON_LOCK_TIMEOUT_MS",
            "RECON_DEFAULT_OVERPAYMENT",
            "RECON_CHANNEL_OVERPAYMENT",
            "RECON_CHANNEL_BUCKETS",
            "RECON_DISPATCH_MAX_ATTEMPTS",
            "RECON_DISPATCH_BACKOFF_MS",
            "RECON_DISPATCH_MAX_BACKOFF_MS",
            "RECON_DISPATCH_TIMEOUT_MS",
            "RECON_DISPATCH_CONCURRENCY",
            "CRM_WEBHOOK_URL",
            "PARTNER_ACK_URL",
            "ANALYTICS_URL",
            "ALERT_WEBHOOK_URL",
        ] {
            env::remove_var(key);
        }
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AppConfig::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.reconciliation.lock_timeout, Duration::from_secs(2));
        assert_eq!(
            config.reconciliation.default_policy.overpayment,
            OverpaymentPolicy::Credit
        );
    }

    #[test]
    fn accepts_localhost_host() {
        let config = from_pairs(&[("APP_HOST", "localhost")]).expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }

    #[test]
    fn channel_policies_override_the_default() {
        let config = from_pairs(&[
            ("RECON_DEFAULT_OVERPAYMENT", "credit"),
            ("RECON_CHANNEL_OVERPAYMENT", "ovo=reject, bca=credit"),
            ("RECON_CHANNEL_BUCKETS", "dana=principal>interest>late_fee"),
        ])
        .expect("config loads");

        let reconciliation = &config.reconciliation;
        assert_eq!(
            reconciliation.policy_for(&Channel::Ovo).overpayment,
            OverpaymentPolicy::Reject
        );
        assert_eq!(
            reconciliation.policy_for(&Channel::Bca).overpayment,
            OverpaymentPolicy::Credit
        );
        let dana = reconciliation.policy_for(&Channel::Dana);
        assert_eq!(dana.overpayment, OverpaymentPolicy::Credit);
        assert_eq!(dana.bucket_priority.order()[0], LedgerBucket::Principal);
        assert_eq!(
            reconciliation.policy_for(&Channel::Credgenics),
            reconciliation.default_policy
        );
    }

    #[test]
    fn malformed_settings_are_reported() {
        assert!(matches!(
            from_pairs(&[("RECON_CHANNEL_OVERPAYMENT", "ovo")]),
            Err(ConfigError::InvalidSetting { .. })
        ));
        assert!(matches!(
            from_pairs(&[("RECON_DEFAULT_OVERPAYMENT", "refund")]),
            Err(ConfigError::InvalidSetting { .. })
        ));
        assert!(matches!(
            from_pairs(&[("RECON_LOCK_TIMEOUT_MS", "soon")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            from_pairs(&[("APP_PORT", "70000")]),
            Err(ConfigError::InvalidPort)
        ));
    }

    #[test]
    fn dispatch_concurrency_is_configurable_and_never_zero() {
        let default = from_pairs(&[]).expect("config loads");
        assert_eq!(default.dispatch.max_in_flight, 16);

        let narrowed = from_pairs(&[("RECON_DISPATCH_CONCURRENCY", "4")]).expect("config loads");
        assert_eq!(narrowed.dispatch.max_in_flight, 4);

        let zero = from_pairs(&[("RECON_DISPATCH_CONCURRENCY", "0")]).expect("config loads");
        assert_eq!(zero.dispatch.max_in_flight, 1);
    }

    #[test]
    fn blank_targets_are_treated_as_unset() {
        let config = from_pairs(&[
            ("CRM_WEBHOOK_URL", "https://crm.example/hooks"),
            ("ALERT_WEBHOOK_URL", "  "),
        ])
        .expect("config loads");
        assert_eq!(
            config.dispatch.targets.crm.as_deref(),
            Some("https://crm.example/hooks")
        );
        assert!(config.dispatch.targets.alerts.is_none());
    }
}
