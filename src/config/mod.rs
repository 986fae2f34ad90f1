//! Configuration module for the guardian operator.
//!
//! Configuration is loaded from `GUARDIAN_`-prefixed environment variables
//! using the figment crate (nested fields use a double underscore, e.g.
//! `GUARDIAN_DATABASE__KIND=postgres`). Duration fields accept both numeric
//! values (interpreted as seconds) and duration strings with units.

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main operator configuration containing all sub-configurations.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Log level for the operator's own target ("trace" through "error").
    ///
    /// Equivalent to an env filter of "warn,guardian=<level>".
    /// Defaults to "info" if not specified.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Execution store backend configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Dispatcher-wide alerting defaults.
    #[serde(default)]
    pub alerting: AlertingDefaults,

    /// History retention tiers.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Leader election settings.
    #[serde(default)]
    pub leader_election: LeaderConfig,

    /// How often a CronJobMonitor is re-reconciled when nothing changed.
    #[serde(
        default = "default_monitor_requeue",
        deserialize_with = "deserialize_duration"
    )]
    pub monitor_requeue: Duration,

    /// Graceful shutdown timeout for all services.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            alerting: AlertingDefaults::default(),
            retention: RetentionConfig::default(),
            leader_election: LeaderConfig::default(),
            monitor_requeue: default_monitor_requeue(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Default log level of "info"
fn default_log_level() -> String {
    "info".to_string()
}

/// Default monitor requeue interval of 30 seconds
fn default_monitor_requeue() -> Duration {
    Duration::from_secs(30)
}

/// Default shutdown timeout of 8 seconds
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

/// Which SQL engine backs the execution store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    Postgres,
    Mysql,
}

/// Execution store configuration.
///
/// For sqlite only `path` is consulted; network backends use host/port/name
/// plus credentials resolved from `credentials_secret` (a `namespace/name`
/// reference to a secret exposing `username` and `password` keys).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_kind")]
    pub kind: DatabaseKind,

    /// File path for the sqlite backend.
    #[serde(default = "default_database_path")]
    pub path: String,

    #[serde(default = "default_database_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_database_name")]
    pub name: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// `namespace/name` of the secret holding `username`/`password`.
    #[serde(default)]
    pub credentials_secret: Option<String>,

    /// Connection pool sizing.
    #[serde(default = "default_max_open")]
    pub max_open: u32,
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    #[serde(
        default = "default_max_lifetime",
        deserialize_with = "deserialize_duration"
    )]
    pub max_lifetime: Duration,
    #[serde(
        default = "default_max_idle_time",
        deserialize_with = "deserialize_duration"
    )]
    pub max_idle_time: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_database_kind(),
            path: default_database_path(),
            host: default_database_host(),
            port: None,
            name: default_database_name(),
            ssl_mode: default_ssl_mode(),
            credentials_secret: None,
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            max_lifetime: default_max_lifetime(),
            max_idle_time: default_max_idle_time(),
        }
    }
}

fn default_database_kind() -> DatabaseKind {
    DatabaseKind::Sqlite
}

fn default_database_path() -> String {
    "/data/guardian.db".to_string()
}

fn default_database_host() -> String {
    "localhost".to_string()
}

fn default_database_name() -> String {
    "guardian".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_max_open() -> u32 {
    10
}

fn default_max_idle() -> u32 {
    5
}

/// Default connection lifetime of 30 minutes
fn default_max_lifetime() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Default idle timeout of 10 minutes
fn default_max_idle_time() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Dispatcher-wide alerting defaults.
///
/// Per-monitor alerting configuration can override the suppression window
/// and introduce a per-alert delay; these are the fallbacks and the global
/// throughput cap shared by every channel.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingDefaults {
    /// Global token bucket: sustained alerts per minute across all channels.
    #[serde(default = "default_max_alerts_per_minute")]
    pub max_alerts_per_minute: u32,
    /// Global token bucket burst allowance.
    #[serde(default = "default_alert_burst")]
    pub burst: u32,
    /// Quiet period after startup during which alerts are recorded but not sent.
    #[serde(
        default = "default_startup_grace",
        deserialize_with = "deserialize_duration"
    )]
    pub startup_grace: Duration,
    /// Default duplicate-suppression window.
    #[serde(
        default = "default_suppression_window",
        deserialize_with = "deserialize_duration"
    )]
    pub suppression_window: Duration,
}

impl Default for AlertingDefaults {
    fn default() -> Self {
        Self {
            max_alerts_per_minute: default_max_alerts_per_minute(),
            burst: default_alert_burst(),
            startup_grace: default_startup_grace(),
            suppression_window: default_suppression_window(),
        }
    }
}

fn default_max_alerts_per_minute() -> u32 {
    50
}

fn default_alert_burst() -> u32 {
    10
}

/// Default startup grace of 30 seconds
fn default_startup_grace() -> Duration {
    Duration::from_secs(30)
}

/// Default suppression window of 1 hour
fn default_suppression_window() -> Duration {
    Duration::from_secs(60 * 60)
}

/// History retention tiers.
///
/// Execution metadata and the bulky log/event payloads age out on
/// independent schedules; pruning logs keeps the row for SLA math.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// How long execution rows are kept.
    #[serde(
        default = "default_execution_retention",
        deserialize_with = "deserialize_duration"
    )]
    pub executions: Duration,
    /// How long log/event payloads are kept.
    #[serde(
        default = "default_log_retention",
        deserialize_with = "deserialize_duration"
    )]
    pub logs: Duration,
    /// How often the retention sweeper runs.
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            executions: default_execution_retention(),
            logs: default_log_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Default execution retention of 30 days
fn default_execution_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

/// Default log retention of 7 days
fn default_log_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

/// Default sweep interval of 1 hour
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

/// Leader election settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderConfig {
    #[serde(default = "default_leader_enabled")]
    pub enabled: bool,
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    /// Namespace the lease lives in; defaults to the pod's own namespace.
    #[serde(default)]
    pub lease_namespace: Option<String>,
    #[serde(
        default = "default_lease_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub lease_duration: Duration,
    #[serde(
        default = "default_renew_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub renew_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            enabled: default_leader_enabled(),
            lease_name: default_lease_name(),
            lease_namespace: None,
            lease_duration: default_lease_duration(),
            renew_interval: default_renew_interval(),
        }
    }
}

fn default_leader_enabled() -> bool {
    true
}

fn default_lease_name() -> String {
    "guardian-leader".to_string()
}

/// Default lease duration of 15 seconds
fn default_lease_duration() -> Duration {
    Duration::from_secs(15)
}

/// Default renew interval of 5 seconds
fn default_renew_interval() -> Duration {
    Duration::from_secs(5)
}

/// Duration parser configured to handle various time units with seconds as default
///
/// Supports:
/// - Seconds (s) - default unit
/// - Milliseconds (ms)
/// - Minutes (m)
/// - Hours (h)
/// - Days (d)
///
/// Does not support fractions, exponents, or infinity values.
/// Allows whitespace between the number and the time unit and multiple
/// units summed together (e.g. "1h 30m").
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Parse a human duration string ("30s", "5m", "1h 30m", bare seconds).
///
/// Shared by config deserialization and the CRD fields that carry durations
/// as strings (suppression windows, alert delays, backoff knobs).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    DURATION_PARSER
        .parse(value.trim())
        .map_err(|e| format!("invalid duration '{value}': {e}"))?
        .try_into()
        .map_err(|e| format!("duration '{value}' out of range: {e}"))
}

/// Custom deserializer for duration fields that accepts both numeric and string values
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration(value).map_err(serde::de::Error::custom)
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1d").unwrap(),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(
            parse_duration("1h 30m").unwrap(),
            Duration::from_secs(90 * 60)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn default_config_is_complete() {
        let config = Config::default();
        assert_eq!(config.database.kind, DatabaseKind::Sqlite);
        assert_eq!(config.database.path, "/data/guardian.db");
        assert_eq!(config.alerting.max_alerts_per_minute, 50);
        assert_eq!(config.alerting.startup_grace, Duration::from_secs(30));
        assert_eq!(config.monitor_requeue, Duration::from_secs(30));
    }
}
