//! Custom resource types: CronJobMonitor and AlertChannel.
//!
//! Generated CRD schemas are produced by `kube`'s derive; only the operator
//! contract lives here. Duration-valued fields are strings ("30s", "5m") so
//! manifests stay readable; they are parsed and validated at reconcile time.

use crate::config::parse_duration;
use crate::error::{Error, Result};
use crate::store::{ExecutionMetrics, Severity};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use crate::store::AlertType;

/// Finalizer owned by the monitor reconciler.
pub const MONITOR_FINALIZER: &str = "guardian.io/monitor-cleanup";
/// Finalizer owned by the channel reconciler.
pub const CHANNEL_FINALIZER: &str = "guardian.io/channel-cleanup";

fn default_true() -> bool {
    true
}

fn default_window_days() -> u32 {
    7
}

/// Watches a set of CronJobs, keeps their execution history, and raises
/// alerts on failures and SLA violations.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "guardian.io",
    version = "v1alpha1",
    kind = "CronJobMonitor",
    namespaced,
    status = "CronJobMonitorStatus",
    shortname = "cjm"
)]
#[serde(rename_all = "camelCase")]
pub struct CronJobMonitorSpec {
    /// Which CronJobs this monitor covers.
    #[serde(default)]
    pub selector: CronJobSelector,

    /// Alert routing; when absent no alerts are dispatched.
    #[serde(default)]
    pub alerting: Option<AlertingConfig>,

    /// SLA thresholds; when absent only failures alert.
    #[serde(default)]
    pub sla: Option<SlaConfig>,

    /// What gets captured alongside each execution record.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// What happens to history when CronJobs vanish or are recreated.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Remediation patterns layered over the builtin table.
    #[serde(default)]
    pub custom_fix_patterns: Vec<CustomFixPattern>,

    /// Metrics window in days for status reporting and SLA math.
    #[serde(default = "default_window_days")]
    pub metrics_window_days: u32,
}

/// CronJob selection. All present fields are conjunctive.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSelector {
    /// Explicit CronJob names.
    #[serde(default)]
    pub match_names: Vec<String>,

    /// Labels every matched CronJob must carry.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based label requirements.
    #[serde(default)]
    pub match_expressions: Vec<SelectorExpression>,

    /// Namespaces to search. Empty means the monitor's own namespace.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Match namespaces by label instead of listing them.
    #[serde(default)]
    pub namespace_selector: BTreeMap<String, String>,

    /// Search every namespace.
    #[serde(default)]
    pub all_namespaces: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorExpression {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Alert routing for one monitor.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Channels to notify, each with an optional severity filter.
    #[serde(default)]
    pub channels: Vec<ChannelRef>,

    /// Duplicate-suppression window override (duration string).
    #[serde(default)]
    pub suppression_window: Option<String>,

    /// Hold alerts this long before sending; a success in the meantime
    /// cancels them (duration string).
    #[serde(default)]
    pub alert_delay: Option<String>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: Vec::new(),
            suppression_window: None,
            alert_delay: None,
        }
    }
}

impl AlertingConfig {
    /// Effective suppression window, falling back to the operator default.
    pub fn suppression(&self, default: Duration) -> Result<Duration> {
        match self.suppression_window.as_deref() {
            Some(raw) => parse_duration(raw).map_err(Error::Validation),
            None => Ok(default),
        }
    }

    /// Parsed alert delay; None when unset or zero.
    pub fn delay(&self) -> Result<Option<Duration>> {
        match self.alert_delay.as_deref() {
            Some(raw) => {
                let delay = parse_duration(raw).map_err(Error::Validation)?;
                Ok((!delay.is_zero()).then_some(delay))
            }
            None => Ok(None),
        }
    }
}

/// One channel reference inside an AlertingConfig.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub name: String,
    /// Severities this channel receives; empty means all.
    #[serde(default)]
    pub severities: Vec<Severity>,
}

/// SLA thresholds for one monitor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlaConfig {
    /// Minimum success rate in percent over the metrics window.
    #[serde(default)]
    pub min_success_rate: Option<f64>,

    /// Alert when the latest duration exceeds the historical p95 by this
    /// factor (e.g. 1.5).
    #[serde(default)]
    pub duration_regression_threshold: Option<f64>,

    /// Dead-man switch: alert when no success lands within the schedule
    /// interval plus slack.
    #[serde(default)]
    pub dead_man: Option<DeadManConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeadManConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra slack on top of the schedule interval (duration string,
    /// default "5m").
    #[serde(default)]
    pub slack: Option<String>,
}

impl Default for DeadManConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slack: None,
        }
    }
}

impl DeadManConfig {
    pub fn slack_duration(&self) -> Result<Duration> {
        match self.slack.as_deref() {
            Some(raw) => parse_duration(raw).map_err(Error::Validation),
            None => Ok(Duration::from_secs(5 * 60)),
        }
    }
}

/// What gets captured alongside each execution record.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityConfig {
    /// Store container logs from the most recent pod of a failed job.
    #[serde(default)]
    pub store_logs: bool,

    /// Log capture cap per execution.
    #[serde(default = "default_max_log_size_kb")]
    pub max_log_size_kb: u32,

    /// Store the job's cluster events.
    #[serde(default)]
    pub store_events: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            store_logs: false,
            max_log_size_kb: default_max_log_size_kb(),
            store_events: false,
        }
    }
}

fn default_max_log_size_kb() -> u32 {
    64
}

/// History handling for vanished and recreated CronJobs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub vanished: VanishedPolicy,

    /// Grace period for `purge-after-days`.
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,

    #[serde(default)]
    pub on_recreation: RecreationPolicy,
}

fn default_purge_after_days() -> u32 {
    7
}

/// What happens to stored history when a matched CronJob disappears.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum VanishedPolicy {
    #[default]
    Retain,
    Purge,
    PurgeAfterDays,
}

/// What happens when a CronJob name reappears under a new UID.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RecreationPolicy {
    #[default]
    Keep,
    Reset,
}

/// A custom remediation pattern, merged over the builtins by name.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomFixPattern {
    pub name: String,
    pub suggestion: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Inclusive [low, high] exit-code range.
    #[serde(default)]
    pub exit_code_range: Option<[i32; 2]>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub reason_pattern: Option<String>,
    #[serde(default)]
    pub log_pattern: Option<String>,
    #[serde(default)]
    pub event_pattern: Option<String>,
}

/// Observed state of a CronJobMonitor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronJobMonitorStatus {
    #[serde(default)]
    pub phase: MonitorPhase,
    #[serde(default)]
    pub summary: StatusSummary,
    #[serde(default)]
    pub cronjobs: Vec<CronJobStatusEntry>,
    #[serde(default)]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MonitorPhase {
    #[default]
    Active,
    Degraded,
    Error,
}

/// Per-health-bucket totals across all observed CronJobs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub total: u32,
    pub healthy: u32,
    pub warning: u32,
    pub critical: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum CronJobHealth {
    Healthy,
    Warning,
    Critical,
    #[default]
    Unknown,
}

/// Observed state of one matched CronJob.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CronJobStatusEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub health: CronJobHealth,
    #[serde(default)]
    pub last_successful_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_duration_secs: Option<f64>,
    #[serde(default)]
    pub next_schedule_time: Option<DateTime<Utc>>,
    /// Names of owner-referenced child jobs that are not yet terminal.
    #[serde(default)]
    pub active_jobs: Vec<String>,
    #[serde(default)]
    pub metrics: Option<ExecutionMetrics>,
    #[serde(default)]
    pub active_alerts: Vec<ActiveAlertStatus>,
    /// Set when the CronJob is no longer present in the cluster; drives
    /// the `purge-after-days` retention policy.
    #[serde(default)]
    pub vanished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlertStatus {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

/// A delivery target the dispatcher can route alerts to.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "guardian.io",
    version = "v1alpha1",
    kind = "AlertChannel",
    namespaced,
    status = "AlertChannelStatus",
    shortname = "ach"
)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannelSpec {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    #[serde(default)]
    pub slack: Option<SlackChannelConfig>,
    #[serde(default)]
    pub pagerduty: Option<PagerDutyChannelConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
    #[serde(default)]
    pub email: Option<EmailChannelConfig>,

    /// Fire a test alert through the channel whenever it is (re)applied.
    #[serde(default)]
    pub test_on_save: bool,

    #[serde(default)]
    pub rate_limit: Option<ChannelRateLimit>,
    #[serde(default)]
    pub retry: Option<ChannelRetry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Pagerduty,
    Webhook,
    Email,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Slack => "slack",
            ChannelType::Pagerduty => "pagerduty",
            ChannelType::Webhook => "webhook",
            ChannelType::Email => "email",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to one key of a secret in the channel's namespace.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlackChannelConfig {
    /// Secret key holding the webhook URL (default key "webhookUrl").
    pub webhook_url_secret_ref: SecretKeyRef,
    /// Optional channel override posted with the message.
    #[serde(default)]
    pub channel: Option<String>,
    /// Message template; a severity-colored default is used when absent.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PagerDutyChannelConfig {
    /// Secret key holding the Events v2 routing key (default key "routingKey").
    pub routing_key_secret_ref: SecretKeyRef,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookChannelConfig {
    /// Secret key holding the target URL (default key "url").
    pub url_secret_ref: SecretKeyRef,
    /// HTTP method, default POST.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body template; a full default payload is used when absent.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailChannelConfig {
    /// Name of the SMTP secret (keys: host, port, username, password).
    pub smtp_secret_name: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject_template: Option<String>,
    #[serde(default)]
    pub body_template: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRateLimit {
    #[serde(default)]
    pub max_alerts_per_hour: Option<u32>,
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Retry knobs for HTTP channels (duration strings).
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRetry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub initial_backoff: Option<String>,
    #[serde(default)]
    pub max_backoff: Option<String>,
}

/// Observed state of an AlertChannel.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannelStatus {
    #[serde(default)]
    pub ready: bool,
    /// "Registered" or "ValidationFailed".
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_test_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_test_result: Option<String>,
    /// Delivery counters mirrored from the dispatcher.
    #[serde(default)]
    pub delivery: Option<ChannelDeliveryStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDeliveryStatus {
    pub total_sent: i64,
    pub total_failed: i64,
    pub consecutive_failures: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alerting_config_parses_duration_overrides() {
        let cfg = AlertingConfig {
            enabled: true,
            channels: vec![],
            suppression_window: Some("30m".into()),
            alert_delay: Some("45s".into()),
        };
        assert_eq!(
            cfg.suppression(Duration::from_secs(3600)).unwrap(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(cfg.delay().unwrap(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn alerting_config_defaults() {
        let cfg = AlertingConfig::default();
        assert_eq!(
            cfg.suppression(Duration::from_secs(3600)).unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(cfg.delay().unwrap(), None);
    }

    #[test]
    fn zero_delay_means_immediate() {
        let cfg = AlertingConfig {
            alert_delay: Some("0".into()),
            ..Default::default()
        };
        assert_eq!(cfg.delay().unwrap(), None);
    }

    #[test]
    fn retention_policy_wire_form() {
        let policy: VanishedPolicy = serde_json::from_str("\"purge-after-days\"").unwrap();
        assert_eq!(policy, VanishedPolicy::PurgeAfterDays);
        let policy: RecreationPolicy = serde_json::from_str("\"reset\"").unwrap();
        assert_eq!(policy, RecreationPolicy::Reset);
    }
}
