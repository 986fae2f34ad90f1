//! Persistence models shared by every store backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the CronJob whose history a query is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronJobRef {
    pub namespace: String,
    pub name: String,
}

impl CronJobRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for CronJobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The category of condition an alert reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, schemars::JsonSchema,
)]
pub enum AlertType {
    JobFailed,
    MissedSchedule,
    DeadManTriggered,
    #[serde(rename = "SLABreached")]
    #[sqlx(rename = "SLABreached")]
    SlaBreached,
    DurationRegression,
    Test,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::JobFailed => "JobFailed",
            AlertType::MissedSchedule => "MissedSchedule",
            AlertType::DeadManTriggered => "DeadManTriggered",
            AlertType::SlaBreached => "SLABreached",
            AlertType::DurationRegression => "DurationRegression",
            AlertType::Test => "Test",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgent an alert is; channels can filter on this.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per terminal Job outcome.
///
/// `(namespace, job_name, start_time)` uniquely identifies a record. Rows are
/// immutable after write except for `logs`/`events`, which retention may null
/// out while preserving the row for SLA math.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    #[sqlx(default)]
    pub id: i64,
    pub namespace: String,
    pub cronjob_name: String,
    pub cronjob_uid: String,
    pub job_name: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub retried: bool,
    pub retry_of: Option<String>,
    pub logs: Option<String>,
    pub events: Option<String>,
    pub suggested_fix: Option<String>,
    #[sqlx(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn cronjob(&self) -> CronJobRef {
        CronJobRef::new(self.namespace.clone(), self.cronjob_name.clone())
    }
}

/// Success/failure filter applied at the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Success,
    Failed,
}

impl StatusFilter {
    /// Parse the wire form used by list endpoints: "success", "failed", or
    /// the empty string for no filter.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(StatusFilter::All),
            "success" => Some(StatusFilter::Success),
            "failed" => Some(StatusFilter::Failed),
            _ => None,
        }
    }
}

/// Aggregate SLA numbers for one CronJob over a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    /// Percentage in [0, 100]; an empty window reports 100 (assume healthy).
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    pub p50_duration_secs: f64,
    pub p95_duration_secs: f64,
    pub p99_duration_secs: f64,
}

/// One row per dispatched alert.
///
/// `channels` holds the comma-joined names of the channels that were
/// actually notified; `resolved_at` is only ever written by an explicit
/// resolve and is set at most once.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertHistoryRecord {
    #[sqlx(default)]
    pub id: i64,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub namespace: String,
    pub cronjob_name: String,
    pub monitor_name: Option<String>,
    pub channels: String,
    pub occurred_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub suggested_fix: Option<String>,
}

impl AlertHistoryRecord {
    /// Decode the comma-joined channel column.
    pub fn channel_list(&self) -> Vec<String> {
        if self.channels.is_empty() {
            return Vec::new();
        }
        self.channels.split(',').map(str::to_string).collect()
    }

    /// Encode a channel list for storage.
    pub fn join_channels(names: &[String]) -> String {
        names.join(",")
    }
}

/// Filters for listing alert history. All fields are optional and conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AlertHistoryQuery {
    pub namespace: Option<String>,
    pub cronjob_name: Option<String>,
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub unresolved_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AlertHistoryQuery {
    pub fn unresolved_since(since: DateTime<Utc>) -> Self {
        Self {
            unresolved_only: true,
            since: Some(since),
            limit: 1000,
            ..Default::default()
        }
    }
}

/// Delivery counters for one registered channel, keyed by channel name.
///
/// `consecutive_failures` resets to 0 on any success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelStatsRecord {
    pub channel_name: String,
    pub total_sent: i64,
    pub total_failed: i64,
    pub consecutive_failures: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ChannelStatsRecord {
    pub fn named(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_sent += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, error: &str) {
        self.total_failed += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(at);
        self.last_error = Some(error.to_string());
    }
}

/// How many alert-history rows name a given channel, and when it last fired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelAlertStats {
    pub channel_name: String,
    pub alerts_sent: i64,
    pub last_alert: Option<DateTime<Utc>>,
}
