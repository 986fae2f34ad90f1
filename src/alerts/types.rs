//! In-memory alert values passed through the dispatcher.

use crate::store::{AlertType, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Everything a channel needs to render one alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Deduplication key; synthesized as `"<ns>/<name>/<type>"` when empty.
    pub key: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub namespace: String,
    pub cronjob_name: String,
    pub monitor_name: String,
    pub context: AlertContext,
    pub timestamp: DateTime<Utc>,
}

/// Failure context bundled with an alert.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertContext {
    pub logs: Option<String>,
    pub events: Vec<String>,
    pub pod_status: Option<String>,
    pub suggested_fix: Option<String>,
    pub success_rate: Option<f64>,
    pub last_duration_secs: Option<f64>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl Alert {
    /// The canonical dedup key for an alert condition.
    pub fn key_for(namespace: &str, cronjob_name: &str, alert_type: AlertType) -> String {
        format!("{namespace}/{cronjob_name}/{alert_type}")
    }

    /// Fill in the dedup key if the producer left it empty.
    pub fn ensure_key(&mut self) {
        if self.key.is_empty() {
            self.key = Self::key_for(&self.namespace, &self.cronjob_name, self.alert_type);
        }
    }

    /// A synthetic alert for exercising a channel end to end.
    pub fn test(channel_name: &str) -> Self {
        Self {
            key: format!("guardian/{channel_name}/Test"),
            alert_type: AlertType::Test,
            severity: Severity::Info,
            title: "Guardian test alert".to_string(),
            message: format!("Test delivery through channel '{channel_name}'. No action needed."),
            namespace: "guardian".to_string(),
            cronjob_name: channel_name.to_string(),
            monitor_name: String::new(),
            context: AlertContext::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Exit-code buckets used for error-signature comparison.
///
/// 137 and 143 get their own buckets ahead of the generic signal range;
/// the order of the match arms is the category table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCategory {
    Success,
    Oom,
    SigTerm,
    Signal,
    AppError,
    Unknown,
}

pub fn exit_category(code: Option<i32>) -> ExitCategory {
    match code {
        Some(0) => ExitCategory::Success,
        Some(137) => ExitCategory::Oom,
        Some(143) => ExitCategory::SigTerm,
        Some(c) if c >= 128 => ExitCategory::Signal,
        Some(c) if (1..=127).contains(&c) => ExitCategory::AppError,
        _ => ExitCategory::Unknown,
    }
}

/// Whether two failures with the same dedup key are "different enough" to
/// bypass suppression.
///
/// A change is an exit-code category change, or a reason change where both
/// sides actually carry a reason. An empty-to-nonempty reason transition is
/// deliberately NOT a change; alerting on it would fire a duplicate the
/// first time a bare failure gains a reason string.
pub fn signature_changed(previous: &Alert, next: &Alert) -> bool {
    if exit_category(previous.context.exit_code) != exit_category(next.context.exit_code) {
        return true;
    }
    let prev_reason = previous.context.reason.as_deref().unwrap_or("");
    let next_reason = next.context.reason.as_deref().unwrap_or("");
    !prev_reason.is_empty() && !next_reason.is_empty() && prev_reason != next_reason
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_with(exit_code: Option<i32>, reason: Option<&str>) -> Alert {
        let mut alert = Alert::test("t");
        alert.context.exit_code = exit_code;
        alert.context.reason = reason.map(str::to_string);
        alert
    }

    #[test]
    fn categories_follow_the_table() {
        assert_eq!(exit_category(Some(0)), ExitCategory::Success);
        assert_eq!(exit_category(Some(137)), ExitCategory::Oom);
        assert_eq!(exit_category(Some(143)), ExitCategory::SigTerm);
        assert_eq!(exit_category(Some(139)), ExitCategory::Signal);
        assert_eq!(exit_category(Some(1)), ExitCategory::AppError);
        assert_eq!(exit_category(Some(127)), ExitCategory::AppError);
        assert_eq!(exit_category(None), ExitCategory::Unknown);
        assert_eq!(exit_category(Some(-1)), ExitCategory::Unknown);
    }

    #[test]
    fn sigterm_is_not_the_generic_signal_bucket() {
        // 143 would fall in >=128, but the explicit row wins.
        assert_ne!(exit_category(Some(143)), exit_category(Some(139)));
    }

    #[test]
    fn category_change_is_a_signature_change() {
        let first = alert_with(Some(1), None);
        let second = alert_with(Some(137), None);
        assert!(signature_changed(&first, &second));
    }

    #[test]
    fn same_category_same_reason_is_unchanged() {
        let first = alert_with(Some(1), Some("Error"));
        let second = alert_with(Some(2), Some("Error"));
        assert!(!signature_changed(&first, &second), "1 and 2 share a bucket");
    }

    #[test]
    fn reason_change_needs_both_sides_non_empty() {
        let bare = alert_with(Some(1), None);
        let with_reason = alert_with(Some(1), Some("DeadlineExceeded"));
        assert!(!signature_changed(&bare, &with_reason));
        assert!(!signature_changed(&with_reason, &bare));

        let other_reason = alert_with(Some(1), Some("Evicted"));
        assert!(signature_changed(&with_reason, &other_reason));
    }

    #[test]
    fn empty_key_synthesis() {
        let mut alert = Alert::test("t");
        alert.key = String::new();
        alert.namespace = "data".into();
        alert.cronjob_name = "etl".into();
        alert.alert_type = AlertType::JobFailed;
        alert.ensure_key();
        assert_eq!(alert.key, "data/etl/JobFailed");
    }
}
