//! SLA analyzer: a thin, stateless layer over the execution store.
//!
//! All checks are read-only; they report violations and leave dispatching
//! to the reconcilers.

use crate::crd::{DeadManConfig, SlaConfig};
use crate::error::Result;
use crate::schedule;
use crate::store::{AlertType, CronJobRef, ExecutionMetrics, ExecutionStore, Severity};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct SlaAnalyzer {
    store: Arc<dyn ExecutionStore>,
}

/// Outcome of an SLA evaluation.
#[derive(Debug, Clone)]
pub struct SlaCheck {
    pub passed: bool,
    pub violations: Vec<SlaViolation>,
}

#[derive(Debug, Clone)]
pub struct SlaViolation {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of a dead-man-switch evaluation.
#[derive(Debug, Clone)]
pub struct DeadManVerdict {
    pub triggered: bool,
    pub message: String,
}

impl SlaAnalyzer {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    pub async fn metrics(
        &self,
        cronjob: &CronJobRef,
        window_days: u32,
    ) -> Result<ExecutionMetrics> {
        self.store.metrics(cronjob, window_days).await
    }

    /// Compare the measured success rate against the configured minimum.
    pub async fn check_sla(
        &self,
        cronjob: &CronJobRef,
        sla: &SlaConfig,
        window_days: u32,
    ) -> Result<SlaCheck> {
        let mut violations = Vec::new();

        if let Some(min_rate) = sla.min_success_rate {
            let rate = self.store.success_rate(cronjob, window_days).await?;
            if rate < min_rate {
                violations.push(SlaViolation {
                    alert_type: AlertType::SlaBreached,
                    severity: Severity::Warning,
                    message: format!(
                        "success rate {rate:.1}% over the last {window_days}d is below the {min_rate:.1}% SLA"
                    ),
                });
            }
        }

        Ok(SlaCheck {
            passed: violations.is_empty(),
            violations,
        })
    }

    /// Compare the most recent execution's duration against the historical
    /// p95. Returns a violation when the ratio exceeds the threshold.
    pub async fn check_duration_regression(
        &self,
        cronjob: &CronJobRef,
        sla: &SlaConfig,
        window_days: u32,
    ) -> Result<Option<SlaViolation>> {
        let Some(threshold) = sla.duration_regression_threshold else {
            return Ok(None);
        };

        let Some(last) = self.store.last_execution(cronjob).await? else {
            return Ok(None);
        };
        let Some(last_duration) = last.duration_secs else {
            return Ok(None);
        };

        let p95 = self
            .store
            .duration_percentile(cronjob, 95.0, window_days)
            .await?;
        if p95 <= 0.0 {
            return Ok(None);
        }

        if last_duration > p95 * threshold {
            return Ok(Some(SlaViolation {
                alert_type: AlertType::DurationRegression,
                severity: Severity::Warning,
                message: format!(
                    "last run took {last_duration:.0}s, {:.1}x the {window_days}d p95 of {p95:.0}s",
                    last_duration / p95
                ),
            }));
        }
        Ok(None)
    }

    /// Dead-man switch: triggered when no success has landed within the
    /// schedule interval plus slack. A CronJob with no successful history
    /// yet does not trigger; there is no baseline to measure from.
    pub async fn check_dead_man_switch(
        &self,
        cronjob: &CronJobRef,
        cron_expression: &str,
        tz: Option<&str>,
        config: &DeadManConfig,
        now: DateTime<Utc>,
    ) -> Result<DeadManVerdict> {
        let not_triggered = DeadManVerdict {
            triggered: false,
            message: String::new(),
        };

        if !config.enabled {
            return Ok(not_triggered);
        }

        let slack = chrono::Duration::from_std(config.slack_duration()?)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let Some(tolerance) = schedule::dead_man_tolerance(cron_expression, tz, slack, now)? else {
            return Ok(not_triggered);
        };

        let Some(last_success) = self.store.last_successful_execution(cronjob).await? else {
            return Ok(not_triggered);
        };
        let last_completion = last_success.completion_time.unwrap_or(last_success.start_time);

        let silence = now - last_completion;
        if silence > tolerance {
            return Ok(DeadManVerdict {
                triggered: true,
                message: format!(
                    "no successful run for {}m (tolerance {}m, schedule '{}')",
                    silence.num_minutes(),
                    tolerance.num_minutes(),
                    cron_expression
                ),
            });
        }
        Ok(not_triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Execution, SqliteStore};
    use chrono::Duration;

    fn scope() -> CronJobRef {
        CronJobRef::new("data", "nightly-etl")
    }

    fn execution(job: &str, ago: Duration, duration_secs: f64, success: bool) -> Execution {
        let start = Utc::now() - ago;
        Execution {
            id: 0,
            namespace: "data".into(),
            cronjob_name: "nightly-etl".into(),
            cronjob_uid: "uid-1".into(),
            job_name: job.into(),
            scheduled_time: None,
            start_time: start,
            completion_time: Some(start + Duration::seconds(duration_secs as i64)),
            duration_secs: Some(duration_secs),
            success,
            exit_code: if success { Some(0) } else { Some(1) },
            reason: None,
            retried: false,
            retry_of: None,
            logs: None,
            events: None,
            suggested_fix: None,
            created_at: None,
        }
    }

    async fn seeded_store(rows: Vec<Execution>) -> Arc<dyn ExecutionStore> {
        let store = SqliteStore::in_memory().await.unwrap();
        store.init().await.unwrap();
        for row in &rows {
            store.record_execution(row).await.unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn sla_passes_above_minimum() {
        let store = seeded_store(vec![
            execution("j1", Duration::hours(3), 60.0, true),
            execution("j2", Duration::hours(2), 60.0, true),
            execution("j3", Duration::hours(1), 60.0, false),
        ])
        .await;
        let analyzer = SlaAnalyzer::new(store);

        let sla = SlaConfig {
            min_success_rate: Some(50.0),
            ..Default::default()
        };
        let check = analyzer.check_sla(&scope(), &sla, 7).await.unwrap();
        assert!(check.passed, "66% > 50%: {:?}", check.violations);
    }

    #[tokio::test]
    async fn sla_violation_below_minimum() {
        let store = seeded_store(vec![
            execution("j1", Duration::hours(3), 60.0, false),
            execution("j2", Duration::hours(2), 60.0, false),
            execution("j3", Duration::hours(1), 60.0, true),
        ])
        .await;
        let analyzer = SlaAnalyzer::new(store);

        let sla = SlaConfig {
            min_success_rate: Some(90.0),
            ..Default::default()
        };
        let check = analyzer.check_sla(&scope(), &sla, 7).await.unwrap();
        assert!(!check.passed);
        assert_eq!(check.violations.len(), 1);
        assert_eq!(check.violations[0].alert_type, AlertType::SlaBreached);
    }

    #[tokio::test]
    async fn empty_window_assumes_healthy() {
        let analyzer = SlaAnalyzer::new(seeded_store(vec![]).await);
        let sla = SlaConfig {
            min_success_rate: Some(99.0),
            ..Default::default()
        };
        let check = analyzer.check_sla(&scope(), &sla, 7).await.unwrap();
        assert!(check.passed);
    }

    #[tokio::test]
    async fn duration_regression_fires_on_slow_run() {
        let mut rows: Vec<Execution> = (0..10)
            .map(|i| execution(&format!("j{i}"), Duration::hours(20 - i), 60.0, true))
            .collect();
        // Latest run is 5x slower than the steady state.
        rows.push(execution("slow", Duration::minutes(5), 300.0, true));
        let analyzer = SlaAnalyzer::new(seeded_store(rows).await);

        let sla = SlaConfig {
            duration_regression_threshold: Some(1.5),
            ..Default::default()
        };
        let violation = analyzer
            .check_duration_regression(&scope(), &sla, 7)
            .await
            .unwrap()
            .expect("should flag the slow run");
        assert_eq!(violation.alert_type, AlertType::DurationRegression);
    }

    #[tokio::test]
    async fn duration_regression_quiet_on_steady_state() {
        let rows: Vec<Execution> = (0..10)
            .map(|i| execution(&format!("j{i}"), Duration::hours(20 - i), 60.0, true))
            .collect();
        let analyzer = SlaAnalyzer::new(seeded_store(rows).await);

        let sla = SlaConfig {
            duration_regression_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(
            analyzer
                .check_duration_regression(&scope(), &sla, 7)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn dead_man_triggers_after_tolerance() {
        // Hourly schedule, last success 3 hours ago.
        let store = seeded_store(vec![execution("j1", Duration::hours(3), 60.0, true)]).await;
        let analyzer = SlaAnalyzer::new(store);

        let verdict = analyzer
            .check_dead_man_switch(
                &scope(),
                "0 * * * *",
                None,
                &DeadManConfig {
                    enabled: true,
                    slack: Some("5m".into()),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(verdict.triggered, "{}", verdict.message);
        assert!(verdict.message.contains("no successful run"));
    }

    #[tokio::test]
    async fn dead_man_quiet_within_tolerance() {
        let store = seeded_store(vec![execution("j1", Duration::minutes(30), 60.0, true)]).await;
        let analyzer = SlaAnalyzer::new(store);

        let verdict = analyzer
            .check_dead_man_switch(
                &scope(),
                "0 * * * *",
                None,
                &DeadManConfig {
                    enabled: true,
                    slack: Some("5m".into()),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!verdict.triggered);
    }

    #[tokio::test]
    async fn dead_man_quiet_without_history() {
        let analyzer = SlaAnalyzer::new(seeded_store(vec![]).await);
        let verdict = analyzer
            .check_dead_man_switch(
                &scope(),
                "0 * * * *",
                None,
                &DeadManConfig::default(),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!verdict.triggered);
    }
}
