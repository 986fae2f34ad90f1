//! CronJobMonitor control loop.
//!
//! Resolves the selector, builds a per-CronJob status (history, schedule,
//! metrics, active alerts), dispatches monitor-level alerts (dead-man, SLA,
//! duration regression), applies the vanished-CronJob retention policy, and
//! writes the aggregated status back with conflict retries.

use crate::alerts::{Alert, AlertContext};
use crate::crd::{
    ActiveAlertStatus, CronJobHealth, CronJobMonitor, CronJobMonitorStatus, CronJobStatusEntry,
    MONITOR_FINALIZER, MonitorPhase, StatusSummary, VanishedPolicy,
};
use crate::error::{Error, Result};
use crate::reconcile::{Context, ensure_finalizer, remove_finalizer};
use crate::reconcile::selector;
use crate::schedule;
use crate::store::{AlertType, CronJobRef, Severity};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn reconcile(monitor: Arc<CronJobMonitor>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = monitor.namespace().unwrap_or_default();
    let name = monitor.name_any();
    let api: Api<CronJobMonitor> = Api::namespaced(ctx.client.clone(), &namespace);

    if monitor.metadata.deletion_timestamp.is_some() {
        // Clear dispatcher state for everything this monitor observed, then
        // let the resource go.
        if let Some(status) = &monitor.status {
            for entry in &status.cronjobs {
                ctx.dispatcher
                    .clear_cronjob_alerts(&entry.namespace, &entry.name)
                    .await;
            }
        }
        remove_finalizer(&api, &name, monitor.as_ref(), MONITOR_FINALIZER).await?;
        info!(monitor = %name, "monitor deleted, alerts cleared");
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &name, monitor.as_ref(), MONITOR_FINALIZER).await?;

    let cronjobs =
        selector::resolve_cronjobs(&ctx.client, &namespace, &monitor.spec.selector).await?;
    debug!(monitor = %name, matched = cronjobs.len(), "selector resolved");

    let now = Utc::now();
    let mut entries = Vec::with_capacity(cronjobs.len());
    for cronjob in &cronjobs {
        entries.push(observe_cronjob(&ctx, &monitor, cronjob, now).await?);
    }

    let previous = monitor.status.clone().unwrap_or_default();
    apply_vanished_policy(&ctx, &monitor, &previous, &mut entries, now).await?;

    let summary = summarize(&entries);
    let phase = if summary.critical > 0 {
        MonitorPhase::Error
    } else if summary.warning > 0 {
        MonitorPhase::Degraded
    } else {
        MonitorPhase::Active
    };

    let status = CronJobMonitorStatus {
        phase,
        summary,
        cronjobs: entries,
        last_reconcile_time: Some(now),
    };
    update_status(&api, &name, &status).await?;

    Ok(Action::requeue(ctx.config.monitor_requeue))
}

/// Build the status entry for one matched CronJob, dispatching any
/// monitor-level alerts along the way.
async fn observe_cronjob(
    ctx: &Arc<Context>,
    monitor: &CronJobMonitor,
    cronjob: &CronJob,
    now: DateTime<Utc>,
) -> Result<CronJobStatusEntry> {
    let cj_namespace = cronjob.namespace().unwrap_or_default();
    let cj_name = cronjob.name_any();
    let cj_uid = cronjob.uid().unwrap_or_default();
    let scope = CronJobRef::new(cj_namespace.clone(), cj_name.clone());
    let window = monitor.spec.metrics_window_days;

    let last = ctx.store.last_execution(&scope).await?;
    let last_success = ctx.store.last_successful_execution(&scope).await?;

    let cron_expression = cronjob
        .spec
        .as_ref()
        .map(|spec| spec.schedule.clone())
        .unwrap_or_default();
    let time_zone = cronjob.spec.as_ref().and_then(|spec| spec.time_zone.clone());
    let next_schedule_time = match schedule::next_run(&cron_expression, time_zone.as_deref(), now) {
        Ok(next) => next,
        Err(e) => {
            warn!(cronjob = %scope, error = %e, "cannot compute next run");
            None
        }
    };

    let active_jobs = active_jobs_of(&ctx.client, &cj_namespace, &cj_uid).await?;
    let metrics = ctx.analyzer.metrics(&scope, window).await?;

    let mut active_alerts: Vec<ActiveAlertStatus> = Vec::new();

    // Check order: last-execution failure, dead-man, SLA, regression.
    if let Some(ref last) = last
        && !last.success
    {
        active_alerts.push(ActiveAlertStatus {
            alert_type: AlertType::JobFailed,
            severity: Severity::Critical,
            message: format!(
                "last run {} failed{}",
                last.job_name,
                last.reason
                    .as_deref()
                    .map(|reason| format!(" ({reason})"))
                    .unwrap_or_default()
            ),
            since: Some(last.completion_time.unwrap_or(last.start_time)),
        });
    }

    if let Some(ref sla) = monitor.spec.sla {
        if let Some(ref dead_man) = sla.dead_man {
            let verdict = ctx
                .analyzer
                .check_dead_man_switch(&scope, &cron_expression, time_zone.as_deref(), dead_man, now)
                .await?;
            if verdict.triggered {
                active_alerts.push(ActiveAlertStatus {
                    alert_type: AlertType::DeadManTriggered,
                    severity: Severity::Critical,
                    message: verdict.message.clone(),
                    since: Some(now),
                });
                dispatch_monitor_alert(
                    ctx,
                    monitor,
                    &scope,
                    AlertType::DeadManTriggered,
                    Severity::Critical,
                    format!("Dead-man switch: {}", scope),
                    verdict.message,
                    &metrics,
                    last.as_ref().and_then(|e| e.duration_secs),
                )
                .await;
            }
        }

        let check = ctx.analyzer.check_sla(&scope, sla, window).await?;
        for violation in check.violations {
            active_alerts.push(ActiveAlertStatus {
                alert_type: violation.alert_type,
                severity: violation.severity,
                message: violation.message.clone(),
                since: Some(now),
            });
            dispatch_monitor_alert(
                ctx,
                monitor,
                &scope,
                violation.alert_type,
                violation.severity,
                format!("SLA breached: {}", scope),
                violation.message,
                &metrics,
                last.as_ref().and_then(|e| e.duration_secs),
            )
            .await;
        }

        if let Some(violation) = ctx
            .analyzer
            .check_duration_regression(&scope, sla, window)
            .await?
        {
            active_alerts.push(ActiveAlertStatus {
                alert_type: violation.alert_type,
                severity: violation.severity,
                message: violation.message.clone(),
                since: Some(now),
            });
            dispatch_monitor_alert(
                ctx,
                monitor,
                &scope,
                violation.alert_type,
                violation.severity,
                format!("Duration regression: {}", scope),
                violation.message,
                &metrics,
                last.as_ref().and_then(|e| e.duration_secs),
            )
            .await;
        }
    }

    let health = if active_alerts
        .iter()
        .any(|alert| alert.severity == Severity::Critical)
    {
        CronJobHealth::Critical
    } else if active_alerts
        .iter()
        .any(|alert| alert.severity == Severity::Warning)
    {
        CronJobHealth::Warning
    } else {
        CronJobHealth::Healthy
    };

    Ok(CronJobStatusEntry {
        namespace: cj_namespace,
        name: cj_name,
        uid: cj_uid,
        health,
        last_successful_time: last_success
            .as_ref()
            .map(|e| e.completion_time.unwrap_or(e.start_time)),
        last_duration_secs: last_success.as_ref().and_then(|e| e.duration_secs),
        next_schedule_time,
        active_jobs,
        metrics: Some(metrics),
        active_alerts,
        vanished_at: None,
    })
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_monitor_alert(
    ctx: &Arc<Context>,
    monitor: &CronJobMonitor,
    scope: &CronJobRef,
    alert_type: AlertType,
    severity: Severity,
    title: String,
    message: String,
    metrics: &crate::store::ExecutionMetrics,
    last_duration_secs: Option<f64>,
) {
    let alert = Alert {
        key: String::new(),
        alert_type,
        severity,
        title,
        message,
        namespace: scope.namespace.clone(),
        cronjob_name: scope.name.clone(),
        monitor_name: monitor.name_any(),
        context: AlertContext {
            success_rate: Some(metrics.success_rate),
            last_duration_secs,
            ..Default::default()
        },
        timestamp: Utc::now(),
    };

    match ctx
        .dispatcher
        .dispatch(alert, monitor.spec.alerting.as_ref())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_rate_limit() => {
            warn!(cronjob = %scope, alert_type = %alert_type, "alert dropped by rate limit");
        }
        Err(e) => {
            warn!(cronjob = %scope, alert_type = %alert_type, error = %e, "alert dispatch failed");
        }
    }
}

/// Names of owner-referenced child jobs that have not reached a terminal
/// condition yet.
async fn active_jobs_of(client: &kube::Client, namespace: &str, owner_uid: &str) -> Result<Vec<String>> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    let list = jobs.list(&ListParams::default()).await?;

    Ok(list
        .items
        .iter()
        .filter(|job| {
            job.metadata
                .owner_references
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|owner| owner.kind == "CronJob" && owner.uid == owner_uid)
        })
        .filter(|job| !job_is_terminal(job))
        .map(|job| job.name_any())
        .collect())
}

fn job_is_terminal(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|condition| {
                (condition.type_ == "Complete" || condition.type_ == "Failed")
                    && condition.status == "True"
            })
        })
        .unwrap_or(false)
}

/// Carry or purge status entries for CronJobs that disappeared since the
/// last observation.
async fn apply_vanished_policy(
    ctx: &Arc<Context>,
    monitor: &CronJobMonitor,
    previous: &CronJobMonitorStatus,
    entries: &mut Vec<CronJobStatusEntry>,
    now: DateTime<Utc>,
) -> Result<()> {
    let current: HashSet<(String, String)> = entries
        .iter()
        .map(|entry| (entry.namespace.clone(), entry.name.clone()))
        .collect();

    for old in &previous.cronjobs {
        if current.contains(&(old.namespace.clone(), old.name.clone())) {
            continue;
        }
        let scope = CronJobRef::new(old.namespace.clone(), old.name.clone());

        match monitor.spec.retention.vanished {
            VanishedPolicy::Retain => {
                let mut kept = old.clone();
                if kept.vanished_at.is_none() {
                    kept.vanished_at = Some(now);
                }
                kept.health = CronJobHealth::Unknown;
                kept.active_jobs.clear();
                entries.push(kept);
            }
            VanishedPolicy::Purge => {
                let deleted = ctx.store.delete_executions(&scope).await?;
                ctx.dispatcher
                    .clear_cronjob_alerts(&scope.namespace, &scope.name)
                    .await;
                info!(cronjob = %scope, deleted, "purged history for vanished cronjob");
            }
            VanishedPolicy::PurgeAfterDays => {
                let vanished_at = old.vanished_at.unwrap_or(now);
                let age = now - vanished_at;
                if age > chrono::Duration::days(i64::from(monitor.spec.retention.purge_after_days))
                {
                    let deleted = ctx.store.delete_executions(&scope).await?;
                    ctx.dispatcher
                        .clear_cronjob_alerts(&scope.namespace, &scope.name)
                        .await;
                    info!(cronjob = %scope, deleted, "purge grace elapsed for vanished cronjob");
                } else {
                    let mut kept = old.clone();
                    kept.vanished_at = Some(vanished_at);
                    kept.health = CronJobHealth::Unknown;
                    kept.active_jobs.clear();
                    entries.push(kept);
                }
            }
        }
    }
    Ok(())
}

fn summarize(entries: &[CronJobStatusEntry]) -> StatusSummary {
    let mut summary = StatusSummary {
        total: entries.len() as u32,
        ..Default::default()
    };
    for entry in entries {
        match entry.health {
            CronJobHealth::Healthy => summary.healthy += 1,
            CronJobHealth::Warning => summary.warning += 1,
            CronJobHealth::Critical => summary.critical += 1,
            CronJobHealth::Unknown => {}
        }
    }
    summary
}

/// Replace the status subresource, retrying on version conflicts.
async fn update_status(
    api: &Api<CronJobMonitor>,
    name: &str,
    status: &CronJobMonitorStatus,
) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    for attempt in 0..ATTEMPTS {
        let mut latest = api.get(name).await?;
        latest.status = Some(status.clone());
        latest.metadata.managed_fields = None;
        let data = serde_json::to_vec(&latest)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < ATTEMPTS => {
                debug!(monitor = %name, attempt, "status update conflict, retrying");
            }
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(health: CronJobHealth) -> CronJobStatusEntry {
        CronJobStatusEntry {
            namespace: "data".into(),
            name: "etl".into(),
            health,
            ..Default::default()
        }
    }

    #[test]
    fn summary_counts_health_buckets() {
        let entries = vec![
            entry(CronJobHealth::Healthy),
            entry(CronJobHealth::Healthy),
            entry(CronJobHealth::Warning),
            entry(CronJobHealth::Critical),
            entry(CronJobHealth::Unknown),
        ];
        let summary = summarize(&entries);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.warning, 1);
        assert_eq!(summary.critical, 1);
    }

    #[test]
    fn terminal_job_detection() {
        use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

        let mut job = Job::default();
        assert!(!job_is_terminal(&job));

        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(job_is_terminal(&job));

        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "False".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!job_is_terminal(&job));
    }
}
