//! Job control loop: turns terminal child Jobs into execution records and
//! failure alerts.

use crate::alerts::{Alert, AlertContext};
use crate::cluster;
use crate::crd::{CronJobMonitor, CustomFixPattern, RecreationPolicy};
use crate::error::{Error, Result};
use crate::fixes::{self, FailureContext, FixPattern};
use crate::reconcile::{Context, selector};
use crate::store::{AlertType, CronJobRef, Execution, Severity};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Annotation linking a manual re-run to the execution it retries.
const RETRY_OF_ANNOTATION: &str = "guardian.io/retry-of";

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    completion_time: Option<DateTime<Utc>>,
}

pub async fn reconcile(job: Arc<Job>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = job.namespace().unwrap_or_default();
    let job_name = job.name_any();

    // Only CronJob-owned jobs are interesting.
    let Some(owner) = job
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| owner.kind == "CronJob")
        .cloned()
    else {
        return Ok(Action::await_change());
    };

    // Still running: wait for the next event.
    let Some(outcome) = job_outcome(&job) else {
        return Ok(Action::await_change());
    };

    // Watch replays re-deliver terminal jobs; the stored record makes
    // reconciliation idempotent.
    if ctx
        .store
        .execution_by_job_name(&namespace, &job_name)
        .await?
        .is_some()
    {
        return Ok(Action::await_change());
    }

    let cronjob_api: Api<CronJob> = Api::namespaced(ctx.client.clone(), &namespace);
    let cronjob = cronjob_api.get_opt(&owner.name).await?;
    let cronjob_labels: BTreeMap<String, String> = cronjob
        .as_ref()
        .and_then(|cj| cj.metadata.labels.clone())
        .unwrap_or_default();

    let monitors = matching_monitors(&ctx, &namespace, &owner.name, &cronjob_labels).await?;
    if monitors.is_empty() {
        debug!(job = %job_name, cronjob = %owner.name, "no monitor covers this job");
        return Ok(Action::await_change());
    }

    let scope = CronJobRef::new(namespace.clone(), owner.name.clone());

    // Recreation handling must run before the new UID's first record so the
    // reset does not wipe it.
    if monitors
        .iter()
        .any(|monitor| monitor.spec.retention.on_recreation == RecreationPolicy::Reset)
    {
        let known = ctx.store.cronjob_uids(&scope).await?;
        for stale in known.iter().filter(|uid| **uid != owner.uid) {
            let deleted = ctx.store.delete_executions_by_uid(&scope, stale).await?;
            info!(cronjob = %scope, uid = %stale, deleted, "reset history for recreated cronjob");
        }
    }

    let (execution, pod_status) =
        build_execution(&ctx, &job, &owner.name, &owner.uid, &monitors, outcome).await;

    match ctx.store.record_execution(&execution).await {
        Ok(_) => {}
        Err(Error::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => {
            debug!(job = %job_name, "execution already recorded");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    }
    info!(
        job = %job_name,
        cronjob = %scope,
        success = outcome.success,
        exit_code = ?execution.exit_code,
        "execution recorded"
    );

    if outcome.success {
        // A success clears the failure condition: cancel held alerts and
        // resolve the history row.
        ctx.dispatcher
            .cancel_pending_for_cronjob(&namespace, &owner.name)
            .await;
        ctx.dispatcher
            .resolve_alert_state(&Alert::key_for(&namespace, &owner.name, AlertType::JobFailed))
            .await;
        ctx.store
            .resolve_alert(AlertType::JobFailed, &namespace, &owner.name)
            .await?;
    } else {
        dispatch_failure_alerts(&ctx, &monitors, &scope, &execution, pod_status).await;
    }

    Ok(Action::await_change())
}

/// Terminal outcome of a job, or None while it is still running.
fn job_outcome(job: &Job) -> Option<Outcome> {
    let status = job.status.as_ref()?;

    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => {
                    return Some(Outcome {
                        success: true,
                        completion_time: status.completion_time.as_ref().map(|t| t.0),
                    });
                }
                "Failed" => {
                    return Some(Outcome {
                        success: false,
                        completion_time: condition.last_transition_time.as_ref().map(|t| t.0),
                    });
                }
                _ => {}
            }
        }
    }

    // Some controllers set completionTime without the condition.
    status.completion_time.as_ref().map(|t| Outcome {
        success: true,
        completion_time: Some(t.0),
    })
}

/// Every CronJobMonitor whose selector covers this CronJob.
async fn matching_monitors(
    ctx: &Arc<Context>,
    namespace: &str,
    cronjob_name: &str,
    cronjob_labels: &BTreeMap<String, String>,
) -> Result<Vec<CronJobMonitor>> {
    let monitors: Api<CronJobMonitor> = Api::all(ctx.client.clone());
    let list = monitors.list(&Default::default()).await?;

    let mut namespace_labels: Option<BTreeMap<String, String>> = None;
    let mut matched = Vec::new();

    for monitor in list.items {
        let selector = &monitor.spec.selector;
        let monitor_namespace = monitor.namespace().unwrap_or_default();

        // The namespace label variant needs the namespace object; fetch it
        // once, lazily.
        if !selector.namespace_selector.is_empty() && namespace_labels.is_none() {
            let namespaces: Api<k8s_openapi::api::core::v1::Namespace> =
                Api::all(ctx.client.clone());
            namespace_labels = Some(
                namespaces
                    .get_opt(namespace)
                    .await?
                    .and_then(|ns| ns.metadata.labels)
                    .unwrap_or_default(),
            );
        }

        let in_scope = selector::namespace_in_scope(
            selector,
            &monitor_namespace,
            namespace,
            namespace_labels.as_ref().unwrap_or(&BTreeMap::new()),
        );
        if in_scope && selector::cronjob_matches(selector, cronjob_name, cronjob_labels) {
            matched.push(monitor);
        }
    }
    Ok(matched)
}

/// Assemble the execution record (plus the observed pod phase): pod exit
/// state, capped logs, events, and a suggested fix for failures.
async fn build_execution(
    ctx: &Arc<Context>,
    job: &Job,
    cronjob_name: &str,
    cronjob_uid: &str,
    monitors: &[CronJobMonitor],
    outcome: Outcome,
) -> (Execution, Option<String>) {
    let namespace = job.namespace().unwrap_or_default();
    let job_name = job.name_any();
    let status = job.status.as_ref();

    let start_time = status
        .and_then(|s| s.start_time.as_ref())
        .map(|t| t.0)
        .or_else(|| job.creation_timestamp().map(|t| t.0))
        .unwrap_or_else(Utc::now);
    let duration_secs = outcome
        .completion_time
        .map(|completion| (completion - start_time).num_milliseconds() as f64 / 1000.0);

    // Observability settings are the union across matching monitors.
    let store_logs = monitors.iter().any(|m| m.spec.observability.store_logs);
    let store_events = monitors.iter().any(|m| m.spec.observability.store_events);
    let max_log_kb = monitors
        .iter()
        .map(|m| m.spec.observability.max_log_size_kb)
        .max()
        .unwrap_or(64);

    let pod = match cluster::latest_pod_for_job(&ctx.client, &namespace, &job_name).await {
        Ok(pod) => pod,
        Err(e) => {
            warn!(job = %job_name, error = %e, "pod lookup failed");
            None
        }
    };

    let pod_status = pod.as_ref().and_then(cluster::pod_phase);
    let (mut exit_code, pod_reason) = pod
        .as_ref()
        .map(cluster::pod_exit_status)
        .unwrap_or((None, None));
    let condition_reason = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.reason.clone())
        });
    let reason = pod_reason.or(condition_reason);
    if outcome.success && exit_code.is_none() {
        exit_code = Some(0);
    }

    // Logs are only worth their weight for failures.
    let logs = if store_logs && !outcome.success {
        match pod.as_ref().and_then(|p| p.metadata.name.clone()) {
            Some(pod_name) => {
                match cluster::pod_logs(&ctx.client, &namespace, &pod_name, max_log_kb).await {
                    Ok(logs) if !logs.is_empty() => Some(logs),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(job = %job_name, error = %e, "log capture failed");
                        None
                    }
                }
            }
            None => None,
        }
    } else {
        None
    };

    let events = if store_events {
        match cluster::job_events(&ctx.client, &namespace, &job_name).await {
            Ok(events) if !events.is_empty() => Some(events),
            Ok(_) => None,
            Err(e) => {
                warn!(job = %job_name, error = %e, "event capture failed");
                None
            }
        }
    } else {
        None
    };

    let suggested_fix = if outcome.success {
        None
    } else {
        let custom = merged_custom_patterns(monitors);
        let event_lines = events.clone().unwrap_or_default();
        let context = FailureContext {
            namespace: &namespace,
            name: cronjob_name,
            job_name: &job_name,
            exit_code,
            reason: reason.as_deref().unwrap_or(""),
            logs: logs.as_deref().unwrap_or(""),
            events: &event_lines,
        };
        Some(fixes::best_suggestion(&context, &custom))
    };

    let annotations = job.annotations();
    let retried = status.map(|s| s.failed.unwrap_or(0) > 0 && outcome.success).unwrap_or(false);
    let retry_of = annotations.get(RETRY_OF_ANNOTATION).cloned();

    let execution = Execution {
        id: 0,
        namespace,
        cronjob_name: cronjob_name.to_string(),
        cronjob_uid: cronjob_uid.to_string(),
        job_name,
        scheduled_time: scheduled_time_of(job),
        start_time,
        completion_time: outcome.completion_time,
        duration_secs,
        success: outcome.success,
        exit_code,
        reason,
        retried,
        retry_of,
        logs,
        events: events.map(|lines| lines.join("\n")),
        suggested_fix,
        created_at: None,
    };
    (execution, pod_status)
}

/// The scheduled fire time, when the orchestrator stamped it on the job.
fn scheduled_time_of(job: &Job) -> Option<DateTime<Utc>> {
    job.annotations()
        .get("batch.kubernetes.io/cronjob-scheduled-timestamp")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Custom fix patterns across all matching monitors, merged by name in
/// monitor-name order (first writer wins).
fn merged_custom_patterns(monitors: &[CronJobMonitor]) -> Vec<FixPattern> {
    let mut sorted: Vec<&CronJobMonitor> = monitors.iter().collect();
    sorted.sort_by_key(|monitor| monitor.name_any());

    let mut seen = std::collections::HashSet::new();
    let mut patterns = Vec::new();
    for monitor in sorted {
        for custom in &monitor.spec.custom_fix_patterns {
            if seen.insert(custom.name.clone()) {
                patterns.push(to_fix_pattern(custom));
            }
        }
    }
    patterns
}

fn to_fix_pattern(custom: &CustomFixPattern) -> FixPattern {
    let mut pattern = FixPattern::new(&custom.name, &custom.suggestion).priority(custom.priority);
    if let Some(code) = custom.exit_code {
        pattern = pattern.exit_code(code);
    }
    if let Some([low, high]) = custom.exit_code_range {
        pattern = pattern.exit_code_range(low, high);
    }
    if let Some(ref reason) = custom.reason {
        pattern = pattern.reason(reason);
    }
    if let Some(ref regex) = custom.reason_pattern {
        pattern = pattern.reason_pattern(regex);
    }
    if let Some(ref regex) = custom.log_pattern {
        pattern = pattern.log_pattern(regex);
    }
    if let Some(ref regex) = custom.event_pattern {
        pattern = pattern.event_pattern(regex);
    }
    pattern
}

/// Fan a JobFailed alert out through every matching monitor's alerting
/// configuration.
async fn dispatch_failure_alerts(
    ctx: &Arc<Context>,
    monitors: &[CronJobMonitor],
    scope: &CronJobRef,
    execution: &Execution,
    pod_status: Option<String>,
) {
    for monitor in monitors {
        let Some(alerting) = monitor.spec.alerting.as_ref() else {
            continue;
        };

        let window = monitor.spec.metrics_window_days;
        let success_rate = match ctx.store.success_rate(scope, window).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                warn!(cronjob = %scope, error = %e, "success rate lookup failed");
                None
            }
        };

        let alert = Alert {
            key: String::new(),
            alert_type: AlertType::JobFailed,
            severity: Severity::Critical,
            title: format!("Job failed: {scope}"),
            message: format!(
                "job {} failed{}{}",
                execution.job_name,
                execution
                    .exit_code
                    .map(|code| format!(" with exit code {code}"))
                    .unwrap_or_default(),
                execution
                    .reason
                    .as_deref()
                    .map(|reason| format!(" ({reason})"))
                    .unwrap_or_default(),
            ),
            namespace: scope.namespace.clone(),
            cronjob_name: scope.name.clone(),
            monitor_name: monitor.name_any(),
            context: AlertContext {
                logs: execution.logs.clone(),
                events: execution
                    .events
                    .as_deref()
                    .map(|joined| joined.lines().map(str::to_string).collect())
                    .unwrap_or_default(),
                pod_status: pod_status.clone(),
                suggested_fix: execution.suggested_fix.clone(),
                success_rate,
                last_duration_secs: execution.duration_secs,
                exit_code: execution.exit_code,
                reason: execution.reason.clone(),
            },
            timestamp: Utc::now(),
        };

        match ctx.dispatcher.dispatch(alert, Some(alerting)).await {
            Ok(()) => {}
            Err(e) if e.is_rate_limit() => {
                warn!(cronjob = %scope, monitor = %monitor.name_any(), "failure alert dropped by rate limit");
            }
            Err(e) => {
                warn!(cronjob = %scope, monitor = %monitor.name_any(), error = %e, "failure alert dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn job_with_status(status: JobStatus) -> Job {
        Job {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn running_job_has_no_outcome() {
        assert!(job_outcome(&Job::default()).is_none());
        assert!(job_outcome(&job_with_status(JobStatus::default())).is_none());
    }

    #[test]
    fn complete_condition_is_success() {
        let completion = Time(Utc::now());
        let outcome = job_outcome(&job_with_status(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            completion_time: Some(completion.clone()),
            ..Default::default()
        }))
        .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.completion_time, Some(completion.0));
    }

    #[test]
    fn failed_condition_is_failure() {
        let outcome = job_outcome(&job_with_status(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                last_transition_time: Some(Time(Utc::now())),
                ..Default::default()
            }]),
            ..Default::default()
        }))
        .unwrap();
        assert!(!outcome.success);
        assert!(outcome.completion_time.is_some());
    }

    #[test]
    fn completion_time_without_condition_counts_as_success() {
        let outcome = job_outcome(&job_with_status(JobStatus {
            completion_time: Some(Time(Utc::now())),
            ..Default::default()
        }))
        .unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn custom_patterns_merge_first_writer_wins() {
        use crate::crd::{CronJobMonitorSpec, CronJobSelector};

        let make_monitor = |name: &str, pattern_name: &str, suggestion: &str| {
            let mut monitor = CronJobMonitor::new(
                name,
                CronJobMonitorSpec {
                    selector: CronJobSelector::default(),
                    alerting: None,
                    sla: None,
                    observability: Default::default(),
                    retention: Default::default(),
                    custom_fix_patterns: vec![CustomFixPattern {
                        name: pattern_name.into(),
                        suggestion: suggestion.into(),
                        priority: 50,
                        exit_code: Some(1),
                        exit_code_range: None,
                        reason: None,
                        reason_pattern: None,
                        log_pattern: None,
                        event_pattern: None,
                    }],
                    metrics_window_days: 7,
                },
            );
            monitor.metadata.name = Some(name.into());
            monitor
        };

        let monitors = vec![
            make_monitor("b-monitor", "shared", "from-b"),
            make_monitor("a-monitor", "shared", "from-a"),
        ];
        let merged = merged_custom_patterns(&monitors);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].suggestion, "from-a", "a-monitor sorts first");
    }
}
