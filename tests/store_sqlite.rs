#[allow(dead_code)]
mod helpers;

use chrono::{Duration, Utc};
use guardian::store::{
    AlertHistoryQuery, AlertHistoryRecord, AlertType, ChannelStatsRecord, CronJobRef, Severity,
    SqliteStore, StatusFilter,
};
use guardian::store::ExecutionStore;
use helpers::{execution, memory_store};

fn scope() -> CronJobRef {
    CronJobRef::new("data", "nightly-etl")
}

// ── schema ──────────────────────────────────────────────────────────

#[tokio::test]
async fn init_is_idempotent() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.init().await.unwrap();
    store.init().await.unwrap();
    store.health().await.unwrap();
}

// ── executions ──────────────────────────────────────────────────────

#[tokio::test]
async fn record_and_read_back() {
    let store = memory_store().await;
    let id = store
        .record_execution(&execution("nightly-etl-1", Duration::hours(1), 60.0, true))
        .await
        .unwrap();
    assert!(id > 0);

    let last = store.last_execution(&scope()).await.unwrap().unwrap();
    assert_eq!(last.job_name, "nightly-etl-1");
    assert_eq!(last.duration_secs, Some(60.0));
    assert!(last.success);

    let by_name = store
        .execution_by_job_name("data", "nightly-etl-1")
        .await
        .unwrap();
    assert!(by_name.is_some());
    assert!(
        store
            .execution_by_job_name("data", "unknown")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn duplicate_job_record_surfaces_unique_violation() {
    let store = memory_store().await;
    let row = execution("nightly-etl-1", Duration::hours(1), 60.0, true);
    store.record_execution(&row).await.unwrap();

    let err = store
        .record_execution(&row)
        .await
        .expect_err("same (namespace, job, start) must be rejected");
    match err {
        guardian::error::Error::Database(sqlx::Error::Database(db)) => {
            assert!(db.is_unique_violation(), "got: {db}");
        }
        other => panic!("expected a database error, got: {other}"),
    }
}

#[tokio::test]
async fn executions_are_newest_first() {
    let store = memory_store().await;
    for (i, hours) in [5i64, 1, 3].iter().enumerate() {
        store
            .record_execution(&execution(
                &format!("job-{i}"),
                Duration::hours(*hours),
                60.0,
                true,
            ))
            .await
            .unwrap();
    }

    let rows = store
        .executions(&scope(), Utc::now() - Duration::days(1))
        .await
        .unwrap();
    let names: Vec<&str> = rows.iter().map(|row| row.job_name.as_str()).collect();
    assert_eq!(names, vec!["job-1", "job-2", "job-0"]);
}

#[tokio::test]
async fn pagination_returns_rows_and_total() {
    let store = memory_store().await;
    for i in 0..10 {
        store
            .record_execution(&execution(
                &format!("job-{i}"),
                Duration::minutes(10 * (i + 1) as i64),
                60.0,
                true,
            ))
            .await
            .unwrap();
    }

    let since = Utc::now() - Duration::days(1);
    let (rows, total) = store
        .executions_paginated(&scope(), since, 3, 0)
        .await
        .unwrap();
    assert_eq!(total, 10);
    assert_eq!(rows.len(), 3);

    let (rows, total) = store
        .executions_paginated(&scope(), since, 3, 9)
        .await
        .unwrap();
    assert_eq!(total, 10);
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn status_filter_applies_at_the_database() {
    let store = memory_store().await;
    for i in 0..6 {
        store
            .record_execution(&execution(
                &format!("job-{i}"),
                Duration::minutes(10 * (i + 1) as i64),
                60.0,
                i % 3 != 0, // jobs 0 and 3 fail
            ))
            .await
            .unwrap();
    }

    let since = Utc::now() - Duration::days(1);
    let (rows, total) = store
        .executions_filtered(&scope(), since, StatusFilter::Failed, 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(rows.iter().all(|row| !row.success));

    let (_, total) = store
        .executions_filtered(&scope(), since, StatusFilter::Success, 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 4);

    let (_, total) = store
        .executions_filtered(&scope(), since, StatusFilter::All, 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 6);
}

#[tokio::test]
async fn last_successful_skips_failures() {
    let store = memory_store().await;
    store
        .record_execution(&execution("ok-old", Duration::hours(5), 60.0, true))
        .await
        .unwrap();
    store
        .record_execution(&execution("bad-new", Duration::hours(1), 60.0, false))
        .await
        .unwrap();

    let last = store.last_execution(&scope()).await.unwrap().unwrap();
    assert_eq!(last.job_name, "bad-new");

    let last_ok = store
        .last_successful_execution(&scope())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last_ok.job_name, "ok-old");
}

// ── metrics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn percentile_uses_nearest_rank() {
    let store = memory_store().await;
    // Durations 1s..=100s, all inside the window.
    for i in 1..=100 {
        store
            .record_execution(&execution(
                &format!("job-{i}"),
                Duration::minutes(i as i64),
                i as f64,
                true,
            ))
            .await
            .unwrap();
    }

    let p95 = store.duration_percentile(&scope(), 95.0, 7).await.unwrap();
    assert_eq!(p95, 95.0);

    let p50 = store.duration_percentile(&scope(), 50.0, 7).await.unwrap();
    assert_eq!(p50, 50.0);

    let p0 = store.duration_percentile(&scope(), 0.0, 7).await.unwrap();
    assert_eq!(p0, 1.0);

    let p100 = store.duration_percentile(&scope(), 100.0, 7).await.unwrap();
    assert_eq!(p100, 100.0);
}

#[tokio::test]
async fn empty_window_yields_zeroed_metrics_and_healthy_rate() {
    let store = memory_store().await;

    let metrics = store.metrics(&scope(), 7).await.unwrap();
    assert_eq!(metrics.total, 0);
    assert_eq!(metrics.success_rate, 100.0);
    assert_eq!(metrics.p95_duration_secs, 0.0);

    assert_eq!(store.success_rate(&scope(), 7).await.unwrap(), 100.0);
    assert_eq!(store.duration_percentile(&scope(), 95.0, 7).await.unwrap(), 0.0);
}

#[tokio::test]
async fn metrics_aggregate_counts_and_rate() {
    let store = memory_store().await;
    for i in 0..4 {
        store
            .record_execution(&execution(
                &format!("job-{i}"),
                Duration::hours(i as i64 + 1),
                30.0,
                i != 0,
            ))
            .await
            .unwrap();
    }

    let metrics = store.metrics(&scope(), 7).await.unwrap();
    assert_eq!(metrics.total, 4);
    assert_eq!(metrics.succeeded, 3);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.success_rate, 75.0);
    assert_eq!(metrics.avg_duration_secs, 30.0);
}

// ── retention ───────────────────────────────────────────────────────

#[tokio::test]
async fn prune_deletes_exactly_older_rows() {
    let store = memory_store().await;
    store
        .record_execution(&execution("old", Duration::days(10), 60.0, true))
        .await
        .unwrap();
    store
        .record_execution(&execution("new", Duration::hours(1), 60.0, true))
        .await
        .unwrap();

    let deleted = store.prune(Utc::now() - Duration::days(7)).await.unwrap();
    assert_eq!(deleted, 1);

    let rows = store
        .executions(&scope(), Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].job_name, "new");
}

#[tokio::test]
async fn prune_logs_keeps_rows_and_metrics() {
    let store = memory_store().await;
    store
        .record_execution(&execution("old", Duration::days(10), 60.0, true))
        .await
        .unwrap();
    store
        .record_execution(&execution("new", Duration::hours(1), 30.0, true))
        .await
        .unwrap();

    let before = store.metrics(&scope(), 30).await.unwrap();

    let cleared = store
        .prune_logs(Utc::now() - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    // A second pass touches nothing: the payloads are already gone.
    let cleared = store
        .prune_logs(Utc::now() - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(cleared, 0);

    let rows = store
        .executions(&scope(), Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2, "rows survive log pruning");
    let old = rows.iter().find(|row| row.job_name == "old").unwrap();
    assert!(old.logs.is_none());
    assert!(old.events.is_none());
    let new = rows.iter().find(|row| row.job_name == "new").unwrap();
    assert!(new.logs.is_some());

    let after = store.metrics(&scope(), 30).await.unwrap();
    assert_eq!(before.total, after.total);
    assert_eq!(before.avg_duration_secs, after.avg_duration_secs);
}

#[tokio::test]
async fn delete_by_cronjob_and_uid() {
    let store = memory_store().await;
    let mut by_uid_a = execution("job-a", Duration::hours(3), 60.0, true);
    by_uid_a.cronjob_uid = "uid-a".into();
    let mut by_uid_b = execution("job-b", Duration::hours(2), 60.0, true);
    by_uid_b.cronjob_uid = "uid-b".into();
    store.record_execution(&by_uid_a).await.unwrap();
    store.record_execution(&by_uid_b).await.unwrap();

    let uids = store.cronjob_uids(&scope()).await.unwrap();
    assert_eq!(uids, vec!["uid-a", "uid-b"]);

    let deleted = store
        .delete_executions_by_uid(&scope(), "uid-a")
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.cronjob_uids(&scope()).await.unwrap(), vec!["uid-b"]);

    let deleted = store.delete_executions(&scope()).await.unwrap();
    assert_eq!(deleted, 1);
}

// ── alert history ───────────────────────────────────────────────────

fn history_row(alert_type: AlertType, channels: &str, minutes_ago: i64) -> AlertHistoryRecord {
    AlertHistoryRecord {
        id: 0,
        alert_type,
        severity: Severity::Critical,
        title: "Job failed: data/nightly-etl".into(),
        message: "exit 1".into(),
        namespace: "data".into(),
        cronjob_name: "nightly-etl".into(),
        monitor_name: Some("etl-monitor".into()),
        channels: channels.into(),
        occurred_at: Utc::now() - Duration::minutes(minutes_ago),
        resolved_at: None,
        exit_code: Some(1),
        reason: Some("Error".into()),
        suggested_fix: Some("Check job logs and events for details.".into()),
    }
}

#[tokio::test]
async fn alert_history_round_trips() {
    let store = memory_store().await;
    store
        .store_alert(&history_row(AlertType::JobFailed, "slack-main,oncall", 5))
        .await
        .unwrap();

    let (rows, total) = store
        .list_alert_history(&AlertHistoryQuery {
            namespace: Some("data".into()),
            cronjob_name: Some("nightly-etl".into()),
            alert_type: Some(AlertType::JobFailed),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].channel_list(), vec!["slack-main", "oncall"]);
    assert_eq!(rows[0].alert_type, AlertType::JobFailed);
    assert_eq!(rows[0].severity, Severity::Critical);
    assert!(rows[0].resolved_at.is_none());
}

#[tokio::test]
async fn alert_history_filters_are_conjunctive() {
    let store = memory_store().await;
    store
        .store_alert(&history_row(AlertType::JobFailed, "slack-main", 5))
        .await
        .unwrap();
    store
        .store_alert(&history_row(AlertType::SlaBreached, "slack-main", 10))
        .await
        .unwrap();

    let (_, total) = store
        .list_alert_history(&AlertHistoryQuery {
            alert_type: Some(AlertType::SlaBreached),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);

    let (_, total) = store
        .list_alert_history(&AlertHistoryQuery {
            since: Some(Utc::now() - Duration::minutes(7)),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1, "only the 5-minute-old row is inside the range");
}

#[tokio::test]
async fn resolve_touches_only_unresolved_rows_once() {
    let store = memory_store().await;
    store
        .store_alert(&history_row(AlertType::JobFailed, "slack-main", 5))
        .await
        .unwrap();
    store
        .store_alert(&history_row(AlertType::SlaBreached, "slack-main", 5))
        .await
        .unwrap();

    let resolved = store
        .resolve_alert(AlertType::JobFailed, "data", "nightly-etl")
        .await
        .unwrap();
    assert_eq!(resolved, 1);

    // Already resolved: nothing left to touch.
    let resolved = store
        .resolve_alert(AlertType::JobFailed, "data", "nightly-etl")
        .await
        .unwrap();
    assert_eq!(resolved, 0);

    let (rows, _) = store
        .list_alert_history(&AlertHistoryQuery {
            unresolved_only: true,
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].alert_type, AlertType::SlaBreached);
}

#[tokio::test]
async fn channel_alert_stats_match_whole_names() {
    let store = memory_store().await;
    store
        .store_alert(&history_row(AlertType::JobFailed, "slack-main,oncall", 5))
        .await
        .unwrap();
    store
        .store_alert(&history_row(AlertType::JobFailed, "oncall", 15))
        .await
        .unwrap();
    store
        .store_alert(&history_row(AlertType::JobFailed, "oncall-backup", 20))
        .await
        .unwrap();

    let stats = store.channel_alert_stats("oncall").await.unwrap();
    assert_eq!(stats.alerts_sent, 2, "'oncall-backup' must not count");
    assert!(stats.last_alert.is_some());

    let stats = store.channel_alert_stats("ghost").await.unwrap();
    assert_eq!(stats.alerts_sent, 0);
    assert!(stats.last_alert.is_none());
}

// ── channel stats ───────────────────────────────────────────────────

#[tokio::test]
async fn channel_stats_upsert_by_name() {
    let store = memory_store().await;

    let mut record = ChannelStatsRecord::named("slack-main");
    record.record_success(Utc::now());
    store.save_channel_stats(&record).await.unwrap();

    record.record_failure(Utc::now(), "timeout");
    record.record_failure(Utc::now(), "refused");
    store.save_channel_stats(&record).await.unwrap();

    let loaded = store.channel_stats("slack-main").await.unwrap().unwrap();
    assert_eq!(loaded.total_sent, 1);
    assert_eq!(loaded.total_failed, 2);
    assert_eq!(loaded.consecutive_failures, 2);
    assert_eq!(loaded.last_error.as_deref(), Some("refused"));

    // A success resets the consecutive counter.
    record.record_success(Utc::now());
    store.save_channel_stats(&record).await.unwrap();
    let loaded = store.channel_stats("slack-main").await.unwrap().unwrap();
    assert_eq!(loaded.consecutive_failures, 0);
    assert_eq!(loaded.total_sent, 2);

    assert!(store.channel_stats("ghost").await.unwrap().is_none());
    assert_eq!(store.all_channel_stats().await.unwrap().len(), 1);
}
