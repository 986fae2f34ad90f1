#[allow(dead_code)]
mod helpers;

use guardian::alerts::{Alert, Dispatcher};
use guardian::config::AlertingDefaults;
use guardian::crd::ChannelRef;
use guardian::store::{AlertHistoryQuery, AlertHistoryRecord, AlertType, ExecutionStore, Severity};
use helpers::{alerting_to, failure_alert, memory_store, mock_channel};
use std::sync::Arc;
use std::time::Duration;

fn no_grace() -> AlertingDefaults {
    AlertingDefaults {
        startup_grace: Duration::ZERO,
        ..Default::default()
    }
}

async fn dispatcher_with_channels(
    defaults: AlertingDefaults,
    names: &[&str],
) -> (Arc<Dispatcher>, Vec<helpers::MockHandle>) {
    let dispatcher = Arc::new(Dispatcher::new(&defaults));
    let mut handles = Vec::new();
    for name in names {
        let (channel, handle) = mock_channel(name);
        dispatcher.register_channel(channel, Default::default()).await;
        handles.push(handle);
    }
    (dispatcher, handles)
}

// ── deduplication ───────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_within_window_is_suppressed() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();

    assert_eq!(handles[0].sent_count(), 1, "second dispatch must be suppressed");
}

#[tokio::test]
async fn signature_change_bypasses_suppression() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    // Same key, but the exit-code category flips app-error -> oom.
    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 137), Some(&config))
        .await
        .unwrap();

    assert_eq!(handles[0].sent_count(), 2, "category change must bypass");
}

#[tokio::test]
async fn reason_change_with_both_reasons_bypasses() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    let mut first = failure_alert("d/t/JobFailed", 1);
    first.context.reason = Some("DeadlineExceeded".into());
    let mut second = failure_alert("d/t/JobFailed", 1);
    second.context.reason = Some("Evicted".into());
    let mut third = failure_alert("d/t/JobFailed", 1);
    third.context.reason = None;

    dispatcher.dispatch(first, Some(&config)).await.unwrap();
    dispatcher.dispatch(second, Some(&config)).await.unwrap();
    // Empty reason on one side is NOT a change.
    dispatcher.dispatch(third, Some(&config)).await.unwrap();

    assert_eq!(handles[0].sent_count(), 2);
}

#[tokio::test]
async fn empty_key_is_synthesized() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    let mut alert = failure_alert("", 1);
    alert.namespace = "data".into();
    alert.cronjob_name = "nightly-etl".into();
    dispatcher.dispatch(alert, Some(&config)).await.unwrap();

    assert_eq!(handles[0].sent_count(), 1);
    let delivered = handles[0].sent.lock().unwrap()[0].key.clone();
    assert_eq!(delivered, "data/nightly-etl/JobFailed");
}

#[tokio::test]
async fn disabled_or_absent_config_drops_silently() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), None)
        .await
        .unwrap();

    let mut disabled = alerting_to(&["slack-main"]);
    disabled.enabled = false;
    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&disabled))
        .await
        .unwrap();

    assert_eq!(handles[0].sent_count(), 0);
}

// ── delayed dispatch ────────────────────────────────────────────────

#[tokio::test]
async fn delayed_alert_fires_after_delay() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let mut config = alerting_to(&["slack-main"]);
    config.alert_delay = Some("200ms".into());

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    assert_eq!(handles[0].sent_count(), 0, "nothing sent before the delay");
    assert_eq!(dispatcher.pending_count().await, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handles[0].sent_count(), 1);
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test]
async fn delayed_then_cancelled_never_sends() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let mut config = alerting_to(&["slack-main"]);
    config.alert_delay = Some("500ms".into());

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.cancel_pending_alert("d/t/JobFailed").await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handles[0].sent_count(), 0);
    assert_eq!(dispatcher.pending_count().await, 0);
}

#[tokio::test]
async fn pending_alert_is_not_rearmed() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let mut config = alerting_to(&["slack-main"]);
    config.alert_delay = Some("200ms".into());

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    assert_eq!(dispatcher.pending_count().await, 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(handles[0].sent_count(), 1, "only the first arm fires");
}

#[tokio::test]
async fn cancel_by_cronjob_prefix() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let mut config = alerting_to(&["slack-main"]);
    config.alert_delay = Some("300ms".into());

    dispatcher
        .dispatch(failure_alert("data/nightly-etl/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    dispatcher
        .dispatch(failure_alert("data/other-job/JobFailed", 1), Some(&config))
        .await
        .unwrap();

    dispatcher
        .cancel_pending_for_cronjob("data", "nightly-etl")
        .await;
    assert_eq!(dispatcher.pending_count().await, 1);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(handles[0].sent_count(), 1);
    let delivered = handles[0].sent.lock().unwrap()[0].key.clone();
    assert_eq!(delivered, "data/other-job/JobFailed");
}

// ── startup grace ───────────────────────────────────────────────────

#[tokio::test]
async fn grace_period_records_without_sending() {
    let defaults = AlertingDefaults {
        startup_grace: Duration::from_secs(60),
        ..Default::default()
    };
    let (dispatcher, handles) = dispatcher_with_channels(defaults, &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();

    assert_eq!(handles[0].sent_count(), 0, "grace period must not send");
    assert!(
        dispatcher.last_sent("d/t/JobFailed").await.is_some(),
        "the key must still be recorded for post-wake dedup"
    );
}

// ── partial failure and stats ───────────────────────────────────────

#[tokio::test]
async fn partial_failure_reports_and_persists_only_successes() {
    let store = memory_store().await;
    let (dispatcher, handles) =
        dispatcher_with_channels(no_grace(), &["slack-main", "oncall"]).await;
    dispatcher.attach_store(Arc::clone(&store)).await.unwrap();
    handles[1].fail_with("conn refused");

    let config = alerting_to(&["slack-main", "oncall"]);
    let err = dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .expect_err("one channel failed");
    assert!(
        err.to_string().contains("failed to send to 1 channels"),
        "got: {err}"
    );

    assert_eq!(handles[0].sent_count(), 1);
    assert_eq!(handles[1].sent_count(), 0);

    // The history row lists only the successful channel.
    let (rows, total) = store
        .list_alert_history(&AlertHistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].channel_list(), vec!["slack-main"]);

    // Stats: one sent on the good channel, one failure on the bad one.
    let good = dispatcher.channel_stats("slack-main").await.unwrap();
    assert_eq!(good.total_sent, 1);
    assert_eq!(good.consecutive_failures, 0);

    let bad = dispatcher.channel_stats("oncall").await.unwrap();
    assert_eq!(bad.total_failed, 1);
    assert_eq!(bad.consecutive_failures, 1);
    assert_eq!(bad.last_error.as_deref(), Some("conn refused"));
}

#[tokio::test]
async fn consecutive_failures_reset_on_success() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["oncall"]).await;
    let config = alerting_to(&["oncall"]);

    handles[0].fail_with("boom");
    let _ = dispatcher
        .dispatch(failure_alert("a/a/JobFailed", 1), Some(&config))
        .await;
    let _ = dispatcher
        .dispatch(failure_alert("b/b/JobFailed", 1), Some(&config))
        .await;
    assert_eq!(
        dispatcher.channel_stats("oncall").await.unwrap().consecutive_failures,
        2
    );

    handles[0].succeed();
    dispatcher
        .dispatch(failure_alert("c/c/JobFailed", 1), Some(&config))
        .await
        .unwrap();

    let stats = dispatcher.channel_stats("oncall").await.unwrap();
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_failed, 2);
}

// ── routing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn severity_filter_excludes_channels() {
    let (dispatcher, handles) =
        dispatcher_with_channels(no_grace(), &["pager", "slack-main"]).await;

    let config = guardian::crd::AlertingConfig {
        enabled: true,
        channels: vec![
            ChannelRef {
                name: "pager".into(),
                severities: vec![Severity::Critical],
            },
            ChannelRef {
                name: "slack-main".into(),
                severities: vec![],
            },
        ],
        suppression_window: None,
        alert_delay: None,
    };

    let mut info_alert = failure_alert("d/t/SLABreached", 1);
    info_alert.severity = Severity::Info;
    dispatcher.dispatch(info_alert, Some(&config)).await.unwrap();

    assert_eq!(handles[0].sent_count(), 0, "pager only takes critical");
    assert_eq!(handles[1].sent_count(), 1, "empty filter takes everything");
}

#[tokio::test]
async fn unknown_channels_resolve_to_empty_target_set() {
    let (dispatcher, _handles) = dispatcher_with_channels(no_grace(), &[]).await;
    let config = alerting_to(&["ghost"]);

    // Empty target set is a silent success.
    dispatcher
        .dispatch(failure_alert("d/t/JobFailed", 1), Some(&config))
        .await
        .unwrap();
}

// ── rate limiting ───────────────────────────────────────────────────

#[tokio::test]
async fn global_rate_limit_refuses_excess() {
    let defaults = AlertingDefaults {
        max_alerts_per_minute: 1,
        burst: 1,
        startup_grace: Duration::ZERO,
        ..Default::default()
    };
    let (dispatcher, handles) = dispatcher_with_channels(defaults, &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    dispatcher
        .dispatch(failure_alert("a/a/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    let err = dispatcher
        .dispatch(failure_alert("b/b/JobFailed", 1), Some(&config))
        .await
        .expect_err("bucket is empty");
    assert!(err.is_rate_limit());
    assert_eq!(handles[0].sent_count(), 1);
}

// ── startup recovery ────────────────────────────────────────────────

#[tokio::test]
async fn attach_store_seeds_dedup_from_unresolved_history() {
    let store = memory_store().await;
    store
        .store_alert(&AlertHistoryRecord {
            id: 0,
            alert_type: AlertType::JobFailed,
            severity: Severity::Critical,
            title: "Job failed: data/nightly-etl".into(),
            message: "boom".into(),
            namespace: "data".into(),
            cronjob_name: "nightly-etl".into(),
            monitor_name: None,
            channels: "slack-main".into(),
            occurred_at: chrono::Utc::now() - chrono::Duration::minutes(10),
            resolved_at: None,
            exit_code: Some(1),
            reason: None,
            suggested_fix: None,
        })
        .await
        .unwrap();

    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    dispatcher.attach_store(Arc::clone(&store)).await.unwrap();

    // Same condition, unchanged signature, inside the window: suppressed
    // even though this dispatcher instance never sent it.
    dispatcher
        .dispatch(failure_alert("data/nightly-etl/JobFailed", 1), Some(&alerting_to(&["slack-main"])))
        .await
        .unwrap();
    assert_eq!(handles[0].sent_count(), 0);
}

#[tokio::test]
async fn attach_store_loads_channel_stats() {
    let store = memory_store().await;
    let mut record = guardian::store::ChannelStatsRecord::named("slack-main");
    record.total_sent = 42;
    store.save_channel_stats(&record).await.unwrap();

    let (dispatcher, _handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    dispatcher.attach_store(store).await.unwrap();

    let stats = dispatcher.channel_stats("slack-main").await.unwrap();
    assert_eq!(stats.total_sent, 42);
}

// ── direct sends ────────────────────────────────────────────────────

#[tokio::test]
async fn send_to_channel_bypasses_everything() {
    let store = memory_store().await;
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    dispatcher.attach_store(Arc::clone(&store)).await.unwrap();

    let alert = Alert::test("slack-main");
    dispatcher.send_to_channel("slack-main", &alert).await.unwrap();
    dispatcher.send_to_channel("slack-main", &alert).await.unwrap();

    // No suppression between the two sends, and no history rows.
    assert_eq!(handles[0].sent_count(), 2);
    let (_, total) = store
        .list_alert_history(&AlertHistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(total, 0);

    let err = dispatcher
        .send_to_channel("ghost", &alert)
        .await
        .expect_err("unknown channel");
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn resolve_alert_state_allows_realerting() {
    let (dispatcher, handles) = dispatcher_with_channels(no_grace(), &["slack-main"]).await;
    let config = alerting_to(&["slack-main"]);

    dispatcher
        .dispatch(failure_alert("data/nightly-etl/JobFailed", 1), Some(&config))
        .await
        .unwrap();
    dispatcher
        .resolve_alert_state("data/nightly-etl/JobFailed")
        .await;
    dispatcher
        .dispatch(failure_alert("data/nightly-etl/JobFailed", 1), Some(&config))
        .await
        .unwrap();

    assert_eq!(handles[0].sent_count(), 2, "resolution clears suppression");
}
