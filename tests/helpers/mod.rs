use chrono::{DateTime, Duration, Utc};
use guardian::alerts::channels::Channel;
use guardian::alerts::{Alert, AlertContext};
use guardian::crd::{AlertingConfig, ChannelRef, ChannelType};
use guardian::error::{Error, Result};
use guardian::store::{
    AlertType, Execution, ExecutionStore, Severity, SqliteStore,
};
use std::sync::{Arc, Mutex};

/// Fresh in-memory store with the schema applied.
pub async fn memory_store() -> Arc<dyn ExecutionStore> {
    let store = SqliteStore::in_memory().await.expect("open sqlite memory");
    store.init().await.expect("init schema");
    Arc::new(store)
}

/// Build a test `Execution` row.
///
/// `ago` positions `start_time` relative to now; successful rows get exit
/// code 0, failed rows exit code 1 unless overridden afterwards.
pub fn execution(job_name: &str, ago: Duration, duration_secs: f64, success: bool) -> Execution {
    let start_time = Utc::now() - ago;
    Execution {
        id: 0,
        namespace: "data".into(),
        cronjob_name: "nightly-etl".into(),
        cronjob_uid: "uid-1".into(),
        job_name: job_name.into(),
        scheduled_time: None,
        start_time,
        completion_time: Some(start_time + Duration::seconds(duration_secs as i64)),
        duration_secs: Some(duration_secs),
        success,
        exit_code: Some(if success { 0 } else { 1 }),
        reason: None,
        retried: false,
        retry_of: None,
        logs: Some(format!("log output of {job_name}")),
        events: Some("[Normal] Created: pod created".into()),
        suggested_fix: None,
        created_at: None,
    }
}

/// A channel that records every alert it is asked to deliver. Failure can
/// be toggled at runtime to exercise the stats paths.
pub struct MockChannel {
    name: String,
    sent: Arc<Mutex<Vec<Alert>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

/// Handle for inspecting and steering a [`MockChannel`] after it has been
/// boxed into the dispatcher.
#[derive(Clone)]
pub struct MockHandle {
    pub sent: Arc<Mutex<Vec<Alert>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl MockHandle {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn succeed(&self) {
        *self.fail_with.lock().unwrap() = None;
    }
}

pub fn mock_channel(name: &str) -> (Box<dyn Channel>, MockHandle) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let fail_with = Arc::new(Mutex::new(None));
    let handle = MockHandle {
        sent: Arc::clone(&sent),
        fail_with: Arc::clone(&fail_with),
    };
    let channel = MockChannel {
        name: name.to_string(),
        sent,
        fail_with,
    };
    (Box::new(channel), handle)
}

#[async_trait::async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(Error::Delivery(message));
        }
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Alerting config routing to the given channels with no severity filter.
pub fn alerting_to(channels: &[&str]) -> AlertingConfig {
    AlertingConfig {
        enabled: true,
        channels: channels
            .iter()
            .map(|name| ChannelRef {
                name: name.to_string(),
                severities: vec![],
            })
            .collect(),
        suppression_window: None,
        alert_delay: None,
    }
}

/// A JobFailed alert with the given dedup key and exit code.
pub fn failure_alert(key: &str, exit_code: i32) -> Alert {
    Alert {
        key: key.to_string(),
        alert_type: AlertType::JobFailed,
        severity: Severity::Critical,
        title: "Job failed: data/nightly-etl".into(),
        message: "job nightly-etl-1 failed".into(),
        namespace: "data".into(),
        cronjob_name: "nightly-etl".into(),
        monitor_name: "etl-monitor".into(),
        context: AlertContext {
            exit_code: Some(exit_code),
            ..Default::default()
        },
        timestamp: Utc::now(),
    }
}

#[allow(dead_code)]
pub fn at_hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}
