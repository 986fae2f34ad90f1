//! Concurrent, rate-limited alert fan-out.
//!
//! The dispatcher owns the channel registry, per-channel statistics, the
//! sent/active dedup book, and the pending (delayed) alert map. Each map
//! sits behind its own lock and no lock is ever held across channel, store,
//! or network I/O; state is copied out first. Channel-stat persistence runs
//! on background tasks with a per-write timeout so the dispatch hot path
//! never blocks on the database.

use crate::alerts::channels::{Channel, ChannelLimits, RateLimitedChannel};
use crate::alerts::types::{Alert, signature_changed};
use crate::config::AlertingDefaults;
use crate::crd::AlertingConfig;
use crate::error::{Error, Result};
use crate::store::{AlertHistoryQuery, AlertHistoryRecord, ChannelStatsRecord, ExecutionStore};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a sent/active entry lives before the cleanup task drops it.
const BOOK_RETENTION_HOURS: i64 = 24;
/// Cleanup cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Budget for one background channel-stat write.
const STATS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent-time and active-alert maps share one lock: the suppression check
/// reads both together, and the per-key ordering guarantee comes from
/// updating them under a single write acquisition.
#[derive(Default)]
struct AlertBook {
    sent: HashMap<String, DateTime<Utc>>,
    active: HashMap<String, Alert>,
    sent_last_24h: u64,
}

struct PendingEntry {
    send_at: DateTime<Utc>,
    cancel: CancellationToken,
}

pub struct Dispatcher {
    channels: RwLock<HashMap<String, Arc<RateLimitedChannel>>>,
    book: RwLock<AlertBook>,
    stats: RwLock<HashMap<String, ChannelStatsRecord>>,
    pending: RwLock<HashMap<String, PendingEntry>>,
    limiter: DefaultDirectRateLimiter,
    /// Alerts before this instant are recorded but not delivered.
    ready_at: DateTime<Utc>,
    default_suppression: Duration,
    store: RwLock<Option<Arc<dyn ExecutionStore>>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(defaults: &AlertingDefaults) -> Self {
        let period = Duration::from_secs(60) / defaults.max_alerts_per_minute.max(1);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(NonZeroU32::new(50).unwrap()))
            .allow_burst(NonZeroU32::new(defaults.burst.max(1)).unwrap());

        Self {
            channels: RwLock::new(HashMap::new()),
            book: RwLock::new(AlertBook::default()),
            stats: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            limiter: RateLimiter::direct(quota),
            ready_at: Utc::now()
                + chrono::Duration::from_std(defaults.startup_grace)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            default_suppression: defaults.suppression_window,
            store: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach the persistence handle and recover cross-restart state:
    /// channel counters, plus dedup seeds from unresolved alerts of the
    /// last hour so a restart does not instantly re-alert.
    pub async fn attach_store(&self, store: Arc<dyn ExecutionStore>) -> Result<()> {
        let persisted = store.all_channel_stats().await?;
        {
            let mut stats = self.stats.write().await;
            for record in persisted {
                stats.insert(record.channel_name.clone(), record);
            }
        }

        let query = AlertHistoryQuery::unresolved_since(Utc::now() - chrono::Duration::hours(1));
        let (rows, _) = store.list_alert_history(&query).await?;
        {
            let mut book = self.book.write().await;
            for row in rows {
                let key = Alert::key_for(&row.namespace, &row.cronjob_name, row.alert_type);
                book.sent.entry(key).or_insert(row.occurred_at);
            }
            book.sent_last_24h = book.sent.len() as u64;
        }

        *self.store.write().await = Some(store);
        Ok(())
    }

    /// Start the hourly cleanup task.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => dispatcher.cleanup().await,
                    _ = dispatcher.shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Cancel the cleanup task and every live pending-alert task. In-flight
    /// sends finish on their own timeouts; nobody waits on them here.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Register (or atomically replace) a channel under its name.
    pub async fn register_channel(&self, channel: Box<dyn Channel>, limits: ChannelLimits) {
        let name = channel.name().to_string();
        let kind = channel.kind();
        let wrapped = Arc::new(RateLimitedChannel::new(channel, limits));
        self.channels.write().await.insert(name.clone(), wrapped);
        info!(channel = %name, r#type = %kind, "channel registered");
    }

    pub async fn remove_channel(&self, name: &str) {
        if self.channels.write().await.remove(name).is_some() {
            info!(channel = %name, "channel removed");
        }
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// In-memory counters for one channel.
    pub async fn channel_stats(&self, name: &str) -> Option<ChannelStatsRecord> {
        self.stats.read().await.get(name).cloned()
    }

    /// Alerts delivered in the trailing 24 hours.
    pub async fn alerts_last_24h(&self) -> u64 {
        self.book.read().await.sent_last_24h
    }

    /// When an alert condition was last recorded as sent (including grace
    /// recordings), if within the book's retention.
    pub async fn last_sent(&self, key: &str) -> Option<DateTime<Utc>> {
        self.book.read().await.sent.get(key).copied()
    }

    /// The dispatch state machine: drop, synthesize key, grace, suppress,
    /// delay, send.
    pub async fn dispatch(
        self: &Arc<Self>,
        mut alert: Alert,
        config: Option<&AlertingConfig>,
    ) -> Result<()> {
        let Some(config) = config else {
            return Ok(());
        };
        if !config.enabled {
            return Ok(());
        }

        alert.ensure_key();
        let now = Utc::now();

        if now < self.ready_at {
            // Startup grace: track the condition so we don't re-alert the
            // moment the quiet period ends, but send nothing.
            let mut book = self.book.write().await;
            book.sent.insert(alert.key.clone(), now);
            book.active.insert(alert.key.clone(), alert);
            debug!("alert recorded during startup grace");
            return Ok(());
        }

        let window = config.suppression(self.default_suppression)?;
        if self.is_suppressed(&alert, window).await {
            debug!(key = %alert.key, "alert suppressed");
            return Ok(());
        }

        if let Some(delay) = config.delay()? {
            return self.queue_pending(alert, config.clone(), delay).await;
        }

        self.dispatch_now(alert, config).await
    }

    /// A prior send within the window with an unchanged error signature
    /// suppresses; a signature change always bypasses.
    async fn is_suppressed(&self, alert: &Alert, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
        let book = self.book.read().await;
        match book.sent.get(&alert.key) {
            Some(&sent_at) if Utc::now() - sent_at < window => match book.active.get(&alert.key) {
                Some(previous) => !signature_changed(previous, alert),
                None => true,
            },
            _ => false,
        }
    }

    /// Arm a delayed send. A pending alert already holding this key wins;
    /// the new call is a no-op rather than re-arming the timer.
    async fn queue_pending(
        self: &Arc<Self>,
        alert: Alert,
        config: AlertingConfig,
        delay: Duration,
    ) -> Result<()> {
        let key = alert.key.clone();
        let cancel = CancellationToken::new();
        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&key) {
                debug!(key = %key, "pending alert already armed");
                return Ok(());
            }
            pending.insert(
                key.clone(),
                PendingEntry {
                    send_at: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                    cancel: cancel.clone(),
                },
            );
        }

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // A concurrent cancel may have won; only send if the
                    // entry is still ours to take.
                    let armed = dispatcher.pending.write().await.remove(&key).is_some();
                    if armed {
                        if let Err(e) = dispatcher.dispatch_now(alert, &config).await {
                            warn!(key = %key, error = %e, "delayed alert dispatch failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(key = %key, "pending alert cancelled");
                }
                _ = dispatcher.shutdown.cancelled() => {
                    dispatcher.pending.write().await.remove(&key);
                }
            }
        });
        Ok(())
    }

    /// Immediate fan-out: consume a global token, resolve targets, send to
    /// every target outside any lock, then record stats, dedup state, and
    /// history.
    async fn dispatch_now(&self, alert: Alert, config: &AlertingConfig) -> Result<()> {
        self.limiter
            .check()
            .map_err(|_| Error::RateLimited("global alert budget exhausted".into()))?;

        let targets: Vec<Arc<RateLimitedChannel>> = {
            let channels = self.channels.read().await;
            config
                .channels
                .iter()
                .filter_map(|reference| {
                    if !reference.severities.is_empty()
                        && !reference.severities.contains(&alert.severity)
                    {
                        return None;
                    }
                    match channels.get(&reference.name) {
                        Some(channel) => Some(Arc::clone(channel)),
                        None => {
                            warn!(channel = %reference.name, key = %alert.key,
                                  "alert references an unregistered channel");
                            None
                        }
                    }
                })
                .collect()
        };

        if targets.is_empty() {
            info!(key = %alert.key, "no channels resolved for alert, dropping");
            return Ok(());
        }

        let now = Utc::now();
        let mut succeeded: Vec<String> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();

        for channel in &targets {
            match channel.send(&alert).await {
                Ok(()) => {
                    info!(
                        event = "alert_sent",
                        channel = %channel.name(),
                        key = %alert.key,
                        severity = %alert.severity,
                        "alert delivered"
                    );
                    succeeded.push(channel.name().to_string());
                }
                Err(e) => {
                    warn!(
                        event = "alert_failed",
                        channel = %channel.name(),
                        key = %alert.key,
                        error = %e,
                        "alert delivery failed"
                    );
                    failed.push((channel.name().to_string(), e.to_string()));
                }
            }
        }

        let dirty: Vec<ChannelStatsRecord> = {
            let mut stats = self.stats.write().await;
            let mut dirty = Vec::with_capacity(succeeded.len() + failed.len());
            for name in &succeeded {
                let record = stats
                    .entry(name.clone())
                    .or_insert_with(|| ChannelStatsRecord::named(name.clone()));
                record.record_success(now);
                dirty.push(record.clone());
            }
            for (name, error) in &failed {
                let record = stats
                    .entry(name.clone())
                    .or_insert_with(|| ChannelStatsRecord::named(name.clone()));
                record.record_failure(now, error);
                dirty.push(record.clone());
            }
            dirty
        };

        {
            let mut book = self.book.write().await;
            book.sent.insert(alert.key.clone(), now);
            book.active.insert(alert.key.clone(), alert.clone());
            book.sent_last_24h += 1;
        }

        let store = self.store.read().await.clone();
        if let Some(ref store) = store
            && !succeeded.is_empty()
        {
            let record = history_record(&alert, &succeeded, now);
            if let Err(e) = store.store_alert(&record).await {
                warn!(key = %alert.key, error = %e, "failed to persist alert history");
            }
        }
        if let Some(store) = store {
            persist_stats(store, dirty);
        }

        if failed.is_empty() {
            Ok(())
        } else {
            let details: Vec<String> = failed
                .iter()
                .map(|(name, error)| format!("{name}: {error}"))
                .collect();
            Err(Error::Delivery(format!(
                "failed to send to {} channels: {}",
                failed.len(),
                details.join("; ")
            )))
        }
    }

    /// One-off send for test endpoints: bypasses suppression, delay, rate
    /// limits, and history.
    pub async fn send_to_channel(&self, name: &str, alert: &Alert) -> Result<()> {
        let channel = self
            .channels
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
        channel.send_unlimited(alert).await
    }

    /// Exercise a registered channel with its own synthetic test alert.
    pub async fn test_channel(&self, name: &str) -> Result<()> {
        let channel = self
            .channels
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
        channel.test().await
    }

    /// Cancel one armed delayed alert.
    pub async fn cancel_pending_alert(&self, key: &str) {
        if let Some(entry) = self.pending.write().await.remove(key) {
            entry.cancel.cancel();
        }
    }

    /// Cancel every armed delayed alert for one CronJob (prefix match on
    /// `"ns/name/"`).
    pub async fn cancel_pending_for_cronjob(&self, namespace: &str, name: &str) {
        let prefix = format!("{namespace}/{name}/");
        let mut pending = self.pending.write().await;
        let keys: Vec<String> = pending
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = pending.remove(&key) {
                entry.cancel.cancel();
            }
        }
    }

    /// Forget one alert condition so the next occurrence alerts fresh.
    /// Called when the underlying condition resolves (e.g. a job succeeds).
    pub async fn resolve_alert_state(&self, key: &str) {
        let mut book = self.book.write().await;
        book.sent.remove(key);
        book.active.remove(key);
    }

    /// Drop all dispatcher state for a CronJob: pending timers plus the
    /// dedup book. Used when a monitor or CronJob goes away.
    pub async fn clear_cronjob_alerts(&self, namespace: &str, name: &str) {
        self.cancel_pending_for_cronjob(namespace, name).await;
        let prefix = format!("{namespace}/{name}/");
        let mut book = self.book.write().await;
        book.sent.retain(|key, _| !key.starts_with(&prefix));
        book.active.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop book entries older than 24h and recompute the counter.
    async fn cleanup(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(BOOK_RETENTION_HOURS);
        let mut book = self.book.write().await;
        book.sent.retain(|_, sent_at| *sent_at >= cutoff);
        let live: std::collections::HashSet<String> = book.sent.keys().cloned().collect();
        book.active.retain(|key, _| live.contains(key));
        book.sent_last_24h = book.sent.len() as u64;
        debug!(tracked = book.sent.len(), "alert book cleanup complete");
    }

    /// How many delayed alerts are currently armed.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// When the armed delayed alert for `key` would fire, if any.
    pub async fn pending_send_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.pending.read().await.get(key).map(|entry| entry.send_at)
    }
}

fn history_record(alert: &Alert, succeeded: &[String], now: DateTime<Utc>) -> AlertHistoryRecord {
    AlertHistoryRecord {
        id: 0,
        alert_type: alert.alert_type,
        severity: alert.severity,
        title: alert.title.clone(),
        message: alert.message.clone(),
        namespace: alert.namespace.clone(),
        cronjob_name: alert.cronjob_name.clone(),
        monitor_name: (!alert.monitor_name.is_empty()).then(|| alert.monitor_name.clone()),
        channels: AlertHistoryRecord::join_channels(succeeded),
        occurred_at: now,
        resolved_at: None,
        exit_code: alert.context.exit_code,
        reason: alert.context.reason.clone(),
        suggested_fix: alert.context.suggested_fix.clone(),
    }
}

/// Fire-and-forget stat writes; a slow database must never stall dispatch.
fn persist_stats(store: Arc<dyn ExecutionStore>, records: Vec<ChannelStatsRecord>) {
    for record in records {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            match tokio::time::timeout(STATS_WRITE_TIMEOUT, store.save_channel_stats(&record)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(channel = %record.channel_name, error = %e, "channel stat write failed")
                }
                Err(_) => {
                    warn!(channel = %record.channel_name, "channel stat write timed out")
                }
            }
        });
    }
}
