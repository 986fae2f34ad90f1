//! Execution store: the single persistence abstraction.
//!
//! Three backends (embedded sqlite, postgres, mysql) implement identical
//! semantics behind [`ExecutionStore`]; callers never branch on backend.
//! The factory selects one from configuration.

mod models;
mod mysql;
mod postgres;
mod sqlite;

pub use models::{
    AlertHistoryQuery, AlertHistoryRecord, AlertType, ChannelAlertStats, ChannelStatsRecord,
    CronJobRef, Execution, ExecutionMetrics, Severity, StatusFilter,
};
pub use mysql::MysqlStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Username/password resolved from the referenced credentials secret.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Persistence operations shared by every backend.
///
/// All operations are callable from many tasks concurrently; the backend's
/// connection pool provides isolation.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create or migrate the schema. Idempotent; safe on both fresh and
    /// pre-existing databases.
    async fn init(&self) -> Result<()>;

    /// Durably record one terminal Job outcome. A unique violation on
    /// `(namespace, job_name, start_time)` is surfaced to the caller.
    async fn record_execution(&self, exec: &Execution) -> Result<i64>;

    /// All executions for a CronJob since the lower bound, newest first.
    async fn executions(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Execution>>;

    /// Page of executions plus the total count for the window.
    async fn executions_paginated(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)>;

    /// Page of executions with a success/failure filter applied at the
    /// database, plus the filtered total.
    async fn executions_filtered(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
        status: StatusFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)>;

    /// Newest execution, or None if the CronJob has no history.
    async fn last_execution(&self, cronjob: &CronJobRef) -> Result<Option<Execution>>;

    /// Newest successful execution, or None.
    async fn last_successful_execution(&self, cronjob: &CronJobRef) -> Result<Option<Execution>>;

    /// The record written for a specific Job, or None.
    async fn execution_by_job_name(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<Execution>>;

    /// Counts, success rate, average and p50/p95/p99 durations over the
    /// window. An empty window yields zero counts and a 100% success rate.
    async fn metrics(&self, cronjob: &CronJobRef, window_days: u32) -> Result<ExecutionMetrics>;

    /// Nearest-rank percentile of `duration_secs` over the window
    /// (`p` in [0, 100]); 0 when the window is empty.
    async fn duration_percentile(
        &self,
        cronjob: &CronJobRef,
        p: f64,
        window_days: u32,
    ) -> Result<f64>;

    /// Success rate in [0, 100] over the window; an empty window reports
    /// 100 (assume healthy).
    async fn success_rate(&self, cronjob: &CronJobRef, window_days: u32) -> Result<f64>;

    /// Delete execution rows with `start_time` older than the cutoff.
    /// Returns the number of rows deleted.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Null out `logs` and `events` for rows older than the cutoff while
    /// preserving the rows for SLA math. Returns the number of rows touched.
    async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Delete all executions for a CronJob. Returns the count.
    async fn delete_executions(&self, cronjob: &CronJobRef) -> Result<u64>;

    /// Delete executions recorded under a specific CronJob UID.
    async fn delete_executions_by_uid(&self, cronjob: &CronJobRef, uid: &str) -> Result<u64>;

    /// Distinct UIDs this CronJob name has been observed under, ordered.
    async fn cronjob_uids(&self, cronjob: &CronJobRef) -> Result<Vec<String>>;

    /// Append one alert-history row, returning its id.
    async fn store_alert(&self, record: &AlertHistoryRecord) -> Result<i64>;

    /// Filtered history page plus the filtered total.
    async fn list_alert_history(
        &self,
        query: &AlertHistoryQuery,
    ) -> Result<(Vec<AlertHistoryRecord>, i64)>;

    /// Mark unresolved alerts of the given type for a CronJob as resolved
    /// now. Only rows with a NULL `resolved_at` are touched; returns how
    /// many were.
    async fn resolve_alert(
        &self,
        alert_type: AlertType,
        namespace: &str,
        cronjob_name: &str,
    ) -> Result<u64>;

    /// How many history rows name the channel, and when it last fired.
    async fn channel_alert_stats(&self, channel_name: &str) -> Result<ChannelAlertStats>;

    /// Upsert delivery counters keyed on channel name.
    async fn save_channel_stats(&self, stats: &ChannelStatsRecord) -> Result<()>;

    /// Counters for one channel, or None if never persisted.
    async fn channel_stats(&self, channel_name: &str) -> Result<Option<ChannelStatsRecord>>;

    /// Counters for every channel ever persisted.
    async fn all_channel_stats(&self) -> Result<Vec<ChannelStatsRecord>>;

    /// Ping the backend.
    async fn health(&self) -> Result<()>;

    /// Release the connection pool.
    async fn close(&self);
}

/// Select and connect a backend from configuration.
///
/// Network backends require credentials resolved from the configured secret
/// reference; the sqlite backend ignores them.
pub async fn connect(
    cfg: &DatabaseConfig,
    credentials: Option<Credentials>,
) -> Result<Arc<dyn ExecutionStore>> {
    let store: Arc<dyn ExecutionStore> = match cfg.kind {
        DatabaseKind::Sqlite => {
            info!(path = %cfg.path, "opening sqlite execution store");
            Arc::new(SqliteStore::connect(cfg).await?)
        }
        DatabaseKind::Postgres => {
            info!(host = %cfg.host, database = %cfg.name, "connecting postgres execution store");
            Arc::new(PostgresStore::connect(cfg, credentials).await?)
        }
        DatabaseKind::Mysql => {
            info!(host = %cfg.host, database = %cfg.name, "connecting mysql execution store");
            Arc::new(MysqlStore::connect(cfg, credentials).await?)
        }
    };
    store.init().await?;
    Ok(store)
}

/// Lower bound for a `window_days` query window.
pub(crate) fn window_start(window_days: u32) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(i64::from(window_days))
}

/// Nearest-rank index into an ascending list of `n` durations.
pub(crate) fn percentile_index(n: i64, p: f64) -> i64 {
    let p = p.clamp(0.0, 100.0);
    (((n - 1) as f64) * p / 100.0).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_index_nearest_rank() {
        // 100 samples: p95 lands on index 94 (the 95th smallest).
        assert_eq!(percentile_index(100, 95.0), 94);
        assert_eq!(percentile_index(100, 0.0), 0);
        assert_eq!(percentile_index(100, 100.0), 99);
        assert_eq!(percentile_index(1, 50.0), 0);
        assert_eq!(percentile_index(4, 50.0), 1);
    }

    #[test]
    fn percentile_index_clamps_p() {
        assert_eq!(percentile_index(10, -5.0), 0);
        assert_eq!(percentile_index(10, 250.0), 9);
    }
}
