//! Embedded single-file sqlite backend.
//!
//! Opened with write-ahead journaling and a 5 second busy timeout. This is
//! the default backend and also serves as the hermetic store for tests.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::store::models::*;
use crate::store::{ExecutionStore, percentile_index, window_start};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_open)
            .min_connections(cfg.max_idle)
            .max_lifetime(cfg.max_lifetime)
            .idle_timeout(cfg.max_idle_time)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database sharing a single connection. Used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .any(|row| row.get::<String, _>("name") == column))
    }

    /// Columns added after the initial schema; ALTER is applied only when
    /// the column probe says it is missing, so init stays idempotent on
    /// databases created by older versions.
    async fn migrate_columns(&self) -> Result<()> {
        let added = [
            ("cronjob_uid", "TEXT NOT NULL DEFAULT ''"),
            ("logs", "TEXT"),
            ("events", "TEXT"),
            ("suggested_fix", "TEXT"),
        ];
        for (column, ddl) in added {
            if !self.column_exists("executions", column).await? {
                sqlx::query(&format!(
                    "ALTER TABLE executions ADD COLUMN {column} {ddl}"
                ))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

/// Append the alert-history filters shared by the list and count queries.
fn push_history_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &AlertHistoryQuery) {
    if let Some(ref namespace) = query.namespace {
        qb.push(" AND namespace = ").push_bind(namespace.clone());
    }
    if let Some(ref name) = query.cronjob_name {
        qb.push(" AND cronjob_name = ").push_bind(name.clone());
    }
    if let Some(alert_type) = query.alert_type {
        qb.push(" AND alert_type = ").push_bind(alert_type);
    }
    if let Some(severity) = query.severity {
        qb.push(" AND severity = ").push_bind(severity);
    }
    if query.unresolved_only {
        qb.push(" AND resolved_at IS NULL");
    }
    if let Some(since) = query.since {
        qb.push(" AND occurred_at >= ").push_bind(since);
    }
    if let Some(until) = query.until {
        qb.push(" AND occurred_at < ").push_bind(until);
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS executions
(
    id              INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    namespace       TEXT NOT NULL,
    cronjob_name    TEXT NOT NULL,
    cronjob_uid     TEXT NOT NULL DEFAULT '',
    job_name        TEXT NOT NULL,
    scheduled_time  TIMESTAMP,
    start_time      TIMESTAMP NOT NULL,
    completion_time TIMESTAMP,
    duration_secs   DOUBLE,
    success         BOOLEAN NOT NULL,
    exit_code       INTEGER,
    reason          TEXT,
    retried         BOOLEAN NOT NULL DEFAULT FALSE,
    retry_of        TEXT,
    logs            TEXT,
    events          TEXT,
    suggested_fix   TEXT,
    created_at      TIMESTAMP
);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS alert_history
(
    id            INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    alert_type    TEXT NOT NULL,
    severity      TEXT NOT NULL,
    title         TEXT NOT NULL,
    message       TEXT NOT NULL,
    namespace     TEXT NOT NULL,
    cronjob_name  TEXT NOT NULL,
    monitor_name  TEXT,
    channels      TEXT NOT NULL DEFAULT '',
    occurred_at   TIMESTAMP NOT NULL,
    resolved_at   TIMESTAMP,
    exit_code     INTEGER,
    reason        TEXT,
    suggested_fix TEXT
);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS channel_stats
(
    channel_name         TEXT NOT NULL PRIMARY KEY,
    total_sent           BIGINT NOT NULL DEFAULT 0,
    total_failed         BIGINT NOT NULL DEFAULT 0,
    consecutive_failures BIGINT NOT NULL DEFAULT 0,
    last_success         TIMESTAMP,
    last_failure         TIMESTAMP,
    last_error           TEXT
);
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate_columns().await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS executions_cronjob_idx ON executions (namespace, cronjob_name, start_time)",
            "CREATE UNIQUE INDEX IF NOT EXISTS executions_job_idx ON executions (namespace, job_name, start_time)",
            "CREATE INDEX IF NOT EXISTS alert_history_cronjob_idx ON alert_history (namespace, cronjob_name, occurred_at)",
        ];
        for ddl in indexes {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn record_execution(&self, exec: &Execution) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO executions
    (namespace, cronjob_name, cronjob_uid, job_name, scheduled_time, start_time,
     completion_time, duration_secs, success, exit_code, reason, retried,
     retry_of, logs, events, suggested_fix, created_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
RETURNING id
            "#,
        )
        .bind(&exec.namespace)
        .bind(&exec.cronjob_name)
        .bind(&exec.cronjob_uid)
        .bind(&exec.job_name)
        .bind(exec.scheduled_time)
        .bind(exec.start_time)
        .bind(exec.completion_time)
        .bind(exec.duration_secs)
        .bind(exec.success)
        .bind(exec.exit_code)
        .bind(&exec.reason)
        .bind(exec.retried)
        .bind(&exec.retry_of)
        .bind(&exec.logs)
        .bind(&exec.events)
        .bind(&exec.suggested_fix)
        .bind(exec.created_at.unwrap_or_else(Utc::now))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn executions(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3 \
             ORDER BY start_time DESC",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn executions_paginated(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3 \
             ORDER BY start_time DESC LIMIT $4 OFFSET $5",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn executions_filtered(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
        status: StatusFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Execution>, i64)> {
        let status_clause = match status {
            StatusFilter::All => "",
            StatusFilter::Success => " AND success = TRUE",
            StatusFilter::Failed => " AND success = FALSE",
        };

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3{status_clause}"
        ))
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, Execution>(&format!(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3{status_clause} \
             ORDER BY start_time DESC LIMIT $4 OFFSET $5"
        ))
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn last_execution(&self, cronjob: &CronJobRef) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 \
             ORDER BY start_time DESC LIMIT 1",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn last_successful_execution(&self, cronjob: &CronJobRef) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND success = TRUE \
             ORDER BY start_time DESC LIMIT 1",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn execution_by_job_name(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<Execution>> {
        let row = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = $1 AND job_name = $2 \
             ORDER BY start_time DESC LIMIT 1",
        )
        .bind(namespace)
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn metrics(&self, cronjob: &CronJobRef, window_days: u32) -> Result<ExecutionMetrics> {
        let since = window_start(window_days);
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS succeeded, \
                    COALESCE(AVG(duration_secs), 0.0) AS avg_secs \
             FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let succeeded: i64 = row.get("succeeded");
        let avg_secs: f64 = row.get("avg_secs");

        let success_rate = if total == 0 {
            100.0
        } else {
            succeeded as f64 * 100.0 / total as f64
        };

        Ok(ExecutionMetrics {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate,
            avg_duration_secs: avg_secs,
            p50_duration_secs: self.duration_percentile(cronjob, 50.0, window_days).await?,
            p95_duration_secs: self.duration_percentile(cronjob, 95.0, window_days).await?,
            p99_duration_secs: self.duration_percentile(cronjob, 99.0, window_days).await?,
        })
    }

    async fn duration_percentile(
        &self,
        cronjob: &CronJobRef,
        p: f64,
        window_days: u32,
    ) -> Result<f64> {
        let since = window_start(window_days);
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3 \
               AND duration_secs IS NOT NULL",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        if n == 0 {
            return Ok(0.0);
        }

        // Nearest rank without loading the whole window: an ordered
        // LIMIT/OFFSET hop straight to the rank index.
        let idx = percentile_index(n, p);
        let value = sqlx::query_scalar::<_, f64>(
            "SELECT duration_secs FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3 \
               AND duration_secs IS NOT NULL \
             ORDER BY duration_secs ASC LIMIT 1 OFFSET $4",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .bind(idx)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn success_rate(&self, cronjob: &CronJobRef, window_days: u32) -> Result<f64> {
        let since = window_start(window_days);
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS succeeded \
             FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND start_time >= $3",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        if total == 0 {
            return Ok(100.0);
        }
        let succeeded: i64 = row.get("succeeded");
        Ok(succeeded as f64 * 100.0 / total as f64)
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM executions WHERE start_time < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET logs = NULL, events = NULL \
             WHERE start_time < $1 AND (logs IS NOT NULL OR events IS NOT NULL)",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_executions(&self, cronjob: &CronJobRef) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM executions WHERE namespace = $1 AND cronjob_name = $2")
                .bind(&cronjob.namespace)
                .bind(&cronjob.name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_executions_by_uid(&self, cronjob: &CronJobRef, uid: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND cronjob_uid = $3",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(uid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cronjob_uids(&self, cronjob: &CronJobRef) -> Result<Vec<String>> {
        let uids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT cronjob_uid FROM executions \
             WHERE namespace = $1 AND cronjob_name = $2 AND cronjob_uid != '' \
             ORDER BY cronjob_uid",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .fetch_all(&self.pool)
        .await?;
        Ok(uids)
    }

    async fn store_alert(&self, record: &AlertHistoryRecord) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO alert_history
    (alert_type, severity, title, message, namespace, cronjob_name,
     monitor_name, channels, occurred_at, resolved_at, exit_code, reason, suggested_fix)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
RETURNING id
            "#,
        )
        .bind(record.alert_type)
        .bind(record.severity)
        .bind(&record.title)
        .bind(&record.message)
        .bind(&record.namespace)
        .bind(&record.cronjob_name)
        .bind(&record.monitor_name)
        .bind(&record.channels)
        .bind(record.occurred_at)
        .bind(record.resolved_at)
        .bind(record.exit_code)
        .bind(&record.reason)
        .bind(&record.suggested_fix)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_alert_history(
        &self,
        query: &AlertHistoryQuery,
    ) -> Result<(Vec<AlertHistoryRecord>, i64)> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM alert_history WHERE 1=1");
        push_history_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM alert_history WHERE 1=1");
        push_history_filters(&mut qb, query);
        qb.push(" ORDER BY occurred_at DESC");
        if query.limit > 0 {
            qb.push(" LIMIT ").push_bind(query.limit);
            qb.push(" OFFSET ").push_bind(query.offset);
        }
        let rows = qb
            .build_query_as::<AlertHistoryRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok((rows, total))
    }

    async fn resolve_alert(
        &self,
        alert_type: AlertType,
        namespace: &str,
        cronjob_name: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE alert_history SET resolved_at = $1 \
             WHERE alert_type = $2 AND namespace = $3 AND cronjob_name = $4 \
               AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(alert_type)
        .bind(namespace)
        .bind(cronjob_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn channel_alert_stats(&self, channel_name: &str) -> Result<ChannelAlertStats> {
        // channels is comma-joined; match the name as a whole list element.
        let row = sqlx::query(
            "SELECT COUNT(*) AS sent, MAX(occurred_at) AS last_alert FROM alert_history \
             WHERE channels = $1 \
                OR channels LIKE $2 \
                OR channels LIKE $3 \
                OR channels LIKE $4",
        )
        .bind(channel_name)
        .bind(format!("{channel_name},%"))
        .bind(format!("%,{channel_name}"))
        .bind(format!("%,{channel_name},%"))
        .fetch_one(&self.pool)
        .await?;

        Ok(ChannelAlertStats {
            channel_name: channel_name.to_string(),
            alerts_sent: row.get("sent"),
            last_alert: row.get("last_alert"),
        })
    }

    async fn save_channel_stats(&self, stats: &ChannelStatsRecord) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO channel_stats
    (channel_name, total_sent, total_failed, consecutive_failures,
     last_success, last_failure, last_error)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (channel_name) DO UPDATE SET
    total_sent = excluded.total_sent,
    total_failed = excluded.total_failed,
    consecutive_failures = excluded.consecutive_failures,
    last_success = excluded.last_success,
    last_failure = excluded.last_failure,
    last_error = excluded.last_error
            "#,
        )
        .bind(&stats.channel_name)
        .bind(stats.total_sent)
        .bind(stats.total_failed)
        .bind(stats.consecutive_failures)
        .bind(stats.last_success)
        .bind(stats.last_failure)
        .bind(&stats.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channel_stats(&self, channel_name: &str) -> Result<Option<ChannelStatsRecord>> {
        let row = sqlx::query_as::<_, ChannelStatsRecord>(
            "SELECT * FROM channel_stats WHERE channel_name = $1",
        )
        .bind(channel_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn all_channel_stats(&self) -> Result<Vec<ChannelStatsRecord>> {
        let rows = sqlx::query_as::<_, ChannelStatsRecord>(
            "SELECT * FROM channel_stats ORDER BY channel_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
