//! Networked mysql backend.
//!
//! Mysql has neither `CREATE INDEX IF NOT EXISTS` nor `ADD COLUMN IF NOT
//! EXISTS`, so both are guarded by information_schema probes to keep `init`
//! idempotent. Percentiles fall back to the nearest-rank OFFSET hop.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::store::models::*;
use crate::store::{Credentials, ExecutionStore, percentile_index, window_start};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::{MySql, QueryBuilder, Row};

pub struct MysqlStore {
    pool: MySqlPool,
}

fn ssl_mode(raw: &str) -> MySqlSslMode {
    match raw {
        "disable" => MySqlSslMode::Disabled,
        "require" => MySqlSslMode::Required,
        "verify-ca" => MySqlSslMode::VerifyCa,
        "verify-full" => MySqlSslMode::VerifyIdentity,
        _ => MySqlSslMode::Preferred,
    }
}

impl MysqlStore {
    pub async fn connect(cfg: &DatabaseConfig, credentials: Option<Credentials>) -> Result<Self> {
        let creds = credentials.ok_or_else(|| {
            Error::Config("mysql backend requires a credentials secret".to_string())
        })?;

        let options = MySqlConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port.unwrap_or(3306))
            .database(&cfg.name)
            .username(&creds.username)
            .password(&creds.password)
            .ssl_mode(ssl_mode(&cfg.ssl_mode));

        let pool = MySqlPoolOptions::new()
            .max_connections(cfg.max_open)
            .min_connections(cfg.max_idle)
            .max_lifetime(cfg.max_lifetime)
            .idle_timeout(cfg.max_idle_time)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn create_index(
        &self,
        name: &str,
        table: &str,
        unique: bool,
        columns: &str,
    ) -> Result<()> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM information_schema.statistics \
             WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
        )
        .bind(table)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        if exists == 0 {
            let unique = if unique { "UNIQUE " } else { "" };
            sqlx::query(&format!("CREATE {unique}INDEX {name} ON {table} ({columns})"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn migrate_columns(&self) -> Result<()> {
        let added = [
            ("cronjob_uid", "VARCHAR(64) NOT NULL DEFAULT ''"),
            ("logs", "LONGTEXT"),
            ("events", "LONGTEXT"),
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

fn push_history_filters(qb: &mut QueryBuilder<'_, MySql>, query: &AlertHistoryQuery) {
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
impl ExecutionStore for MysqlStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS executions
(
    id              BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
    namespace       VARCHAR(253) NOT NULL,
    cronjob_name    VARCHAR(253) NOT NULL,
    cronjob_uid     VARCHAR(64) NOT NULL DEFAULT '',
    job_name        VARCHAR(253) NOT NULL,
    scheduled_time  TIMESTAMP(6) NULL,
    start_time      TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    completion_time TIMESTAMP(6) NULL,
    duration_secs   DOUBLE,
    success         BOOLEAN NOT NULL,
    exit_code       INT,
    reason          TEXT,
    retried         BOOLEAN NOT NULL DEFAULT FALSE,
    retry_of        VARCHAR(253),
    logs            LONGTEXT,
    events          LONGTEXT,
    suggested_fix   TEXT,
    created_at      TIMESTAMP(6) NULL
);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS alert_history
(
    id            BIGINT NOT NULL PRIMARY KEY AUTO_INCREMENT,
    alert_type    VARCHAR(32) NOT NULL,
    severity      VARCHAR(16) NOT NULL,
    title         TEXT NOT NULL,
    message       TEXT NOT NULL,
    namespace     VARCHAR(253) NOT NULL,
    cronjob_name  VARCHAR(253) NOT NULL,
    monitor_name  VARCHAR(253),
    channels      TEXT NOT NULL,
    occurred_at   TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
    resolved_at   TIMESTAMP(6) NULL,
    exit_code     INT,
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
    channel_name         VARCHAR(253) NOT NULL PRIMARY KEY,
    total_sent           BIGINT NOT NULL DEFAULT 0,
    total_failed         BIGINT NOT NULL DEFAULT 0,
    consecutive_failures BIGINT NOT NULL DEFAULT 0,
    last_success         TIMESTAMP(6) NULL,
    last_failure         TIMESTAMP(6) NULL,
    last_error           TEXT
);
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate_columns().await?;

        self.create_index(
            "executions_cronjob_idx",
            "executions",
            false,
            "namespace, cronjob_name, start_time",
        )
        .await?;
        self.create_index(
            "executions_job_idx",
            "executions",
            true,
            "namespace, job_name, start_time",
        )
        .await?;
        self.create_index(
            "alert_history_cronjob_idx",
            "alert_history",
            false,
            "namespace, cronjob_name, occurred_at",
        )
        .await?;

        Ok(())
    }

    async fn record_execution(&self, exec: &Execution) -> Result<i64> {
        let result = sqlx::query(
            r#"
INSERT INTO executions
    (namespace, cronjob_name, cronjob_uid, job_name, scheduled_time, start_time,
     completion_time, duration_secs, success, exit_code, reason, retried,
     retry_of, logs, events, suggested_fix, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn executions(
        &self,
        cronjob: &CronJobRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ? \
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
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ?",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ? \
             ORDER BY start_time DESC LIMIT ? OFFSET ?",
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
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ?{status_clause}"
        ))
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, Execution>(&format!(
            "SELECT * FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ?{status_clause} \
             ORDER BY start_time DESC LIMIT ? OFFSET ?"
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
             WHERE namespace = ? AND cronjob_name = ? \
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
             WHERE namespace = ? AND cronjob_name = ? AND success = TRUE \
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
             WHERE namespace = ? AND job_name = ? \
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
        // SUM() comes back as DECIMAL on mysql; CAST keeps the decode simple.
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    CAST(COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS SIGNED) AS succeeded, \
                    CAST(COALESCE(AVG(duration_secs), 0) AS DOUBLE) AS avg_secs \
             FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ?",
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
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ? \
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

        let idx = percentile_index(n, p);
        let value = sqlx::query_scalar::<_, f64>(
            "SELECT duration_secs FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ? \
               AND duration_secs IS NOT NULL \
             ORDER BY duration_secs ASC LIMIT 1 OFFSET ?",
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
                    CAST(COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS SIGNED) AS succeeded \
             FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND start_time >= ?",
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
        let result = sqlx::query("DELETE FROM executions WHERE start_time < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET logs = NULL, events = NULL \
             WHERE start_time < ? AND (logs IS NOT NULL OR events IS NOT NULL)",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_executions(&self, cronjob: &CronJobRef) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM executions WHERE namespace = ? AND cronjob_name = ?")
                .bind(&cronjob.namespace)
                .bind(&cronjob.name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_executions_by_uid(&self, cronjob: &CronJobRef, uid: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM executions \
             WHERE namespace = ? AND cronjob_name = ? AND cronjob_uid = ?",
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
             WHERE namespace = ? AND cronjob_name = ? AND cronjob_uid != '' \
             ORDER BY cronjob_uid",
        )
        .bind(&cronjob.namespace)
        .bind(&cronjob.name)
        .fetch_all(&self.pool)
        .await?;
        Ok(uids)
    }

    async fn store_alert(&self, record: &AlertHistoryRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
INSERT INTO alert_history
    (alert_type, severity, title, message, namespace, cronjob_name,
     monitor_name, channels, occurred_at, resolved_at, exit_code, reason, suggested_fix)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn list_alert_history(
        &self,
        query: &AlertHistoryQuery,
    ) -> Result<(Vec<AlertHistoryRecord>, i64)> {
        let mut count_qb: QueryBuilder<MySql> =
            QueryBuilder::new("SELECT COUNT(*) FROM alert_history WHERE 1=1");
        push_history_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<MySql> =
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
            "UPDATE alert_history SET resolved_at = ? \
             WHERE alert_type = ? AND namespace = ? AND cronjob_name = ? \
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
        let row = sqlx::query(
            "SELECT COUNT(*) AS sent, MAX(occurred_at) AS last_alert FROM alert_history \
             WHERE channels = ? \
                OR channels LIKE ? \
                OR channels LIKE ? \
                OR channels LIKE ?",
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
VALUES (?, ?, ?, ?, ?, ?, ?)
ON DUPLICATE KEY UPDATE
    total_sent = VALUES(total_sent),
    total_failed = VALUES(total_failed),
    consecutive_failures = VALUES(consecutive_failures),
    last_success = VALUES(last_success),
    last_failure = VALUES(last_failure),
    last_error = VALUES(last_error)
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
            "SELECT * FROM channel_stats WHERE channel_name = ?",
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
