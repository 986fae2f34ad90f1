//! Retention sweeper: ages out execution rows and their log payloads on
//! independent schedules.

use crate::config::RetentionConfig;
use crate::services::Service;
use crate::store::ExecutionStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct RetentionService {
    store: Arc<dyn ExecutionStore>,
    config: RetentionConfig,
    leadership: watch::Receiver<bool>,
}

impl RetentionService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        config: RetentionConfig,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            leadership,
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();

        let log_cutoff = now
            - chrono::Duration::from_std(self.config.logs).unwrap_or_else(|_| chrono::Duration::days(7));
        match self.store.prune_logs(log_cutoff).await {
            Ok(cleared) if cleared > 0 => info!(cleared, "log payloads pruned"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "log prune failed"),
        }

        let execution_cutoff = now
            - chrono::Duration::from_std(self.config.executions)
                .unwrap_or_else(|_| chrono::Duration::days(30));
        match self.store.prune(execution_cutoff).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "execution rows pruned"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "execution prune failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for RetentionService {
    fn name(&self) -> &'static str {
        "retention"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        // Only the leader prunes; followers would race it for nothing.
        let mut leadership = self.leadership.clone();
        while !*leadership.borrow() {
            leadership
                .changed()
                .await
                .map_err(|_| anyhow::anyhow!("leadership watch closed"))?;
        }

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
