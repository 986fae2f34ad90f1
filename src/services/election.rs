//! Service wrapper for the lease-based leader elector.

use crate::leader::LeaderElector;
use crate::services::Service;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ElectionService {
    elector: Arc<LeaderElector>,
    token: CancellationToken,
}

impl ElectionService {
    pub fn new(elector: Arc<LeaderElector>, token: CancellationToken) -> Self {
        Self { elector, token }
    }
}

#[async_trait::async_trait]
impl Service for ElectionService {
    fn name(&self) -> &'static str {
        "leader-election"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        self.elector
            .run(self.token.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.token.cancel();
        // The run future may already be gone; release directly so another
        // replica can take over without waiting out the lease.
        self.elector.release_if_held().await;
        Ok(())
    }
}
