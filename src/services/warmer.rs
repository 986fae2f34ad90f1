//! Store warmer: periodic health pings that keep the connection pool
//! alive on every replica, leader or not.

use crate::services::Service;
use crate::store::ExecutionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PING_INTERVAL: Duration = Duration::from_secs(60);

pub struct StoreWarmerService {
    store: Arc<dyn ExecutionStore>,
}

impl StoreWarmerService {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Service for StoreWarmerService {
    fn name(&self) -> &'static str {
        "store-warmer"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            match self.store.health().await {
                Ok(()) => debug!("store ping ok"),
                Err(e) => warn!(error = %e, "store ping failed"),
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
