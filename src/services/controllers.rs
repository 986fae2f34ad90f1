//! Service wrapper for the kube controllers.
//!
//! Controllers are leader-only: the wrapper blocks on the leadership watch
//! before letting the controller stream start.

use crate::services::Service;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ControllerService {
    name: &'static str,
    leadership: watch::Receiver<bool>,
    token: CancellationToken,
    controller: std::sync::Mutex<Option<BoxFuture<'static, Result<(), anyhow::Error>>>>,
}

impl ControllerService {
    pub fn new(
        name: &'static str,
        leadership: watch::Receiver<bool>,
        token: CancellationToken,
        controller: BoxFuture<'static, Result<(), anyhow::Error>>,
    ) -> Self {
        Self {
            name,
            leadership,
            token,
            controller: std::sync::Mutex::new(Some(controller)),
        }
    }
}

#[async_trait::async_trait]
impl Service for ControllerService {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let mut leadership = self.leadership.clone();
        while !*leadership.borrow() {
            leadership
                .changed()
                .await
                .map_err(|_| anyhow::anyhow!("leadership watch closed"))?;
        }
        info!(service = self.name, "leadership confirmed, starting controller");

        let controller = self.controller.lock().unwrap().take();
        match controller {
            Some(controller) => controller.await,
            None => Err(anyhow::anyhow!("controller already consumed")),
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.token.cancel();
        Ok(())
    }
}
