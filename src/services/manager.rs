//! Service supervision.
//!
//! Every service runs as one task in a [`JoinSet`], racing its work loop
//! against a shared cancellation token. Stopping the operator cancels the
//! token once; each task then runs its service's cleanup and reports how it
//! went. The manager never waits on a straggler past the shutdown budget.

use crate::services::Service;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a supervised service left the running set.
#[derive(Debug)]
pub enum ServiceExit {
    /// The work loop returned Ok on its own. Services run until cancelled,
    /// so from the operator's view this is still a fault.
    Finished,
    /// The work loop returned an error.
    Failed(anyhow::Error),
    /// The service observed cancellation and cleaned up.
    Stopped,
    /// Cleanup after cancellation failed.
    StopFailed(anyhow::Error),
}

impl ServiceExit {
    /// Whether this exit should fail the operator.
    pub fn is_fault(&self) -> bool {
        !matches!(self, ServiceExit::Stopped)
    }
}

pub struct ServiceManager {
    registered: Vec<Box<dyn Service>>,
    tasks: JoinSet<(String, ServiceExit)>,
    alive: HashSet<String>,
    stop: CancellationToken,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            registered: Vec::new(),
            tasks: JoinSet::new(),
            alive: HashSet::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Queue a service; it starts when [`spawn_all`](Self::spawn_all) runs.
    pub fn register(&mut self, service: Box<dyn Service>) {
        self.registered.push(service);
    }

    /// Move every registered service onto the runtime.
    pub fn spawn_all(&mut self) {
        for service in self.registered.drain(..) {
            let name = service.name().to_string();
            self.alive.insert(name.clone());
            self.tasks
                .spawn(supervise(service, name, self.stop.clone()));
        }
        info!(services = self.alive.len(), "services spawned");
    }

    /// Wait for the first service to leave the running set.
    pub async fn first_exit(&mut self) -> (String, ServiceExit) {
        match self.tasks.join_next().await {
            Some(Ok((name, exit))) => {
                self.alive.remove(&name);
                (name, exit)
            }
            // A panicked task carries no name; report it as-is and let the
            // caller tear the operator down.
            Some(Err(join_error)) => (
                "unknown".to_string(),
                ServiceExit::Failed(anyhow::anyhow!("service task panicked: {join_error}")),
            ),
            None => (
                "none".to_string(),
                ServiceExit::Failed(anyhow::anyhow!("no services are running")),
            ),
        }
    }

    /// Cancel every service and wait up to `timeout` for cleanup.
    /// Returns the names of services that did not make it out in time.
    pub async fn stop(&mut self, timeout: Duration) -> Vec<String> {
        info!(
            services = self.alive.len(),
            timeout = format!("{timeout:.2?}"),
            "stopping services"
        );
        self.stop.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.alive.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok((name, exit)))) => {
                    self.alive.remove(&name);
                    match exit {
                        ServiceExit::Stopped => debug!(service = %name, "service stopped"),
                        other => warn!(service = %name, exit = ?other, "service stopped uncleanly"),
                    }
                }
                Ok(Some(Err(join_error))) => {
                    warn!(error = %join_error, "service task panicked during shutdown");
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        self.alive.iter().cloned().collect()
    }
}

/// One service's whole lifetime: the work loop until cancellation, then
/// cleanup.
async fn supervise(
    mut service: Box<dyn Service>,
    name: String,
    stop: CancellationToken,
) -> (String, ServiceExit) {
    info!(service = %name, "service started");
    let exit = tokio::select! {
        result = service.run() => match result {
            Ok(()) => ServiceExit::Finished,
            Err(e) => ServiceExit::Failed(e),
        },
        _ = stop.cancelled() => match service.shutdown().await {
            Ok(()) => ServiceExit::Stopped,
            Err(e) => ServiceExit::StopFailed(e),
        },
    };
    (name, exit)
}
