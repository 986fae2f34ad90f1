//! Long-running operator services and their supervisor.

pub mod controllers;
pub mod election;
pub mod manager;
pub mod retention;
pub mod warmer;

pub use manager::{ServiceExit, ServiceManager};

/// A long-running piece of the operator, supervised by [`ServiceManager`].
///
/// Services are expected to run until cancelled; `run` returning on its own
/// means something is wrong (leadership loss, missing CRD, crashed stream)
/// and takes the whole operator down for a clean restart.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&mut self) -> Result<(), anyhow::Error>;

    /// Cooperative cleanup once the operator is stopping.
    async fn shutdown(&mut self) -> Result<(), anyhow::Error>;
}
