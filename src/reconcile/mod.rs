//! Control loops translating cluster state into store writes and
//! dispatcher calls.

pub mod channel;
pub mod job;
pub mod monitor;
pub mod selector;

use crate::alerts::Dispatcher;
use crate::config::Config;
use crate::crd::{AlertChannel, CronJobMonitor};
use crate::error::{Error, Result};
use crate::sla::SlaAnalyzer;
use crate::store::ExecutionStore;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state handed to every reconciler.
pub struct Context {
    pub client: Client,
    pub store: Arc<dyn ExecutionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub analyzer: SlaAnalyzer,
    pub config: Arc<Config>,
}

/// Transient errors requeue with backoff rather than crashing the loop.
fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        object = %obj.name_any(),
        %error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Add the operator's finalizer if it is not present yet.
pub(crate) async fn ensure_finalizer<K>(
    api: &Api<K>,
    name: &str,
    obj: &K,
    finalizer: &str,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + Debug,
{
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|existing| existing == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Drop the operator's finalizer so deletion can complete.
pub(crate) async fn remove_finalizer<K>(
    api: &Api<K>,
    name: &str,
    obj: &K,
    finalizer: &str,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + Debug,
{
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|existing| existing != finalizer)
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Run the CronJobMonitor controller until shutdown.
pub async fn run_monitor_controller(
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> Result<()> {
    let monitors = Api::<CronJobMonitor>::all(ctx.client.clone());
    if let Err(e) = monitors.list(&ListParams::default().limit(1)).await {
        return Err(Error::Config(format!(
            "CronJobMonitor CRD is not queryable: {e}. Is the CRD installed?"
        )));
    }

    info!("starting monitor controller");
    Controller::new(monitors, watcher::Config::default().any_semantic())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(monitor::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "monitor reconcile error");
            }
        })
        .await;
    Ok(())
}

/// Run the child-Job controller until shutdown.
pub async fn run_job_controller(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    let jobs = Api::<Job>::all(ctx.client.clone());

    info!("starting job controller");
    Controller::new(jobs, watcher::Config::default().any_semantic())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(job::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "job reconcile error");
            }
        })
        .await;
    Ok(())
}

/// Run the AlertChannel controller until shutdown.
pub async fn run_channel_controller(
    ctx: Arc<Context>,
    shutdown: CancellationToken,
) -> Result<()> {
    let channels = Api::<AlertChannel>::all(ctx.client.clone());
    if let Err(e) = channels.list(&ListParams::default().limit(1)).await {
        return Err(Error::Config(format!(
            "AlertChannel CRD is not queryable: {e}. Is the CRD installed?"
        )));
    }

    info!("starting channel controller");
    Controller::new(channels, watcher::Config::default().any_semantic())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(channel::reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                debug!(error = %e, "channel reconcile error");
            }
        })
        .await;
    Ok(())
}
