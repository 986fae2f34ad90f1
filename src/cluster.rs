//! Thin kube wrappers shared by the reconcilers: secret resolution, pod
//! log capture, and event listing.

use crate::error::{Error, Result};
use crate::store::Credentials;
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use kube::api::{Api, ListParams, LogParams};
use kube::{Client, ResourceExt};

/// Read one key of a secret as UTF-8.
pub async fn secret_value(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(name).await?;

    let missing = || Error::MissingSecretKey {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    };

    let data = secret.data.unwrap_or_default();
    let bytes = data.get(key).ok_or_else(missing)?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| Error::Validation(format!("secret {namespace}/{name} key {key} is not UTF-8")))
}

/// Resolve database credentials from a `namespace/name` secret reference
/// exposing `username` and `password` keys.
pub async fn database_credentials(client: &Client, reference: &str) -> Result<Credentials> {
    let (namespace, name) = reference.split_once('/').ok_or_else(|| {
        Error::Config(format!(
            "credentials secret reference '{reference}' must be 'namespace/name'"
        ))
    })?;
    Ok(Credentials {
        username: secret_value(client, namespace, name, "username").await?,
        password: secret_value(client, namespace, name, "password").await?,
    })
}

/// The most recently created pod belonging to a job.
pub async fn latest_pod_for_job(
    client: &Client,
    namespace: &str,
    job_name: &str,
) -> Result<Option<Pod>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&format!("job-name={job_name}"));
    let list = pods.list(&params).await?;
    Ok(list
        .items
        .into_iter()
        .max_by_key(|pod| pod.creation_timestamp().map(|t| t.0)))
}

/// Container logs from one pod, capped at `max_kb` kilobytes.
pub async fn pod_logs(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    max_kb: u32,
) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = LogParams {
        limit_bytes: Some(i64::from(max_kb) * 1024),
        ..Default::default()
    };
    Ok(pods.logs(pod_name, &params).await?)
}

/// Exit code and reason from the pod's most relevant terminated container.
///
/// Prefers a non-zero exit; falls back to the pod-level reason (e.g.
/// "Evicted") when no container state carries one.
pub fn pod_exit_status(pod: &Pod) -> (Option<i32>, Option<String>) {
    let mut exit_code = None;
    let mut reason = None;

    if let Some(status) = &pod.status {
        for container in status.container_statuses.iter().flatten() {
            let terminated = container
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .or_else(|| {
                    container
                        .last_state
                        .as_ref()
                        .and_then(|state| state.terminated.as_ref())
                });
            if let Some(terminated) = terminated {
                if exit_code.is_none() || terminated.exit_code != 0 {
                    exit_code = Some(terminated.exit_code);
                    if terminated.reason.is_some() {
                        reason = terminated.reason.clone();
                    }
                }
            }
        }
        if reason.is_none() {
            reason = status.reason.clone();
        }
    }

    (exit_code, reason)
}

pub fn pod_phase(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|status| status.phase.clone())
}

/// Cluster events involving one job, formatted one per line.
pub async fn job_events(client: &Client, namespace: &str, job_name: &str) -> Result<Vec<String>> {
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().fields(&format!(
        "involvedObject.kind=Job,involvedObject.name={job_name}"
    ));
    let list = events.list(&params).await?;

    Ok(list
        .items
        .iter()
        .map(|event| {
            format!(
                "[{}] {}: {}",
                event.type_.as_deref().unwrap_or("Normal"),
                event.reason.as_deref().unwrap_or(""),
                event.message.as_deref().unwrap_or(""),
            )
        })
        .collect())
}
