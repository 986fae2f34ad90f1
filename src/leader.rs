//! Lease-based leader election.
//!
//! One coordination/v1 Lease names the current leader. Each replica runs an
//! acquire-or-renew loop: the holder renews every `renew_interval`; anyone
//! else takes over once the holder's renew time is older than
//! `lease_duration`. Leadership state is published through a watch channel
//! that gates the leader-only services.

use crate::config::LeaderConfig;
use crate::error::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration_secs: i64,
    renew_interval: std::time::Duration,
    leadership: tokio::sync::watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        config: &LeaderConfig,
        namespace: &str,
        identity: String,
    ) -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (leadership, watch) = tokio::sync::watch::channel(false);
        let elector = Self {
            api: Api::namespaced(client, namespace),
            lease_name: config.lease_name.clone(),
            identity,
            lease_duration_secs: config.lease_duration.as_secs() as i64,
            renew_interval: config.renew_interval,
            leadership,
        };
        (elector, watch)
    }

    /// Run the election loop until shutdown. Returns an error if leadership
    /// is lost after having been held; the process restarts rather than
    /// running half-degraded.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut was_leader = *self.leadership.borrow();
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    if !was_leader {
                        info!(identity = %self.identity, lease = %self.lease_name, "acquired leadership");
                        was_leader = true;
                        let _ = self.leadership.send(true);
                    }
                }
                Ok(false) => {
                    if was_leader {
                        let _ = self.leadership.send(false);
                        return Err(crate::error::Error::Config(
                            "leadership lost; restarting to rejoin as follower".into(),
                        ));
                    }
                    debug!(lease = %self.lease_name, "another replica holds the lease");
                }
                Err(e) => {
                    warn!(error = %e, "lease check failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                _ = shutdown.cancelled() => {
                    self.release_if_held().await;
                    return Ok(());
                }
            }
        }
    }

    /// Acquire, renew, or observe the lease. Conflicting writers lose the
    /// update with a 409 and simply retry on the next tick.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());

        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_secs as i32),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();
        let renewed_at = spec.renew_time.as_ref().map(|t| t.0);
        let expired = renewed_at
            .map(|t| (Utc::now() - t).num_seconds() > self.lease_duration_secs)
            .unwrap_or(true);

        if holder != self.identity && !expired {
            return Ok(false);
        }

        let taking_over = holder != self.identity;
        lease.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_secs as i32),
            acquire_time: if taking_over {
                Some(now.clone())
            } else {
                spec.acquire_time
            },
            renew_time: Some(now),
            lease_transitions: Some(
                spec.lease_transitions.unwrap_or(0) + if taking_over { 1 } else { 0 },
            ),
            ..Default::default()
        });

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort release so the next replica does not wait out the lease.
    pub async fn release_if_held(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        let Ok(Some(mut lease)) = self.api.get_opt(&self.lease_name).await else {
            return;
        };
        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.clone())
            .unwrap_or_default();
        if holder != self.identity {
            return;
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
        }
        if let Err(e) = self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            warn!(error = %e, "failed to release leadership lease");
        } else {
            info!(lease = %self.lease_name, "released leadership lease");
        }
    }
}
