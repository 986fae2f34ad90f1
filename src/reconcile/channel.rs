//! AlertChannel control loop: validate declarations, resolve secrets, and
//! keep the dispatcher's channel registry in sync.

use crate::alerts::channels::{self, Channel, ChannelLimits, ResolvedSecrets, SmtpSettings};
use crate::cluster;
use crate::crd::{
    AlertChannel, AlertChannelStatus, CHANNEL_FINALIZER, ChannelDeliveryStatus, ChannelType,
};
use crate::error::{Error, Result};
use crate::reconcile::{Context, ensure_finalizer, remove_finalizer};
use chrono::Utc;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channels are revalidated periodically so secret rotations are picked up
/// without an explicit re-apply.
const REVALIDATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn reconcile(channel: Arc<AlertChannel>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = channel.namespace().unwrap_or_default();
    let name = channel.name_any();
    let api: Api<AlertChannel> = Api::namespaced(ctx.client.clone(), &namespace);

    if channel.metadata.deletion_timestamp.is_some() {
        ctx.dispatcher.remove_channel(&name).await;
        remove_finalizer(&api, &name, channel.as_ref(), CHANNEL_FINALIZER).await?;
        info!(channel = %name, "channel unregistered");
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &name, channel.as_ref(), CHANNEL_FINALIZER).await?;

    let mut status = AlertChannelStatus::default();

    match build_channel(&ctx, &channel, &namespace, &name).await {
        Ok(built) => {
            if channel.spec.test_on_save {
                status.last_test_time = Some(Utc::now());
                status.last_test_result = Some(match built.test().await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => {
                        warn!(channel = %name, error = %e, "channel test failed");
                        format!("failed: {e}")
                    }
                });
            }

            let limits = ChannelLimits::from_spec(channel.spec.rate_limit.as_ref());
            ctx.dispatcher.register_channel(built, limits).await;

            status.ready = true;
            status.reason = Some("Registered".into());
            status.message = Some(format!(
                "{} channel registered with the dispatcher",
                channel.spec.channel_type
            ));
            status.delivery = ctx.dispatcher.channel_stats(&name).await.map(|stats| {
                ChannelDeliveryStatus {
                    total_sent: stats.total_sent,
                    total_failed: stats.total_failed,
                    consecutive_failures: stats.consecutive_failures,
                    last_error: stats.last_error,
                }
            });
        }
        Err(e) => {
            debug!(channel = %name, error = %e, "channel validation failed");
            status.ready = false;
            status.reason = Some("ValidationFailed".into());
            status.message = Some(e.to_string());
        }
    }

    update_status(&api, &name, &status).await?;
    Ok(Action::requeue(REVALIDATE_INTERVAL))
}

/// Validate the declaration, resolve its secrets, and build the concrete
/// channel object.
async fn build_channel(
    ctx: &Arc<Context>,
    channel: &AlertChannel,
    namespace: &str,
    name: &str,
) -> Result<Box<dyn Channel>> {
    let spec = &channel.spec;
    let mut secrets = ResolvedSecrets::default();

    match spec.channel_type {
        ChannelType::Slack => {
            let config = spec.slack.as_ref().ok_or_else(|| {
                Error::Validation("type is slack but the slack section is missing".into())
            })?;
            let reference = &config.webhook_url_secret_ref;
            let key = reference.key.as_deref().unwrap_or("webhookUrl");
            secrets.webhook_url =
                Some(cluster::secret_value(&ctx.client, namespace, &reference.name, key).await?);
        }
        ChannelType::Pagerduty => {
            let config = spec.pagerduty.as_ref().ok_or_else(|| {
                Error::Validation("type is pagerduty but the pagerduty section is missing".into())
            })?;
            let reference = &config.routing_key_secret_ref;
            let key = reference.key.as_deref().unwrap_or("routingKey");
            secrets.routing_key =
                Some(cluster::secret_value(&ctx.client, namespace, &reference.name, key).await?);
        }
        ChannelType::Webhook => {
            let config = spec.webhook.as_ref().ok_or_else(|| {
                Error::Validation("type is webhook but the webhook section is missing".into())
            })?;
            let reference = &config.url_secret_ref;
            let key = reference.key.as_deref().unwrap_or("url");
            secrets.url =
                Some(cluster::secret_value(&ctx.client, namespace, &reference.name, key).await?);
        }
        ChannelType::Email => {
            let config = spec.email.as_ref().ok_or_else(|| {
                Error::Validation("type is email but the email section is missing".into())
            })?;
            let secret = &config.smtp_secret_name;
            let host = cluster::secret_value(&ctx.client, namespace, secret, "host").await?;
            let port = match cluster::secret_value(&ctx.client, namespace, secret, "port").await {
                Ok(raw) => raw.trim().parse::<u16>().map_err(|_| {
                    Error::Validation(format!("SMTP secret {secret} key port is not a port number"))
                })?,
                Err(Error::MissingSecretKey { .. }) => 587,
                Err(e) => return Err(e),
            };
            let username =
                cluster::secret_value(&ctx.client, namespace, secret, "username").await?;
            let password =
                cluster::secret_value(&ctx.client, namespace, secret, "password").await?;
            secrets.smtp = Some(SmtpSettings {
                host,
                port,
                username,
                password,
            });
        }
    }

    channels::build_channel(name, spec, secrets)
}

async fn update_status(
    api: &Api<AlertChannel>,
    name: &str,
    status: &AlertChannelStatus,
) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    for attempt in 0..ATTEMPTS {
        let mut latest = api.get(name).await?;
        latest.status = Some(status.clone());
        latest.metadata.managed_fields = None;
        let data = serde_json::to_vec(&latest)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt + 1 < ATTEMPTS => {
                debug!(channel = %name, attempt, "status update conflict, retrying");
            }
            Err(e) => return Err(Error::Kube(e)),
        }
    }
    Ok(())
}
