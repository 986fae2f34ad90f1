//! Pluggable delivery channels.
//!
//! A [`Channel`] knows how to deliver one alert to one provider. The
//! dispatcher wraps every registered channel in a [`RateLimitedChannel`]
//! that enforces the per-channel hourly token bucket.

mod email;
mod pagerduty;
mod slack;
mod webhook;

pub use email::EmailChannel;
pub use pagerduty::PagerDutyChannel;
pub use slack::SlackChannel;
pub use webhook::WebhookChannel;

use crate::alerts::http::RetryPolicy;
use crate::alerts::types::Alert;
use crate::crd::{AlertChannelSpec, ChannelRateLimit, ChannelType};
use crate::error::{Error, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// One delivery target.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ChannelType;

    /// Deliver one alert.
    async fn send(&self, alert: &Alert) -> Result<()>;

    /// Exercise the channel end to end with a synthetic alert.
    async fn test(&self) -> Result<()> {
        self.send(&Alert::test(self.name())).await
    }
}

/// Per-channel token bucket sizing.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub max_alerts_per_hour: u32,
    pub burst: u32,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_alerts_per_hour: 100,
            burst: 10,
        }
    }
}

impl ChannelLimits {
    pub fn from_spec(spec: Option<&ChannelRateLimit>) -> Self {
        let defaults = Self::default();
        match spec {
            Some(spec) => Self {
                max_alerts_per_hour: spec
                    .max_alerts_per_hour
                    .unwrap_or(defaults.max_alerts_per_hour)
                    .max(1),
                burst: spec.burst.unwrap_or(defaults.burst).max(1),
            },
            None => defaults,
        }
    }
}

/// A registered channel plus its token bucket.
pub struct RateLimitedChannel {
    inner: Box<dyn Channel>,
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitedChannel {
    pub fn new(inner: Box<dyn Channel>, limits: ChannelLimits) -> Self {
        let period = Duration::from_secs(3600) / limits.max_alerts_per_hour.max(1);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_hour(NonZeroU32::new(100).unwrap()))
            .allow_burst(NonZeroU32::new(limits.burst.max(1)).unwrap());
        Self {
            inner,
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> ChannelType {
        self.inner.kind()
    }

    /// Rate-limited delivery; refuses with a rate-limit error when the
    /// bucket is empty.
    pub async fn send(&self, alert: &Alert) -> Result<()> {
        self.limiter.check().map_err(|_| {
            Error::RateLimited(format!("channel '{}' hourly limit reached", self.name()))
        })?;
        self.inner.send(alert).await
    }

    /// One-off delivery that bypasses the token bucket (test endpoints).
    pub async fn send_unlimited(&self, alert: &Alert) -> Result<()> {
        self.inner.send(alert).await
    }

    pub async fn test(&self) -> Result<()> {
        self.inner.test().await
    }
}

/// Plain SMTP settings resolved from the referenced secret.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Secret material resolved by the channel reconciler before building.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecrets {
    pub webhook_url: Option<String>,
    pub routing_key: Option<String>,
    pub url: Option<String>,
    pub smtp: Option<SmtpSettings>,
}

/// Build a concrete channel from a validated declaration.
pub fn build_channel(
    name: &str,
    spec: &AlertChannelSpec,
    secrets: ResolvedSecrets,
) -> Result<Box<dyn Channel>> {
    let retry = RetryPolicy::from_spec(spec.retry.as_ref())?;

    match spec.channel_type {
        ChannelType::Slack => {
            let config = spec.slack.as_ref().ok_or_else(|| {
                Error::Validation("slack channel is missing its slack section".into())
            })?;
            let webhook_url = secrets.webhook_url.ok_or_else(|| {
                Error::Validation("slack channel is missing its webhook URL secret".into())
            })?;
            Ok(Box::new(SlackChannel::new(
                name,
                webhook_url,
                config.channel.clone(),
                config.template.clone(),
                retry,
            )?))
        }
        ChannelType::Pagerduty => {
            spec.pagerduty.as_ref().ok_or_else(|| {
                Error::Validation("pagerduty channel is missing its pagerduty section".into())
            })?;
            let routing_key = secrets.routing_key.ok_or_else(|| {
                Error::Validation("pagerduty channel is missing its routing key secret".into())
            })?;
            Ok(Box::new(PagerDutyChannel::new(name, routing_key, retry)?))
        }
        ChannelType::Webhook => {
            let config = spec.webhook.as_ref().ok_or_else(|| {
                Error::Validation("webhook channel is missing its webhook section".into())
            })?;
            let url = secrets.url.ok_or_else(|| {
                Error::Validation("webhook channel is missing its URL secret".into())
            })?;
            Ok(Box::new(WebhookChannel::new(
                name,
                url,
                config.method.clone(),
                config.headers.clone(),
                config.template.clone(),
                retry,
            )?))
        }
        ChannelType::Email => {
            let config = spec.email.as_ref().ok_or_else(|| {
                Error::Validation("email channel is missing its email section".into())
            })?;
            let smtp = secrets.smtp.ok_or_else(|| {
                Error::Validation("email channel is missing its SMTP secret".into())
            })?;
            Ok(Box::new(EmailChannel::new(
                name,
                smtp,
                &config.from,
                &config.to,
                config.subject_template.clone(),
                config.body_template.clone(),
            )?))
        }
    }
}
