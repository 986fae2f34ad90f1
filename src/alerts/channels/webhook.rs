//! Generic webhook channel: configurable method, headers, and body
//! template.

use crate::alerts::channels::Channel;
use crate::alerts::http::{HttpSender, RetryPolicy};
use crate::alerts::template;
use crate::alerts::types::Alert;
use crate::crd::ChannelType;
use crate::error::{Error, Result};
use async_trait::async_trait;
use minijinja::Environment;
use reqwest::Method;
use std::collections::BTreeMap;

pub struct WebhookChannel {
    name: String,
    url: String,
    method: Method,
    headers: BTreeMap<String, String>,
    template: String,
    env: Environment<'static>,
    http: HttpSender,
}

impl WebhookChannel {
    pub fn new(
        name: &str,
        url: String,
        method: Option<String>,
        headers: BTreeMap<String, String>,
        template_source: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let method = match method.as_deref() {
            None | Some("") => Method::POST,
            Some(raw) => Method::from_bytes(raw.to_uppercase().as_bytes())
                .map_err(|_| Error::Validation(format!("invalid webhook method '{raw}'")))?,
        };

        let template_source =
            template_source.unwrap_or_else(|| template::DEFAULT_WEBHOOK_TEMPLATE.to_string());
        template::validate(&template_source)?;

        Ok(Self {
            name: name.to_string(),
            url,
            method,
            headers,
            template: template_source,
            env: template::environment(),
            http: HttpSender::new(retry)?,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = template::render(&self.env, "webhook", &self.template, alert)?;
        self.http
            .send_json(
                self.method.clone(),
                &self.url,
                &self.headers,
                body,
                |status| status.is_success(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_method_is_post() {
        let channel = WebhookChannel::new(
            "hooks",
            "https://example.invalid/hook".into(),
            None,
            BTreeMap::new(),
            None,
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(channel.method, Method::POST);
    }

    #[test]
    fn invalid_method_is_a_validation_error() {
        let result = WebhookChannel::new(
            "hooks",
            "https://example.invalid/hook".into(),
            Some("FETCH ME".into()),
            BTreeMap::new(),
            None,
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn invalid_template_is_rejected_at_build_time() {
        let result = WebhookChannel::new(
            "hooks",
            "https://example.invalid/hook".into(),
            None,
            BTreeMap::new(),
            Some("{% broken".into()),
            RetryPolicy::default(),
        );
        assert!(result.is_err());
    }
}
