//! Slack incoming-webhook channel.

use crate::alerts::channels::Channel;
use crate::alerts::http::{HttpSender, RetryPolicy};
use crate::alerts::template;
use crate::alerts::types::Alert;
use crate::crd::ChannelType;
use crate::error::Result;
use async_trait::async_trait;
use minijinja::Environment;
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::collections::BTreeMap;

pub struct SlackChannel {
    name: String,
    webhook_url: String,
    channel_override: Option<String>,
    template: String,
    env: Environment<'static>,
    http: HttpSender,
}

impl SlackChannel {
    pub fn new(
        name: &str,
        webhook_url: String,
        channel_override: Option<String>,
        template_source: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let template_source =
            template_source.unwrap_or_else(|| template::DEFAULT_SLACK_TEMPLATE.to_string());
        template::validate(&template_source)?;

        Ok(Self {
            name: name.to_string(),
            webhook_url,
            channel_override,
            template: template_source,
            env: template::environment(),
            http: HttpSender::new(retry)?,
        })
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelType {
        ChannelType::Slack
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let text = template::render(&self.env, "slack", &self.template, alert)?;

        let mut body = json!({ "text": text });
        if let Some(ref channel) = self.channel_override {
            body["channel"] = json!(channel);
        }

        // Slack webhooks answer exactly 200 on success.
        self.http
            .send_json(
                Method::POST,
                &self.webhook_url,
                &BTreeMap::new(),
                body.to_string(),
                |status| status == StatusCode::OK,
            )
            .await
    }
}
