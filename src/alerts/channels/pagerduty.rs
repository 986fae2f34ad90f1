//! PagerDuty Events API v2 channel.

use crate::alerts::channels::Channel;
use crate::alerts::http::{HttpSender, RetryPolicy};
use crate::alerts::types::Alert;
use crate::crd::ChannelType;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::collections::BTreeMap;

const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

pub struct PagerDutyChannel {
    name: String,
    routing_key: String,
    http: HttpSender,
}

impl PagerDutyChannel {
    pub fn new(name: &str, routing_key: String, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            routing_key,
            http: HttpSender::new(retry)?,
        })
    }
}

#[async_trait]
impl Channel for PagerDutyChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelType {
        ChannelType::Pagerduty
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "dedup_key": alert.key,
            "payload": {
                "summary": alert.title,
                "source": format!("{}/{}", alert.namespace, alert.cronjob_name),
                "severity": alert.severity.as_str(),
                "timestamp": alert.timestamp.to_rfc3339(),
                "custom_details": {
                    "type": alert.alert_type.as_str(),
                    "message": alert.message,
                    "suggested_fix": alert.context.suggested_fix,
                    "success_rate": alert.context.success_rate,
                    "exit_code": alert.context.exit_code,
                    "reason": alert.context.reason,
                },
            },
        });

        // The Events API acknowledges with 202 Accepted.
        self.http
            .send_json(
                Method::POST,
                EVENTS_URL,
                &BTreeMap::new(),
                body.to_string(),
                |status| status == StatusCode::ACCEPTED,
            )
            .await
    }
}
