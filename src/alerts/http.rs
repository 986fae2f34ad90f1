//! Retrying HTTP delivery shared by the Slack, PagerDuty, and webhook
//! channels.
//!
//! Retries 5xx and transport errors with exponential backoff; 4xx is a
//! permanent delivery error and never retried. The body is kept as an
//! owned buffer so every attempt replays the identical request.

use crate::config::parse_duration;
use crate::crd::ChannelRetry;
use crate::error::{Error, Result};
use reqwest::{Method, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

/// Backoff knobs, caller-supplied per channel.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Merge CRD overrides onto the defaults.
    pub fn from_spec(spec: Option<&ChannelRetry>) -> Result<Self> {
        let mut policy = Self::default();
        let Some(spec) = spec else {
            return Ok(policy);
        };
        if let Some(max_retries) = spec.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(ref raw) = spec.initial_backoff {
            policy.initial_backoff = parse_duration(raw).map_err(Error::Validation)?;
        }
        if let Some(ref raw) = spec.max_backoff {
            policy.max_backoff = parse_duration(raw).map_err(Error::Validation)?;
        }
        Ok(policy)
    }
}

/// HTTP sender with a 30 s total deadline and a 10 s connect budget.
pub struct HttpSender {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpSender {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, retry })
    }

    /// Send a JSON body; `accept` decides which status counts as success.
    ///
    /// Channel providers keep webhook URLs secret, so error messages carry
    /// only the status, never the URL.
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: String,
        accept: fn(StatusCode) -> bool,
    ) -> Result<()> {
        let mut backoff = self.retry.initial_backoff;
        let mut last_error = String::new();

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
            }

            let mut request = self
                .client
                .request(method.clone(), url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            for (name, value) in headers {
                request = request.header(name, value);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if accept(status) {
                        return Ok(());
                    }
                    if status.is_client_error() {
                        // Permanent; retrying would just repeat the refusal.
                        return Err(Error::Delivery(format!(
                            "provider rejected the request with HTTP {status}"
                        )));
                    }
                    last_error = format!("HTTP {status}");
                }
                Err(e) => {
                    last_error = if e.is_timeout() {
                        "request timed out".to_string()
                    } else if e.is_connect() {
                        "connection failed".to_string()
                    } else {
                        "transport error".to_string()
                    };
                }
            }
        }

        Err(Error::Delivery(format!(
            "delivery failed after {} attempts: {last_error}",
            self.retry.max_retries + 1
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ChannelRetry;

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
    }

    #[test]
    fn retry_policy_from_spec_overrides() {
        let spec = ChannelRetry {
            max_retries: Some(5),
            initial_backoff: Some("250ms".into()),
            max_backoff: Some("10s".into()),
        };
        let policy = RetryPolicy::from_spec(Some(&spec)).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn retry_policy_rejects_bad_durations() {
        let spec = ChannelRetry {
            max_retries: None,
            initial_backoff: Some("whenever".into()),
            max_backoff: None,
        };
        assert!(RetryPolicy::from_spec(Some(&spec)).is_err());
    }
}
