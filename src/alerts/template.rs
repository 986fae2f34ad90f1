//! Channel message templating.
//!
//! Templates come from custom resources and are untrusted; minijinja gives
//! a sandboxed environment with no filesystem or network reach. Beyond the
//! builtin filters (`upper`, `lower`, ...) the environment adds `truncate`,
//! `humanize_duration`, `format_time`, and `json_escape`.

use crate::alerts::types::Alert;
use crate::error::Result;
use crate::store::Severity;
use chrono::{DateTime, Utc};
use minijinja::Environment;
use minijinja::value::Value;

/// Default Slack message: severity emoji, backtick-quoted identity, and an
/// optional suggested-fix block.
pub const DEFAULT_SLACK_TEMPLATE: &str = "\
{{ severity_emoji }} *{{ title }}*
Job: `{{ namespace }}/{{ cronjob }}`
{{ message }}
{%- if suggested_fix %}
Suggested fix: {{ suggested_fix }}
{%- endif %}";

/// Default webhook payload: key/type/severity/title/message/identity/
/// timestamp plus the failure context.
pub const DEFAULT_WEBHOOK_TEMPLATE: &str = r#"{
  "key": "{{ key | json_escape }}",
  "type": "{{ type }}",
  "severity": "{{ severity }}",
  "title": "{{ title | json_escape }}",
  "message": "{{ message | json_escape }}",
  "namespace": "{{ namespace }}",
  "cronjob": "{{ cronjob }}",
  "monitor": "{{ monitor }}",
  "timestamp": "{{ timestamp }}",
  "context": {
    "exit_code": "{{ exit_code }}",
    "reason": "{{ reason | json_escape }}",
    "suggested_fix": "{{ suggested_fix | json_escape }}",
    "success_rate": "{{ success_rate }}"
  }
}"#;

pub const DEFAULT_EMAIL_SUBJECT: &str = "[{{ severity | upper }}] {{ title }}";

pub const DEFAULT_EMAIL_BODY: &str = "\
{{ title }}

Job:      {{ namespace }}/{{ cronjob }}
Severity: {{ severity }}
Time:     {{ timestamp | format_time('RFC3339') }}

{{ message }}
{%- if suggested_fix %}

Suggested fix: {{ suggested_fix }}
{%- endif %}
{%- if logs %}

Last logs:
{{ logs | truncate(2000) }}
{%- endif %}";

/// Build the shared template environment.
pub fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_filter("truncate", truncate);
    env.add_filter("humanize_duration", humanize_duration);
    env.add_filter("format_time", format_time);
    env.add_filter("json_escape", json_escape);
    env
}

/// Parse-check an untrusted template without rendering it.
pub fn validate(source: &str) -> Result<()> {
    // A throwaway environment; parse errors do not depend on filters.
    let env = Environment::new();
    env.template_from_str(source)?;
    Ok(())
}

/// Render a template against one alert.
pub fn render(env: &Environment<'_>, name: &str, source: &str, alert: &Alert) -> Result<String> {
    let rendered = env.render_named_str(name, source, alert_context(alert))?;
    Ok(rendered)
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🔴",
        Severity::Warning => "🟡",
        Severity::Info => "🔵",
    }
}

/// The template vocabulary exposed to channel templates. Built through
/// serde so "type" can be a key despite being a Rust keyword.
fn alert_context(alert: &Alert) -> Value {
    Value::from_serialize(&serde_json::json!({
        "key": alert.key,
        "type": alert.alert_type.as_str(),
        "severity": alert.severity.as_str(),
        "severity_emoji": severity_emoji(alert.severity),
        "title": alert.title,
        "message": alert.message,
        "namespace": alert.namespace,
        "cronjob": alert.cronjob_name,
        "monitor": alert.monitor_name,
        "timestamp": alert.timestamp.to_rfc3339(),
        "logs": alert.context.logs,
        "events": alert.context.events,
        "pod_status": alert.context.pod_status,
        "suggested_fix": alert.context.suggested_fix,
        "success_rate": alert.context.success_rate,
        "last_duration_secs": alert.context.last_duration_secs,
        "exit_code": alert.context.exit_code,
        "reason": alert.context.reason,
    }))
}

fn truncate(value: String, length: usize) -> String {
    if value.chars().count() <= length {
        return value;
    }
    let mut out: String = value.chars().take(length).collect();
    out.push_str("...");
    out
}

/// "45s", "3m 20s", "2h 05m".
fn humanize_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Format an RFC3339 timestamp (or unix seconds) with a chrono format
/// string; the literal "RFC3339" is shorthand for the canonical form.
fn format_time(value: Value, format: &str) -> String {
    let parsed: Option<DateTime<Utc>> = if let Some(raw) = value.as_str() {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    } else {
        value
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    };

    match parsed {
        Some(time) if format == "RFC3339" => time.to_rfc3339(),
        Some(time) => time.format(format).to_string(),
        None => value.to_string(),
    }
}

/// Escape a string for embedding inside a JSON string literal. Absent
/// values escape to the empty string so optional context fields stay
/// usable in JSON templates.
fn json_escape(value: Option<String>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let quoted = serde_json::to_string(&value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AlertType;
    use minijinja::context;

    fn sample_alert() -> Alert {
        let mut alert = Alert::test("slack-main");
        alert.alert_type = AlertType::JobFailed;
        alert.severity = Severity::Critical;
        alert.title = "Job failed: data/nightly-etl".into();
        alert.message = "exit code 137".into();
        alert.namespace = "data".into();
        alert.cronjob_name = "nightly-etl".into();
        alert.context.suggested_fix = Some("Raise the memory limit.".into());
        alert.context.exit_code = Some(137);
        alert
    }

    #[test]
    fn default_slack_template_renders() {
        let env = environment();
        let out = render(&env, "slack", DEFAULT_SLACK_TEMPLATE, &sample_alert()).unwrap();
        assert!(out.contains("🔴"));
        assert!(out.contains("`data/nightly-etl`"));
        assert!(out.contains("Suggested fix: Raise the memory limit."));
    }

    #[test]
    fn default_webhook_template_is_valid_json() {
        let env = environment();
        let out = render(&env, "webhook", DEFAULT_WEBHOOK_TEMPLATE, &sample_alert()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        assert_eq!(parsed["type"], "JobFailed");
        assert_eq!(parsed["severity"], "critical");
    }

    #[test]
    fn json_escape_handles_quotes_and_newlines() {
        let env = environment();
        let mut alert = sample_alert();
        alert.message = "line one\nwith \"quotes\"".into();
        let out = render(&env, "webhook", DEFAULT_WEBHOOK_TEMPLATE, &alert).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
        assert_eq!(parsed["message"], "line one\nwith \"quotes\"");
    }

    #[test]
    fn truncate_filter() {
        let env = environment();
        let out = env
            .render_named_str("t", "{{ s | truncate(5) }}", context! { s => "abcdefgh" })
            .unwrap();
        assert_eq!(out, "abcde...");
    }

    #[test]
    fn humanize_duration_filter() {
        assert_eq!(humanize_duration(42.0), "42s");
        assert_eq!(humanize_duration(200.0), "3m 20s");
        assert_eq!(humanize_duration(7500.0), "2h 05m");
    }

    #[test]
    fn format_time_rfc3339_shorthand() {
        let env = environment();
        let out = env
            .render_named_str(
                "t",
                "{{ ts | format_time('RFC3339') }}",
                context! { ts => "2026-03-01T10:00:00Z" },
            )
            .unwrap();
        assert!(out.starts_with("2026-03-01T10:00:00"));
    }

    #[test]
    fn invalid_template_fails_validation() {
        assert!(validate("{{ unclosed").is_err());
        assert!(validate(DEFAULT_SLACK_TEMPLATE).is_ok());
        assert!(validate(DEFAULT_WEBHOOK_TEMPLATE).is_ok());
        assert!(validate(DEFAULT_EMAIL_SUBJECT).is_ok());
        assert!(validate(DEFAULT_EMAIL_BODY).is_ok());
    }
}
