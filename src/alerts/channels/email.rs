//! SMTP email channel.

use crate::alerts::channels::{Channel, SmtpSettings};
use crate::alerts::template;
use crate::alerts::types::Alert;
use crate::crd::ChannelType;
use crate::error::{Error, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::Environment;

pub struct EmailChannel {
    name: String,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject_template: String,
    body_template: String,
    env: Environment<'static>,
}

impl EmailChannel {
    pub fn new(
        name: &str,
        smtp: SmtpSettings,
        from: &str,
        recipients: &[String],
        subject_template: Option<String>,
        body_template: Option<String>,
    ) -> Result<Self> {
        if from.is_empty() {
            return Err(Error::Validation("email channel requires a from address".into()));
        }
        if recipients.is_empty() {
            return Err(Error::Validation("email channel requires at least one recipient".into()));
        }

        let from: Mailbox = from.parse()?;
        let recipients = recipients
            .iter()
            .map(|addr| addr.parse::<Mailbox>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let subject_template =
            subject_template.unwrap_or_else(|| template::DEFAULT_EMAIL_SUBJECT.to_string());
        let body_template =
            body_template.unwrap_or_else(|| template::DEFAULT_EMAIL_BODY.to_string());
        template::validate(&subject_template)?;
        template::validate(&body_template)?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.username, smtp.password))
            .authentication(vec![Mechanism::Plain])
            .build();

        Ok(Self {
            name: name.to_string(),
            mailer,
            from,
            recipients,
            subject_template,
            body_template,
            env: template::environment(),
        })
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let subject = template::render(&self.env, "subject", &self.subject_template, alert)?;
        let body = template::render(&self.env, "body", &self.body_template, alert)?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let message = builder.body(body)?;

        self.mailer.send(message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.invalid".into(),
            port: 587,
            username: "guardian".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn requires_from_and_recipients() {
        let result = EmailChannel::new("mail", smtp(), "", &["ops@example.com".into()], None, None);
        assert!(result.is_err());

        let result = EmailChannel::new("mail", smtp(), "guardian@example.com", &[], None, None);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_addresses() {
        let result = EmailChannel::new(
            "mail",
            smtp(),
            "guardian@example.com",
            &["not an address".into()],
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn builds_with_default_templates() {
        let channel = EmailChannel::new(
            "mail",
            smtp(),
            "guardian@example.com",
            &["ops@example.com".into()],
            None,
            None,
        )
        .unwrap();
        assert_eq!(channel.name(), "mail");
        assert_eq!(channel.kind(), ChannelType::Email);
    }
}
