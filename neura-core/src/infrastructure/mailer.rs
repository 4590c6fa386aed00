// neura-core/src/infrastructure/mailer.rs

// SMTP mailer over lettre. Delivery failures are reported as `false`, not as
// errors: a missing DOCX or an unreachable relay must never fail the report
// run itself.

use crate::error::NeuraError;
use crate::infrastructure::config::SmtpConfig;
use crate::infrastructure::error::InfrastructureError;
use crate::ports::mailer::{Mailer, OutboundEmail};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    #[allow(clippy::expect_used)]
    fn content_type_for(path: &std::path::Path) -> ContentType {
        let fallback = ContentType::parse("application/octet-stream");
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("pdf") => ContentType::parse("application/pdf"),
            Some("html") => ContentType::parse("text/html"),
            Some("docx") => ContentType::parse(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ),
            Some("xlsx") => ContentType::parse(
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ),
            _ => ContentType::parse("application/octet-stream"),
        };
        parsed.or(fallback).expect("static content types parse")
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<Message, NeuraError> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|e| NeuraError::Infrastructure(InfrastructureError::Mail(format!("bad sender: {e}"))))?;

        let mut builder = Message::builder().from(from).subject(email.subject.clone());
        for recipient in &email.recipients {
            let mailbox: Mailbox = recipient.parse().map_err(|e| {
                NeuraError::Infrastructure(InfrastructureError::Mail(format!(
                    "bad recipient '{recipient}': {e}"
                )))
            })?;
            builder = builder.to(mailbox);
        }

        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(email.body.clone()));
        for path in &email.attachments {
            let bytes = std::fs::read(path)?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "attachment.bin".to_string());
            multipart = multipart
                .singlepart(Attachment::new(filename).body(bytes, Self::content_type_for(path)));
        }

        builder
            .multipart(multipart)
            .map_err(|e| NeuraError::Infrastructure(InfrastructureError::Mail(e.to_string())))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<bool, NeuraError> {
        if email.recipients.is_empty() {
            return Ok(false);
        }
        let message = self.build_message(email)?;
        let config = self.config.clone();

        let sent = tokio::task::spawn_blocking(move || {
            let relay = SmtpTransport::relay(&config.host);
            let mut transport = match relay {
                Ok(builder) => builder,
                Err(err) => {
                    warn!(host = %config.host, error = %err, "smtp relay setup failed");
                    return false;
                }
            };
            if let (Some(user), Some(pass)) = (config.username.clone(), config.password.clone()) {
                transport = transport.credentials(Credentials::new(user, pass));
            }
            match transport.build().send(&message) {
                Ok(_) => true,
                Err(err) => {
                    warn!(host = %config.host, error = %err, "email delivery failed");
                    false
                }
            }
        })
        .await
        .map_err(|e| NeuraError::InternalError(format!("mailer task join: {e}")))?;

        if sent {
            info!(recipients = email.recipients.len(), "notification email sent");
        }
        Ok(sent)
    }
}

/// Stand-in used when no SMTP relay is configured: every send reports
/// failure so callers record the email step as skipped.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<bool, NeuraError> {
        warn!(
            recipients = email.recipients.len(),
            "email requested but no SMTP transport is configured"
        );
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mailer() -> SmtpMailer {
        SmtpMailer::new(SmtpConfig {
            host: "smtp.example.invalid".into(),
            username: None,
            password: None,
            from: "reports@neurareport.local".into(),
        })
    }

    #[test]
    fn test_build_message_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("filled_1.pdf");
        std::fs::write(&pdf, b"%PDF-1.4 fake").unwrap();

        let email = OutboundEmail {
            recipients: vec!["ops@example.com".into()],
            subject: "Report run for Monthly".into(),
            body: "Artifacts attached.".into(),
            attachments: vec![pdf],
        };
        let message = mailer().build_message(&email).unwrap();
        let encoded = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(encoded.contains("filled_1.pdf"));
        assert!(encoded.contains("Report run for Monthly"));
    }

    #[test]
    fn test_bad_recipient_is_an_error() {
        let email = OutboundEmail {
            recipients: vec!["not-an-address".into()],
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![],
        };
        assert!(mailer().build_message(&email).is_err());
    }

    #[tokio::test]
    async fn test_send_without_recipients_is_noop() {
        let email = OutboundEmail {
            recipients: vec![],
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![],
        };
        assert!(!mailer().send(&email).await.unwrap());
    }
}
