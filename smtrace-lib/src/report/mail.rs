use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::debug;

use crate::config::{MailConfig, Security};
use crate::{Error, Result};

/// A file attached to a [MailMessage].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A report mail, independent of how it is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl MailMessage {
    /// Address a message according to `config`. The subject is the configured
    /// prefix followed by `identifier`.
    #[must_use]
    pub fn new(config: &MailConfig, identifier: &str, body: String) -> Self {
        MailMessage {
            from: config.from.clone(),
            to: split_addresses(&config.to),
            cc: config.cc.as_deref().map(split_addresses).unwrap_or_default(),
            subject: Some(format!(
                "{}{identifier}",
                config.subject_prefix.as_deref().unwrap_or_default()
            )),
            body,
            attachments: Vec::default(),
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

fn split_addresses(list: &str) -> Vec<String> {
    list.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Delivers report mails.
pub trait Mailer: Send + Sync {
    /// # Errors
    /// If the message cannot be built or delivered.
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Creates the [Mailer] for a handler's mail settings.
pub type MailerFactory = Arc<dyn Fn(&MailConfig) -> Arc<dyn Mailer> + Send + Sync>;

/// [MailerFactory] producing [SmtpMailer]s.
#[must_use]
pub fn smtp_mailers() -> MailerFactory {
    Arc::new(|config: &MailConfig| Arc::new(SmtpMailer::new(config.clone())) as Arc<dyn Mailer>)
}

/// Sends mail over SMTP, connecting once per message.
///
/// STARTTLS and login are only used when security is `starttls` and exactly two
/// credentials are configured. Otherwise the connection is plain.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    config: MailConfig,
}

impl SmtpMailer {
    #[must_use]
    pub fn new(config: MailConfig) -> Self {
        SmtpMailer { config }
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let cfg = &self.config;
        let transport = match (cfg.security, cfg.auth.as_slice()) {
            (Security::Starttls, [user, password]) => SmtpTransport::starttls_relay(&cfg.server)?
                .port(cfg.port)
                .credentials(Credentials::new(user.clone(), password.clone()))
                .build(),
            _ => SmtpTransport::builder_dangerous(&cfg.server)
                .port(cfg.port)
                .build(),
        };
        Ok(transport)
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, message: &MailMessage) -> Result<()> {
        let email = build(message)?;
        debug!(server = %self.config.server, port = self.config.port, "sending mail");
        self.transport()?.send(&email)?;
        Ok(())
    }
}

fn build(message: &MailMessage) -> Result<Message> {
    let mut builder = Message::builder().from(message.from.parse::<Mailbox>()?);
    for to in &message.to {
        builder = builder.to(to.parse::<Mailbox>()?);
    }
    for cc in &message.cc {
        builder = builder.cc(cc.parse::<Mailbox>()?);
    }
    if let Some(subject) = &message.subject {
        builder = builder.subject(subject);
    }

    if message.attachments.is_empty() {
        return Ok(builder.body(message.body.clone())?);
    }
    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
    for attachment in &message.attachments {
        let content_type = ContentType::parse(&attachment.content_type).map_err(|err| {
            Error::Runtime(format!(
                "invalid content type {:?}: {err}",
                attachment.content_type
            ))
        })?;
        parts = parts.singlepart(
            MailAttachment::new(attachment.filename.clone())
                .body(attachment.data.clone(), content_type),
        );
    }
    Ok(builder.multipart(parts)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MailConfig {
        MailConfig {
            server: "localhost".to_string(),
            port: 25,
            security: Security::None,
            auth: vec![],
            from: "meter@example.com".to_string(),
            to: "me@example.com".to_string(),
            cc: Some("a@example.com;b@example.com;".to_string()),
            subject_prefix: Some("[smtrace] ".to_string()),
        }
    }

    #[test]
    fn message_addressing() {
        let msg = MailMessage::new(&config(), "basement / heat pump", "hello".to_string());
        assert_eq!(msg.to, vec!["me@example.com"]);
        assert_eq!(msg.cc, vec!["a@example.com", "b@example.com"]);
        assert_eq!(msg.subject.as_deref(), Some("[smtrace] basement / heat pump"));
    }

    #[test]
    fn subject_without_prefix() {
        let mut cfg = config();
        cfg.subject_prefix = None;
        let msg = MailMessage::new(&cfg, "basement", String::new());
        assert_eq!(msg.subject.as_deref(), Some("basement"));
    }

    #[test]
    fn build_plain_and_multipart() {
        let msg = MailMessage::new(&config(), "basement", "body text".to_string());
        let plain = String::from_utf8(build(&msg).unwrap().formatted()).unwrap();
        assert!(plain.contains("Subject: [smtrace] basement"));
        assert!(plain.contains("body text"));

        let msg = msg.with_attachment(Attachment {
            filename: "capture.pcapng".to_string(),
            content_type: "application/octet-stream".to_string(),
            data: vec![0x0a, 0x0d, 0x0d, 0x0a],
        });
        let multipart = String::from_utf8(build(&msg).unwrap().formatted()).unwrap();
        assert!(multipart.contains("multipart/mixed"));
        assert!(multipart.contains("capture.pcapng"));
    }

    #[test]
    fn invalid_address() {
        let mut cfg = config();
        cfg.from = "not an address".to_string();
        let msg = MailMessage::new(&cfg, "basement", String::new());
        assert!(matches!(build(&msg), Err(Error::Address(_))));
    }
}
