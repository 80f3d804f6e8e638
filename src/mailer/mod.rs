//! Transactional email.
//!
//! A [`Mailer`] renders [`EmailMessage`]s through the [`Renderer`] and hands the result to
//! a [`MailTransport`]. The transport decides how to deliver (SMTP, log) and returns
//! `Ok`/`Err`; the mailer never logs message bodies.
//!
//! Templates live in the mail filesystem as `templates/<name>.html|.txt`, wrapped by
//! `layouts/<layout>.html|.txt`. The `t` template function translates through the
//! mailer's i18n bundle for the message locale.

pub mod preview;
pub mod render;
pub mod smtp;

pub use preview::PreviewMailer;
pub use render::{FuncMap, RenderOptions, Rendered, Renderer};
pub use smtp::SmtpTransport;

use crate::{
    error::{Error, Result},
    fs::SharedFs,
    i18n::Bundle,
};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::{Instrument, info, info_span};

pub const DEFAULT_LAYOUT: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            body,
        }
    }
}

/// A message before rendering.
#[derive(Clone, Debug, Default)]
pub struct EmailMessage {
    /// Overrides the mailer default sender.
    pub from: Option<String>,
    /// SMTP `MAIL FROM`; defaults to the header sender.
    pub envelope_from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub template: String,
    pub data: serde_json::Value,
    /// Synthesised as `<ulid@domain>` when absent.
    pub message_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub locale: Option<String>,
    pub layout: Option<String>,
}

impl EmailMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            template: template.into(),
            data: serde_json::Value::Object(serde_json::Map::new()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_envelope_from(mut self, envelope_from: impl Into<String>) -> Self {
        self.envelope_from = Some(envelope_from.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = Some(layout.into());
        self
    }
}

/// A rendered message ready for delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub envelope_from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub message_id: String,
    pub html: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// Delivery abstraction used by the mailer.
#[async_trait]
pub trait MailTransport: Send + Sync + fmt::Debug {
    /// Deliver every message over one connection, stopping at the first failure.
    async fn deliver(&self, emails: &[OutgoingEmail]) -> Result<()>;
}

/// Local dev transport that logs envelopes instead of sending real email.
#[derive(Clone, Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn deliver(&self, emails: &[OutgoingEmail]) -> Result<()> {
        for email in emails {
            info!(
                to = %email.to.join(", "),
                subject = %email.subject,
                message_id = %email.message_id,
                attachments = email.attachments.len(),
                "email send stub"
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MailerConfig {
    from: String,
    default_layout: String,
    message_id_domain: Option<String>,
}

impl MailerConfig {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            default_layout: DEFAULT_LAYOUT.to_string(),
            message_id_domain: None,
        }
    }

    #[must_use]
    pub fn with_default_layout(mut self, layout: impl Into<String>) -> Self {
        self.default_layout = layout.into();
        self
    }

    #[must_use]
    pub fn with_message_id_domain(mut self, domain: impl Into<String>) -> Self {
        self.message_id_domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn default_layout(&self) -> &str {
        &self.default_layout
    }

    /// Explicit domain, else the sender's domain, else `localhost`.
    #[must_use]
    pub fn message_id_domain(&self) -> String {
        self.message_id_domain.clone().unwrap_or_else(|| {
            self.from
                .trim_end_matches('>')
                .rsplit_once('@')
                .map_or_else(|| "localhost".to_string(), |(_, domain)| domain.to_string())
        })
    }
}

#[derive(Clone, Debug)]
pub struct Mailer {
    config: MailerConfig,
    renderer: Renderer,
    transport: Arc<dyn MailTransport>,
    bundle: Option<Arc<Bundle>>,
}

impl Mailer {
    pub fn new(config: MailerConfig, templates: SharedFs, transport: Arc<dyn MailTransport>) -> Self {
        let renderer = Renderer::new(templates, config.default_layout());
        Self {
            config,
            renderer,
            transport,
            bundle: None,
        }
    }

    #[must_use]
    pub fn with_bundle(mut self, bundle: Arc<Bundle>) -> Self {
        self.bundle = Some(bundle);
        self
    }

    /// Extra template functions available to every render.
    #[must_use]
    pub fn with_funcs(mut self, funcs: FuncMap) -> Self {
        self.renderer = self.renderer.with_funcs(funcs);
        self
    }

    #[must_use]
    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    /// Render `message` without sending it.
    pub fn render(&self, message: &EmailMessage) -> Result<OutgoingEmail> {
        if message.to.iter().all(|to| to.trim().is_empty()) {
            return Err(Error::validation("email has no recipients"));
        }
        let mut options = RenderOptions::default();
        if let Some(layout) = &message.layout {
            options = options.with_layout(layout.clone());
        }
        if let Some(bundle) = &self.bundle {
            let locales: Vec<&str> = message.locale.as_deref().into_iter().collect();
            options = options.with_localizer(bundle.localizer(&locales));
        }
        let rendered = self.renderer.render(&message.template, &message.data, &options)?;

        Ok(OutgoingEmail {
            from: message.from.clone().unwrap_or_else(|| self.config.from().to_string()),
            envelope_from: message.envelope_from.clone(),
            to: message
                .to
                .iter()
                .filter(|to| !to.trim().is_empty())
                .cloned()
                .collect(),
            subject: message.subject.clone(),
            message_id: message
                .message_id
                .clone()
                .unwrap_or_else(|| synthesize_message_id(&self.config.message_id_domain())),
            html: rendered.html,
            text: rendered.text,
            attachments: message.attachments.clone(),
        })
    }

    /// Render and deliver one message; returns its message id.
    pub async fn send(&self, message: &EmailMessage) -> Result<String> {
        let email = self.render(message)?;
        let span = info_span!("mailer.send", template = %message.template);
        self.transport
            .deliver(std::slice::from_ref(&email))
            .instrument(span)
            .await?;
        info!(
            to = %email.to.join(", "),
            subject = %email.subject,
            template = %message.template,
            message_id = %email.message_id,
            "email sent"
        );
        Ok(email.message_id)
    }

    /// Render every message first, then deliver them over one transport session.
    pub async fn bulk_send(&self, messages: &[EmailMessage]) -> Result<Vec<String>> {
        if messages.is_empty() {
            return Err(Error::validation("bulk send needs at least one message"));
        }
        let emails = messages
            .iter()
            .map(|message| self.render(message))
            .collect::<Result<Vec<_>>>()?;
        let span = info_span!("mailer.bulk_send", count = emails.len());
        self.transport.deliver(&emails).instrument(span).await?;
        info!(count = emails.len(), "bulk email sent");
        Ok(emails.into_iter().map(|email| email.message_id).collect())
    }
}

#[must_use]
pub fn synthesize_message_id(domain: &str) -> String {
    format!("<{}@{domain}>", ulid::Ulid::new())
}
