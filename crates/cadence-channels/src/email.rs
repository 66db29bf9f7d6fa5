//! SMTP mail sender — async lettre over STARTTLS.
//!
//! Every message gets a fresh `<uuid@domain>` Message-ID. Follow-ups carry
//! In-Reply-To/References to the previous step; the thread id is the
//! Message-ID of the first message in the thread.

use std::collections::HashMap;

use async_trait::async_trait;
use cadence_core::config::MailboxConfig;
use cadence_core::error::SendError;
use cadence_core::traits::MailSender;
use cadence_core::types::{Mailbox, OutgoingEmail, SentEmail};
use lettre::message::header::ContentType;
use lettre::message::Mailbox as Address;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Map an SMTP reply code onto the send taxonomy.
pub fn classify_reply(code: u16, detail: &str) -> SendError {
    let detail = format!("{code} {detail}");
    match code {
        // Temporary authentication failure (expired OAuth token).
        454 => SendError::TokenExpired,
        530 | 534 | 535 => SendError::CredentialRevoked(detail),
        421 | 450 | 451 => SendError::RateLimited(detail),
        400..=499 => SendError::Transient(detail),
        500..=599 => SendError::Permanent(detail),
        _ => SendError::Transient(detail),
    }
}

fn map_smtp_error(e: lettre::transport::smtp::Error) -> SendError {
    if let Some(code) = e.status()
        && let Ok(code) = code.to_string().parse::<u16>()
    {
        return classify_reply(code, &e.to_string());
    }
    if e.is_permanent() {
        SendError::Permanent(e.to_string())
    } else {
        // Connection, TLS and timeout failures.
        SendError::Transient(e.to_string())
    }
}

fn domain_of(email: &str) -> &str {
    email.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost")
}

/// New `uuid@domain` Message-ID, without brackets.
pub fn new_message_id(from_email: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), domain_of(from_email))
}

/// Build the RFC 5322 message. `message_id` is bare (no brackets).
pub fn build_message(
    account: &MailboxConfig,
    email: &OutgoingEmail,
    message_id: &str,
) -> std::result::Result<Message, SendError> {
    let from_name = account.display_name.as_deref().unwrap_or(&account.email);
    let from: Address = format!("{from_name} <{}>", account.email)
        .parse()
        .map_err(|e| SendError::CredentialRevoked(format!("Invalid from address: {e}")))?;
    let to: Address = match &email.to_name {
        Some(name) if !name.trim().is_empty() => format!("{name} <{}>", email.to),
        _ => email.to.clone(),
    }
    .parse()
    .map_err(|e| SendError::Permanent(format!("Invalid recipient '{}': {e}", email.to)))?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(&email.subject)
        .message_id(Some(format!("<{message_id}>")))
        .header(ContentType::TEXT_PLAIN);

    if let Some(parent) = &email.in_reply_to {
        let parent = format!("<{}>", parent.trim_matches(['<', '>']));
        builder = builder.in_reply_to(parent.clone());
        // Root first, then the direct parent.
        let references = match &email.thread_id {
            Some(root) if root.trim_matches(['<', '>']) != parent.trim_matches(['<', '>']) => {
                format!("<{}> {parent}", root.trim_matches(['<', '>']))
            }
            _ => parent,
        };
        builder = builder.references(references);
    }

    builder
        .body(email.body.clone())
        .map_err(|e| SendError::Permanent(format!("Build email: {e}")))
}

/// Sends through each mailbox's own SMTP relay.
pub struct SmtpMailer {
    accounts: HashMap<String, MailboxConfig>,
}

impl SmtpMailer {
    pub fn new(mailboxes: &[MailboxConfig]) -> Self {
        Self {
            accounts: mailboxes.iter().map(|m| (m.id.clone(), m.clone())).collect(),
        }
    }

    fn transport(account: &MailboxConfig) -> std::result::Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
        let creds = Credentials::new(account.login().to_string(), account.password.clone());
        Ok(AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.smtp_host)
            .map_err(|e| SendError::Transient(format!("SMTP relay: {e}")))?
            .port(account.smtp_port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mailbox: &Mailbox, email: &OutgoingEmail) -> std::result::Result<SentEmail, SendError> {
        let account = self.accounts.get(&mailbox.id).ok_or_else(|| {
            SendError::CredentialRevoked(format!("mailbox '{}' has no SMTP settings", mailbox.id))
        })?;
        let message_id = new_message_id(&account.email);
        let message = build_message(account, email, &message_id)?;

        Self::transport(account)?
            .send(message)
            .await
            .map_err(map_smtp_error)?;

        tracing::info!("📤 Email sent to: {}", email.to);
        Ok(SentEmail {
            thread_id: email
                .thread_id
                .clone()
                .unwrap_or_else(|| message_id.clone()),
            message_id,
        })
    }
}
