//! Outbound email for billing side effects.

use crate::config::SmtpConfig;
use crate::models::{format_amount, Invoice, TenantProfile};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email configuration error: {0}")]
    Configuration(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("email send failed: {0}")]
    SendFailed(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError>;
}

pub struct SmtpEmailSender {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Result<Self, EmailError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| EmailError::Configuration(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError> {
        let Some(transport) = self.transport.as_ref() else {
            tracing::info!(to = %to, subject = %subject, "SMTP disabled, email not sent");
            return Ok(());
        };

        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| EmailError::Configuration(format!("Invalid from address: {}", e)))?;
        let recipient: Mailbox = to
            .parse()
            .map_err(|e| EmailError::InvalidRecipient(format!("{}: {}", to, e)))?;

        let message = Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| EmailError::SendFailed(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| EmailError::SendFailed(e.to_string()))?;

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Records messages instead of delivering them.
#[derive(Default)]
pub struct MockEmailSender {
    send_count: AtomicU64,
    sent: Mutex<Vec<SentEmail>>,
}

impl MockEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentEmail {
                to: to.to_string(),
                subject: subject.to_string(),
                html: html.to_string(),
            });
        }
        Ok(())
    }
}

pub fn payment_confirmation(brand: &str, invoice: &Invoice, tenant: &TenantProfile) -> (String, String) {
    let subject = format!("{}: Zahlung erhalten ({})", brand, invoice.invoice_number);
    let html = format!(
        "<p>Hallo {},</p>\
         <p>wir haben Ihre Zahlung über {} {} für die Rechnung {} ({}) erhalten.</p>\
         <p>Vielen Dank für Ihr Vertrauen!</p>\
         <p>Ihr {} Team</p>",
        tenant.display_name(),
        format_amount(invoice.amount),
        invoice.currency,
        invoice.invoice_number,
        invoice.period.key(),
        brand,
    );
    (subject, html)
}

pub fn payment_failed(brand: &str, invoice: &Invoice, tenant: &TenantProfile, reason: &str) -> (String, String) {
    let subject = format!("{}: Zahlung fehlgeschlagen ({})", brand, invoice.invoice_number);
    let html = format!(
        "<p>Hallo {},</p>\
         <p>die Zahlung über {} {} für die Rechnung {} konnte nicht durchgeführt werden ({}).</p>\
         <p>Bitte prüfen Sie Ihre hinterlegte Zahlungsmethode.</p>\
         <p>Ihr {} Team</p>",
        tenant.display_name(),
        format_amount(invoice.amount),
        invoice.currency,
        invoice.invoice_number,
        reason,
        brand,
    );
    (subject, html)
}
