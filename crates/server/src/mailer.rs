//! Outbound mail for one-time codes

use crate::auth::otp::OtpPurpose;
use crate::config::SmtpConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use tracing::info;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> Result<()>;
}

fn otp_subject(purpose: OtpPurpose) -> &'static str {
    match purpose {
        OtpPurpose::VerifyEmail => "Your verification code",
        OtpPurpose::ResetPassword => "Your password reset code",
    }
}

fn otp_body(code: &str, purpose: OtpPurpose) -> String {
    let action = match purpose {
        OtpPurpose::VerifyEmail => "verify your email address",
        OtpPurpose::ResetPassword => "reset your password",
    };
    format!(
        "Hello!\n\nUse this code to {}: {}\n\nIf you didn't request this, you can ignore this email.\n",
        action, code
    )
}

/// SMTP relay via lettre
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .with_context(|| format!("Invalid SMTP host {}", config.host))?
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        if let Some(port) = config.port {
            builder = builder.port(port);
        }

        let from = config
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("Invalid FROM address {}", config.from))?;

        info!("[Mail] SMTP relay {} as {}", config.host, config.from);

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> Result<()> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(to.parse().context("Invalid TO address")?)
            .subject(otp_subject(purpose))
            .header(ContentType::TEXT_PLAIN)
            .body(otp_body(code, purpose))
            .context("Failed to build email")?;

        self.transport
            .send(email)
            .await
            .context("SMTP send failed")?;

        info!("[Mail] Sent {} code to {}", purpose.as_str(), to);
        Ok(())
    }
}

/// Writes codes to the log instead of sending them
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> Result<()> {
        info!("[Mail] {} code for {}: {}", purpose.as_str(), to, code);
        Ok(())
    }
}

/// Keeps sent codes in memory; handy for tests and local tooling
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<(String, String, OtpPurpose)>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent code sent to `to` for `purpose`
    pub fn last_code(&self, to: &str, purpose: OtpPurpose) -> Option<String> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(addr, _, p)| addr == to && *p == purpose)
            .map(|(_, code, _)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> Result<()> {
        self.sent
            .lock()
            .push((to.to_string(), code.to_string(), purpose));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_contains_code() {
        let body = otp_body("123456", OtpPurpose::ResetPassword);
        assert!(body.contains("123456"));
        assert!(body.contains("reset your password"));
    }

    #[tokio::test]
    async fn test_memory_mailer_keeps_latest() {
        let mailer = MemoryMailer::new();
        mailer.send_otp("a@x.io", "111111", OtpPurpose::VerifyEmail).await.unwrap();
        mailer.send_otp("a@x.io", "222222", OtpPurpose::VerifyEmail).await.unwrap();
        assert_eq!(
            mailer.last_code("a@x.io", OtpPurpose::VerifyEmail).as_deref(),
            Some("222222")
        );
        assert_eq!(mailer.last_code("a@x.io", OtpPurpose::ResetPassword), None);
        assert_eq!(mailer.sent_count(), 2);
    }
}
