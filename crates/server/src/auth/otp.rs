//! One-time codes for email verification and password reset.
//!
//! Codes are six decimal digits. Only a SHA-256 digest is stored, keyed by
//! (email, purpose), so issuing a new code replaces the previous one.

use crate::error::{Error, Result};
use crate::models::{fmt_ts, parse_ts};
use chrono::{Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    VerifyEmail,
    ResetPassword,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::VerifyEmail => "verify_email",
            OtpPurpose::ResetPassword => "reset_password",
        }
    }
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..6).map(|_| rng.gen_range(0..10).to_string()).collect()
}

fn hash_code(email: &str, purpose: OtpPurpose, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(purpose.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(email.as_bytes());
    hasher.update(b":");
    hasher.update(code.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct OtpStore {
    pool: SqlitePool,
    ttl: Duration,
    cooldown: Duration,
    max_attempts: i64,
}

impl OtpStore {
    pub fn new(pool: SqlitePool, ttl_minutes: i64, cooldown_secs: i64, max_attempts: i64) -> Self {
        Self {
            pool,
            ttl: Duration::minutes(ttl_minutes),
            cooldown: Duration::seconds(cooldown_secs),
            max_attempts,
        }
    }

    /// Issue a fresh code, replacing any previous one
    pub async fn issue(&self, email: &str, purpose: OtpPurpose) -> Result<String> {
        let now = Utc::now();

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT created_at FROM otp_codes WHERE email = ? AND purpose = ?")
                .bind(email)
                .bind(purpose.as_str())
                .fetch_optional(&self.pool)
                .await?;

        if let Some((created_at,)) = existing {
            let elapsed = now - parse_ts(&created_at);
            if elapsed < self.cooldown {
                let wait = (self.cooldown - elapsed).num_seconds().max(1);
                return Err(Error::TooManyRequests(format!(
                    "Please wait {} seconds before requesting a new code",
                    wait
                )));
            }
        }

        let code = generate_code();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO otp_codes (email, purpose, code_hash, attempts, created_at, expires_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(email)
        .bind(purpose.as_str())
        .bind(hash_code(email, purpose, &code))
        .bind(fmt_ts(&now))
        .bind(fmt_ts(&(now + self.ttl)))
        .execute(&self.pool)
        .await?;

        debug!("[Otp] Issued {} code for {}", purpose.as_str(), email);
        Ok(code)
    }

    /// Check a code; a matching code is consumed
    pub async fn verify(&self, email: &str, purpose: OtpPurpose, code: &str) -> Result<()> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT code_hash, attempts, expires_at FROM otp_codes WHERE email = ? AND purpose = ?",
        )
        .bind(email)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let (code_hash, attempts, expires_at) = row.ok_or(Error::InvalidOtp)?;

        if parse_ts(&expires_at) <= Utc::now() {
            self.discard(email, purpose).await?;
            return Err(Error::InvalidOtp);
        }

        if attempts >= self.max_attempts {
            self.discard(email, purpose).await?;
            return Err(Error::TooManyRequests(
                "Too many attempts, request a new code".to_string(),
            ));
        }

        if hash_code(email, purpose, code) != code_hash {
            sqlx::query(
                "UPDATE otp_codes SET attempts = attempts + 1 WHERE email = ? AND purpose = ?",
            )
            .bind(email)
            .bind(purpose.as_str())
            .execute(&self.pool)
            .await?;
            warn!("[Otp] Wrong {} code for {}", purpose.as_str(), email);
            return Err(Error::InvalidOtp);
        }

        self.discard(email, purpose).await
    }

    pub async fn discard(&self, email: &str, purpose: OtpPurpose) -> Result<()> {
        sqlx::query("DELETE FROM otp_codes WHERE email = ? AND purpose = ?")
            .bind(email)
            .bind(purpose.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    #[test]
    fn test_generate_code_shape() {
        for _ in 0..20 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_issue_and_verify_consumes_code() {
        let store = OtpStore::new(memory_pool().await, 10, 0, 5);
        let code = store.issue("a@example.com", OtpPurpose::VerifyEmail).await.unwrap();

        store
            .verify("a@example.com", OtpPurpose::VerifyEmail, &code)
            .await
            .unwrap();

        let again = store.verify("a@example.com", OtpPurpose::VerifyEmail, &code).await;
        assert!(matches!(again, Err(Error::InvalidOtp)));
    }

    #[tokio::test]
    async fn test_purposes_are_separate() {
        let store = OtpStore::new(memory_pool().await, 10, 0, 5);
        let code = store.issue("a@example.com", OtpPurpose::VerifyEmail).await.unwrap();

        let wrong_purpose = store
            .verify("a@example.com", OtpPurpose::ResetPassword, &code)
            .await;
        assert!(matches!(wrong_purpose, Err(Error::InvalidOtp)));
    }

    #[tokio::test]
    async fn test_attempt_limit() {
        let store = OtpStore::new(memory_pool().await, 10, 0, 2);
        let code = store.issue("a@example.com", OtpPurpose::VerifyEmail).await.unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        for _ in 0..2 {
            let res = store.verify("a@example.com", OtpPurpose::VerifyEmail, wrong).await;
            assert!(matches!(res, Err(Error::InvalidOtp)));
        }

        // Even the right code is refused once the budget is spent.
        let res = store.verify("a@example.com", OtpPurpose::VerifyEmail, &code).await;
        assert!(matches!(res, Err(Error::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn test_resend_cooldown() {
        let store = OtpStore::new(memory_pool().await, 10, 60, 5);
        store.issue("a@example.com", OtpPurpose::VerifyEmail).await.unwrap();

        let res = store.issue("a@example.com", OtpPurpose::VerifyEmail).await;
        assert!(matches!(res, Err(Error::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let store = OtpStore::new(memory_pool().await, 0, 0, 5);
        let code = store.issue("a@example.com", OtpPurpose::VerifyEmail).await.unwrap();

        let res = store.verify("a@example.com", OtpPurpose::VerifyEmail, &code).await;
        assert!(matches!(res, Err(Error::InvalidOtp)));
    }
}
