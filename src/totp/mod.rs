//! Time-based one-time password verification and enrollment.

pub mod crypto;
pub mod repo;

use anyhow::{Context, Result, anyhow};
use sqlx::PgPool;
use std::time::{SystemTime, UNIX_EPOCH};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;

use repo::{TotpConfigurationRow, TotpRepo};

#[derive(Clone, Debug)]
pub struct TotpConfig {
    issuer: String,
    digits: usize,
    period: u64,
    /// Accepted clock skew in steps on either side.
    skew: u8,
}

impl TotpConfig {
    #[must_use]
    pub fn new(issuer: String) -> Self {
        Self {
            issuer,
            digits: 6,
            period: 30,
            skew: 1,
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

/// The key pieces returned by enrollment; the caller renders them as a QR
/// code client-side.
#[derive(Clone, Debug)]
pub struct TotpEnrollment {
    pub base32_secret: String,
    pub otpauth_url: String,
}

#[derive(Clone)]
pub struct TotpService {
    config: TotpConfig,
    key: [u8; 32],
    pool: PgPool,
}

impl TotpService {
    #[must_use]
    pub fn new(config: TotpConfig, key: [u8; 32], pool: PgPool) -> Self {
        Self { config, key, pool }
    }

    /// Generate and store a fresh secret for `username`, replacing any
    /// previous enrollment.
    ///
    /// # Errors
    /// Returns an error when secret generation, sealing, or storage fails.
    pub async fn register(&self, username: &str) -> Result<TotpEnrollment> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|err| anyhow!("TOTP secret generation failed: {err:?}"))?;

        let sealed = crypto::encrypt_secret(&self.key, &secret_bytes, username)?;

        let row = TotpConfigurationRow {
            username: username.to_string(),
            issuer: self.config.issuer.clone(),
            algorithm: "SHA1".to_string(),
            digits: i32::try_from(self.config.digits).unwrap_or(6),
            period: i32::try_from(self.config.period).unwrap_or(30),
            secret: sealed,
        };
        TotpRepo::save(&self.pool, &row).await?;

        let totp = build_totp(&row, secret_bytes)?;

        Ok(TotpEnrollment {
            base32_secret: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        })
    }

    /// Verify a submitted code with the configured skew and consume its time
    /// step, so the same `(secret, code, window)` tuple cannot be replayed.
    ///
    /// # Errors
    /// Returns an error on storage or decryption failures; a wrong, reused,
    /// or unenrolled code is `Ok(false)`.
    pub async fn verify(&self, username: &str, code: &str) -> Result<bool> {
        let Some(row) = TotpRepo::load(&self.pool, username).await? else {
            debug!(username, "TOTP verification without enrollment");
            return Ok(false);
        };

        let secret = crypto::decrypt_secret(&self.key, &row.secret, username)?;
        let totp = build_totp(&row, secret)?;
        let period = i64::from(row.period.max(1));

        let now = i64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("clock before epoch")?
                .as_secs(),
        )
        .context("clock out of range")?;

        let skew = i64::from(self.config.skew);
        for offset in -skew..=skew {
            let time = now + offset * period;
            if time < 0 {
                continue;
            }
            #[allow(clippy::cast_sign_loss)]
            if totp.generate(time as u64) != code {
                continue;
            }

            // Matching code: consume its step or treat the reuse as invalid.
            let step = time / period;
            return TotpRepo::consume_step(&self.pool, username, step).await;
        }

        Ok(false)
    }
}

fn build_totp(row: &TotpConfigurationRow, secret: Vec<u8>) -> Result<TOTP> {
    let algorithm = match row.algorithm.as_str() {
        "SHA1" => Algorithm::SHA1,
        "SHA256" => Algorithm::SHA256,
        "SHA512" => Algorithm::SHA512,
        other => return Err(anyhow!("unsupported TOTP algorithm: {other}")),
    };

    TOTP::new(
        algorithm,
        usize::try_from(row.digits).context("invalid digit count")?,
        1,
        u64::try_from(row.period).context("invalid period")?,
        secret,
        Some(row.issuer.clone()),
        row.username.clone(),
    )
    .map_err(|err| anyhow!("TOTP construction failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(secret: Vec<u8>) -> TotpConfigurationRow {
        TotpConfigurationRow {
            username: "john".to_string(),
            issuer: "Gardisto".to_string(),
            algorithm: "SHA1".to_string(),
            digits: 6,
            period: 30,
            secret,
        }
    }

    #[test]
    fn build_totp_accepts_known_algorithms() {
        let secret = Secret::generate_secret().to_bytes().expect("secret");
        let totp = build_totp(&row(secret), Secret::generate_secret().to_bytes().expect("secret"));
        assert!(totp.is_ok());
    }

    #[test]
    fn build_totp_rejects_unknown_algorithm() {
        let mut config = row(Vec::new());
        config.algorithm = "MD5".to_string();
        let secret = Secret::generate_secret().to_bytes().expect("secret");
        assert!(build_totp(&config, secret).is_err());
    }

    #[test]
    fn generated_codes_verify_within_skew() {
        let secret = Secret::generate_secret().to_bytes().expect("secret");
        let totp = build_totp(&row(secret.clone()), secret).expect("totp");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs();

        // A code from the previous step still matches one of the three
        // windows the verifier probes.
        let stale = totp.generate(now - 30);
        let candidates = [totp.generate(now - 30), totp.generate(now), totp.generate(now + 30)];
        assert!(candidates.contains(&stale));

        // A code from two steps ago does not.
        let too_old = totp.generate(now - 90);
        assert!(!candidates.contains(&too_old));
    }

    #[test]
    fn otpauth_url_mentions_issuer_and_account() {
        let secret = Secret::generate_secret().to_bytes().expect("secret");
        let totp = build_totp(&row(secret), Secret::generate_secret().to_bytes().expect("secret"));
        let url = totp.expect("totp").get_url();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("Gardisto"));
        assert!(url.contains("john"));
    }
}
