//! Failed-attempt regulation: sliding-window lockout per username.
//!
//! Attempts are appended to `authentication_attempts`; `regulate` reads only
//! the trailing window (`LIMIT max_retries ORDER BY time DESC`) so its cost
//! is bounded regardless of history size.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{Instrument, info};

/// Attempt-type labels recorded with every mark.
pub const AUTH_TYPE_1FA: &str = "1FA";
pub const AUTH_TYPE_TOTP: &str = "TOTP";
pub const AUTH_TYPE_WEBAUTHN: &str = "WebAuthn";
pub const AUTH_TYPE_DUO: &str = "Duo";

#[derive(Clone, Copy, Debug)]
pub struct RegulationConfig {
    max_retries: u32,
    find_time: Duration,
    ban_time: Duration,
}

impl RegulationConfig {
    /// Defaults: 3 retries inside 2 minutes, 5 minute ban.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            find_time: Duration::seconds(120),
            ban_time: Duration::seconds(300),
        }
    }

    /// `max_retries == 0` disables regulation entirely.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_find_time(mut self, find_time: Duration) -> Self {
        self.find_time = find_time;
        self
    }

    #[must_use]
    pub fn with_ban_time(mut self, ban_time: Duration) -> Self {
        self.ban_time = ban_time;
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regulation {
    Unrestricted,
    Banned { until: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum RegulationError {
    #[error("attempt storage failure")]
    Storage(#[source] anyhow::Error),
}

/// One row of the trailing attempt window.
#[derive(Clone, Copy, Debug)]
struct Attempt {
    successful: bool,
    time: DateTime<Utc>,
}

/// Decide from the trailing window whether the user is currently banned.
/// The window is newest-first. A success anywhere in the window clears it.
fn evaluate_window(
    attempts: &[Attempt],
    config: &RegulationConfig,
    now: DateTime<Utc>,
) -> Regulation {
    if config.max_retries == 0 || attempts.len() < config.max_retries as usize {
        return Regulation::Unrestricted;
    }

    if attempts.iter().any(|attempt| attempt.successful) {
        return Regulation::Unrestricted;
    }

    let until = attempts[0].time + config.ban_time;
    if until > now {
        Regulation::Banned { until }
    } else {
        Regulation::Unrestricted
    }
}

pub struct Regulator {
    config: RegulationConfig,
    pool: PgPool,
}

impl Regulator {
    #[must_use]
    pub fn new(config: RegulationConfig, pool: PgPool) -> Self {
        Self { config, pool }
    }

    /// Whether `username` may attempt to authenticate right now.
    ///
    /// # Errors
    /// Returns an error when the attempt store is unreachable; callers must
    /// fail closed.
    pub async fn regulate(&self, username: &str) -> Result<Regulation, RegulationError> {
        if self.config.max_retries == 0 {
            return Ok(Regulation::Unrestricted);
        }

        let query = r"
            SELECT successful, time
            FROM authentication_attempts
            WHERE username = $1
              AND time > NOW() - ($2 * INTERVAL '1 second')
            ORDER BY time DESC
            LIMIT $3
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(username)
            .bind(self.config.find_time.num_seconds())
            .bind(i64::from(self.config.max_retries))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| RegulationError::Storage(anyhow!(err).context("failed to read attempts")))?;

        let attempts: Vec<Attempt> = rows
            .iter()
            .map(|row| Attempt {
                successful: row.get("successful"),
                time: row.get("time"),
            })
            .collect();

        Ok(evaluate_window(&attempts, &self.config, Utc::now()))
    }

    /// Append an attempt record. Also the metric contract for sign-in
    /// outcomes.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub async fn mark(
        &self,
        username: &str,
        successful: bool,
        banned: bool,
        auth_type: &str,
        ip: &str,
    ) -> Result<(), RegulationError> {
        let query = r"
            INSERT INTO authentication_attempts (username, time, successful, auth_type, ip, banned)
            VALUES ($1, NOW(), $2, $3, $4, $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(username)
            .bind(successful)
            .bind(auth_type)
            .bind(ip)
            .bind(banned)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| RegulationError::Storage(anyhow!(err).context("failed to record attempt")))?;

        info!(
            username,
            successful,
            banned,
            auth_type,
            remote_ip = ip,
            "auth.attempt"
        );

        Ok(())
    }
}
