//! Storage for per-user TOTP configurations.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;

/// One row of `totp_configurations`. The secret column holds the sealed
/// blob, never the raw seed.
#[derive(Clone, Debug)]
pub struct TotpConfigurationRow {
    pub username: String,
    pub issuer: String,
    pub algorithm: String,
    pub digits: i32,
    pub period: i32,
    pub secret: Vec<u8>,
}

pub struct TotpRepo;

impl TotpRepo {
    /// Load a user's TOTP configuration.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub async fn load(pool: &PgPool, username: &str) -> Result<Option<TotpConfigurationRow>> {
        let query = r"
            SELECT username, issuer, algorithm, digits, period, secret
            FROM totp_configurations
            WHERE username = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to load TOTP configuration")?;

        Ok(row.map(|row| TotpConfigurationRow {
            username: row.get("username"),
            issuer: row.get("issuer"),
            algorithm: row.get("algorithm"),
            digits: row.get("digits"),
            period: row.get("period"),
            secret: row.get("secret"),
        }))
    }

    /// Insert or replace a user's TOTP configuration. Replacement resets the
    /// consumed-step guard.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub async fn save(pool: &PgPool, row: &TotpConfigurationRow) -> Result<()> {
        let query = r"
            INSERT INTO totp_configurations (username, issuer, algorithm, digits, period, secret, last_used_step)
            VALUES ($1, $2, $3, $4, $5, $6, NULL)
            ON CONFLICT (username)
            DO UPDATE SET issuer = EXCLUDED.issuer,
                          algorithm = EXCLUDED.algorithm,
                          digits = EXCLUDED.digits,
                          period = EXCLUDED.period,
                          secret = EXCLUDED.secret,
                          last_used_step = NULL
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&row.username)
            .bind(&row.issuer)
            .bind(&row.algorithm)
            .bind(row.digits)
            .bind(row.period)
            .bind(&row.secret)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to save TOTP configuration")?;
        Ok(())
    }

    /// Consume a time step for replay protection. Returns `false` when the
    /// step (or a later one) was already used; the guard is a single
    /// conditional UPDATE so concurrent submissions admit one winner.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub async fn consume_step(pool: &PgPool, username: &str, step: i64) -> Result<bool> {
        let query = r"
            UPDATE totp_configurations
            SET last_used_step = $2
            WHERE username = $1
              AND (last_used_step IS NULL OR last_used_step < $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(username)
            .bind(step)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to consume TOTP step")?;

        Ok(result.rows_affected() == 1)
    }
}
