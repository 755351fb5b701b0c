//! Storage for registered WebAuthn security keys.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;

/// One row of `webauthn_devices`. `public_key` is the serialized credential
/// as produced by the ceremony library.
#[derive(Clone, Debug)]
pub struct WebauthnDeviceRow {
    pub username: String,
    pub kid: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
    pub aaguid: String,
    pub description: String,
}

pub struct WebauthnRepo;

impl WebauthnRepo {
    /// All keys registered by a user.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub async fn list_devices(pool: &PgPool, username: &str) -> Result<Vec<WebauthnDeviceRow>> {
        let query = r"
            SELECT username, kid, public_key, sign_count, aaguid, description
            FROM webauthn_devices
            WHERE username = $1
            ORDER BY description
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(username)
            .fetch_all(pool)
            .instrument(span)
            .await
            .context("failed to list WebAuthn devices")?;

        Ok(rows
            .iter()
            .map(|row| WebauthnDeviceRow {
                username: row.get("username"),
                kid: row.get("kid"),
                public_key: row.get("public_key"),
                sign_count: row.get("sign_count"),
                aaguid: row.get("aaguid"),
                description: row.get("description"),
            })
            .collect())
    }

    /// Register a new key.
    ///
    /// # Errors
    /// Returns an error when the insert fails (including duplicate kid).
    pub async fn save_device(pool: &PgPool, row: &WebauthnDeviceRow) -> Result<()> {
        let query = r"
            INSERT INTO webauthn_devices (username, kid, public_key, sign_count, aaguid, description)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&row.username)
            .bind(&row.kid)
            .bind(&row.public_key)
            .bind(row.sign_count)
            .bind(&row.aaguid)
            .bind(&row.description)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to save WebAuthn device")?;
        Ok(())
    }

    /// Bump the stored sign count, atomically. The guard refuses anything
    /// that does not strictly increase, except counter-less authenticators
    /// which stay at zero. Returns `false` when the guard refused.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub async fn bump_sign_count(
        pool: &PgPool,
        username: &str,
        kid: &[u8],
        new_count: i64,
    ) -> Result<bool> {
        let query = r"
            UPDATE webauthn_devices
            SET sign_count = $3
            WHERE username = $1
              AND kid = $2
              AND (sign_count < $3 OR ($3 = 0 AND sign_count = 0))
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(username)
            .bind(kid)
            .bind(new_count)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to bump WebAuthn sign count")?;

        Ok(result.rows_affected() == 1)
    }
}
