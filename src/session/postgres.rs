//! PostgreSQL session backend.
//!
//! Plays the replicated-backend role: every gateway instance shares the
//! `sessions` table through the pool, and failover is the database
//! deployment's concern. Records are JSON blobs with an absolute
//! `expires_at`; rotation is a single re-keying `UPDATE` so the CAS
//! guarantee comes from row-level atomicity.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Duration;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::Instrument;

use super::UserSession;
use super::backend::{SessionBackend, SessionError};

pub struct PostgresSessionBackend {
    pool: PgPool,
}

impl PostgresSessionBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend_err(err: sqlx::Error, what: &'static str) -> SessionError {
    SessionError::Backend(anyhow!(err).context(what))
}

#[async_trait]
impl SessionBackend for PostgresSessionBackend {
    async fn load(&self, token_hash: &[u8]) -> Result<Option<UserSession>, SessionError> {
        let query = r"
            SELECT data
            FROM sessions
            WHERE token_hash = $1
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend_err(err, "failed to load session"))?;

        row.map(|row| {
            row.try_get::<Json<UserSession>, _>("data")
                .map(|json| json.0)
                .map_err(|err| SessionError::Backend(anyhow!(err).context("corrupt session blob")))
        })
        .transpose()
    }

    async fn save(
        &self,
        token_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let query = r"
            INSERT INTO sessions (token_hash, data, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
            ON CONFLICT (token_hash)
            DO UPDATE SET data = EXCLUDED.data, expires_at = EXCLUDED.expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .bind(Json(session))
            .bind(ttl.num_seconds())
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend_err(err, "failed to save session"))?;
        Ok(())
    }

    async fn rotate(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<bool, SessionError> {
        // Single statement: the WHERE clause on the old hash is the CAS.
        let query = r"
            UPDATE sessions
            SET token_hash = $2,
                data = $3,
                expires_at = NOW() + ($4 * INTERVAL '1 second')
            WHERE token_hash = $1
              AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(old_hash)
            .bind(new_hash)
            .bind(Json(session))
            .bind(ttl.num_seconds())
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend_err(err, "failed to rotate session"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn destroy(&self, token_hash: &[u8]) -> Result<(), SessionError> {
        let query = "DELETE FROM sessions WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend_err(err, "failed to destroy session"))?;
        Ok(())
    }
}
