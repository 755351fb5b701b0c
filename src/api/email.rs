//! Email outbox worker and delivery abstraction.
//!
//! Reset-password notifications are enqueued as rows in `email_outbox`
//! inside the same transaction that creates their identity token, so the
//! token and the email can never disagree. A background task polls the
//! table, locks a batch with `FOR UPDATE SKIP LOCKED`, and hands each row
//! to an [`EmailSender`]. Failures retry with exponential backoff and
//! jitter until a max attempt threshold, then park as `failed`.
//!
//! SMTP stays an external collaborator behind the trait; the default
//! sender logs instead of delivering.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info};

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Email delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: i64,
    max_attempts: i32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Defaults: 5s poll, 10 rows per batch, 5 attempts, 5s->5m backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Exponential backoff with jitter for a row that has failed `attempts`
    /// times.
    fn backoff(&self, attempts: i32) -> Duration {
        let shift = u32::try_from((attempts - 1).clamp(0, 16)).unwrap_or(0);
        let base = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(shift))
            .min(self.backoff_max);
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_base.as_secs().max(1));
        base + Duration::from_secs(jitter)
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue a message inside the caller's transaction.
///
/// # Errors
/// Returns an error when the insert fails.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text = serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json, status, attempts, next_attempt_at)
        VALUES ($1, $2, $3::jsonb, 'pending', 0, NOW())
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to enqueue outbox email")?;
    Ok(())
}

/// Spawn the background task that drains the outbox.
pub fn spawn_outbox_worker(pool: PgPool, sender: Arc<dyn EmailSender>, config: EmailWorkerConfig) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = process_batch(&pool, sender.as_ref(), &config).await {
                error!(error = %err, "email outbox batch failed");
            }
            sleep(config.poll_interval).await;
        }
    });
}

async fn process_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool.begin().await.context("begin outbox transaction")?;

    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY id
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(config.batch_size)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lock outbox batch")?;

    let mut processed = 0usize;
    for row in rows {
        let id: i64 = row.get("id");
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };
        let attempts: i32 = row.get("attempts");

        match sender.send(&message) {
            Ok(()) => {
                sqlx::query(
                    "UPDATE email_outbox SET status = 'sent', sent_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("failed to mark email sent")?;
            }
            Err(err) => {
                let attempts = attempts + 1;
                error!(id, attempts, error = %err, "email delivery failed");
                if attempts >= config.max_attempts {
                    sqlx::query(
                        "UPDATE email_outbox SET status = 'failed', attempts = $2 WHERE id = $1",
                    )
                    .bind(id)
                    .bind(attempts)
                    .execute(&mut *tx)
                    .await
                    .context("failed to park email as failed")?;
                } else {
                    let delay = i64::try_from(config.backoff(attempts).as_secs()).unwrap_or(300);
                    sqlx::query(
                        r"
                        UPDATE email_outbox
                        SET attempts = $2,
                            next_attempt_at = NOW() + ($3 * INTERVAL '1 second')
                        WHERE id = $1
                        ",
                    )
                    .bind(id)
                    .bind(attempts)
                    .bind(delay)
                    .execute(&mut *tx)
                    .await
                    .context("failed to schedule email retry")?;
                }
            }
        }
        processed += 1;
    }

    tx.commit().await.context("commit outbox batch")?;
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sender_accepts_everything() {
        let sender = LogEmailSender;
        let message = EmailMessage {
            to_email: "john@example.com".to_string(),
            template: "reset_password".to_string(),
            payload_json: "{}".to_string(),
        };
        assert!(sender.send(&message).is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = EmailWorkerConfig::new();
        let first = config.backoff(1);
        let fifth = config.backoff(5);
        assert!(first >= Duration::from_secs(5));
        // Cap plus at most one base of jitter.
        assert!(fifth <= Duration::from_secs(305));

        // A huge attempt count must not overflow the shift.
        let late = config.backoff(40);
        assert!(late <= Duration::from_secs(305));
    }

    #[test]
    fn config_floors_degenerate_values() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
    }
}
