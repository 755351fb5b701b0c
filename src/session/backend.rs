//! Pluggable session storage.

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;

use super::UserSession;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend is unreachable or a write failed. Handlers answer 401/500
    /// instead of issuing cookies that reference unsaved state.
    #[error("session backend failure")]
    Backend(#[source] anyhow::Error),

    #[error("session record could not be encoded")]
    Codec(#[from] serde_json::Error),
}

/// Storage seam for session records, keyed by the token hash. Backends are
/// selected once at startup; the core never branches on backend identity
/// afterwards.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Fetch a live (non-expired) session.
    async fn load(&self, token_hash: &[u8]) -> Result<Option<UserSession>, SessionError>;

    /// Insert or overwrite a session with an absolute TTL.
    async fn save(
        &self,
        token_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<(), SessionError>;

    /// Re-key a session from `old_hash` to `new_hash` as a compare-and-swap:
    /// returns `false` when `old_hash` no longer exists, in which case no
    /// state was written. Of two concurrent rotations of the same cookie
    /// exactly one observes `true`.
    async fn rotate(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<bool, SessionError>;

    /// Remove a session. Idempotent.
    async fn destroy(&self, token_hash: &[u8]) -> Result<(), SessionError>;
}
