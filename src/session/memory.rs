//! In-memory session backend for single-instance deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::backend::{SessionBackend, SessionError};
use super::UserSession;

struct Entry {
    session: UserSession,
    expires_at: DateTime<Utc>,
}

/// Session store held entirely in process memory. Expired entries are
/// evicted lazily on access.
#[derive(Default)]
pub struct MemorySessionBackend {
    entries: Mutex<HashMap<Vec<u8>, Entry>>,
}

impl MemorySessionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn load(&self, token_hash: &[u8]) -> Result<Option<UserSession>, SessionError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        match entries.get(token_hash) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.session.clone())),
            Some(_) => {
                entries.remove(token_hash);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        token_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            token_hash.to_vec(),
            Entry {
                session: session.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn rotate(
        &self,
        old_hash: &[u8],
        new_hash: &[u8],
        session: &UserSession,
        ttl: Duration,
    ) -> Result<bool, SessionError> {
        // Remove-then-insert under one lock: the second concurrent rotation
        // of the same old hash finds nothing to remove and loses.
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let Some(entry) = entries.remove(old_hash) else {
            return Ok(false);
        };
        if entry.expires_at <= now {
            return Ok(false);
        }

        entries.insert(
            new_hash.to_vec(),
            Entry {
                session: session.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn destroy(&self, token_hash: &[u8]) -> Result<(), SessionError> {
        self.entries.lock().await.remove(token_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UserSession {
        UserSession::anonymous(Utc::now())
    }

    #[tokio::test]
    async fn save_load_destroy_round_trip() {
        let backend = MemorySessionBackend::new();
        backend
            .save(b"hash", &session(), Duration::minutes(5))
            .await
            .expect("save");

        assert!(backend.load(b"hash").await.expect("load").is_some());
        backend.destroy(b"hash").await.expect("destroy");
        assert!(backend.load(b"hash").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let backend = MemorySessionBackend::new();
        backend
            .save(b"hash", &session(), Duration::seconds(-1))
            .await
            .expect("save");
        assert!(backend.load(b"hash").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_evicts_expired_entries() {
        let backend = MemorySessionBackend::new();
        backend
            .save(b"old", &session(), Duration::seconds(-1))
            .await
            .expect("save");
        backend
            .save(b"new", &session(), Duration::minutes(5))
            .await
            .expect("save");
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn rotation_is_a_compare_and_swap() {
        let backend = MemorySessionBackend::new();
        backend
            .save(b"old", &session(), Duration::minutes(5))
            .await
            .expect("save");

        let won = backend
            .rotate(b"old", b"new", &session(), Duration::minutes(5))
            .await
            .expect("rotate");
        assert!(won);

        // The stale hash has been consumed: the second rotation loses.
        let lost = backend
            .rotate(b"old", b"other", &session(), Duration::minutes(5))
            .await
            .expect("rotate");
        assert!(!lost);

        assert!(backend.load(b"new").await.expect("load").is_some());
        assert!(backend.load(b"other").await.expect("load").is_none());
        assert!(backend.load(b"old").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn concurrent_rotations_admit_one_winner() {
        use std::sync::Arc;

        let backend = Arc::new(MemorySessionBackend::new());
        backend
            .save(b"stale", &session(), Duration::minutes(5))
            .await
            .expect("save");

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                backend
                    .rotate(b"stale", &[i], &UserSession::anonymous(Utc::now()), Duration::minutes(5))
                    .await
                    .expect("rotate")
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
