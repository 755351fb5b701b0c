//! Session manager: token minting, cookie plumbing, TTL policy, and
//! rotation.

use anyhow::anyhow;
use axum::http::header::{COOKIE, InvalidHeaderValue};
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::backend::{SessionBackend, SessionError};
use super::config::SessionConfig;
use super::UserSession;

const TOKEN_BYTES: usize = 48;

/// Mint a fresh cookie token: 48 random bytes, hex encoded. The raw value
/// only ever travels in `Set-Cookie`.
fn mint_token() -> Result<String, SessionError> {
    let mut raw = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|err| SessionError::Backend(anyhow!(err).context("failed to mint session token")))?;
    Ok(raw.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Storage key for a token. Backends only ever see this digest, so a
/// dumped session table cannot be replayed as cookies.
fn token_digest(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

pub struct SessionManager {
    config: SessionConfig,
    backend: Arc<dyn SessionBackend>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionConfig, backend: Arc<dyn SessionBackend>) -> Self {
        Self { config, backend }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The raw session token carried by the request, if any.
    #[must_use]
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        let header = headers.get(COOKIE)?;
        let value = header.to_str().ok()?;
        for pair in value.split(';') {
            let trimmed = pair.trim();
            let mut parts = trimmed.splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            if key == self.config.cookie_name() {
                return Some(val.to_string());
            }
        }
        None
    }

    /// Resolve the request's session. Missing, expired, and inactivity-timed-out
    /// cookies all resolve to a fresh anonymous session with no token.
    ///
    /// # Errors
    /// Propagates backend failures so the caller can refuse service instead
    /// of treating an outage as "anonymous".
    pub async fn session_for_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<(UserSession, Option<String>), SessionError> {
        let now = Utc::now();

        let Some(token) = self.token_from_headers(headers) else {
            return Ok((UserSession::anonymous(now), None));
        };

        let token_hash = token_digest(&token);
        let Some(mut session) = self.backend.load(&token_hash).await? else {
            return Ok((UserSession::anonymous(now), None));
        };

        // Inactivity is a sliding window; remember-me sessions only expire
        // absolutely.
        if !session.remember_me
            && now.signed_duration_since(session.last_activity_at) > self.config.inactivity()
        {
            self.backend.destroy(&token_hash).await?;
            return Ok((UserSession::anonymous(now), None));
        }

        let ttl = self.remaining_ttl(&session, now);
        if ttl <= Duration::zero() {
            self.backend.destroy(&token_hash).await?;
            return Ok((UserSession::anonymous(now), None));
        }

        session.last_activity_at = now;
        self.backend.save(&token_hash, &session, ttl).await?;

        Ok((session, Some(token)))
    }

    /// Persist a brand-new session and return its cookie token.
    ///
    /// # Errors
    /// Fails when the token source or the backend write fails; no cookie may
    /// be issued in that case.
    pub async fn establish(&self, session: &UserSession) -> Result<String, SessionError> {
        let token = mint_token()?;
        let ttl = self.remaining_ttl(session, Utc::now());
        self.backend
            .save(&token_digest(&token), session, ttl)
            .await?;
        Ok(token)
    }

    /// Rotate the session id for a privilege change. Returns the new token,
    /// or `None` when the old token lost the compare-and-swap (someone else
    /// already rotated it).
    ///
    /// # Errors
    /// Propagates backend failures.
    pub async fn rotate(
        &self,
        old_token: &str,
        session: &UserSession,
    ) -> Result<Option<String>, SessionError> {
        let new_token = mint_token()?;
        let ttl = self.remaining_ttl(session, Utc::now());

        let won = self
            .backend
            .rotate(
                &token_digest(old_token),
                &token_digest(&new_token),
                session,
                ttl,
            )
            .await?;

        Ok(won.then_some(new_token))
    }

    /// Persist an updated session under its existing token.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub async fn save(&self, token: &str, session: &UserSession) -> Result<(), SessionError> {
        let ttl = self.remaining_ttl(session, Utc::now());
        self.backend
            .save(&token_digest(token), session, ttl)
            .await
    }

    /// Destroy the session behind a token. Idempotent.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub async fn destroy(&self, token: &str) -> Result<(), SessionError> {
        self.backend.destroy(&token_digest(token)).await
    }

    /// Remaining absolute lifetime: the full expiration (or remember-me
    /// duration) counted from creation.
    fn remaining_ttl(&self, session: &UserSession, now: DateTime<Utc>) -> Duration {
        let lifetime = if session.remember_me {
            self.config.remember_me_duration()
        } else {
            self.config.expiration()
        };
        lifetime - now.signed_duration_since(session.created_at)
    }

    /// Build the session cookie for a response.
    ///
    /// # Errors
    /// Fails only when the assembled value is not a valid header.
    pub fn cookie(
        &self,
        domain: &str,
        token: &str,
        max_age: Duration,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!(
            "{}={token}; Domain={domain}; Path=/; Secure; HttpOnly; SameSite={}; Max-Age={}",
            self.config.cookie_name(),
            self.config.same_site(),
            max_age.num_seconds().max(0),
        ))
    }

    /// The clearing variant sent on logout and refused promotions.
    ///
    /// # Errors
    /// Fails only when the assembled value is not a valid header.
    pub fn clear_cookie(&self, domain: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&format!(
            "{}=; Domain={domain}; Path=/; Secure; HttpOnly; SameSite={}; Max-Age=0",
            self.config.cookie_name(),
            self.config.same_site(),
        ))
    }

    /// Max-Age matching the session's remaining lifetime.
    #[must_use]
    pub fn cookie_max_age(&self, session: &UserSession) -> Duration {
        self.remaining_ttl(session, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::config::CookieDomain;
    use crate::session::memory::MemorySessionBackend;
    use url::Url;

    fn manager() -> SessionManager {
        let config = SessionConfig::new(vec![CookieDomain {
            domain: "example.com".to_string(),
            portal_url: Url::parse("https://auth.example.com").expect("url"),
            default_redirection_url: None,
        }]);
        SessionManager::new(config, Arc::new(MemorySessionBackend::new()))
    }

    fn headers_with_cookie(manager: &SessionManager, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!(
                "other=1; {}={token}",
                manager.config().cookie_name()
            ))
            .expect("header"),
        );
        headers
    }

    #[tokio::test]
    async fn missing_cookie_resolves_anonymous() {
        let manager = manager();
        let (session, token) = manager
            .session_for_request(&HeaderMap::new())
            .await
            .expect("resolve");
        assert!(session.is_anonymous());
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn establish_then_resolve_round_trip() {
        let manager = manager();
        let session = UserSession::anonymous(Utc::now());
        let token = manager.establish(&session).await.expect("establish");

        let headers = headers_with_cookie(&manager, &token);
        let (resolved, resolved_token) =
            manager.session_for_request(&headers).await.expect("resolve");
        assert!(resolved.is_anonymous());
        assert_eq!(resolved_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn inactivity_timeout_destroys_the_session() {
        let manager = manager();
        let mut session = UserSession::anonymous(Utc::now());
        session.last_activity_at = Utc::now() - Duration::minutes(30);
        let token = manager.establish(&session).await.expect("establish");

        let headers = headers_with_cookie(&manager, &token);
        let (resolved, resolved_token) =
            manager.session_for_request(&headers).await.expect("resolve");
        assert!(resolved.is_anonymous());
        assert!(resolved_token.is_none());
    }

    #[tokio::test]
    async fn remember_me_ignores_inactivity() {
        let manager = manager();
        let mut session = UserSession::anonymous(Utc::now());
        session.remember_me = true;
        session.last_activity_at = Utc::now() - Duration::minutes(30);
        let token = manager.establish(&session).await.expect("establish");

        let headers = headers_with_cookie(&manager, &token);
        let (_, resolved_token) = manager.session_for_request(&headers).await.expect("resolve");
        assert!(resolved_token.is_some());
    }

    #[tokio::test]
    async fn rotation_returns_a_fresh_token_once() {
        let manager = manager();
        let session = UserSession::anonymous(Utc::now());
        let token = manager.establish(&session).await.expect("establish");

        let rotated = manager.rotate(&token, &session).await.expect("rotate");
        let new_token = rotated.expect("winner");
        assert_ne!(new_token, token);

        // The stale token loses the CAS.
        let again = manager.rotate(&token, &session).await.expect("rotate");
        assert!(again.is_none());
    }

    #[test]
    fn minted_tokens_are_hex_and_unique() {
        let token = mint_token().expect("token");
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, mint_token().expect("token"));
    }

    #[test]
    fn token_digest_is_stable() {
        assert_eq!(token_digest("tok"), token_digest("tok"));
        assert_ne!(token_digest("tok"), token_digest("other"));
        assert_eq!(token_digest("tok").len(), 32);
    }

    #[test]
    fn cookie_attributes() {
        let manager = manager();
        let cookie = manager
            .cookie("example.com", "tok", Duration::seconds(3600))
            .expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.starts_with("gardisto_session=tok; Domain=example.com; Path=/"));
        assert!(value.contains("Secure"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Max-Age=3600"));

        let clear = manager.clear_cookie("example.com").expect("cookie");
        assert!(clear.to_str().expect("ascii").contains("Max-Age=0"));
    }
}
