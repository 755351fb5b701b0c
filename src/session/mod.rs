//! Server-side session state.
//!
//! Only an opaque token rides in the cookie; everything else lives in the
//! session backend, keyed by the SHA-256 hash of that token. Every privilege
//! change rotates the token through a compare-and-swap on the old hash.

pub mod backend;
pub mod config;
pub mod manager;
pub mod memory;
pub mod postgres;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::authentication::UserDetails;
use crate::authorization::Level;
use crate::oidc::OidcWorkflow;

pub use backend::{SessionBackend, SessionError};
pub use config::{CookieDomain, SessionConfig};
pub use manager::SessionManager;

/// The session's authentication level, promoted by the sign-in handlers.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationLevel {
    Anonymous,
    OneFactor,
    TwoFactor,
}

impl AuthenticationLevel {
    /// Wire representation used by `/api/state`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Anonymous => 0,
            Self::OneFactor => 1,
            Self::TwoFactor => 2,
        }
    }

    /// Whether this level satisfies a required authorization level.
    /// `Denied` is never satisfiable.
    #[must_use]
    pub fn satisfies(self, required: Level) -> bool {
        match required {
            Level::Bypass => true,
            Level::OneFactor => self >= Self::OneFactor,
            Level::TwoFactor => self >= Self::TwoFactor,
            Level::Denied => false,
        }
    }
}

/// The per-cookie session record. Serialized as a JSON blob into whichever
/// backend is configured.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserSession {
    pub username: String,
    pub display_name: String,
    pub groups: Vec<String>,
    pub emails: Vec<String>,
    pub authentication_level: AuthenticationLevel,
    pub first_factor_at: Option<DateTime<Utc>>,
    pub second_factor_at: Option<DateTime<Utc>>,
    pub remember_me: bool,
    /// Pending OIDC authorization workflow, if the login detour started at
    /// the provider's authorization endpoint.
    pub oidc_workflow: Option<OidcWorkflow>,
    /// In-flight WebAuthn assertion state, serialized; the GET handler
    /// writes it, the POST handler consumes it.
    pub webauthn_assertion: Option<serde_json::Value>,
    /// In-flight WebAuthn registration state for device enrollment.
    pub webauthn_registration: Option<serde_json::Value>,
    /// Username with a completed reset-password identity check.
    pub password_reset_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UserSession {
    #[must_use]
    pub fn anonymous(now: DateTime<Utc>) -> Self {
        Self {
            username: String::new(),
            display_name: String::new(),
            groups: Vec::new(),
            emails: Vec::new(),
            authentication_level: AuthenticationLevel::Anonymous,
            first_factor_at: None,
            second_factor_at: None,
            remember_me: false,
            oidc_workflow: None,
            webauthn_assertion: None,
            webauthn_registration: None,
            password_reset_username: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.authentication_level == AuthenticationLevel::Anonymous
    }

    /// Promote to one-factor after a successful password check. Identity
    /// fields come from the user provider, never from the request.
    pub fn set_one_factor(&mut self, now: DateTime<Utc>, details: &UserDetails, remember_me: bool) {
        self.username = details.username.clone();
        self.display_name = details.display_name.clone();
        self.groups = details.groups.clone();
        self.emails = details.emails.clone();
        self.authentication_level = AuthenticationLevel::OneFactor;
        self.first_factor_at = Some(now);
        self.remember_me = remember_me;
        self.last_activity_at = now;
    }

    /// Promote to two-factor after any second-factor verifier succeeded.
    pub fn set_two_factor(&mut self, now: DateTime<Utc>) {
        self.authentication_level = AuthenticationLevel::TwoFactor;
        self.second_factor_at = Some(now);
        self.last_activity_at = now;
    }

    /// True when the last second factor is recent enough for
    /// credential-altering actions.
    #[must_use]
    pub fn elevation_recent(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.second_factor_at
            .is_some_and(|at| now.signed_duration_since(at) <= window)
    }
}
