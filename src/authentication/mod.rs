//! User-provider seam and first-factor timing floor.
//!
//! The gateway never stores long-term user records itself; password checks
//! and profile lookups go through the [`UserProvider`] trait, selected at
//! startup. The built-in implementation is a file of argon2 PHC hashes.

pub mod file;

use anyhow::anyhow;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{Rng, rngs::OsRng};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Identity fields a provider returns for an authenticated user.
#[derive(Clone, Debug, Default)]
pub struct UserDetails {
    pub username: String,
    pub display_name: String,
    pub groups: Vec<String>,
    pub emails: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("user not found")]
    UserNotFound,

    #[error("user provider failure")]
    Provider(#[source] anyhow::Error),
}

#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Check a password. `Ok(false)` is a wrong password; an unknown user is
    /// `Err(UserNotFound)`. Callers must not let the two differ observably.
    async fn check_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, AuthenticationError>;

    async fn get_details(&self, username: &str) -> Result<UserDetails, AuthenticationError>;

    async fn update_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), AuthenticationError>;
}

/// Response-time floor for first-factor attempts.
///
/// The floor is measured at startup by hashing a throwaway random password,
/// so a request that skipped the expensive hash (unknown user, banned user)
/// still takes as long as one that did not.
#[derive(Clone, Copy, Debug)]
pub struct FirstFactorDelay {
    floor: Duration,
}

const MIN_FLOOR: Duration = Duration::from_millis(250);

impl FirstFactorDelay {
    /// Measure the hashing cost once. Never faster than 250ms.
    #[must_use]
    pub fn measure() -> Self {
        let throwaway: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();

        let started = Instant::now();
        let salt = SaltString::generate(&mut OsRng);
        let _ = Argon2::default().hash_password(throwaway.as_bytes(), &salt);
        let measured = started.elapsed();

        let floor = measured.max(MIN_FLOOR);
        debug!(floor_ms = floor.as_millis() as u64, "first factor delay calibrated");

        Self { floor }
    }

    #[must_use]
    pub const fn from_duration(floor: Duration) -> Self {
        Self { floor }
    }

    #[must_use]
    pub const fn floor(&self) -> Duration {
        self.floor
    }

    /// Sleep out the remainder of the floor for a request that started at
    /// `started`.
    pub async fn hold(&self, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed < self.floor {
            tokio::time::sleep(self.floor - elapsed).await;
        }
    }
}

/// Hash a password into a PHC string with the default argon2id parameters.
///
/// # Errors
/// Returns an error when the hasher rejects its inputs.
pub fn hash_password(password: &str) -> Result<String, AuthenticationError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthenticationError::Provider(anyhow!("argon2 hash failed: {err}")))
}
