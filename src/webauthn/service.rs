//! WebAuthn security-key ceremonies.
//!
//! Both ceremonies are two-phase: the GET side produces a challenge whose
//! server state the caller parks in the session record, the POST side
//! validates the browser's response against that state. Handlers are the
//! only progress drivers; there is no background state.

use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse, SecurityKey, SecurityKeyAuthentication, SecurityKeyRegistration,
    Url, Webauthn, WebauthnBuilder,
};

use super::repo::{WebauthnDeviceRow, WebauthnRepo};

pub struct WebauthnService {
    webauthn: Webauthn,
    pool: PgPool,
}

impl WebauthnService {
    /// Build the ceremony engine for the portal's relying-party identity.
    ///
    /// # Errors
    /// Returns an error for an invalid origin or relying-party id.
    pub fn new(pool: PgPool, rp_id: &str, rp_origin: &str) -> Result<Self> {
        let origin = Url::parse(rp_origin)?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)?
            .rp_name("Gardisto")
            .build()?;

        Ok(Self { webauthn, pool })
    }

    /// Begin registering a new key. Existing credential ids are excluded so
    /// the same authenticator cannot enroll twice.
    ///
    /// # Errors
    /// Returns an error when storage or challenge generation fails.
    pub async fn start_registration(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<(CreationChallengeResponse, SecurityKeyRegistration)> {
        let existing = WebauthnRepo::list_devices(&self.pool, username).await?;
        let exclude = existing
            .into_iter()
            .map(|device| device.kid.into())
            .collect();

        let (challenge, state) = self.webauthn.start_securitykey_registration(
            user_handle(username),
            username,
            display_name,
            Some(exclude),
            None,
            None,
        )?;

        Ok((challenge, state))
    }

    /// Finish a registration ceremony and persist the new key.
    ///
    /// # Errors
    /// Returns an error when attestation validation or storage fails.
    pub async fn finish_registration(
        &self,
        username: &str,
        state: &SecurityKeyRegistration,
        response: &RegisterPublicKeyCredential,
        description: &str,
    ) -> Result<()> {
        let key = self
            .webauthn
            .finish_securitykey_registration(response, state)?;

        let row = WebauthnDeviceRow {
            username: username.to_string(),
            kid: key.cred_id().as_slice().to_vec(),
            public_key: serde_json::to_vec(&key)?,
            sign_count: 0,
            aaguid: String::new(),
            description: description.to_string(),
        };
        WebauthnRepo::save_device(&self.pool, &row).await?;

        Ok(())
    }

    /// Begin an assertion ceremony over every key the user has registered.
    ///
    /// # Errors
    /// Returns an error when the user has no keys or storage fails.
    pub async fn start_authentication(
        &self,
        username: &str,
    ) -> Result<(RequestChallengeResponse, SecurityKeyAuthentication)> {
        let devices = WebauthnRepo::list_devices(&self.pool, username).await?;
        if devices.is_empty() {
            return Err(anyhow!("no security keys registered for user"));
        }

        let keys: Vec<SecurityKey> = devices
            .iter()
            .filter_map(|device| serde_json::from_slice(&device.public_key).ok())
            .collect();
        if keys.is_empty() {
            return Err(anyhow!("no decodable security keys for user"));
        }

        let (challenge, state) = self.webauthn.start_securitykey_authentication(&keys)?;
        Ok((challenge, state))
    }

    /// Finish an assertion ceremony: validate the client assertion, match
    /// the credential id, and bump the sign count atomically. A decreasing
    /// count is a hard failure.
    ///
    /// # Errors
    /// Returns an error for invalid assertions, unknown credentials, and
    /// sign-count regressions.
    pub async fn finish_authentication(
        &self,
        username: &str,
        state: &SecurityKeyAuthentication,
        response: &PublicKeyCredential,
    ) -> Result<()> {
        let result = self
            .webauthn
            .finish_securitykey_authentication(response, state)?;

        let kid = result.cred_id().as_slice().to_vec();
        let bumped = WebauthnRepo::bump_sign_count(
            &self.pool,
            username,
            &kid,
            i64::from(result.counter()),
        )
        .await?;

        if !bumped {
            // Either the credential is not this user's or the counter went
            // backwards, which indicates a cloned authenticator.
            return Err(anyhow!("security key sign count regression"));
        }

        Ok(())
    }
}

/// Stable per-username user handle for the ceremony library.
fn user_handle(username: &str) -> Uuid {
    let digest = Sha256::digest(username.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_handles_are_stable_and_distinct() {
        assert_eq!(user_handle("john"), user_handle("john"));
        assert_ne!(user_handle("john"), user_handle("jane"));
    }
}
