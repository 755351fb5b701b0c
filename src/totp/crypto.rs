//! At-rest encryption for TOTP secrets.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under the server's secrets key,
//! with the owning username as AAD so a row copied between users fails to
//! decrypt. Layout: `nonce (12 bytes) || ciphertext`.

use anyhow::{Result, anyhow};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};

const NONCE_LEN: usize = 12;

/// Seal a TOTP secret for storage.
///
/// # Errors
/// Returns an error when encryption fails.
pub fn encrypt_secret(key: &[u8; 32], secret: &[u8], username: &str) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let payload = Payload {
        msg: secret,
        aad: username.as_bytes(),
    };

    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|err| anyhow!("failed to seal TOTP secret: {err}"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed TOTP secret.
///
/// # Errors
/// Returns an error for truncated input, a wrong key, or a username
/// mismatch.
pub fn decrypt_secret(key: &[u8; 32], sealed: &[u8], username: &str) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(anyhow!("sealed TOTP secret too short"));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let payload = Payload {
        msg: ciphertext,
        aad: username.as_bytes(),
    };

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), payload)
        .map_err(|err| anyhow!("failed to open TOTP secret: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn seal_and_open_round_trip() {
        let sealed = encrypt_secret(&KEY, b"supersecretseed", "john").expect("seal");
        let opened = decrypt_secret(&KEY, &sealed, "john").expect("open");
        assert_eq!(opened, b"supersecretseed");
    }

    #[test]
    fn username_binds_the_ciphertext() {
        let sealed = encrypt_secret(&KEY, b"supersecretseed", "john").expect("seal");
        assert!(decrypt_secret(&KEY, &sealed, "jane").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt_secret(&KEY, b"supersecretseed", "john").expect("seal");
        let other = [8u8; 32];
        assert!(decrypt_secret(&other, &sealed, "john").is_err());
    }

    #[test]
    fn truncated_input_fails() {
        assert!(decrypt_secret(&KEY, &[0u8; 4], "john").is_err());
    }
}
