//! # Gardisto (Forward-Authentication Gateway)
//!
//! `gardisto` sits behind a trusted front proxy (Traefik, NGINX, Envoy) and
//! answers, for every delegated request, whether the client may pass, must
//! log in, or is denied outright. It also serves the login portal API the
//! proxy redirects browsers to.
//!
//! ## Access control
//!
//! Authorization is a compiled, ordered rule list evaluated first-match-wins
//! against the request's domain, path, method, source network, and subject
//! (username/groups). Each rule yields one of four levels:
//! `bypass < one_factor < two_factor < deny`.
//!
//! ## Sessions
//!
//! Session state lives server side, keyed by the SHA-256 hash of an opaque
//! cookie token; raw tokens never touch storage. Every privilege change
//! (login, second factor, logout) rotates the token as a compare-and-swap on
//! the old hash, so a stale cookie can be promoted at most once.
//!
//! ## Regulation
//!
//! Failed first-factor attempts are tracked per user in a sliding window;
//! too many failures inside the window ban the user for a configured
//! duration. First-factor responses are additionally held to a floor
//! measured at startup so unknown users and wrong passwords are
//! indistinguishable by timing.

pub mod api;
pub mod authentication;
pub mod authorization;
pub mod cli;
pub mod duo;
pub mod oidc;
pub mod regulation;
pub mod session;
pub mod totp;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
