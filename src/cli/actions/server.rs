use crate::api::{self, EmailWorkerConfig, ServerOptions, SessionBackendKind};
use crate::authentication::file::FileUserProvider;
use crate::authorization::{AccessControlConfig, Authorizer};
use crate::duo::DuoConfig;
use crate::regulation::RegulationConfig;
use crate::session::{CookieDomain, SessionConfig};
use crate::totp::TotpConfig;
use anyhow::{Context, Result, anyhow};
use base64::Engine;
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct SessionDomainArg {
    pub domain: String,
    pub portal_url: Url,
    pub default_redirection_url: Option<Url>,
}

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub access_control_path: String,
    pub users_path: String,
    pub session_domains: Vec<SessionDomainArg>,
    pub session_backend: SessionBackendKind,
    pub session_inactivity_seconds: i64,
    pub session_expiration_seconds: i64,
    pub session_remember_me_seconds: i64,
    pub session_same_site: String,
    pub elevation_window_seconds: i64,
    pub regulation_max_retries: u32,
    pub regulation_find_time_seconds: i64,
    pub regulation_ban_time_seconds: i64,
    pub totp_issuer: Option<String>,
    pub secrets_key: Option<String>,
    pub webauthn: Option<(String, String)>,
    pub duo: Option<(String, String, String)>,
}

/// Decode the base64 key sealing TOTP secrets at rest.
fn decode_secrets_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .context("secrets key is not valid base64")?;
    <[u8; 32]>::try_from(bytes).map_err(|bytes| {
        anyhow!(
            "secrets key must decode to exactly 32 bytes, got {}",
            bytes.len()
        )
    })
}

/// Execute the server action.
///
/// # Errors
/// Returns an error when the policy or user database fails to load, a
/// verifier is misconfigured, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let raw_policy = std::fs::read_to_string(&args.access_control_path).with_context(|| {
        format!(
            "failed to read access-control policy {}",
            args.access_control_path
        )
    })?;
    let policy: AccessControlConfig = serde_json::from_str(&raw_policy).with_context(|| {
        format!(
            "failed to parse access-control policy {}",
            args.access_control_path
        )
    })?;
    let authorizer = Arc::new(
        Authorizer::new(&policy).context("invalid access-control policy")?,
    );

    info!(
        rules = policy.rules.len(),
        default_policy = %policy.default_policy,
        second_factor = authorizer.is_second_factor_enabled(),
        "access-control policy compiled"
    );

    let users = Arc::new(FileUserProvider::load(Path::new(&args.users_path))?);

    let domains = args
        .session_domains
        .into_iter()
        .map(|domain| CookieDomain {
            domain: domain.domain,
            portal_url: domain.portal_url,
            default_redirection_url: domain.default_redirection_url,
        })
        .collect();

    let session = SessionConfig::new(domains)
        .with_inactivity(chrono::Duration::seconds(args.session_inactivity_seconds))
        .with_expiration(chrono::Duration::seconds(args.session_expiration_seconds))
        .with_remember_me_duration(chrono::Duration::seconds(args.session_remember_me_seconds))
        .with_same_site(args.session_same_site);

    let regulation = RegulationConfig::new()
        .with_max_retries(args.regulation_max_retries)
        .with_find_time(chrono::Duration::seconds(args.regulation_find_time_seconds))
        .with_ban_time(chrono::Duration::seconds(args.regulation_ban_time_seconds));

    let totp = args
        .totp_issuer
        .map(|issuer| {
            let key = args
                .secrets_key
                .as_deref()
                .context("TOTP requires --secrets-key")?;
            Ok::<_, anyhow::Error>((TotpConfig::new(issuer), decode_secrets_key(key)?))
        })
        .transpose()?;

    let duo = args.duo.map(|(hostname, integration_key, secret_key)| DuoConfig {
        api_hostname: hostname,
        integration_key,
        secret_key: SecretString::from(secret_key),
    });

    let options = ServerOptions {
        session,
        session_backend: args.session_backend,
        regulation,
        totp,
        webauthn: args.webauthn,
        duo,
        elevation_window: chrono::Duration::seconds(args.elevation_window_seconds),
        email: EmailWorkerConfig::new(),
    };

    api::new(args.port, args.dsn, authorizer, users, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_key_round_trip() {
        let raw = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        assert_eq!(decode_secrets_key(&raw).expect("decode"), [9u8; 32]);
    }

    #[test]
    fn secrets_key_rejects_wrong_length_and_encoding() {
        let short = base64::engine::general_purpose::STANDARD.encode([9u8; 16]);
        assert!(decode_secrets_key(&short).is_err());
        assert!(decode_secrets_key("not base64 at all!").is_err());
    }
}
