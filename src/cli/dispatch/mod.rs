use crate::api::SessionBackendKind;
use crate::cli::actions::{Action, server::Args, server::SessionDomainArg};
use anyhow::{Context, Result, anyhow};
use url::Url;

/// Parse one `--session-domain` value:
/// `DOMAIN=PORTAL_URL[|DEFAULT_REDIRECTION_URL]`.
fn parse_session_domain(raw: &str) -> Result<SessionDomainArg> {
    let (domain, rest) = raw
        .split_once('=')
        .with_context(|| format!("invalid session domain {raw:?}: expected DOMAIN=PORTAL_URL"))?;

    let domain = domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(anyhow!("invalid session domain {raw:?}: empty domain"));
    }

    let (portal, default_redirection) = match rest.split_once('|') {
        Some((portal, default)) => (portal, Some(default)),
        None => (rest, None),
    };

    let portal_url = Url::parse(portal.trim())
        .with_context(|| format!("invalid portal URL in session domain {raw:?}"))?;

    let default_redirection_url = default_redirection
        .map(|default| {
            Url::parse(default.trim())
                .with_context(|| format!("invalid default redirection URL in {raw:?}"))
        })
        .transpose()?;

    Ok(SessionDomainArg {
        domain,
        portal_url,
        default_redirection_url,
    })
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    super::commands::validate(matches).map_err(|message| anyhow!(message))?;

    let port = matches.get_one::<u16>("port").copied().unwrap_or(9091);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let access_control_path = matches
        .get_one::<String>("access-control")
        .cloned()
        .context("missing required argument: --access-control")?;
    let users_path = matches
        .get_one::<String>("users")
        .cloned()
        .context("missing required argument: --users")?;

    let session_domains = matches
        .get_many::<String>("session-domain")
        .context("missing required argument: --session-domain")?
        .map(|raw| parse_session_domain(raw))
        .collect::<Result<Vec<_>>>()?;

    let session_backend = matches
        .get_one::<String>("session-backend")
        .map(String::as_str)
        .unwrap_or("memory")
        .parse::<SessionBackendKind>()
        .map_err(|message| anyhow!(message))?;

    let seconds = |name: &str, fallback: i64| {
        matches.get_one::<i64>(name).copied().unwrap_or(fallback)
    };

    let totp_issuer = matches.get_one::<String>("totp-issuer").cloned();
    let secrets_key = matches.get_one::<String>("secrets-key").cloned();

    let webauthn = match (
        matches.get_one::<String>("webauthn-rp-id").cloned(),
        matches.get_one::<String>("webauthn-rp-origin").cloned(),
    ) {
        (Some(rp_id), Some(rp_origin)) => Some((rp_id, rp_origin)),
        _ => None,
    };

    let duo = match (
        matches.get_one::<String>("duo-hostname").cloned(),
        matches.get_one::<String>("duo-integration-key").cloned(),
        matches.get_one::<String>("duo-secret-key").cloned(),
    ) {
        (Some(hostname), Some(integration_key), Some(secret_key)) => {
            Some((hostname, integration_key, secret_key))
        }
        _ => None,
    };

    Ok(Action::Server(Box::new(Args {
        port,
        dsn,
        access_control_path,
        users_path,
        session_domains,
        session_backend,
        session_inactivity_seconds: seconds("session-inactivity-seconds", 300),
        session_expiration_seconds: seconds("session-expiration-seconds", 3600),
        session_remember_me_seconds: seconds("session-remember-me-seconds", 2_592_000),
        session_same_site: matches
            .get_one::<String>("session-same-site")
            .cloned()
            .unwrap_or_else(|| "Lax".to_string()),
        elevation_window_seconds: seconds("elevation-window-seconds", 600),
        regulation_max_retries: matches
            .get_one::<u32>("regulation-max-retries")
            .copied()
            .unwrap_or(3),
        regulation_find_time_seconds: seconds("regulation-find-time-seconds", 120),
        regulation_ban_time_seconds: seconds("regulation-ban-time-seconds", 300),
        totp_issuer,
        secrets_key,
        webauthn,
        duo,
    })))
}
