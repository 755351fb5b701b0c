//! Second-factor sign handlers: TOTP, WebAuthn, and Duo push.
//!
//! All three verifiers share the same epilogue: rotate the session id (a
//! compare-and-swap, so two submissions with the same stolen cookie admit
//! one winner), promote to two-factor, persist, then answer with either a
//! pending OIDC workflow continuation or a safe redirect.

pub mod duo;
pub mod totp;
pub mod webauthn;

use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use chrono::Utc;
use tracing::{error, warn};
use url::Url;

use super::first_factor::{RedirectResponse, requesting_cookie_domain};
use super::{ServerState, mfa_validation_failed, ok_data, ok_empty};
use crate::session::UserSession;

/// Promote the session to two-factor and rotate its id. The old token must
/// still win the CAS; a stale cookie answers 401.
pub(super) async fn promote_two_factor(
    state: &ServerState,
    old_token: &str,
    session: &mut UserSession,
) -> Result<String, Response> {
    session.set_two_factor(Utc::now());
    // The assertion state is single use regardless of outcome.
    session.webauthn_assertion = None;

    match state.sessions.rotate(old_token, session).await {
        Ok(Some(new_token)) => Ok(new_token),
        Ok(None) => {
            warn!(username = %session.username, "second factor lost session rotation");
            Err(mfa_validation_failed())
        }
        Err(err) => {
            error!(error = %err, "session rotation failed during second factor");
            Err(mfa_validation_failed())
        }
    }
}

/// Shared reply shape after a successful second factor, with the rotated
/// cookie attached.
pub(super) fn second_factor_response(
    state: &ServerState,
    headers: &HeaderMap,
    session: &UserSession,
    new_token: &str,
    target_url: Option<&str>,
) -> Response {
    let cookie_domain = requesting_cookie_domain(state, headers);

    let redirect = if let Some(workflow) = &session.oidc_workflow {
        cookie_domain
            .map(|domain| workflow.continuation_url(&domain.portal_url).to_string())
    } else if let Some(target) = target_url
        && let Ok(target) = Url::parse(target)
        && state.sessions.config().is_safe_redirection(&target)
    {
        Some(target.to_string())
    } else {
        cookie_domain
            .and_then(|domain| domain.default_redirection_url.as_ref())
            .map(|url| url.to_string())
    };

    let mut response = match redirect {
        Some(redirect) => ok_data(RedirectResponse { redirect }),
        None => ok_empty(),
    };

    if let Some(domain) = cookie_domain {
        match state.sessions.cookie(
            &domain.domain,
            new_token,
            state.sessions.cookie_max_age(session),
        ) {
            Ok(cookie) => {
                response.headers_mut().insert(SET_COOKIE, cookie);
            }
            Err(err) => error!(error = %err, "failed to build rotated session cookie"),
        }
    }

    response
}
