//! First-factor (username + password) sign-in.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use url::Url;
use utoipa::ToSchema;

use super::{
    ServerState, authentication_failed, client_ip, internal_error, ok_data, ok_empty,
};
use crate::authentication::AuthenticationError;
use crate::authorization::Level;
use crate::regulation::{AUTH_TYPE_1FA, Regulation};
use crate::session::UserSession;
use crate::session::config::CookieDomain;

#[derive(Debug, Deserialize, ToSchema)]
pub struct FirstFactorRequest {
    pub username: String,
    pub password: String,
    #[serde(default, rename = "targetURL")]
    pub target_url: Option<String>,
    #[serde(default, rename = "requestMethod")]
    pub request_method: Option<String>,
    #[serde(default, rename = "keepMeLoggedIn")]
    pub keep_me_logged_in: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RedirectResponse {
    pub redirect: String,
}

/// The cookie domain serving this portal request, from the proxy-reported
/// host.
pub(super) fn requesting_cookie_domain<'a>(
    state: &'a ServerState,
    headers: &HeaderMap,
) -> Option<&'a CookieDomain> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(':').next().unwrap_or(value))?;

    state.sessions.config().domain_for_host(host)
}

/// Where to send the browser after a successful first factor.
fn first_factor_redirect(
    state: &ServerState,
    session: &UserSession,
    target_url: Option<&str>,
    cookie_domain: Option<&CookieDomain>,
) -> Option<String> {
    if let Some(workflow) = &session.oidc_workflow
        && workflow.is_satisfied_by(Level::OneFactor)
        && let Some(domain) = cookie_domain
    {
        return Some(workflow.continuation_url(&domain.portal_url).to_string());
    }

    if let Some(target) = target_url
        && let Ok(target) = Url::parse(target)
        && state.sessions.config().is_safe_redirection(&target)
    {
        return Some(target.to_string());
    }

    cookie_domain
        .and_then(|domain| domain.default_redirection_url.as_ref())
        .map(|url| url.to_string())
}

/// `POST /api/firstfactor`
///
/// Every outcome is held to the calibrated delay floor, and bans answer
/// with the same shape as a wrong password.
#[utoipa::path(
    post,
    path = "/api/firstfactor",
    request_body = FirstFactorRequest,
    responses(
        (status = 200, description = "Authenticated; body may carry a redirect"),
        (status = 401, description = "Authentication failed", body = super::KoResponse)
    ),
    tag = "auth"
)]
pub async fn first_factor(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<FirstFactorRequest>>,
) -> Response {
    let started = Instant::now();
    let response = first_factor_inner(&state, &headers, payload).await;
    state.first_factor_delay.hold(started).await;
    response
}

async fn first_factor_inner(
    state: &ServerState,
    headers: &HeaderMap,
    payload: Option<Json<FirstFactorRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return authentication_failed();
    };
    if request.username.is_empty() || request.password.is_empty() {
        return authentication_failed();
    }

    let ip = client_ip(headers).to_string();

    let (mut session, token) = match state.sessions.session_for_request(headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during first factor");
            return internal_error();
        }
    };

    // Banned users are answered without consulting the user provider.
    match state.regulator.regulate(&request.username).await {
        Ok(Regulation::Unrestricted) => {}
        Ok(Regulation::Banned { until }) => {
            warn!(username = %request.username, %until, "regulator refused first factor");
            if let Err(err) = state
                .regulator
                .mark(&request.username, false, true, AUTH_TYPE_1FA, &ip)
                .await
            {
                error!(error = %err, "failed to record banned attempt");
            }
            return authentication_failed();
        }
        Err(err) => {
            error!(error = %err, "regulator failure");
            return internal_error();
        }
    }

    let password_ok = match state
        .users
        .check_password(&request.username, &request.password)
        .await
    {
        Ok(ok) => ok,
        Err(AuthenticationError::UserNotFound) => false,
        Err(err) => {
            error!(error = %err, "user provider failure");
            return internal_error();
        }
    };

    if let Err(err) = state
        .regulator
        .mark(&request.username, password_ok, false, AUTH_TYPE_1FA, &ip)
        .await
    {
        error!(error = %err, "failed to record attempt");
        return internal_error();
    }

    if !password_ok {
        return authentication_failed();
    }

    let details = match state.users.get_details(&request.username).await {
        Ok(details) => details,
        Err(err) => {
            error!(error = %err, "user provider failure after password check");
            return internal_error();
        }
    };

    session.set_one_factor(Utc::now(), &details, request.keep_me_logged_in);

    // Privilege change: the session id must rotate, and only one holder of
    // the old cookie may win.
    let new_token = match token {
        Some(old_token) => match state.sessions.rotate(&old_token, &session).await {
            Ok(Some(new_token)) => new_token,
            Ok(None) => {
                warn!(username = %request.username, "stale session cookie lost rotation");
                return authentication_failed();
            }
            Err(err) => {
                error!(error = %err, "session rotation failed");
                return authentication_failed();
            }
        },
        None => match state.sessions.establish(&session).await {
            Ok(new_token) => new_token,
            Err(err) => {
                error!(error = %err, "session establishment failed");
                return authentication_failed();
            }
        },
    };

    let cookie_domain = requesting_cookie_domain(state, headers);
    let Some(domain) = cookie_domain else {
        error!("no cookie domain covers the portal host");
        return internal_error();
    };

    let cookie = match state.sessions.cookie(
        &domain.domain,
        &new_token,
        state.sessions.cookie_max_age(&session),
    ) {
        Ok(cookie) => cookie,
        Err(err) => {
            error!(error = %err, "failed to build session cookie");
            return internal_error();
        }
    };

    let mut response = match first_factor_redirect(
        state,
        &session,
        request.target_url.as_deref(),
        cookie_domain,
    ) {
        Some(redirect) => ok_data(RedirectResponse { redirect }),
        None => ok_empty(),
    };
    response.headers_mut().insert(SET_COOKIE, cookie);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_field_names_are_the_contract() {
        let raw = r#"{
            "username": "john",
            "password": "hunter2",
            "targetURL": "https://app.example.com/",
            "requestMethod": "GET",
            "keepMeLoggedIn": true
        }"#;
        let request: FirstFactorRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.username, "john");
        assert_eq!(request.target_url.as_deref(), Some("https://app.example.com/"));
        assert_eq!(request.request_method.as_deref(), Some("GET"));
        assert!(request.keep_me_logged_in);
    }

    #[test]
    fn optional_fields_default() {
        let raw = r#"{"username": "john", "password": "hunter2"}"#;
        let request: FirstFactorRequest = serde_json::from_str(raw).expect("parse");
        assert!(request.target_url.is_none());
        assert!(!request.keep_me_logged_in);
    }
}
