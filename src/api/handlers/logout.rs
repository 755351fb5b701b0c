//! Logout: destroy the server-side session and clear the cookie.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use url::Url;
use utoipa::ToSchema;

use super::first_factor::requesting_cookie_domain;
use super::{ServerState, internal_error, ok_data};

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutRequest {
    #[serde(default, rename = "targetURL")]
    pub target_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LogoutResponse {
    /// Whether the supplied target may be followed by the frontend.
    #[serde(rename = "safeTargetURL")]
    pub safe_target_url: bool,
}

/// `POST /api/logout`
#[utoipa::path(
    post,
    path = "/api/logout",
    request_body = LogoutRequest,
    responses((status = 200, description = "Session destroyed", body = LogoutResponse)),
    tag = "auth"
)]
pub async fn logout(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<LogoutRequest>>,
) -> Response {
    let target_url = payload.and_then(|Json(request)| request.target_url);

    let (_session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during logout");
            return internal_error();
        }
    };

    if let Some(token) = token
        && let Err(err) = state.sessions.destroy(&token).await
    {
        error!(error = %err, "failed to destroy session");
        return internal_error();
    }

    let safe_target_url = target_url
        .as_deref()
        .and_then(|target| Url::parse(target).ok())
        .is_some_and(|target| state.sessions.config().is_safe_redirection(&target));

    let mut response = ok_data(LogoutResponse { safe_target_url });

    // Always clear the cookie, even when no session record existed.
    if let Some(domain) = requesting_cookie_domain(&state, &headers)
        && let Ok(cookie) = state.sessions.clear_cookie(&domain.domain)
    {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logout_response_uses_contract_field_name() {
        let raw = serde_json::to_string(&LogoutResponse {
            safe_target_url: true,
        })
        .expect("serialize");
        assert_eq!(raw, r#"{"safeTargetURL":true}"#);
    }
}
