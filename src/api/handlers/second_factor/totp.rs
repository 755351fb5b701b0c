//! TOTP second-factor verification and enrollment.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;

use super::super::{
    MSG_ELEVATION_REQUIRED, ServerState, client_ip, internal_error, ko, mfa_validation_failed,
    ok_data,
};
use super::{promote_two_factor, second_factor_response};
use crate::regulation::AUTH_TYPE_TOTP;
use crate::session::AuthenticationLevel;
use crate::totp::repo::TotpRepo;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignTotpRequest {
    /// The 6-digit passcode.
    pub token: String,
    #[serde(default, rename = "targetURL")]
    pub target_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TotpKeyResponse {
    pub base32_secret: String,
    pub otpauth_url: String,
}

/// `POST /api/secondfactor/totp`
#[utoipa::path(
    post,
    path = "/api/secondfactor/totp",
    request_body = SignTotpRequest,
    responses(
        (status = 200, description = "Second factor accepted"),
        (status = 401, description = "Validation failed", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn totp_post(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<SignTotpRequest>>,
) -> Response {
    let Some(service) = state.totp.clone() else {
        return mfa_validation_failed();
    };
    let Some(Json(request)) = payload else {
        return mfa_validation_failed();
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during TOTP validation");
            return internal_error();
        }
    };

    let Some(old_token) = token else {
        return mfa_validation_failed();
    };
    if session.authentication_level < AuthenticationLevel::OneFactor {
        return mfa_validation_failed();
    }

    let username = session.username.clone();
    let ip = client_ip(&headers).to_string();

    let valid = match service.verify(&username, &request.token).await {
        Ok(valid) => valid,
        Err(err) => {
            error!(error = %err, username = %username, "TOTP verification errored");
            return mfa_validation_failed();
        }
    };

    if let Err(err) = state
        .regulator
        .mark(&username, valid, false, AUTH_TYPE_TOTP, &ip)
        .await
    {
        error!(error = %err, "failed to record TOTP attempt");
    }

    if !valid {
        warn!(username = %username, "wrong or reused TOTP passcode");
        return mfa_validation_failed();
    }

    let new_token = match promote_two_factor(&state, &old_token, &mut session).await {
        Ok(new_token) => new_token,
        Err(response) => return response,
    };

    second_factor_response(
        &state,
        &headers,
        &session,
        &new_token,
        request.target_url.as_deref(),
    )
}

/// `POST /api/secondfactor/totp/register`
///
/// Generates a fresh secret for the signed-in user. Replacing an existing
/// enrollment is a credential-altering action and needs a recent second
/// factor.
#[utoipa::path(
    post,
    path = "/api/secondfactor/totp/register",
    responses(
        (status = 200, description = "New secret issued", body = TotpKeyResponse),
        (status = 401, description = "Not signed in", body = super::super::KoResponse),
        (status = 403, description = "Elevation required", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn totp_register(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<sqlx::PgPool>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = state.totp.clone() else {
        return ko(axum::http::StatusCode::NOT_FOUND, "TOTP is not configured.");
    };

    let (session, _token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during TOTP enrollment");
            return internal_error();
        }
    };

    if session.authentication_level < AuthenticationLevel::OneFactor {
        return mfa_validation_failed();
    }

    // Re-enrollment overwrites a working credential; demand elevation.
    let existing = match TotpRepo::load(&pool, &session.username).await {
        Ok(existing) => existing,
        Err(err) => {
            error!(error = %err, "failed to check existing TOTP enrollment");
            return internal_error();
        }
    };
    if existing.is_some()
        && !session.elevation_recent(state.elevation_window, chrono::Utc::now())
    {
        return ko(axum::http::StatusCode::FORBIDDEN, MSG_ELEVATION_REQUIRED);
    }

    match service.register(&session.username).await {
        Ok(enrollment) => ok_data(TotpKeyResponse {
            base32_secret: enrollment.base32_secret,
            otpauth_url: enrollment.otpauth_url,
        }),
        Err(err) => {
            error!(error = %err, "TOTP enrollment failed");
            internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_request_parses_contract_fields() {
        let raw = r#"{"token": "123456", "targetURL": "https://app.example.com/"}"#;
        let request: SignTotpRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.token, "123456");
        assert_eq!(request.target_url.as_deref(), Some("https://app.example.com/"));
    }

    #[test]
    fn key_response_serializes_contract_fields() {
        let response = TotpKeyResponse {
            base32_secret: "JBSWY3DP".to_string(),
            otpauth_url: "otpauth://totp/x".to_string(),
        };
        let raw = serde_json::to_string(&response).expect("serialize");
        assert!(raw.contains("base32_secret"));
        assert!(raw.contains("otpauth_url"));
    }
}
