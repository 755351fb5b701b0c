//! WebAuthn second-factor assertion and device registration.
//!
//! Both ceremonies are two-phase; the server state between the phases lives
//! in the session record, so any instance behind the load balancer can
//! finish a ceremony another one started.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::ToSchema;
use webauthn_rs::prelude::{
    PublicKeyCredential, RegisterPublicKeyCredential, SecurityKeyAuthentication,
    SecurityKeyRegistration,
};

use super::super::{
    MSG_ELEVATION_REQUIRED, ServerState, client_ip, internal_error, ko, mfa_validation_failed,
    ok_data, ok_empty,
};
use super::{promote_two_factor, second_factor_response};
use crate::regulation::AUTH_TYPE_WEBAUTHN;
use crate::session::AuthenticationLevel;
use crate::webauthn::WebauthnService;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignWebauthnRequest {
    /// The browser's assertion for the challenge parked in the session.
    #[schema(value_type = Object)]
    pub response: PublicKeyCredential,
    #[serde(default, rename = "targetURL")]
    pub target_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterWebauthnRequest {
    #[schema(value_type = Object)]
    pub response: RegisterPublicKeyCredential,
    #[serde(default)]
    pub description: String,
}

fn webauthn_service(state: &ServerState) -> Option<Arc<WebauthnService>> {
    state.webauthn.clone()
}

/// `GET /api/secondfactor/webauthn` — issue an assertion challenge and park
/// its server state in the session.
#[utoipa::path(
    get,
    path = "/api/secondfactor/webauthn",
    responses(
        (status = 200, description = "Assertion challenge"),
        (status = 401, description = "Not signed in", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn webauthn_get(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = webauthn_service(&state) else {
        return mfa_validation_failed();
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during WebAuthn challenge");
            return internal_error();
        }
    };

    let Some(token) = token else {
        return mfa_validation_failed();
    };
    if session.authentication_level < AuthenticationLevel::OneFactor {
        return mfa_validation_failed();
    }

    let (challenge, assertion_state) = match service.start_authentication(&session.username).await
    {
        Ok(started) => started,
        Err(err) => {
            warn!(error = %err, username = %session.username, "WebAuthn challenge failed");
            return mfa_validation_failed();
        }
    };

    let parked = match serde_json::to_value(&assertion_state) {
        Ok(parked) => parked,
        Err(err) => {
            error!(error = %err, "failed to serialize WebAuthn assertion state");
            return internal_error();
        }
    };
    session.webauthn_assertion = Some(parked);
    if let Err(err) = state.sessions.save(&token, &session).await {
        error!(error = %err, "failed to park WebAuthn assertion state");
        return internal_error();
    }

    ok_data(challenge)
}

/// `POST /api/secondfactor/webauthn` — validate the assertion, bump the
/// sign count, promote the session.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn",
    request_body = SignWebauthnRequest,
    responses(
        (status = 200, description = "Second factor accepted"),
        (status = 401, description = "Validation failed", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn webauthn_post(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<SignWebauthnRequest>>,
) -> Response {
    let Some(service) = webauthn_service(&state) else {
        return mfa_validation_failed();
    };
    let Some(Json(request)) = payload else {
        return mfa_validation_failed();
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during WebAuthn validation");
            return internal_error();
        }
    };

    let Some(old_token) = token else {
        return mfa_validation_failed();
    };
    if session.authentication_level < AuthenticationLevel::OneFactor {
        return mfa_validation_failed();
    }

    // The challenge is single use: whatever happens next, it is gone.
    let Some(parked) = session.webauthn_assertion.take() else {
        warn!(username = %session.username, "WebAuthn assertion without a pending challenge");
        return mfa_validation_failed();
    };
    let Ok(assertion_state) = serde_json::from_value::<SecurityKeyAuthentication>(parked) else {
        warn!(username = %session.username, "corrupt WebAuthn assertion state");
        return mfa_validation_failed();
    };

    let username = session.username.clone();
    let ip = client_ip(&headers).to_string();

    let verified = service
        .finish_authentication(&username, &assertion_state, &request.response)
        .await;

    let valid = verified.is_ok();
    if let Err(err) = state
        .regulator
        .mark(&username, valid, false, AUTH_TYPE_WEBAUTHN, &ip)
        .await
    {
        error!(error = %err, "failed to record WebAuthn attempt");
    }

    if let Err(err) = verified {
        warn!(error = %err, username = %username, "WebAuthn assertion rejected");
        // Persist the consumed challenge so it cannot be replayed.
        if let Err(err) = state.sessions.save(&old_token, &session).await {
            error!(error = %err, "failed to clear WebAuthn assertion state");
        }
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

/// `GET /api/secondfactor/webauthn/register` — issue a registration
/// challenge for enrolling a new key.
#[utoipa::path(
    get,
    path = "/api/secondfactor/webauthn/register",
    responses(
        (status = 200, description = "Registration challenge"),
        (status = 401, description = "Not signed in", body = super::super::KoResponse),
        (status = 403, description = "Elevation required", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn webauthn_register_get(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let Some(service) = webauthn_service(&state) else {
        return ko(axum::http::StatusCode::NOT_FOUND, "WebAuthn is not configured.");
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during WebAuthn registration");
            return internal_error();
        }
    };

    let Some(token) = token else {
        return mfa_validation_failed();
    };
    if session.authentication_level < AuthenticationLevel::OneFactor {
        return mfa_validation_failed();
    }

    // Adding a credential is a credential-altering action once the user
    // already has a second factor.
    if state.authorizer.is_second_factor_enabled()
        && session.authentication_level == AuthenticationLevel::TwoFactor
        && !session.elevation_recent(state.elevation_window, chrono::Utc::now())
    {
        return ko(axum::http::StatusCode::FORBIDDEN, MSG_ELEVATION_REQUIRED);
    }

    let (challenge, registration_state) = match service
        .start_registration(&session.username, &session.display_name)
        .await
    {
        Ok(started) => started,
        Err(err) => {
            error!(error = %err, "WebAuthn registration challenge failed");
            return internal_error();
        }
    };

    let parked = match serde_json::to_value(&registration_state) {
        Ok(parked) => parked,
        Err(err) => {
            error!(error = %err, "failed to serialize WebAuthn registration state");
            return internal_error();
        }
    };
    session.webauthn_registration = Some(parked);
    if let Err(err) = state.sessions.save(&token, &session).await {
        error!(error = %err, "failed to park WebAuthn registration state");
        return internal_error();
    }

    ok_data(challenge)
}

/// `POST /api/secondfactor/webauthn/register` — validate the attestation
/// and store the new device.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/register",
    request_body = RegisterWebauthnRequest,
    responses(
        (status = 200, description = "Device registered"),
        (status = 401, description = "Validation failed", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn webauthn_register_post(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<RegisterWebauthnRequest>>,
) -> Response {
    let Some(service) = webauthn_service(&state) else {
        return mfa_validation_failed();
    };
    let Some(Json(request)) = payload else {
        return mfa_validation_failed();
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during WebAuthn registration");
            return internal_error();
        }
    };

    let Some(token) = token else {
        return mfa_validation_failed();
    };

    let Some(parked) = session.webauthn_registration.take() else {
        warn!(username = %session.username, "WebAuthn registration without a pending challenge");
        return mfa_validation_failed();
    };
    let Ok(registration_state) = serde_json::from_value::<SecurityKeyRegistration>(parked) else {
        warn!(username = %session.username, "corrupt WebAuthn registration state");
        return mfa_validation_failed();
    };

    let result = service
        .finish_registration(
            &session.username,
            &registration_state,
            &request.response,
            &request.description,
        )
        .await;

    if let Err(err) = state.sessions.save(&token, &session).await {
        error!(error = %err, "failed to clear WebAuthn registration state");
    }

    match result {
        Ok(()) => ok_empty(),
        Err(err) => {
            warn!(error = %err, "WebAuthn registration rejected");
            mfa_validation_failed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_defaults_description() {
        let raw = r#"{"response": {
            "id": "AAAA",
            "rawId": "AAAA",
            "type": "public-key",
            "extensions": {},
            "response": {
                "attestationObject": "AAAA",
                "clientDataJSON": "AAAA"
            }
        }}"#;
        let request: RegisterWebauthnRequest = serde_json::from_str(raw).expect("parse");
        assert!(request.description.is_empty());
    }
}
