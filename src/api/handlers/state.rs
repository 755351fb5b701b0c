//! Portal state, configuration, safe-redirection checks, and the user's
//! preferred second-factor method.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error};
use url::Url;
use utoipa::ToSchema;

use super::first_factor::requesting_cookie_domain;
use super::{ServerState, authentication_failed, internal_error, ok_data, ok_empty};

pub const METHOD_TOTP: &str = "totp";
pub const METHOD_WEBAUTHN: &str = "webauthn";
pub const METHOD_DUO: &str = "mobile_push";

#[derive(Debug, Serialize, ToSchema)]
pub struct StateResponse {
    pub username: String,
    pub authentication_level: u8,
    pub default_redirection_url: String,
}

/// `GET /api/state`
#[utoipa::path(
    get,
    path = "/api/state",
    responses((status = 200, description = "Session state", body = StateResponse)),
    tag = "portal"
)]
pub async fn state(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let (session, _token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during state lookup");
            return internal_error();
        }
    };

    let default_redirection_url = requesting_cookie_domain(&state, &headers)
        .and_then(|domain| domain.default_redirection_url.as_ref())
        .map(Url::to_string)
        .unwrap_or_default();

    ok_data(StateResponse {
        username: session.username,
        authentication_level: session.authentication_level.as_u8(),
        default_redirection_url,
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConfigurationResponse {
    pub available_methods: Vec<&'static str>,
    pub second_factor_enabled: bool,
}

/// `GET /api/configuration`
#[utoipa::path(
    get,
    path = "/api/configuration",
    responses((status = 200, description = "Portal configuration", body = ConfigurationResponse)),
    tag = "portal"
)]
pub async fn configuration(Extension(state): Extension<Arc<ServerState>>) -> Response {
    ok_data(ConfigurationResponse {
        available_methods: available_methods(&state),
        second_factor_enabled: state.authorizer.is_second_factor_enabled(),
    })
}

fn available_methods(state: &ServerState) -> Vec<&'static str> {
    let mut methods = Vec::new();
    if state.totp.is_some() {
        methods.push(METHOD_TOTP);
    }
    if state.webauthn.is_some() {
        methods.push(METHOD_WEBAUTHN);
    }
    if state.duo.is_some() {
        methods.push(METHOD_DUO);
    }
    methods
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SafeRedirectionRequest {
    pub uri: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SafeRedirectionResponse {
    pub ok: bool,
}

/// `POST /api/checks/safe-redirection` — whether a URI stays inside the
/// cookie-domain tree.
#[utoipa::path(
    post,
    path = "/api/checks/safe-redirection",
    request_body = SafeRedirectionRequest,
    responses((status = 200, description = "Verdict", body = SafeRedirectionResponse)),
    tag = "portal"
)]
pub async fn safe_redirection(
    Extension(state): Extension<Arc<ServerState>>,
    payload: Option<Json<SafeRedirectionRequest>>,
) -> Response {
    let ok = payload
        .and_then(|Json(request)| Url::parse(&request.uri).ok())
        .is_some_and(|target| state.sessions.config().is_safe_redirection(&target));

    ok_data(SafeRedirectionResponse { ok })
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct PreferredMethodBody {
    pub method: String,
}

/// `GET /api/secondfactor/preferences`
#[utoipa::path(
    get,
    path = "/api/secondfactor/preferences",
    responses(
        (status = 200, description = "Preferred method", body = PreferredMethodBody),
        (status = 401, description = "Not signed in", body = super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn preferences_get(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
) -> Response {
    let (session, _token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during preference lookup");
            return internal_error();
        }
    };
    if session.is_anonymous() {
        return authentication_failed();
    }

    let query = "SELECT method FROM user_preferences WHERE username = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&session.username)
        .fetch_optional(&pool)
        .instrument(span)
        .await;

    match row {
        Ok(row) => {
            let method = row
                .map(|row| row.get::<String, _>("method"))
                .unwrap_or_else(|| first_available_method(&state));
            ok_data(PreferredMethodBody { method })
        }
        Err(err) => {
            error!(error = %err, "failed to load preferred method");
            internal_error()
        }
    }
}

fn first_available_method(state: &ServerState) -> String {
    available_methods(state)
        .first()
        .copied()
        .unwrap_or(METHOD_TOTP)
        .to_string()
}

/// `POST /api/secondfactor/preferences`
#[utoipa::path(
    post,
    path = "/api/secondfactor/preferences",
    request_body = PreferredMethodBody,
    responses(
        (status = 200, description = "Preference saved"),
        (status = 401, description = "Not signed in", body = super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn preferences_post(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    payload: Option<Json<PreferredMethodBody>>,
) -> Response {
    let (session, _token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during preference update");
            return internal_error();
        }
    };
    if session.is_anonymous() {
        return authentication_failed();
    }

    let Some(Json(request)) = payload else {
        return internal_error();
    };
    if !available_methods(&state).contains(&request.method.as_str()) {
        return super::ko(
            axum::http::StatusCode::BAD_REQUEST,
            "Unknown second factor method.",
        );
    }

    let query = r"
        INSERT INTO user_preferences (username, method)
        VALUES ($1, $2)
        ON CONFLICT (username)
        DO UPDATE SET method = EXCLUDED.method
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(&session.username)
        .bind(&request.method)
        .execute(&pool)
        .instrument(span)
        .await;

    match result {
        Ok(_) => ok_empty(),
        Err(err) => {
            error!(error = %err, "failed to save preferred method");
            internal_error()
        }
    }
}
