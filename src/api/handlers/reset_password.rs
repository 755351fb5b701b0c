//! Password reset: opaque identity verification, then the password change.
//!
//! The start endpoint always answers 200 so account existence cannot be
//! probed. Tokens are single use, hashed at rest, and TTL-bound; the email
//! row and the token row are written in one transaction.

use anyhow::{Context, Result};
use axum::Json;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::http::header::SET_COOKIE;
use axum::response::Response;
use base64::Engine;
use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error, info, warn};
use utoipa::ToSchema;

use super::first_factor::requesting_cookie_domain;
use super::{
    MSG_OPERATION_FAILED, ServerState, internal_error, ko, ok_empty,
};
use crate::api::email;
use crate::authentication::AuthenticationError;

const IDENTITY_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const TEMPLATE_RESET_PASSWORD: &str = "reset_password";

#[derive(Debug, Deserialize, ToSchema)]
pub struct IdentityStartRequest {
    pub username: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IdentityFinishRequest {
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub password: String,
}

fn generate_identity_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate identity token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn hash_identity_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// `POST /api/reset-password/identity/start`
///
/// Always 200; the work happens only for known users with an email.
#[utoipa::path(
    post,
    path = "/api/reset-password/identity/start",
    request_body = IdentityStartRequest,
    responses((status = 200, description = "Accepted")),
    tag = "resetpassword"
)]
pub async fn identity_start(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    payload: Option<Json<IdentityStartRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ok_empty();
    };

    if let Err(err) = start_identity_verification(&state, &pool, &headers, &request.username).await
    {
        // Deliberately opaque to the caller.
        warn!(error = %err, "reset-password identity start did not complete");
    }

    ok_empty()
}

async fn start_identity_verification(
    state: &ServerState,
    pool: &PgPool,
    headers: &HeaderMap,
    username: &str,
) -> Result<()> {
    let details = state
        .users
        .get_details(username)
        .await
        .context("unknown user")?;
    let email = details
        .emails
        .first()
        .context("user has no email address")?;

    let token = generate_identity_token()?;
    let token_hash = hash_identity_token(&token);

    let reset_url = requesting_cookie_domain(state, headers)
        .map(|domain| {
            let mut url = domain.portal_url.clone();
            url.set_path("/reset-password/step2");
            url.set_query(Some(&format!("token={token}")));
            url.to_string()
        })
        .context("no cookie domain covers the portal host")?;

    let mut tx = pool.begin().await.context("begin identity transaction")?;

    let query = r"
        INSERT INTO identity_tokens (token_hash, username, action, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&token_hash)
        .bind(username)
        .bind(TEMPLATE_RESET_PASSWORD)
        .bind(IDENTITY_TOKEN_TTL_SECONDS)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert identity token")?;

    email::enqueue(
        &mut tx,
        email,
        TEMPLATE_RESET_PASSWORD,
        &serde_json::json!({
            "username": username,
            "reset_url": reset_url,
        }),
    )
    .await?;

    tx.commit().await.context("commit identity transaction")?;
    Ok(())
}

/// `POST /api/reset-password/identity/finish`
///
/// Consumes the token and marks the session as allowed to set a new
/// password for its user.
#[utoipa::path(
    post,
    path = "/api/reset-password/identity/finish",
    request_body = IdentityFinishRequest,
    responses(
        (status = 200, description = "Identity verified"),
        (status = 401, description = "Invalid token", body = super::KoResponse)
    ),
    tag = "resetpassword"
)]
pub async fn identity_finish(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    payload: Option<Json<IdentityFinishRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return ko(StatusCode::UNAUTHORIZED, MSG_OPERATION_FAILED);
    };

    let token_hash = hash_identity_token(request.token.trim());

    // Consume-once: the UPDATE only hits unconsumed, unexpired rows.
    let query = r"
        UPDATE identity_tokens
        SET consumed_at = NOW()
        WHERE token_hash = $1
          AND action = $2
          AND consumed_at IS NULL
          AND expires_at > NOW()
        RETURNING username
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = match sqlx::query(query)
        .bind(&token_hash)
        .bind(TEMPLATE_RESET_PASSWORD)
        .fetch_optional(&pool)
        .instrument(span)
        .await
    {
        Ok(row) => row,
        Err(err) => {
            error!(error = %err, "failed to consume identity token");
            return internal_error();
        }
    };

    let Some(row) = row else {
        return ko(StatusCode::UNAUTHORIZED, MSG_OPERATION_FAILED);
    };
    let username: String = row.get("username");

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during identity finish");
            return internal_error();
        }
    };

    session.password_reset_username = Some(username);

    let (cookie_token, established) = match token {
        Some(token) => (token, false),
        None => match state.sessions.establish(&session).await {
            Ok(token) => (token, true),
            Err(err) => {
                error!(error = %err, "failed to establish session for password reset");
                return internal_error();
            }
        },
    };

    if !established
        && let Err(err) = state.sessions.save(&cookie_token, &session).await
    {
        error!(error = %err, "failed to persist identity verification");
        return internal_error();
    }

    let mut response = ok_empty();
    if established
        && let Some(domain) = requesting_cookie_domain(&state, &headers)
        && let Ok(cookie) = state.sessions.cookie(
            &domain.domain,
            &cookie_token,
            state.sessions.cookie_max_age(&session),
        )
    {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}

/// `POST /api/reset-password`
#[utoipa::path(
    post,
    path = "/api/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password changed"),
        (status = 401, description = "No verified identity", body = super::KoResponse)
    ),
    tag = "resetpassword"
)]
pub async fn reset_password(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Response {
    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during password reset");
            return internal_error();
        }
    };

    let Some(username) = session.password_reset_username.clone() else {
        return ko(StatusCode::UNAUTHORIZED, MSG_OPERATION_FAILED);
    };

    let Some(Json(request)) = payload else {
        return ko(StatusCode::UNAUTHORIZED, MSG_OPERATION_FAILED);
    };
    if request.password.is_empty() {
        return ko(StatusCode::BAD_REQUEST, MSG_OPERATION_FAILED);
    }

    match state.users.update_password(&username, &request.password).await {
        Ok(()) => {}
        Err(AuthenticationError::UserNotFound) => {
            warn!(username = %username, "password reset for a vanished user");
            return ko(StatusCode::UNAUTHORIZED, MSG_OPERATION_FAILED);
        }
        Err(err) => {
            error!(error = %err, "user provider failure during password reset");
            return internal_error();
        }
    }

    // The verification is single use.
    session.password_reset_username = None;
    if let Some(token) = token
        && let Err(err) = state.sessions.save(&token, &session).await
    {
        error!(error = %err, "failed to clear password reset marker");
    }

    info!(username = %username, at = %Utc::now(), "password reset completed");
    ok_empty()
}
