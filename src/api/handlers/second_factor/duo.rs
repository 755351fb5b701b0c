//! Duo push second factor.
//!
//! PreAuth probes enrollment and the device list. Exactly one usable
//! device+method pair is persisted as the user's preference; more than one
//! turns into a selection prompt for the frontend. The auth call itself is
//! asynchronous on Duo's side and polled here until allow/deny; dropping
//! the request future stops the polling, and no session promotion happens
//! without a completed storage write.

use axum::Json;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

use super::super::{ServerState, client_ip, internal_error, mfa_validation_failed, ok_data};
use super::{promote_two_factor, second_factor_response};
use crate::duo::{
    self, AuthRequest, DuoApi, DuoDevice, RESULT_ALLOW, RESULT_AUTH, RESULT_DENY, RESULT_ENROLL,
    RESULT_WAITING,
};
use crate::regulation::AUTH_TYPE_DUO;
use crate::session::AuthenticationLevel;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_LIMIT: u32 = 60;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignDuoRequest {
    #[serde(default, rename = "targetURL")]
    pub target_url: Option<String>,
    /// Required only for the `mobile_otp` method.
    #[serde(default)]
    pub passcode: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DuoSignResponse {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Vec<Object>)]
    pub devices: Option<Vec<DuoDevice>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enroll_url: Option<String>,
}

/// What the preauth + device-selection phase decided.
enum Selection {
    Proceed { device: String, method: String },
    Respond(Response),
}

/// Pick the device+method to push to, or a response prompting the frontend.
/// Persists the pair when it is the only possible one.
async fn select_device(
    pool: &PgPool,
    username: &str,
    preferred: Option<(String, String)>,
    devices: Vec<DuoDevice>,
) -> anyhow::Result<Selection> {
    if devices.is_empty() {
        // Enrolled but nothing usable; clear the stale preference.
        duo::delete_preferred_device(pool, username).await?;
        return Ok(Selection::Respond(ok_data(DuoSignResponse {
            result: RESULT_ENROLL.to_string(),
            devices: None,
            enroll_url: None,
        })));
    }

    if let Some((device, method)) = preferred
        && devices
            .iter()
            .any(|d| d.device == device && d.capabilities.contains(&method))
    {
        return Ok(Selection::Proceed { device, method });
    }

    if devices.len() > 1 || devices[0].capabilities.len() > 1 {
        debug!(username, "multiple Duo devices or methods, requiring selection");
        return Ok(Selection::Respond(ok_data(DuoSignResponse {
            result: RESULT_AUTH.to_string(),
            devices: Some(devices),
            enroll_url: None,
        })));
    }

    let device = devices[0].device.clone();
    let Some(method) = devices[0].capabilities.first().cloned() else {
        return Ok(Selection::Respond(mfa_validation_failed()));
    };

    // Exactly one possibility: remember it as the preferred pair.
    duo::save_preferred_device(pool, username, &device, &method).await?;
    Ok(Selection::Proceed { device, method })
}

/// Poll the transaction until Duo settles it. The caller's request future
/// carries the deadline; dropping it cancels the poll.
async fn poll_auth(service: &dyn DuoApi, txid: &str) -> anyhow::Result<bool> {
    for _ in 0..POLL_LIMIT {
        let status = service.auth_status(txid).await?;
        match status.result.as_str() {
            RESULT_ALLOW => return Ok(true),
            RESULT_DENY => return Ok(false),
            RESULT_WAITING => tokio::time::sleep(POLL_INTERVAL).await,
            other => {
                warn!(result = other, "unexpected Duo auth status");
                return Ok(false);
            }
        }
    }
    Ok(false)
}

fn pushinfo(target_url: Option<&str>) -> Option<String> {
    target_url.map(|target| format!("target%20url={target}"))
}

/// `POST /api/secondfactor/duo`
#[utoipa::path(
    post,
    path = "/api/secondfactor/duo",
    request_body = SignDuoRequest,
    responses(
        (status = 200, description = "Second factor accepted, or a device selection / enrollment prompt"),
        (status = 401, description = "Validation failed", body = super::super::KoResponse)
    ),
    tag = "secondfactor"
)]
pub async fn duo_post(
    Extension(state): Extension<Arc<ServerState>>,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
    payload: Option<Json<SignDuoRequest>>,
) -> Response {
    let Some(service) = state.duo.clone() else {
        return mfa_validation_failed();
    };
    let Some(Json(request)) = payload else {
        return mfa_validation_failed();
    };

    let (mut session, token) = match state.sessions.session_for_request(&headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during Duo validation");
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

    let preferred = match duo::load_preferred_device(&pool, &username).await {
        Ok(preferred) => preferred,
        Err(err) => {
            error!(error = %err, "failed to load preferred Duo device");
            return internal_error();
        }
    };

    let preauth = match service.preauth(&username, &ip).await {
        Ok(preauth) => preauth,
        Err(err) => {
            error!(error = %err, "Duo preauth failed");
            return internal_error();
        }
    };

    let (device, method) = match preauth.result.as_str() {
        RESULT_ENROLL => {
            debug!(username, "Duo user not enrolled");
            if preferred.is_some()
                && let Err(err) = duo::delete_preferred_device(&pool, &username).await
            {
                error!(error = %err, "failed to clear stale Duo preference");
            }
            return ok_data(DuoSignResponse {
                result: RESULT_ENROLL.to_string(),
                devices: None,
                enroll_url: preauth.enroll_portal_url,
            });
        }
        RESULT_DENY => {
            warn!(username, message = %preauth.status_msg, "Duo denied authentication");
            return mfa_validation_failed();
        }
        RESULT_ALLOW => {
            // Duo bypass: no push needed.
            if let Err(err) = state
                .regulator
                .mark(&username, true, false, AUTH_TYPE_DUO, &ip)
                .await
            {
                error!(error = %err, "failed to record Duo attempt");
            }
            let new_token = match promote_two_factor(&state, &old_token, &mut session).await {
                Ok(new_token) => new_token,
                Err(response) => return response,
            };
            return second_factor_response(
                &state,
                &headers,
                &session,
                &new_token,
                request.target_url.as_deref(),
            );
        }
        RESULT_AUTH => {
            match select_device(&pool, &username, preferred, preauth.devices).await {
                Ok(Selection::Proceed { device, method }) => (device, method),
                Ok(Selection::Respond(response)) => return response,
                Err(err) => {
                    error!(error = %err, "Duo device selection failed");
                    return internal_error();
                }
            }
        }
        other => {
            error!(result = other, "unknown Duo preauth result");
            return internal_error();
        }
    };

    if method == "mobile_otp" && request.passcode.is_none() {
        warn!(username, "Duo OTP method without a passcode");
        return mfa_validation_failed();
    }

    let auth_request = AuthRequest {
        username: username.clone(),
        display_name: session.display_name.clone(),
        device,
        factor: method.clone(),
        ipaddr: ip.clone(),
        pushinfo: pushinfo(request.target_url.as_deref()),
        passcode: request.passcode.clone(),
    };

    let allowed = match service.auth(&auth_request).await {
        Ok(begin) => match poll_auth(service.as_ref(), &begin.txid).await {
            Ok(allowed) => allowed,
            Err(err) => {
                error!(error = %err, "Duo auth polling failed");
                return internal_error();
            }
        },
        Err(err) => {
            error!(error = %err, "Duo auth call failed");
            return internal_error();
        }
    };

    if let Err(err) = state
        .regulator
        .mark(&username, allowed, false, AUTH_TYPE_DUO, &ip)
        .await
    {
        error!(error = %err, "failed to record Duo attempt");
    }

    if !allowed {
        warn!(username, "Duo authentication not allowed");
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
