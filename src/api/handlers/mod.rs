//! HTTP handlers for the proxy protocols and the portal JSON API.

pub mod authz;
pub mod first_factor;
pub mod health;
pub mod logout;
pub mod reset_password;
pub mod second_factor;
pub mod state;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::authentication::{FirstFactorDelay, UserProvider};
use crate::authorization::Authorizer;
use crate::duo::DuoApi;
use crate::regulation::Regulator;
use crate::session::SessionManager;
use crate::totp::TotpService;
use crate::webauthn::WebauthnService;

/// Generic failure message for anything credential-shaped; banned users,
/// unknown users, and wrong passwords all read identically.
pub const MSG_AUTHENTICATION_FAILED: &str = "Authentication failed. Check your credentials.";
/// Generic failure for second-factor validation.
pub const MSG_MFA_VALIDATION_FAILED: &str = "Authentication failed, please retry later.";
/// Sent when a credential-altering action needs a fresh second factor.
pub const MSG_ELEVATION_REQUIRED: &str = "Elevation required. Confirm your second factor.";
/// Generic upstream failure; internals go to the log, never the client.
pub const MSG_OPERATION_FAILED: &str = "Operation failed.";

/// Everything the handlers share. Constructed once at startup; immutable
/// afterwards.
pub struct ServerState {
    pub authorizer: Arc<Authorizer>,
    pub sessions: SessionManager,
    pub users: Arc<dyn UserProvider>,
    pub regulator: Regulator,
    pub first_factor_delay: FirstFactorDelay,
    pub totp: Option<TotpService>,
    pub webauthn: Option<Arc<WebauthnService>>,
    pub duo: Option<Arc<dyn DuoApi>>,
    pub elevation_window: chrono::Duration,
}

/// Portal API envelope for successful calls.
#[derive(Debug, Serialize)]
pub struct OkResponse<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Portal API envelope for failed calls.
#[derive(Debug, Serialize, ToSchema)]
pub struct KoResponse {
    pub status: &'static str,
    pub message: String,
}

/// `200 {"status":"OK","data":...}`
pub fn ok_data<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(OkResponse {
            status: "OK",
            data: Some(data),
        }),
    )
        .into_response()
}

/// `200 {"status":"OK"}`
#[must_use]
pub fn ok_empty() -> Response {
    (
        StatusCode::OK,
        Json(OkResponse::<()> {
            status: "OK",
            data: None,
        }),
    )
        .into_response()
}

/// A failure envelope with an explicit status code.
pub fn ko(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(KoResponse {
            status: "KO",
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// The uniform 401 used for every authentication-shaped failure.
#[must_use]
pub fn authentication_failed() -> Response {
    ko(StatusCode::UNAUTHORIZED, MSG_AUTHENTICATION_FAILED)
}

/// The uniform 401 used for every second-factor failure.
#[must_use]
pub fn mfa_validation_failed() -> Response {
    ko(StatusCode::UNAUTHORIZED, MSG_MFA_VALIDATION_FAILED)
}

/// Generic 500; the cause is logged by the caller with a correlation id.
#[must_use]
pub fn internal_error() -> Response {
    ko(StatusCode::INTERNAL_SERVER_ERROR, MSG_OPERATION_FAILED)
}

/// Client IP as reported by the trusted front proxy.
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|value| value.parse().ok());

    if let Some(ip) = forwarded {
        return ip;
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::authentication::{AuthenticationError, UserDetails};
    use crate::authorization::AccessControlConfig;
    use crate::regulation::RegulationConfig;
    use crate::session::config::CookieDomain;
    use crate::session::memory::MemorySessionBackend;
    use crate::session::SessionConfig;
    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;
    use url::Url;

    /// Provider with a single fixed user, for handler tests.
    pub(crate) struct StaticUserProvider;

    #[async_trait]
    impl UserProvider for StaticUserProvider {
        async fn check_password(
            &self,
            username: &str,
            password: &str,
        ) -> Result<bool, AuthenticationError> {
            if username != "john" {
                return Err(AuthenticationError::UserNotFound);
            }
            Ok(password == "hunter2")
        }

        async fn get_details(&self, username: &str) -> Result<UserDetails, AuthenticationError> {
            if username != "john" {
                return Err(AuthenticationError::UserNotFound);
            }
            Ok(UserDetails {
                username: "john".to_string(),
                display_name: "John Doe".to_string(),
                groups: vec!["dev".to_string()],
                emails: vec!["john@example.com".to_string()],
            })
        }

        async fn update_password(&self, _: &str, _: &str) -> Result<(), AuthenticationError> {
            Ok(())
        }
    }

    /// A full server state over the in-memory session backend. The pool is
    /// lazy and never connects; tests exercising storage run elsewhere.
    pub(crate) fn server_state(policy: serde_json::Value) -> Arc<ServerState> {
        let config: AccessControlConfig = serde_json::from_value(policy).expect("policy");
        let authorizer = Arc::new(Authorizer::new(&config).expect("compile"));

        let session_config = SessionConfig::new(vec![CookieDomain {
            domain: "example.com".to_string(),
            portal_url: Url::parse("https://auth.example.com").expect("url"),
            default_redirection_url: None,
        }]);
        let sessions = SessionManager::new(
            session_config,
            Arc::new(MemorySessionBackend::new()),
        );

        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://gardisto@localhost:5432/gardisto_test")
            .expect("lazy pool");

        Arc::new(ServerState {
            authorizer,
            sessions,
            users: Arc::new(StaticUserProvider),
            regulator: Regulator::new(RegulationConfig::new(), pool),
            first_factor_delay: FirstFactorDelay::from_duration(Duration::from_millis(1)),
            totp: None,
            webauthn: None,
            duo: None,
            elevation_window: chrono::Duration::minutes(10),
        })
    }
}
