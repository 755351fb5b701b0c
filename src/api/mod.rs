//! Server assembly: pool, component construction, router, and serving.

use anyhow::{Context, Result};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{any, get},
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

pub(crate) mod email;
pub mod handlers;
mod openapi;

pub use email::{EmailWorkerConfig, LogEmailSender};
pub use openapi::openapi;

use crate::authentication::{FirstFactorDelay, UserProvider};
use crate::authorization::Authorizer;
use crate::duo::{DuoClient, DuoConfig};
use crate::regulation::{RegulationConfig, Regulator};
use crate::session::memory::MemorySessionBackend;
use crate::session::postgres::PostgresSessionBackend;
use crate::session::{SessionBackend, SessionConfig, SessionManager};
use crate::totp::{TotpConfig, TotpService};
use crate::webauthn::WebauthnService;
use handlers::ServerState;

/// Which session backend to construct at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionBackendKind {
    Memory,
    Postgres,
}

impl std::str::FromStr for SessionBackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "memory" => Ok(Self::Memory),
            "postgres" => Ok(Self::Postgres),
            other => Err(format!("unknown session backend: {other}")),
        }
    }
}

/// Everything `new` needs beyond the already-built authorizer and user
/// provider.
pub struct ServerOptions {
    pub session: SessionConfig,
    pub session_backend: SessionBackendKind,
    pub regulation: RegulationConfig,
    pub totp: Option<(TotpConfig, [u8; 32])>,
    pub webauthn: Option<(String, String)>,
    pub duo: Option<DuoConfig>,
    pub elevation_window: chrono::Duration,
    pub email: EmailWorkerConfig,
}

/// Start the server.
///
/// # Errors
/// Returns an error when the pool, a component, or the listener fails to
/// come up.
pub async fn new(
    port: u16,
    dsn: String,
    authorizer: Arc<Authorizer>,
    users: Arc<dyn UserProvider>,
    options: ServerOptions,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    // Calibrate the first-factor floor before accepting traffic.
    let first_factor_delay = FirstFactorDelay::measure();

    let backend: Arc<dyn SessionBackend> = match options.session_backend {
        SessionBackendKind::Memory => Arc::new(MemorySessionBackend::new()),
        SessionBackendKind::Postgres => Arc::new(PostgresSessionBackend::new(pool.clone())),
    };
    let sessions = SessionManager::new(options.session, backend);

    let regulator = Regulator::new(options.regulation, pool.clone());

    let totp = options
        .totp
        .map(|(config, key)| TotpService::new(config, key, pool.clone()));

    let webauthn = options
        .webauthn
        .map(|(rp_id, rp_origin)| {
            WebauthnService::new(pool.clone(), &rp_id, &rp_origin)
                .context("Failed to build WebAuthn service")
        })
        .transpose()?
        .map(Arc::new);

    let duo: Option<Arc<dyn crate::duo::DuoApi>> = options
        .duo
        .map(|config| DuoClient::new(config).context("Failed to build Duo client"))
        .transpose()?
        .map(|client| Arc::new(client) as Arc<dyn crate::duo::DuoApi>);

    let state = Arc::new(ServerState {
        authorizer,
        sessions,
        users,
        regulator,
        first_factor_delay,
        totp,
        webauthn,
        duo,
        elevation_window: options.elevation_window,
    });

    // Reset-password notifications drain through the DB-backed outbox.
    email::spawn_outbox_worker(pool.clone(), Arc::new(LogEmailSender), options.email);

    // Documented portal routes come from the OpenAPI wiring; the
    // proxy-protocol endpoints accept arbitrary methods and are added here.
    let (router, _openapi) = openapi::api_router().split_for_parts();
    let app = router
        .route("/api/verify", get(handlers::authz::verify))
        .route("/api/authz/auth-request", any(handlers::authz::auth_request))
        .route("/api/authz/forward-auth", any(handlers::authz::forward_auth))
        .route("/api/authz/ext-authz", any(handlers::authz::ext_authz))
        .route("/api/authz/ext-authz/{*path}", any(handlers::authz::ext_authz))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state))
                .layer(Extension(pool)),
        );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
