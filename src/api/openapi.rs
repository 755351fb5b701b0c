use super::handlers::{
    first_factor, health, logout, reset_password, second_factor, state,
};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// The proxy-protocol endpoints (`/api/verify`, `/api/authz/*`) accept
/// arbitrary methods and are registered outside this router, undocumented
/// on purpose.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path; handlers
    // sharing a path go into one call.
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(first_factor::first_factor))
        .routes(routes!(logout::logout))
        .routes(routes!(state::state))
        .routes(routes!(state::configuration))
        .routes(routes!(state::safe_redirection))
        .routes(routes!(state::preferences_get, state::preferences_post))
        .routes(routes!(second_factor::totp::totp_post))
        .routes(routes!(second_factor::totp::totp_register))
        .routes(routes!(
            second_factor::webauthn::webauthn_get,
            second_factor::webauthn::webauthn_post
        ))
        .routes(routes!(
            second_factor::webauthn::webauthn_register_get,
            second_factor::webauthn::webauthn_register_post
        ))
        .routes(routes!(second_factor::duo::duo_post))
        .routes(routes!(reset_password::identity_start))
        .routes(routes!(reset_password::identity_finish))
        .routes(routes!(reset_password::reset_password));

    let mut portal_tag = Tag::new("portal");
    portal_tag.description = Some("Login portal state".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("First factor and logout".to_string());

    let mut second_factor_tag = Tag::new("secondfactor");
    second_factor_tag.description = Some("TOTP, WebAuthn and Duo verification".to_string());

    router.get_openapi_mut().tags = Some(vec![portal_tag, auth_tag, second_factor_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    OpenApiBuilder::new().info(info).build()
}
