//! Authorization-protocol endpoints for the front proxies.
//!
//! Three wire shapes land here: the legacy auth-request endpoint
//! (`/api/verify`), its modern twin (`/api/authz/auth-request`), Traefik's
//! forward-auth, and Envoy's ext-authz HTTP variant. All of them normalize
//! into the same `(subject, object)` pair and share one decision path.
//!
//! Malformed proxy input is answered 401, never 400, so a probing client
//! cannot learn which header was wrong.

use axum::extract::{Extension, Path, RawQuery};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{error, info};
use url::Url;

use super::{ServerState, client_ip};
use crate::authorization::{Level, Object, Subject};
use crate::session::UserSession;

pub const HEADER_PORTAL_OVERRIDE: &str = "x-gardisto-url";

/// Rebuild the original URL for the auth-request/forward-auth shapes.
fn forwarded_target(headers: &HeaderMap) -> Option<Url> {
    if let Some(raw) = header_str(headers, "x-original-url") {
        return Url::parse(raw).ok();
    }

    let proto = header_str(headers, "x-forwarded-proto")?;
    let host = header_str(headers, "x-forwarded-host")?;
    let uri = header_str(headers, "x-forwarded-uri").unwrap_or("/");
    Url::parse(&format!("{proto}://{host}{uri}")).ok()
}

fn forwarded_method(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-method")
        .or_else(|| header_str(headers, "x-original-method"))
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// A request is XHR-shaped when it does not accept HTML or announces itself
/// as XMLHttpRequest; those get a 401 instead of a login redirect.
fn is_xhr(headers: &HeaderMap) -> bool {
    let accepts_html = header_str(headers, "accept")
        .is_some_and(|accept| accept.contains("text/html"));
    let requested_with = header_str(headers, "x-requested-with")
        .is_some_and(|value| value.eq_ignore_ascii_case("xmlhttprequest"));

    !accepts_html || requested_with
}

/// The login portal for the request's target domain: the `X-Gardisto-URL`
/// override when it points inside the cookie-domain tree, otherwise the
/// configured portal of the covering cookie domain.
fn resolve_portal(state: &ServerState, headers: &HeaderMap, target_domain: &str) -> Option<Url> {
    if let Some(raw) = header_str(headers, HEADER_PORTAL_OVERRIDE)
        && let Ok(url) = Url::parse(raw)
        && url
            .host_str()
            .is_some_and(|host| state.sessions.config().domain_for_host(host).is_some())
    {
        return Some(url);
    }

    state
        .sessions
        .config()
        .domain_for_host(target_domain)
        .map(|domain| domain.portal_url.clone())
}

/// 302 for safe methods, 303 for everything else so the browser retries the
/// login portal with GET.
fn redirect_status(method: Option<&str>) -> StatusCode {
    match method {
        None | Some("GET" | "HEAD" | "OPTIONS") => StatusCode::FOUND,
        Some(_) => StatusCode::SEE_OTHER,
    }
}

fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Build the `{portal}/?rd={target}&rm={method}` redirect with the anchor
/// body curl-based health checks expect.
fn redirect_response(portal: &Url, target: &Url, method: Option<&str>) -> Response {
    let mut location = portal.clone();
    {
        let mut pairs = location.query_pairs_mut();
        pairs.append_pair("rd", target.as_str());
        if let Some(method) = method {
            pairs.append_pair("rm", method);
        }
    }

    let status = redirect_status(method);
    let status_text = if status == StatusCode::FOUND {
        "302 Found"
    } else {
        "303 See Other"
    };
    let body = format!(
        "<a href=\"{}\">{status_text}</a>",
        html_escape(location.as_str())
    );

    (
        status,
        [
            (header::LOCATION, location.as_str().to_string()),
            (
                header::CONTENT_TYPE,
                "text/html; charset=utf-8".to_string(),
            ),
        ],
        body,
    )
        .into_response()
}

/// 200 with the identity headers proxies forward to the upstream.
fn accept_response(session: &UserSession) -> Response {
    fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(header::HeaderName::from_static(name), value);
        }
    }

    let mut headers = HeaderMap::new();
    if !session.is_anonymous() {
        insert(&mut headers, "remote-user", &session.username);
        insert(&mut headers, "remote-groups", &session.groups.join(","));
        insert(&mut headers, "remote-name", &session.display_name);
        if let Some(email) = session.emails.first() {
            insert(&mut headers, "remote-email", email);
        }
    }
    (StatusCode::OK, headers).into_response()
}

async fn handle(
    state: &ServerState,
    headers: &HeaderMap,
    target: Option<Url>,
    method: Option<String>,
) -> Response {
    let ip = client_ip(headers);

    let Some(target) = target else {
        // InvalidInput: unparseable or missing proxy headers.
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let (session, _token) = match state.sessions.session_for_request(headers).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, "session backend failure during authorization");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let object = Object::from_url(&target, method.as_deref());
    let subject = Subject {
        username: session.username.clone(),
        groups: session.groups.clone(),
        ip,
    };

    let required = state.authorizer.get_required_level(&subject, &object);

    let response = match required {
        Level::Bypass => accept_response(&session),
        Level::Denied => StatusCode::FORBIDDEN.into_response(),
        needed => {
            if session.authentication_level.satisfies(needed) {
                accept_response(&session)
            } else {
                match resolve_portal(state, headers, &object.domain) {
                    None => StatusCode::UNAUTHORIZED.into_response(),
                    Some(portal) => {
                        if session.is_anonymous() && is_xhr(headers) {
                            StatusCode::UNAUTHORIZED.into_response()
                        } else {
                            redirect_response(&portal, &target, object.method.as_deref())
                        }
                    }
                }
            }
        }
    };

    info!(
        remote_ip = %ip,
        method = object.method.as_deref().unwrap_or(""),
        path = %object.path,
        domain = %object.domain,
        required = %required,
        status_code = response.status().as_u16(),
        "authz.decision"
    );

    response
}

/// `GET /api/verify` — the legacy auth-request endpoint.
pub async fn verify(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let target = forwarded_target(&headers);
    let method = forwarded_method(&headers);
    handle(&state, &headers, target, method).await
}

/// `/api/authz/auth-request` — same semantics, any method.
pub async fn auth_request(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let target = forwarded_target(&headers);
    let method = forwarded_method(&headers);
    handle(&state, &headers, target, method).await
}

/// `/api/authz/forward-auth` — Traefik.
pub async fn forward_auth(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    let target = forwarded_target(&headers);
    let method = forwarded_method(&headers);
    handle(&state, &headers, target, method).await
}

/// `/api/authz/ext-authz/{*path}` — Envoy appends the original path to the
/// endpoint; the host comes from the `Host` header and the method is the
/// check request's own.
pub async fn ext_authz(
    Extension(state): Extension<Arc<ServerState>>,
    method: Method,
    path: Option<Path<String>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let target = ext_authz_target(&headers, path.map(|Path(p)| p), query.as_deref());
    handle(&state, &headers, target, Some(method.as_str().to_string())).await
}

fn ext_authz_target(
    headers: &HeaderMap,
    path: Option<String>,
    query: Option<&str>,
) -> Option<Url> {
    let host = header_str(headers, "host")?;
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("https");
    let path = path.unwrap_or_default();
    let mut raw = format!("{scheme}://{host}/{path}");
    if let Some(query) = query
        && !query.is_empty()
    {
        raw.push('?');
        raw.push_str(query);
    }
    Url::parse(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                header::HeaderName::from_bytes(name.as_bytes()).expect("name"),
                HeaderValue::from_str(value).expect("value"),
            );
        }
        map
    }

    #[test]
    fn original_url_header_wins() {
        let map = headers(&[
            ("x-original-url", "https://app.example.com/x?y=1"),
            ("x-forwarded-proto", "http"),
            ("x-forwarded-host", "other.example.com"),
        ]);
        let url = forwarded_target(&map).expect("url");
        assert_eq!(url.as_str(), "https://app.example.com/x?y=1");
    }

    #[test]
    fn forwarded_triplet_reassembles() {
        let map = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "app.example.com"),
            ("x-forwarded-uri", "/dashboard?tab=2"),
        ]);
        let url = forwarded_target(&map).expect("url");
        assert_eq!(url.as_str(), "https://app.example.com/dashboard?tab=2");

        // Missing URI defaults to the root.
        let map = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "app.example.com"),
        ]);
        assert_eq!(
            forwarded_target(&map).expect("url").as_str(),
            "https://app.example.com/"
        );
    }

    #[test]
    fn unparseable_target_is_none() {
        let map = headers(&[("x-original-url", "http://[")]);
        assert!(forwarded_target(&map).is_none());
        assert!(forwarded_target(&HeaderMap::new()).is_none());
    }

    #[test]
    fn method_headers_in_priority_order() {
        let map = headers(&[
            ("x-forwarded-method", "POST"),
            ("x-original-method", "GET"),
        ]);
        assert_eq!(forwarded_method(&map).as_deref(), Some("POST"));

        let map = headers(&[("x-original-method", "PATCH")]);
        assert_eq!(forwarded_method(&map).as_deref(), Some("PATCH"));

        assert!(forwarded_method(&HeaderMap::new()).is_none());
    }

    #[test]
    fn xhr_detection_follows_accept_and_requested_with() {
        // No Accept at all: not a browser navigation.
        assert!(is_xhr(&HeaderMap::new()));

        let browser = headers(&[("accept", "text/html,application/xhtml+xml")]);
        assert!(!is_xhr(&browser));

        let json = headers(&[("accept", "application/json")]);
        assert!(is_xhr(&json));

        let announced = headers(&[
            ("accept", "text/html"),
            ("x-requested-with", "XMLHttpRequest"),
        ]);
        assert!(is_xhr(&announced));
    }

    #[test]
    fn redirect_statuses_by_method() {
        assert_eq!(redirect_status(Some("GET")), StatusCode::FOUND);
        assert_eq!(redirect_status(Some("HEAD")), StatusCode::FOUND);
        assert_eq!(redirect_status(Some("OPTIONS")), StatusCode::FOUND);
        assert_eq!(redirect_status(None), StatusCode::FOUND);
        assert_eq!(redirect_status(Some("POST")), StatusCode::SEE_OTHER);
        assert_eq!(redirect_status(Some("DELETE")), StatusCode::SEE_OTHER);
    }

    #[test]
    fn redirect_location_carries_rd_and_rm() {
        let portal = Url::parse("https://auth.example.com/").expect("url");
        let target = Url::parse("https://secret.example.com/").expect("url");

        let response = redirect_response(&portal, &target, Some("GET"));
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location");
        assert_eq!(
            location,
            "https://auth.example.com/?rd=https%3A%2F%2Fsecret.example.com%2F&rm=GET"
        );

        let response = redirect_response(&portal, &target, Some("POST"));
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location");
        assert_eq!(
            location,
            "https://auth.example.com/?rd=https%3A%2F%2Fsecret.example.com%2F&rm=POST"
        );
    }

    #[test]
    fn html_body_is_escaped_anchor() {
        assert_eq!(
            html_escape("https://a/?rd=x&rm=GET"),
            "https://a/?rd=x&amp;rm=GET"
        );
        assert_eq!(html_escape("<\">"), "&lt;&quot;&gt;");
    }

    mod scenarios {
        use super::super::handle;
        use super::headers;
        use crate::api::handlers::test_support::server_state;
        use crate::session::UserSession;
        use axum::http::{HeaderMap, StatusCode, header};
        use chrono::Utc;
        use url::Url;

        fn policy() -> serde_json::Value {
            serde_json::json!({
                "default_policy": "two_factor",
                "rules": [
                    {"domains": ["public.example.com"], "policy": "bypass"},
                    {"domains": ["denied.example.com"], "policy": "deny"},
                    {"domains": ["basic.example.com"], "policy": "one_factor"}
                ]
            })
        }

        fn browser_headers() -> HeaderMap {
            headers(&[("accept", "text/html,application/xhtml+xml")])
        }

        fn location_of(response: &axum::response::Response) -> String {
            response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .expect("location")
                .to_string()
        }

        #[tokio::test]
        async fn bypass_rule_allows_anonymous() {
            let state = server_state(policy());
            let target = Url::parse("https://public.example.com/").expect("url");
            let response = handle(
                &state,
                &browser_headers(),
                Some(target),
                Some("GET".to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn anonymous_browser_gets_302_with_rd_and_rm() {
            let state = server_state(policy());
            let target = Url::parse("https://secret.example.com/").expect("url");
            let response = handle(
                &state,
                &browser_headers(),
                Some(target),
                Some("GET".to_string()),
            )
            .await;

            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(
                location_of(&response),
                "https://auth.example.com/?rd=https%3A%2F%2Fsecret.example.com%2F&rm=GET"
            );
        }

        #[tokio::test]
        async fn non_safe_method_downgrades_to_303() {
            let state = server_state(policy());
            let target = Url::parse("https://secret.example.com/").expect("url");
            let response = handle(
                &state,
                &browser_headers(),
                Some(target),
                Some("POST".to_string()),
            )
            .await;

            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            assert_eq!(
                location_of(&response),
                "https://auth.example.com/?rd=https%3A%2F%2Fsecret.example.com%2F&rm=POST"
            );
        }

        #[tokio::test]
        async fn anonymous_xhr_gets_401_instead_of_redirect() {
            let state = server_state(policy());
            let target = Url::parse("https://secret.example.com/").expect("url");
            let response = handle(
                &state,
                &headers(&[("accept", "application/json")]),
                Some(target),
                Some("GET".to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn explicit_deny_is_403() {
            let state = server_state(policy());
            let target = Url::parse("https://denied.example.com/").expect("url");
            let response = handle(
                &state,
                &browser_headers(),
                Some(target),
                Some("GET".to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn missing_proxy_headers_answer_401() {
            let state = server_state(policy());
            let response = handle(&state, &browser_headers(), None, None).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn target_outside_cookie_domains_answers_401() {
            let state = server_state(policy());
            // No portal is resolvable for this host, so no Location header
            // can point outside the cookie-domain tree.
            let target = Url::parse("https://app.elsewhere.org/").expect("url");
            let response = handle(
                &state,
                &browser_headers(),
                Some(target),
                Some("GET".to_string()),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().get(header::LOCATION).is_none());
        }

        #[tokio::test]
        async fn portal_override_outside_cookie_domains_is_ignored() {
            let state = server_state(policy());
            let mut map = browser_headers();
            map.insert(
                super::super::HEADER_PORTAL_OVERRIDE,
                axum::http::HeaderValue::from_static("https://phish.example.org"),
            );
            let target = Url::parse("https://secret.example.com/").expect("url");
            let response = handle(&state, &map, Some(target), Some("GET".to_string())).await;

            assert_eq!(response.status(), StatusCode::FOUND);
            assert!(location_of(&response).starts_with("https://auth.example.com/"));
        }

        #[tokio::test]
        async fn one_factor_session_passes_one_factor_rule() {
            let state = server_state(policy());

            let mut session = UserSession::anonymous(Utc::now());
            session.set_one_factor(
                Utc::now(),
                &crate::authentication::UserDetails {
                    username: "john".to_string(),
                    display_name: "John Doe".to_string(),
                    groups: vec!["dev".to_string()],
                    emails: vec!["john@example.com".to_string()],
                },
                false,
            );
            let token = state.sessions.establish(&session).await.expect("establish");

            let mut map = browser_headers();
            map.insert(
                header::COOKIE,
                axum::http::HeaderValue::from_str(&format!("gardisto_session={token}"))
                    .expect("cookie"),
            );

            let target = Url::parse("https://basic.example.com/").expect("url");
            let response = handle(&state, &map, Some(target), Some("GET".to_string())).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response
                    .headers()
                    .get("remote-user")
                    .and_then(|value| value.to_str().ok()),
                Some("john")
            );
            assert_eq!(
                response
                    .headers()
                    .get("remote-groups")
                    .and_then(|value| value.to_str().ok()),
                Some("dev")
            );

            // The same session does not satisfy the two-factor default.
            let target = Url::parse("https://secret.example.com/").expect("url");
            let response = handle(&state, &map, Some(target), Some("GET".to_string())).await;
            assert_eq!(response.status(), StatusCode::FOUND);
        }
    }

    #[test]
    fn ext_authz_target_from_host_and_path() {
        let map = headers(&[("host", "app.example.com")]);
        let url =
            ext_authz_target(&map, Some("deep/path".to_string()), Some("a=1")).expect("url");
        assert_eq!(url.as_str(), "https://app.example.com/deep/path?a=1");

        let map = headers(&[
            ("host", "app.example.com"),
            ("x-forwarded-proto", "http"),
        ]);
        let url = ext_authz_target(&map, None, None).expect("url");
        assert_eq!(url.as_str(), "http://app.example.com/");

        assert!(ext_authz_target(&HeaderMap::new(), None, None).is_none());
    }
}
