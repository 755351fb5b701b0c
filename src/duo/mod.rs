//! Duo push second factor: Auth API v2 client and device preferences.
//!
//! The HTTP client is behind the [`DuoApi`] trait so handlers and tests
//! never depend on the wire. Requests are signed the Duo way: an
//! HMAC-SHA512 over `date\nmethod\nhost\npath\nparams`, presented as HTTP
//! basic auth with the integration key.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha512;
use sqlx::{PgPool, Row};
use tracing::Instrument;

type HmacSha512 = Hmac<Sha512>;

pub const FACTOR_PUSH: &str = "push";
pub const RESULT_ALLOW: &str = "allow";
pub const RESULT_DENY: &str = "deny";
pub const RESULT_ENROLL: &str = "enroll";
pub const RESULT_AUTH: &str = "auth";
pub const RESULT_WAITING: &str = "waiting";

#[derive(Clone, Debug)]
pub struct DuoConfig {
    pub api_hostname: String,
    pub integration_key: String,
    pub secret_key: SecretString,
}

/// A device Duo reports as usable, with the factors it supports.
#[derive(Clone, Debug, Deserialize, serde::Serialize)]
pub struct DuoDevice {
    pub device: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreauthResponse {
    pub result: String,
    #[serde(default)]
    pub status_msg: String,
    #[serde(default)]
    pub devices: Vec<DuoDevice>,
    #[serde(default)]
    pub enroll_portal_url: Option<String>,
}

/// An asynchronous auth call only hands back a transaction to poll.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthBegin {
    pub txid: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthStatus {
    pub result: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_msg: String,
}

/// Fields for the second-factor push.
#[derive(Clone, Debug)]
pub struct AuthRequest {
    pub username: String,
    pub display_name: String,
    pub device: String,
    pub factor: String,
    pub ipaddr: String,
    pub pushinfo: Option<String>,
    /// Only for the `mobile_otp` factor.
    pub passcode: Option<String>,
}

#[async_trait]
pub trait DuoApi: Send + Sync {
    /// Probe enrollment state and the usable device list.
    async fn preauth(&self, username: &str, ipaddr: &str) -> Result<PreauthResponse>;

    /// Start an asynchronous authentication; poll the returned transaction.
    async fn auth(&self, request: &AuthRequest) -> Result<AuthBegin>;

    /// Poll an in-flight authentication until `allow`/`deny`.
    async fn auth_status(&self, txid: &str) -> Result<AuthStatus>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    stat: String,
    response: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

pub struct DuoClient {
    http: reqwest::Client,
    config: DuoConfig,
}

impl DuoClient {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: DuoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("failed to build Duo HTTP client")?;

        Ok(Self { http, config })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let mut sorted: Vec<(&str, &str)> = params.to_vec();
        sorted.sort_unstable();
        let body = encode_params(&sorted);

        let date = Utc::now().to_rfc2822();
        let signature = sign_request(
            self.config.secret_key.expose_secret(),
            &date,
            "POST",
            &self.config.api_hostname,
            path,
            &body,
        )?;

        let url = format!("https://{}{path}", self.config.api_hostname);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.integration_key, Some(&signature))
            .header("Date", &date)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .context("Duo API request failed")?;

        let envelope: Envelope<T> = response
            .json()
            .await
            .context("Duo API returned an unreadable body")?;

        if envelope.stat != "OK" {
            return Err(anyhow!(
                "Duo API error: {}",
                envelope.message.unwrap_or_else(|| "unknown".to_string())
            ));
        }

        envelope
            .response
            .ok_or_else(|| anyhow!("Duo API returned an empty response"))
    }
}

#[async_trait]
impl DuoApi for DuoClient {
    async fn preauth(&self, username: &str, ipaddr: &str) -> Result<PreauthResponse> {
        self.call(
            "/auth/v2/preauth",
            &[("username", username), ("ipaddr", ipaddr)],
        )
        .await
    }

    async fn auth(&self, request: &AuthRequest) -> Result<AuthBegin> {
        let mut params = vec![
            ("username", request.username.as_str()),
            ("factor", request.factor.as_str()),
            ("device", request.device.as_str()),
            ("ipaddr", request.ipaddr.as_str()),
            ("async", "1"),
        ];
        if !request.display_name.is_empty() {
            params.push(("display_username", request.display_name.as_str()));
        }
        if let Some(pushinfo) = &request.pushinfo {
            params.push(("pushinfo", pushinfo.as_str()));
        }
        if let Some(passcode) = &request.passcode {
            params.push(("passcode", passcode.as_str()));
        }

        self.call("/auth/v2/auth", &params).await
    }

    async fn auth_status(&self, txid: &str) -> Result<AuthStatus> {
        self.call("/auth/v2/auth_status", &[("txid", txid)]).await
    }
}

fn encode_params(sorted: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in sorted {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// The signed canonical request: params must already be the encoded body.
fn sign_request(
    secret_key: &str,
    date: &str,
    method: &str,
    host: &str,
    path: &str,
    params: &str,
) -> Result<String> {
    let canon = format!(
        "{date}\n{}\n{}\n{path}\n{params}",
        method.to_uppercase(),
        host.to_lowercase()
    );

    let mut mac = HmacSha512::new_from_slice(secret_key.as_bytes())
        .map_err(|err| anyhow!("invalid Duo secret key: {err}"))?;
    mac.update(canon.as_bytes());

    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// Load a user's saved (device, method) pair.
///
/// # Errors
/// Returns an error when the query fails.
pub async fn load_preferred_device(
    pool: &PgPool,
    username: &str,
) -> Result<Option<(String, String)>> {
    let query = "SELECT device, method FROM duo_devices WHERE username = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(username)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load preferred Duo device")?;

    Ok(row.map(|row| (row.get("device"), row.get("method"))))
}

/// Persist the preferred (device, method) pair, replacing any previous one.
///
/// # Errors
/// Returns an error when the write fails.
pub async fn save_preferred_device(
    pool: &PgPool,
    username: &str,
    device: &str,
    method: &str,
) -> Result<()> {
    let query = r"
        INSERT INTO duo_devices (username, device, method)
        VALUES ($1, $2, $3)
        ON CONFLICT (username)
        DO UPDATE SET device = EXCLUDED.device, method = EXCLUDED.method
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(username)
        .bind(device)
        .bind(method)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to save preferred Duo device")?;
    Ok(())
}

/// Forget the preferred pair, e.g. after Duo reports it unusable.
///
/// # Errors
/// Returns an error when the delete fails.
pub async fn delete_preferred_device(pool: &PgPool, username: &str) -> Result<()> {
    let query = "DELETE FROM duo_devices WHERE username = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(username)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete preferred Duo device")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_params_are_sorted_and_encoded() {
        let mut params = vec![("username", "john doe"), ("ipaddr", "10.0.0.1")];
        params.sort_unstable();
        let body = encode_params(&params);
        assert_eq!(body, "ipaddr=10.0.0.1&username=john+doe");
    }

    #[test]
    fn signature_is_stable_for_identical_input() {
        let sig = |host: &str| {
            sign_request(
                "skey",
                "Tue, 21 Aug 2012 17:29:18 -0000",
                "post",
                host,
                "/auth/v2/preauth",
                "ipaddr=10.0.0.1&username=john",
            )
            .expect("sign")
        };

        // Method/host normalization is part of the canonical form.
        assert_eq!(sig("API-xyz.duosecurity.com"), sig("api-xyz.duosecurity.com"));
        assert_eq!(sig("api-xyz.duosecurity.com").len(), 128);
    }

    #[test]
    fn envelope_failure_states_surface() {
        let raw = r#"{"stat": "FAIL", "message": "Invalid signature"}"#;
        let envelope: Envelope<PreauthResponse> = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.stat, "FAIL");
        assert!(envelope.response.is_none());
        assert_eq!(envelope.message.as_deref(), Some("Invalid signature"));
    }

    #[test]
    fn preauth_response_parses_device_list() {
        let raw = r#"{
            "stat": "OK",
            "response": {
                "result": "auth",
                "devices": [
                    {"device": "DEV1", "display_name": "Pixel", "capabilities": ["push", "sms"]}
                ]
            }
        }"#;
        let envelope: Envelope<PreauthResponse> = serde_json::from_str(raw).expect("parse");
        let response = envelope.response.expect("response");
        assert_eq!(response.result, RESULT_AUTH);
        assert_eq!(response.devices.len(), 1);
        assert_eq!(response.devices[0].capabilities, vec!["push", "sms"]);
    }
}
