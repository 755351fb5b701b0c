//! OpenID Connect provider glue.
//!
//! The provider itself (authorization-code state, JWKS, token endpoints) is
//! an external collaborator. The core only carries a pending authorization
//! workflow inside the session record and resumes it once the required
//! authentication level has been reached; the HTTP handlers are the only
//! progress drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::authorization::Level;

/// A pending authorization-code workflow, parked while the user completes
/// first- and second-factor authentication.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OidcWorkflow {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub scopes: Vec<String>,
    /// The level the client's policy demands before tokens may be issued.
    pub required_level: Level,
    pub created_at: DateTime<Utc>,
}

impl OidcWorkflow {
    /// True once the session satisfies the workflow's gating level.
    #[must_use]
    pub fn is_satisfied_by(&self, level: Level) -> bool {
        self.required_level <= level
    }

    /// The portal URL the browser is sent back to so the provider can finish
    /// issuing the authorization code.
    #[must_use]
    pub fn continuation_url(&self, portal: &Url) -> Url {
        let mut url = portal.clone();
        url.set_path("/consent");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("state", &self.state);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(required_level: Level) -> OidcWorkflow {
        OidcWorkflow {
            client_id: "grafana".to_string(),
            redirect_uri: "https://grafana.example.com/oauth/callback".to_string(),
            state: "xyzzy".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string()],
            required_level,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn workflow_gates_on_level() {
        let wf = workflow(Level::TwoFactor);
        assert!(!wf.is_satisfied_by(Level::OneFactor));
        assert!(wf.is_satisfied_by(Level::TwoFactor));

        let wf = workflow(Level::OneFactor);
        assert!(wf.is_satisfied_by(Level::OneFactor));
    }

    #[test]
    fn continuation_url_points_at_the_consent_page() {
        let portal = Url::parse("https://auth.example.com").expect("url");
        let url = workflow(Level::TwoFactor).continuation_url(&portal);
        assert_eq!(url.host_str(), Some("auth.example.com"));
        assert_eq!(url.path(), "/consent");
        assert!(url.query().unwrap_or_default().contains("client_id=grafana"));
        assert!(url.query().unwrap_or_default().contains("state=xyzzy"));
    }
}
