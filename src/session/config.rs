//! Session and cookie configuration.

use chrono::Duration;
use url::Url;

pub const SESSION_COOKIE_NAME: &str = "gardisto_session";

/// One protected cookie domain and the portal that serves it.
#[derive(Clone, Debug)]
pub struct CookieDomain {
    /// Registered domain; the cookie covers it and every sub-domain.
    pub domain: String,
    /// Login portal URL for redirects targeting this domain.
    pub portal_url: Url,
    /// Where to send users who arrive at the portal with no target.
    pub default_redirection_url: Option<Url>,
}

impl CookieDomain {
    /// True when `host` is the domain itself or one of its sub-domains.
    #[must_use]
    pub fn covers(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    cookie_name: String,
    domains: Vec<CookieDomain>,
    inactivity: Duration,
    expiration: Duration,
    remember_me_duration: Duration,
    same_site: String,
}

impl SessionConfig {
    #[must_use]
    pub fn new(domains: Vec<CookieDomain>) -> Self {
        Self {
            cookie_name: SESSION_COOKIE_NAME.to_string(),
            domains,
            inactivity: Duration::minutes(5),
            expiration: Duration::hours(1),
            remember_me_duration: Duration::days(30),
            same_site: "Lax".to_string(),
        }
    }

    #[must_use]
    pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
        self.inactivity = inactivity;
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    #[must_use]
    pub fn with_remember_me_duration(mut self, duration: Duration) -> Self {
        self.remember_me_duration = duration;
        self
    }

    #[must_use]
    pub fn with_same_site(mut self, same_site: String) -> Self {
        self.same_site = same_site;
        self
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn domains(&self) -> &[CookieDomain] {
        &self.domains
    }

    #[must_use]
    pub fn inactivity(&self) -> Duration {
        self.inactivity
    }

    #[must_use]
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    #[must_use]
    pub fn remember_me_duration(&self) -> Duration {
        self.remember_me_duration
    }

    #[must_use]
    pub fn same_site(&self) -> &str {
        &self.same_site
    }

    /// The cookie domain covering a host, if any.
    #[must_use]
    pub fn domain_for_host(&self, host: &str) -> Option<&CookieDomain> {
        self.domains.iter().find(|domain| domain.covers(host))
    }

    /// The portal responsible for a target URL.
    #[must_use]
    pub fn portal_for_target(&self, target: &Url) -> Option<&CookieDomain> {
        target
            .host_str()
            .and_then(|host| self.domain_for_host(host))
    }

    /// A redirect target is safe when it is https and lands inside the
    /// configured cookie-domain tree. Everything else is refused.
    #[must_use]
    pub fn is_safe_redirection(&self, target: &Url) -> bool {
        target.scheme() == "https"
            && target
                .host_str()
                .is_some_and(|host| self.domain_for_host(host).is_some())
    }
}
