//! Subjects, objects, and authorization levels used by the rule engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use url::Url;

/// Ordinal authorization requirement. The order of the variants is the order
/// of the levels: `Bypass < OneFactor < TwoFactor < Denied`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Bypass,
    OneFactor,
    TwoFactor,
    #[serde(rename = "deny")]
    Denied,
}

impl Level {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::OneFactor => "one_factor",
            Self::TwoFactor => "two_factor",
            Self::Denied => "deny",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(policy: &str) -> Result<Self, Self::Err> {
        match policy {
            "bypass" => Ok(Self::Bypass),
            "one_factor" => Ok(Self::OneFactor),
            "two_factor" => Ok(Self::TwoFactor),
            "deny" => Ok(Self::Denied),
            other => Err(format!("unknown policy: {other}")),
        }
    }
}

/// The identity a request is evaluated for. An anonymous subject carries an
/// empty username and no groups.
#[derive(Clone, Debug)]
pub struct Subject {
    pub username: String,
    pub groups: Vec<String>,
    pub ip: IpAddr,
}

impl Subject {
    #[must_use]
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            username: String::new(),
            groups: Vec::new(),
            ip,
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.groups.is_empty()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "username={} groups={} ip={}",
            self.username,
            self.groups.join(","),
            self.ip
        )
    }
}

/// The target of a request: scheme, host, path (with query), and method.
///
/// The method is optional because not every proxy protocol forwards it; a
/// rule with a non-empty method list can never match a method-less object.
#[derive(Clone, Debug)]
pub struct Object {
    pub scheme: String,
    pub domain: String,
    pub path: String,
    pub method: Option<String>,
}

impl Object {
    /// Build an object from the original URL the proxy reported. The matched
    /// path is the raw path plus, when non-empty, `?` and the raw query.
    #[must_use]
    pub fn from_url(target: &Url, method: Option<&str>) -> Self {
        let path = match target.query() {
            Some(query) if !query.is_empty() => format!("{}?{query}", target.path()),
            _ => target.path().to_string(),
        };

        Self {
            scheme: target.scheme().to_string(),
            domain: target.host_str().unwrap_or_default().to_lowercase(),
            path,
            method: method.map(str::to_uppercase),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.domain, self.path)
    }
}
