//! Predicate matchers for the access-control rule dimensions.

use ipnetwork::IpNetwork;
use regex::Regex;
use std::net::IpAddr;

use super::types::Subject;

const SUBEXP_USER: &str = "User";
const SUBEXP_GROUP: &str = "Group";

/// A single domain predicate. Host comparisons are always lower-cased by the
/// caller; patterns are lower-cased at compile time.
#[derive(Clone, Debug)]
pub enum DomainPattern {
    /// Exact host equality.
    Exact(String),
    /// `*.suffix`: exactly one extra label in front of the suffix.
    Wildcard(String),
    /// `{user}.suffix`: the extra label must be the subject's username.
    UserPlaceholder(String),
    /// `{group}.suffix`: the extra label must be one of the subject's groups.
    GroupPlaceholder(String),
}

impl DomainPattern {
    /// Classify a raw domain rule into its predicate form.
    #[must_use]
    pub fn parse(rule: &str) -> Self {
        let rule = rule.to_lowercase();

        if let Some(suffix) = rule.strip_prefix("*.") {
            Self::Wildcard(suffix.to_string())
        } else if let Some(suffix) = rule.strip_prefix("{user}.") {
            Self::UserPlaceholder(suffix.to_string())
        } else if let Some(suffix) = rule.strip_prefix("{group}.") {
            Self::GroupPlaceholder(suffix.to_string())
        } else {
            Self::Exact(rule)
        }
    }

    #[must_use]
    pub fn matches(&self, host: &str, subject: &Subject) -> bool {
        match self {
            Self::Exact(name) => host == name,
            Self::Wildcard(suffix) => match host.strip_suffix(suffix.as_str()) {
                // One label only: "x.example.com" matches "*.example.com",
                // "x.y.example.com" does not, nor does the bare suffix.
                Some(label) => {
                    let label = match label.strip_suffix('.') {
                        Some(label) => label,
                        None => return false,
                    };
                    !label.is_empty() && !label.contains('.')
                }
                None => false,
            },
            Self::UserPlaceholder(suffix) => {
                !subject.username.is_empty()
                    && host == format!("{}.{suffix}", subject.username.to_lowercase())
            }
            Self::GroupPlaceholder(suffix) => subject
                .groups
                .iter()
                .any(|group| host == format!("{}.{suffix}", group.to_lowercase())),
        }
    }

    /// A host this pattern would match, used by round-trip tests.
    #[must_use]
    pub fn synthesize(&self, subject: &Subject) -> String {
        match self {
            Self::Exact(name) => name.clone(),
            Self::Wildcard(suffix) => format!("synthetic.{suffix}"),
            Self::UserPlaceholder(suffix) => {
                format!("{}.{suffix}", subject.username.to_lowercase())
            }
            Self::GroupPlaceholder(suffix) => match subject.groups.first() {
                Some(group) => format!("{}.{suffix}", group.to_lowercase()),
                None => suffix.clone(),
            },
        }
    }
}

/// A compiled, left-anchored resource regex.
#[derive(Clone, Debug)]
pub struct ResourcePattern {
    regex: Regex,
    has_identity_captures: bool,
}

impl ResourcePattern {
    /// Compile a resource rule. The pattern is anchored to the start of the
    /// path regardless of whether it carries its own `^`.
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})"))?;
        let has_identity_captures = regex
            .capture_names()
            .flatten()
            .any(|name| name == SUBEXP_USER || name == SUBEXP_GROUP);

        Ok(Self {
            regex,
            has_identity_captures,
        })
    }

    /// Match the path (with query) and, when the pattern names `User` or
    /// `Group` captures, check the captured value against the subject.
    #[must_use]
    pub fn matches(&self, path: &str, subject: &Subject) -> bool {
        if !self.has_identity_captures {
            return self.regex.is_match(path);
        }

        let Some(captures) = self.regex.captures(path) else {
            return false;
        };

        if let Some(user) = captures.name(SUBEXP_USER)
            && user.as_str() != subject.username
        {
            return false;
        }

        if let Some(group) = captures.name(SUBEXP_GROUP)
            && !subject.groups.iter().any(|g| g == group.as_str())
        {
            return false;
        }

        true
    }
}

/// Parse a network reference that is not a named group: a CIDR, or a bare
/// address promoted to `/32` (IPv4) / `/128` (IPv6).
pub fn parse_network(rule: &str) -> Result<IpNetwork, String> {
    if rule.contains('/') {
        rule.parse::<IpNetwork>()
            .map_err(|err| format!("invalid CIDR {rule}: {err}"))
    } else {
        rule.parse::<IpAddr>()
            .map(IpNetwork::from)
            .map_err(|err| format!("invalid address {rule}: {err}"))
    }
}

#[must_use]
pub fn ip_matches(networks: &[IpNetwork], ip: IpAddr) -> bool {
    networks.iter().any(|network| network.contains(ip))
}

/// One conjunction of subject atoms; all atoms must hold.
#[derive(Clone, Debug)]
pub struct SubjectPredicate {
    atoms: Vec<SubjectAtom>,
}

#[derive(Clone, Debug)]
enum SubjectAtom {
    User(String),
    Group(String),
}

impl SubjectPredicate {
    /// Parse a conjunction of `user:NAME` / `group:NAME` atoms.
    pub fn parse(atoms: &[String]) -> Result<Self, String> {
        let atoms = atoms
            .iter()
            .map(|atom| {
                if let Some(user) = atom.strip_prefix("user:") {
                    Ok(SubjectAtom::User(user.trim().to_string()))
                } else if let Some(group) = atom.strip_prefix("group:") {
                    Ok(SubjectAtom::Group(group.trim().to_string()))
                } else {
                    Err(format!("invalid subject atom: {atom}"))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { atoms })
    }

    #[must_use]
    pub fn matches(&self, subject: &Subject) -> bool {
        self.atoms.iter().all(|atom| match atom {
            SubjectAtom::User(name) => subject.username == *name,
            SubjectAtom::Group(name) => subject.groups.iter().any(|g| g == name),
        })
    }
}

/// A rule's subject list is a disjunction of conjunctions: any predicate
/// matching satisfies the rule.
#[must_use]
pub fn subjects_match(predicates: &[SubjectPredicate], subject: &Subject) -> bool {
    predicates.iter().any(|predicate| predicate.matches(subject))
}
