//! Access-control policy compilation and evaluation.
//!
//! The policy is an ordered rule list plus a default policy and named
//! network groups. It is compiled once at startup into an [`Authorizer`]
//! which is immutable afterwards and therefore shared behind an `Arc`
//! without locking; reloading is an atomic pointer swap performed by the
//! caller.

pub mod matching;
pub mod types;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

use matching::{DomainPattern, ResourcePattern, SubjectPredicate};
pub use types::{Level, Object, Subject};

/// Raw policy document, deserialized from the `--access-control` JSON file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessControlConfig {
    #[serde(default = "default_policy")]
    pub default_policy: Level,
    #[serde(default)]
    pub networks: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Restore the older matching semantics in which a subject-constrained
    /// rule matches anonymous requests and contributes its policy.
    #[serde(default)]
    pub compat_anonymous_subjects: bool,
}

const fn default_policy() -> Level {
    Level::Denied
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default)]
    pub domains: Vec<String>,
    pub policy: Level,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum AccessControlError {
    #[error("rule {position}: invalid resource regex {pattern:?}")]
    InvalidResource {
        position: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {position}: {detail}")]
    InvalidNetwork { position: usize, detail: String },

    #[error("network group {name:?}: {detail}")]
    InvalidNetworkGroup { name: String, detail: String },

    #[error("rule {position}: {detail}")]
    InvalidSubject { position: usize, detail: String },

    #[error("rule {position}: a bypass rule must not constrain subjects")]
    BypassWithSubjects { position: usize },
}

/// One compiled rule. All five dimensions must match; an empty dimension
/// matches anything.
#[derive(Clone, Debug)]
struct AccessRule {
    position: usize,
    domains: Vec<DomainPattern>,
    resources: Vec<ResourcePattern>,
    methods: Vec<String>,
    networks: Vec<IpNetwork>,
    subjects: Vec<SubjectPredicate>,
    policy: Level,
}

impl AccessRule {
    /// Match everything except the subject dimension.
    fn matches_request(&self, subject: &Subject, object: &Object) -> bool {
        if !self.domains.is_empty()
            && !self
                .domains
                .iter()
                .any(|domain| domain.matches(&object.domain, subject))
        {
            return false;
        }

        if !self.resources.is_empty()
            && !self
                .resources
                .iter()
                .any(|resource| resource.matches(&object.path, subject))
        {
            return false;
        }

        if !self.methods.is_empty() {
            // A request that did not carry a method cannot satisfy a method
            // whitelist.
            match &object.method {
                Some(method) => {
                    if !self.methods.iter().any(|m| m == method) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        if !self.networks.is_empty() && !matching::ip_matches(&self.networks, subject.ip) {
            return false;
        }

        true
    }
}

/// The compiled policy. `get_required_level` scans the rules in order and
/// the first full match wins.
#[derive(Clone, Debug)]
pub struct Authorizer {
    default_policy: Level,
    rules: Vec<AccessRule>,
    compat_anonymous_subjects: bool,
}

impl Authorizer {
    /// Compile an access-control configuration.
    ///
    /// # Errors
    /// Returns an error for invalid resource regexes, unparseable networks,
    /// malformed subject atoms, and subject-constrained bypass rules.
    pub fn new(config: &AccessControlConfig) -> Result<Self, AccessControlError> {
        let groups = resolve_network_groups(&config.networks)?;

        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(position, rule)| compile_rule(position, rule, &groups))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            default_policy: config.default_policy,
            rules,
            compat_anonymous_subjects: config.compat_anonymous_subjects,
        })
    }

    #[must_use]
    pub fn default_policy(&self) -> Level {
        self.default_policy
    }

    /// The level required to access `object` as `subject`.
    ///
    /// An anonymous subject never satisfies a subject-constrained rule; the
    /// scan continues past it and, with no later subject-free match, the
    /// default policy is returned as "pending authentication". The
    /// compatibility flag restores the older semantics where such a rule
    /// matches and contributes its policy.
    #[must_use]
    pub fn get_required_level(&self, subject: &Subject, object: &Object) -> Level {
        trace!(%subject, %object, "checking authorization");

        for rule in &self.rules {
            if !rule.matches_request(subject, object) {
                continue;
            }

            if rule.subjects.is_empty() {
                trace!(position = rule.position, policy = %rule.policy, "rule hit");
                return rule.policy;
            }

            if subject.is_anonymous() {
                if self.compat_anonymous_subjects {
                    return rule.policy;
                }
                // Not matching yet: the subject dimension cannot be decided
                // before authentication.
                continue;
            }

            if matching::subjects_match(&rule.subjects, subject) {
                trace!(position = rule.position, policy = %rule.policy, "rule hit");
                return rule.policy;
            }
        }

        trace!(policy = %self.default_policy, "no matching rule, applying default policy");
        self.default_policy
    }

    /// True when the default policy or any rule requires a second factor.
    /// The portal uses this to decide whether to offer 2FA registration.
    #[must_use]
    pub fn is_second_factor_enabled(&self) -> bool {
        self.default_policy == Level::TwoFactor
            || self.rules.iter().any(|rule| rule.policy == Level::TwoFactor)
    }
}

fn resolve_network_groups(
    groups: &BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, Vec<IpNetwork>>, AccessControlError> {
    groups
        .iter()
        .map(|(name, rules)| {
            let networks = rules
                .iter()
                .map(|rule| {
                    matching::parse_network(rule).map_err(|detail| {
                        AccessControlError::InvalidNetworkGroup {
                            name: name.clone(),
                            detail,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((name.clone(), networks))
        })
        .collect()
}

fn compile_rule(
    position: usize,
    rule: &RuleConfig,
    groups: &BTreeMap<String, Vec<IpNetwork>>,
) -> Result<AccessRule, AccessControlError> {
    if rule.policy == Level::Bypass && !rule.subjects.is_empty() {
        // Such a rule would be unreachable for anonymous subjects.
        return Err(AccessControlError::BypassWithSubjects { position });
    }

    let domains = rule
        .domains
        .iter()
        .map(|domain| DomainPattern::parse(domain))
        .collect();

    let resources = rule
        .resources
        .iter()
        .map(|pattern| {
            ResourcePattern::compile(pattern).map_err(|source| {
                AccessControlError::InvalidResource {
                    position,
                    pattern: pattern.clone(),
                    source,
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let methods = rule.methods.iter().map(|m| m.to_uppercase()).collect();

    // A network reference is a named group or an inline CIDR; named groups
    // are expanded here, once.
    let mut networks = Vec::new();
    for reference in &rule.networks {
        match groups.get(reference) {
            Some(group) => networks.extend(group.iter().copied()),
            None => networks.push(matching::parse_network(reference).map_err(|detail| {
                AccessControlError::InvalidNetwork { position, detail }
            })?),
        }
    }

    let subjects = rule
        .subjects
        .iter()
        .map(|atoms| {
            SubjectPredicate::parse(atoms)
                .map_err(|detail| AccessControlError::InvalidSubject { position, detail })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AccessRule {
        position,
        domains,
        resources,
        methods,
        networks,
        subjects,
        policy: rule.policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use url::Url;

    fn subject(username: &str, groups: &[&str]) -> Subject {
        Subject {
            username: username.to_string(),
            groups: groups.iter().map(ToString::to_string).collect(),
            ip: "192.168.1.10".parse().expect("ip"),
        }
    }

    fn anonymous() -> Subject {
        Subject::anonymous("192.168.1.10".parse::<IpAddr>().expect("ip"))
    }

    fn object(url: &str, method: Option<&str>) -> Object {
        Object::from_url(&Url::parse(url).expect("url"), method)
    }

    fn config(json: serde_json::Value) -> AccessControlConfig {
        serde_json::from_value(json).expect("valid config")
    }

    fn rule(json: serde_json::Value) -> RuleConfig {
        serde_json::from_value(json).expect("valid rule")
    }

    #[test]
    fn empty_configuration_yields_default_policy() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "two_factor"
        })))
        .expect("compile");

        assert_eq!(
            authorizer.get_required_level(&anonymous(), &object("https://x.example.com/", None)),
            Level::TwoFactor
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "resources": ["/admin"], "policy": "two_factor"},
                {"domains": ["app.example.com"], "policy": "one_factor"},
                {"domains": ["app.example.com"], "policy": "deny"}
            ]
        })))
        .expect("compile");

        let s = subject("john", &[]);
        assert_eq!(
            authorizer.get_required_level(&s, &object("https://app.example.com/admin/users", None)),
            Level::TwoFactor
        );
        assert_eq!(
            authorizer.get_required_level(&s, &object("https://app.example.com/", None)),
            Level::OneFactor
        );
    }

    #[test]
    fn bypass_rule_allows_anonymous() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "two_factor",
            "rules": [
                {"domains": ["public.example.com"], "policy": "bypass"}
            ]
        })))
        .expect("compile");

        assert_eq!(
            authorizer
                .get_required_level(&anonymous(), &object("https://public.example.com/", Some("GET"))),
            Level::Bypass
        );
        assert_eq!(
            authorizer
                .get_required_level(&anonymous(), &object("https://secret.example.com/", Some("GET"))),
            Level::TwoFactor
        );
    }

    #[test]
    fn subject_constrained_bypass_is_rejected_at_load() {
        let result = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "policy": "bypass", "subjects": [["user:john"]]}
            ]
        })));

        assert!(matches!(
            result,
            Err(AccessControlError::BypassWithSubjects { position: 0 })
        ));
    }

    #[test]
    fn invalid_resource_regex_is_rejected_at_load() {
        let result = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "resources": ["/(unclosed"], "policy": "one_factor"}
            ]
        })));

        assert!(matches!(
            result,
            Err(AccessControlError::InvalidResource { position: 0, .. })
        ));
    }

    #[test]
    fn group_subject_rule_matches_members_only() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "two_factor",
            "rules": [
                {"domains": ["*.example.com"], "subjects": [["group:dev"]], "policy": "one_factor"}
            ]
        })))
        .expect("compile");

        let o = object("https://app.example.com/", Some("GET"));
        assert_eq!(
            authorizer.get_required_level(&subject("john", &["dev"]), &o),
            Level::OneFactor
        );
        assert_eq!(
            authorizer.get_required_level(&subject("john", &["ops"]), &o),
            Level::TwoFactor
        );
    }

    #[test]
    fn anonymous_skips_subject_rules_and_falls_through() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "subjects": [["group:dev"]], "policy": "two_factor"},
                {"domains": ["app.example.com"], "policy": "one_factor"}
            ]
        })))
        .expect("compile");

        // Anonymous cannot decide the subject rule yet; the later subject-free
        // rule matches instead.
        assert_eq!(
            authorizer.get_required_level(&anonymous(), &object("https://app.example.com/", None)),
            Level::OneFactor
        );
    }

    #[test]
    fn compat_flag_lets_subject_rules_match_anonymous() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "compat_anonymous_subjects": true,
            "rules": [
                {"domains": ["app.example.com"], "subjects": [["group:dev"]], "policy": "two_factor"},
                {"domains": ["app.example.com"], "policy": "one_factor"}
            ]
        })))
        .expect("compile");

        assert_eq!(
            authorizer.get_required_level(&anonymous(), &object("https://app.example.com/", None)),
            Level::TwoFactor
        );
    }

    #[test]
    fn method_whitelist_requires_a_method() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "methods": ["get", "HEAD"], "policy": "bypass"}
            ]
        })))
        .expect("compile");

        let s = anonymous();
        assert_eq!(
            authorizer.get_required_level(&s, &object("https://app.example.com/", Some("GET"))),
            Level::Bypass
        );
        // Missing method: the whitelist cannot be satisfied.
        assert_eq!(
            authorizer.get_required_level(&s, &object("https://app.example.com/", None)),
            Level::Denied
        );
        assert_eq!(
            authorizer.get_required_level(&s, &object("https://app.example.com/", Some("POST"))),
            Level::Denied
        );
    }

    #[test]
    fn named_network_groups_expand_at_load() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "two_factor",
            "networks": {"internal": ["10.0.0.0/8", "172.16.0.0/12"]},
            "rules": [
                {"domains": ["app.example.com"], "networks": ["internal", "192.168.1.20"], "policy": "bypass"}
            ]
        })))
        .expect("compile");

        let o = object("https://app.example.com/", None);
        let from = |ip: &str| Subject::anonymous(ip.parse().expect("ip"));
        assert_eq!(authorizer.get_required_level(&from("10.4.5.6"), &o), Level::Bypass);
        assert_eq!(authorizer.get_required_level(&from("192.168.1.20"), &o), Level::Bypass);
        assert_eq!(
            authorizer.get_required_level(&from("192.168.1.21"), &o),
            Level::TwoFactor
        );
    }

    #[test]
    fn unknown_network_reference_is_rejected_at_load() {
        let result = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [
                {"domains": ["app.example.com"], "networks": ["corporate"], "policy": "bypass"}
            ]
        })));

        assert!(matches!(
            result,
            Err(AccessControlError::InvalidNetwork { position: 0, .. })
        ));
    }

    #[test]
    fn rule_with_every_dimension_empty_matches_everything() {
        let authorizer = Authorizer::new(&config(serde_json::json!({
            "default_policy": "deny",
            "rules": [{"policy": "one_factor"}]
        })))
        .expect("compile");

        assert_eq!(
            authorizer
                .get_required_level(&anonymous(), &object("https://anything.example.org/x", None)),
            Level::OneFactor
        );
    }

    #[test]
    fn second_factor_enabled_from_default_or_rules() {
        let by_default = Authorizer::new(&config(serde_json::json!({
            "default_policy": "two_factor"
        })))
        .expect("compile");
        assert!(by_default.is_second_factor_enabled());

        let by_rule = Authorizer::new(&config(serde_json::json!({
            "default_policy": "one_factor",
            "rules": [{"domains": ["secure.example.com"], "policy": "two_factor"}]
        })))
        .expect("compile");
        assert!(by_rule.is_second_factor_enabled());

        let none = Authorizer::new(&config(serde_json::json!({
            "default_policy": "one_factor"
        })))
        .expect("compile");
        assert!(!none.is_second_factor_enabled());
    }

    #[test]
    fn rule_config_defaults_are_empty() {
        let parsed = rule(serde_json::json!({"policy": "deny"}));
        assert!(parsed.domains.is_empty());
        assert!(parsed.resources.is_empty());
        assert!(parsed.methods.is_empty());
        assert!(parsed.networks.is_empty());
        assert!(parsed.subjects.is_empty());
    }
}
