//! Routing rules
//!
//! An ordered rule list maps `(client, target)` to an action. Rules are
//! compiled once into a [`CompiledRuleSet`] and swapped atomically on
//! settings updates, so in-flight dispatches keep the set they started
//! with while new dispatches see the new one.
//!
//! Rule grammar (as carried by the `routing` settings module):
//!
//! ```json
//! { "rules": [
//!   { "type": "source-ip",   "value": "10.0.0.5",      "action": "direct" },
//!   { "type": "domain",      "value": "intranet.corp", "action": "direct" },
//!   { "type": "domain-glob", "value": "*.ads.example", "action": "reject" },
//!   { "type": "geoip",       "value": "LOCAL",         "action": "direct" },
//!   { "type": "default",     "action": "backend-group",
//!     "backends": ["srv-a", "srv-b"] }
//! ] }
//! ```
//!
//! First match wins. `geoip` matches through a pluggable resolver; the
//! built-in resolver matches nothing, keeping the rule type inert until a
//! data-backed resolver is plugged in.

use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// The `routing` settings module payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Ordered rule list
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One rule as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule type: `source-ip`, `domain`, `domain-glob`, `geoip`, `default`
    #[serde(rename = "type")]
    pub kind: String,

    /// Match value (unused for `default`)
    #[serde(default)]
    pub value: String,

    /// Action: `direct`, `reject`, `backend`, `backend-group`
    pub action: String,

    /// Backend id for the `backend` action
    #[serde(default)]
    pub backend: String,

    /// Backend ids for the `backend-group` action
    #[serde(default)]
    pub backends: Vec<String>,
}

/// What a matched rule decides
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Bypass the tunnel, splice to the origin
    Direct,
    /// Close without forwarding
    Reject,
    /// Route via one specific backend
    Backend(String),
    /// Route via the best member of a group
    BackendGroup(Vec<String>),
}

enum RuleMatcher {
    SourceIp(IpAddr),
    Domain(String),
    DomainGlob(Regex),
    GeoIp(String),
    Default,
}

struct CompiledRule {
    matcher: RuleMatcher,
    action: RuleAction,
}

/// Resolves a target host to a country/zone code for `geoip` rules.
///
/// The evaluator behind this trait is out of scope here; the default
/// resolver matches nothing so `geoip` rules are inert until one is
/// plugged in.
pub trait GeoIpResolver: Send + Sync {
    /// Country/zone code of `host`, if known
    fn resolve(&self, host: &str) -> Option<String>;
}

/// Resolver that never matches
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoIp;

impl GeoIpResolver for NoGeoIp {
    fn resolve(&self, _host: &str) -> Option<String> {
        None
    }
}

/// An immutable, compiled rule list
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// Compile a settings payload.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::RuleCompile` for unknown rule types or
    /// actions and unparsable match values.
    pub fn compile(settings: &RoutingSettings) -> Result<Self, DispatchError> {
        let mut rules = Vec::with_capacity(settings.rules.len());

        for (index, config) in settings.rules.iter().enumerate() {
            let matcher = match config.kind.as_str() {
                "source-ip" => {
                    let ip = config.value.parse::<IpAddr>().map_err(|_| {
                        DispatchError::RuleCompile(format!(
                            "rule {index}: '{}' is not an IP address",
                            config.value
                        ))
                    })?;
                    RuleMatcher::SourceIp(ip)
                }
                "domain" => RuleMatcher::Domain(config.value.to_ascii_lowercase()),
                "domain-glob" => {
                    let pattern = format!(
                        "(?i)^{}$",
                        regex::escape(&config.value).replace("\\*", ".*")
                    );
                    let regex = Regex::new(&pattern).map_err(|e| {
                        DispatchError::RuleCompile(format!("rule {index}: {e}"))
                    })?;
                    RuleMatcher::DomainGlob(regex)
                }
                "geoip" => RuleMatcher::GeoIp(config.value.to_ascii_uppercase()),
                "default" => RuleMatcher::Default,
                other => {
                    return Err(DispatchError::RuleCompile(format!(
                        "rule {index}: unknown type '{other}'"
                    )));
                }
            };

            let action = match config.action.as_str() {
                "direct" => RuleAction::Direct,
                "reject" => RuleAction::Reject,
                "backend" => {
                    if config.backend.is_empty() {
                        return Err(DispatchError::RuleCompile(format!(
                            "rule {index}: backend action without a backend id"
                        )));
                    }
                    RuleAction::Backend(config.backend.clone())
                }
                "backend-group" => {
                    if config.backends.is_empty() {
                        return Err(DispatchError::RuleCompile(format!(
                            "rule {index}: backend-group action without members"
                        )));
                    }
                    RuleAction::BackendGroup(config.backends.clone())
                }
                other => {
                    return Err(DispatchError::RuleCompile(format!(
                        "rule {index}: unknown action '{other}'"
                    )));
                }
            };

            rules.push(CompiledRule { matcher, action });
        }

        Ok(Self { rules })
    }

    /// Evaluate the list top-down; the first matching rule's action wins.
    #[must_use]
    pub fn evaluate(
        &self,
        client_ip: IpAddr,
        target_host: &str,
        geoip: &dyn GeoIpResolver,
    ) -> Option<&RuleAction> {
        for rule in &self.rules {
            let matched = match &rule.matcher {
                RuleMatcher::SourceIp(ip) => *ip == client_ip,
                RuleMatcher::Domain(domain) => target_host.eq_ignore_ascii_case(domain),
                RuleMatcher::DomainGlob(regex) => regex.is_match(target_host),
                RuleMatcher::GeoIp(code) => {
                    geoip.resolve(target_host).as_deref() == Some(code.as_str())
                }
                RuleMatcher::Default => true,
            };
            if matched {
                return Some(&rule.action);
            }
        }
        None
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: &str, value: &str, action: &str) -> RuleConfig {
        RuleConfig {
            kind: kind.to_string(),
            value: value.to_string(),
            action: action.to_string(),
            backend: String::new(),
            backends: Vec::new(),
        }
    }

    fn backend_rule(kind: &str, value: &str, backend: &str) -> RuleConfig {
        RuleConfig {
            kind: kind.to_string(),
            value: value.to_string(),
            action: "backend".to_string(),
            backend: backend.to_string(),
            backends: Vec::new(),
        }
    }

    fn client() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let settings = RoutingSettings {
            rules: vec![
                rule("domain", "example.com", "reject"),
                rule("default", "", "direct"),
            ],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();

        assert_eq!(
            set.evaluate(client(), "example.com", &NoGeoIp),
            Some(&RuleAction::Reject)
        );
        assert_eq!(
            set.evaluate(client(), "other.org", &NoGeoIp),
            Some(&RuleAction::Direct)
        );
    }

    #[test]
    fn test_source_ip_rule() {
        let settings = RoutingSettings {
            rules: vec![rule("source-ip", "10.0.0.5", "direct")],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();

        assert_eq!(
            set.evaluate(client(), "anything", &NoGeoIp),
            Some(&RuleAction::Direct)
        );
        assert_eq!(
            set.evaluate("10.0.0.6".parse().unwrap(), "anything", &NoGeoIp),
            None
        );
    }

    #[test]
    fn test_domain_glob_rule() {
        let settings = RoutingSettings {
            rules: vec![backend_rule("domain-glob", "*.example.com", "srv-1")],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();

        assert_eq!(
            set.evaluate(client(), "api.example.com", &NoGeoIp),
            Some(&RuleAction::Backend("srv-1".to_string()))
        );
        assert_eq!(set.evaluate(client(), "example.com", &NoGeoIp), None);
    }

    #[test]
    fn test_geoip_inert_with_default_resolver() {
        let settings = RoutingSettings {
            rules: vec![rule("geoip", "LOCAL", "direct")],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();
        assert_eq!(set.evaluate(client(), "example.com", &NoGeoIp), None);
    }

    #[test]
    fn test_geoip_with_custom_resolver() {
        struct Fixed;
        impl GeoIpResolver for Fixed {
            fn resolve(&self, _host: &str) -> Option<String> {
                Some("LOCAL".to_string())
            }
        }

        let settings = RoutingSettings {
            rules: vec![rule("geoip", "local", "direct")],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();
        assert_eq!(
            set.evaluate(client(), "example.com", &Fixed),
            Some(&RuleAction::Direct)
        );
    }

    #[test]
    fn test_backend_group_rule() {
        let settings = RoutingSettings {
            rules: vec![RuleConfig {
                kind: "default".to_string(),
                value: String::new(),
                action: "backend-group".to_string(),
                backend: String::new(),
                backends: vec!["a".to_string(), "b".to_string()],
            }],
        };
        let set = CompiledRuleSet::compile(&settings).unwrap();
        assert_eq!(
            set.evaluate(client(), "x", &NoGeoIp),
            Some(&RuleAction::BackendGroup(vec![
                "a".to_string(),
                "b".to_string()
            ]))
        );
    }

    #[test]
    fn test_compile_errors() {
        let bad_type = RoutingSettings {
            rules: vec![rule("port-range", "80", "direct")],
        };
        assert!(CompiledRuleSet::compile(&bad_type).is_err());

        let bad_ip = RoutingSettings {
            rules: vec![rule("source-ip", "not-an-ip", "direct")],
        };
        assert!(CompiledRuleSet::compile(&bad_ip).is_err());

        let missing_backend = RoutingSettings {
            rules: vec![rule("default", "", "backend")],
        };
        assert!(CompiledRuleSet::compile(&missing_backend).is_err());

        let bad_action = RoutingSettings {
            rules: vec![rule("default", "", "mirror")],
        };
        assert!(CompiledRuleSet::compile(&bad_action).is_err());
    }

    #[test]
    fn test_empty_rule_set_matches_nothing() {
        let set = CompiledRuleSet::compile(&RoutingSettings::default()).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.evaluate(client(), "example.com", &NoGeoIp), None);
    }

    #[test]
    fn test_settings_json_shape() {
        let json = r#"{
            "rules": [
                {"type": "domain-glob", "value": "*.internal", "action": "direct"},
                {"type": "default", "action": "backend", "backend": "srv-1"}
            ]
        }"#;
        let settings: RoutingSettings = serde_json::from_str(json).unwrap();
        let set = CompiledRuleSet::compile(&settings).unwrap();
        assert_eq!(set.len(), 2);
    }
}
