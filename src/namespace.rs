//! Namespace model: host-to-tag catalog, constraint rules, and the
//! predecessor-failure policy shared by every job running in the namespace.
//!
//! The durable form is a YAML document stored in the coordination store;
//! [`Namespace`] is the in-memory view rehydrated from it on demand.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PogoError, Result};

/// A concurrency bound: either an absolute count or a percentage of the
/// population it applies to. Serialized as `4` or `"40%"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Count(u32),
    Percent(u32),
}

impl Capacity {
    /// Resolve against a population size. Percentages round up so a
    /// non-zero percentage of a non-empty population admits at least one.
    pub fn resolve(&self, population: usize) -> usize {
        match *self {
            Capacity::Count(n) => n as usize,
            Capacity::Percent(p) => {
                (population * p as usize).div_ceil(100)
            }
        }
    }
}

impl Serialize for Capacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Capacity::Count(n) => serializer.serialize_u32(n),
            Capacity::Percent(p) => serializer.serialize_str(&format!("{}%", p)),
        }
    }
}

impl<'de> Deserialize<'de> for Capacity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Capacity::Count(n)),
            Raw::Text(s) => {
                let trimmed = s.trim();
                let digits = trimmed
                    .strip_suffix('%')
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid capacity: {s}")))?;
                let p: u32 = digits
                    .trim()
                    .parse()
                    .map_err(|_| serde::de::Error::custom(format!("invalid capacity: {s}")))?;
                Ok(Capacity::Percent(p))
            }
        }
    }
}

/// What happens to a host whose sequence predecessor ends in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredecessorFailurePolicy {
    /// The dependent host is marked skipped.
    Skip,
    /// The dependent host is marked deadlocked (default).
    #[default]
    Deadlock,
    /// The dependency is treated as satisfied.
    Proceed,
}

/// One constraint rule from the namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintRule {
    /// Tag selector the rule applies to, written `%tag`.
    pub applies_to: String,
    /// Cap on simultaneously running hosts matching the selector, counted
    /// across every job in the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<Capacity>,
    /// Tag selectors whose hosts must all finish before a host matching
    /// `applies_to` may start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence_before: Vec<String>,
}

/// Durable namespace document, as stored at `/pogo/ns/<ns>/config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Host to tag-set mapping.
    #[serde(default)]
    pub hosts: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub constraints: Vec<ConstraintRule>,
    #[serde(default)]
    pub on_predecessor_failure: PredecessorFailurePolicy,
}

/// In-memory namespace view.
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    config: NamespaceConfig,
}

impl Namespace {
    pub fn new(name: impl Into<String>, config: NamespaceConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Parse a namespace from its YAML document.
    pub fn from_yaml(name: impl Into<String>, doc: &str) -> Result<Self> {
        let config: NamespaceConfig = serde_yaml::from_str(doc)
            .map_err(|e| PogoError::InvalidSpec(format!("namespace config: {}", e)))?;
        Ok(Self::new(name, config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn constraints(&self) -> &[ConstraintRule] {
        &self.config.constraints
    }

    pub fn policy(&self) -> PredecessorFailurePolicy {
        self.config.on_predecessor_failure
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.config.hosts.contains_key(host)
    }

    /// Tags attached to a host. Hosts outside the namespace have none.
    pub fn tags_of(&self, host: &str) -> BTreeSet<String> {
        self.config.hosts.get(host).cloned().unwrap_or_default()
    }

    /// True if any host in the namespace carries the tag.
    pub fn knows_tag(&self, tag: &str) -> bool {
        self.config.hosts.values().any(|tags| tags.contains(tag))
    }

    /// Hosts carrying the tag, in lexicographic order.
    pub fn hosts_with_tag(&self, tag: &str) -> Vec<String> {
        self.config
            .hosts
            .iter()
            .filter(|(_, tags)| tags.contains(tag))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Resolve a `%tag` selector to the matching hosts.
    pub fn resolve_selector(&self, selector: &str) -> Result<Vec<String>> {
        let tag = selector_tag(selector)?;
        if !self.knows_tag(tag) {
            return Err(PogoError::UnknownTag(tag.to_string()));
        }
        Ok(self.hosts_with_tag(tag))
    }

    /// Resolve a constraint's cap against the hosts matching its selector.
    pub fn resolved_cap(&self, rule: &ConstraintRule) -> Option<usize> {
        let cap = rule.max_parallel?;
        let tag = selector_tag(&rule.applies_to).ok()?;
        Some(cap.resolve(self.hosts_with_tag(tag).len()))
    }
}

/// Strip the `%` sigil from a tag selector.
pub fn selector_tag(selector: &str) -> Result<&str> {
    selector
        .strip_prefix('%')
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PogoError::InvalidSpec(format!("invalid tag selector: {selector}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_YAML: &str = r#"
hosts:
  web1.example.com: [web]
  web2.example.com: [web]
  db1.example.com: [db]
  db2.example.com: [db, primary]
constraints:
  - applies_to: "%db"
    max_parallel: 1
  - applies_to: "%web"
    max_parallel: "50%"
    sequence_before: ["%db"]
on_predecessor_failure: skip
"#;

    #[test]
    fn parses_yaml_document() {
        let ns = Namespace::from_yaml("example", EXAMPLE_YAML).unwrap();
        assert_eq!(ns.config().hosts.len(), 4);
        assert_eq!(ns.constraints().len(), 2);
        assert_eq!(ns.policy(), PredecessorFailurePolicy::Skip);
        assert_eq!(
            ns.tags_of("db2.example.com"),
            ["db", "primary"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn selector_resolution() {
        let ns = Namespace::from_yaml("example", EXAMPLE_YAML).unwrap();
        assert_eq!(
            ns.resolve_selector("%db").unwrap(),
            vec!["db1.example.com".to_string(), "db2.example.com".to_string()]
        );
        assert!(matches!(
            ns.resolve_selector("%nope"),
            Err(PogoError::UnknownTag(_))
        ));
        assert!(matches!(
            ns.resolve_selector("db"),
            Err(PogoError::InvalidSpec(_))
        ));
    }

    #[test]
    fn capacity_resolution() {
        assert_eq!(Capacity::Count(3).resolve(10), 3);
        assert_eq!(Capacity::Percent(50).resolve(4), 2);
        // Rounds up so a small population still admits one host.
        assert_eq!(Capacity::Percent(10).resolve(4), 1);
        assert_eq!(Capacity::Percent(100).resolve(0), 0);
    }

    #[test]
    fn percent_cap_resolves_against_selector_population() {
        let ns = Namespace::from_yaml("example", EXAMPLE_YAML).unwrap();
        let web_rule = &ns.constraints()[1];
        assert_eq!(ns.resolved_cap(web_rule), Some(1));
    }

    #[test]
    fn default_policy_is_deadlock() {
        let ns = Namespace::from_yaml("empty", "hosts: {}").unwrap();
        assert_eq!(ns.policy(), PredecessorFailurePolicy::Deadlock);
    }
}
