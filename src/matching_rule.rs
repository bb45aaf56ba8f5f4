//! Matching Rule Registry
//!
//! A matching rule decides how an assertion value is compared with a stored
//! attribute value. Every rule here is defined by a normalisation applied to both
//! sides before an exact comparison, so equality, ordering and substring
//! matching stay consistent for a given rule (RFC 4517 Section 4.2).
//!
//! The built-in registry is created once on first use and never mutated
//! afterwards; it is shared by every connection without locking.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Name of the rule used when a filter does not name one
pub const DEFAULT_RULE: &str = "octetStringMatch";

/// How values are prepared before they are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Byte-for-byte
    Exact,
    /// Unicode lower-casing
    CaseFold,
    /// ASCII-only lower-casing, for IA5 strings
    AsciiCaseFold,
    /// Spaces are insignificant (numeric strings)
    RemoveSpaces,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingRule {
    name: &'static str,
    oid: &'static str,
    normalization: Normalization,
}

impl MatchingRule {
    pub const fn new(name: &'static str, oid: &'static str, normalization: Normalization) -> Self {
        Self {
            name,
            oid,
            normalization,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn oid(&self) -> &'static str {
        self.oid
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Prepares a value for comparison under this rule
    pub fn normalize<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self.normalization {
            Normalization::Exact => Cow::Borrowed(value),
            Normalization::CaseFold => Cow::Owned(value.to_lowercase()),
            Normalization::AsciiCaseFold => Cow::Owned(value.to_ascii_lowercase()),
            Normalization::RemoveSpaces => {
                if value.contains(' ') {
                    Cow::Owned(value.chars().filter(|c| *c != ' ').collect())
                } else {
                    Cow::Borrowed(value)
                }
            }
        }
    }

    pub fn equals(&self, stored: &str, asserted: &str) -> bool {
        self.normalize(stored) == self.normalize(asserted)
    }

    /// Lexicographic ordering of the normalised values
    pub fn compare(&self, stored: &str, asserted: &str) -> Ordering {
        self.normalize(stored).cmp(&self.normalize(asserted))
    }

    /// Substring match of `value` against `initial`, `any` (in order) and `final`
    ///
    /// Segments are matched leftmost-first without backtracking: each `any`
    /// search starts where the previous match ended, and `final` may not
    /// overlap anything matched before it.
    pub fn substrings(
        &self,
        value: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> bool {
        let value = self.normalize(value);
        let mut cursor = 0;

        if let Some(initial) = initial {
            let initial = self.normalize(initial);
            if !value.starts_with(initial.as_ref()) {
                return false;
            }
            cursor = initial.len();
        }

        for segment in any {
            let segment = self.normalize(segment);
            match value[cursor..].find(segment.as_ref()) {
                Some(pos) => cursor += pos + segment.len(),
                None => return false,
            }
        }

        if let Some(final_) = final_ {
            let final_ = self.normalize(final_);
            if value.len() < cursor + final_.len() || !value.ends_with(final_.as_ref()) {
                return false;
            }
        }

        true
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate matching rule name: {0}")]
    DuplicateName(String),

    #[error("Duplicate matching rule OID: {0}")]
    DuplicateOid(String),
}

/// Read-only lookup table of matching rules, keyed by name and by OID
#[derive(Debug, Clone)]
pub struct MatchingRuleRegistry {
    rules: Vec<MatchingRule>,
    by_key: HashMap<&'static str, usize>,
}

impl MatchingRuleRegistry {
    pub fn builder() -> MatchingRuleRegistryBuilder {
        MatchingRuleRegistryBuilder::default()
    }

    /// Looks a rule up by its name or numeric OID (case-sensitive)
    pub fn find(&self, name: &str) -> Option<&MatchingRule> {
        self.by_key.get(name).map(|&idx| &self.rules[idx])
    }

    /// The exact-match rule used when a filter names no rule
    pub fn default_rule(&self) -> &MatchingRule {
        self.find(DEFAULT_RULE).unwrap_or(&OCTET_STRING_MATCH)
    }

    pub fn rules(&self) -> impl Iterator<Item = &MatchingRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MatchingRuleRegistryBuilder {
    rules: Vec<MatchingRule>,
}

impl MatchingRuleRegistryBuilder {
    pub fn rule(mut self, rule: MatchingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = MatchingRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Freezes the table, rejecting any repeated name or OID
    pub fn build(self) -> std::result::Result<MatchingRuleRegistry, RegistryError> {
        let mut by_key = HashMap::with_capacity(self.rules.len() * 2);
        for (idx, rule) in self.rules.iter().enumerate() {
            if by_key.insert(rule.name, idx).is_some() {
                return Err(RegistryError::DuplicateName(rule.name.to_string()));
            }
            if by_key.insert(rule.oid, idx).is_some() {
                return Err(RegistryError::DuplicateOid(rule.oid.to_string()));
            }
        }
        Ok(MatchingRuleRegistry {
            rules: self.rules,
            by_key,
        })
    }
}

const OCTET_STRING_MATCH: MatchingRule =
    MatchingRule::new(DEFAULT_RULE, "2.5.13.17", Normalization::Exact);

/// RFC 4517 rules shipped with the server
pub fn builtin_rules() -> Vec<MatchingRule> {
    use Normalization::*;

    vec![
        OCTET_STRING_MATCH,
        MatchingRule::new("octetStringOrderingMatch", "2.5.13.18", Exact),
        MatchingRule::new("caseIgnoreMatch", "2.5.13.2", CaseFold),
        MatchingRule::new("caseIgnoreOrderingMatch", "2.5.13.3", CaseFold),
        MatchingRule::new("caseIgnoreSubstringsMatch", "2.5.13.4", CaseFold),
        MatchingRule::new("caseExactMatch", "2.5.13.5", Exact),
        MatchingRule::new("caseExactOrderingMatch", "2.5.13.6", Exact),
        MatchingRule::new("caseExactSubstringsMatch", "2.5.13.7", Exact),
        MatchingRule::new("numericStringMatch", "2.5.13.8", RemoveSpaces),
        MatchingRule::new("numericStringOrderingMatch", "2.5.13.9", RemoveSpaces),
        MatchingRule::new("numericStringSubstringsMatch", "2.5.13.10", RemoveSpaces),
        MatchingRule::new("caseExactIA5Match", "1.3.6.1.4.1.1466.109.114.1", Exact),
        MatchingRule::new("caseIgnoreIA5Match", "1.3.6.1.4.1.1466.109.114.2", AsciiCaseFold),
        MatchingRule::new(
            "caseIgnoreIA5SubstringsMatch",
            "1.3.6.1.4.1.1466.109.114.3",
            AsciiCaseFold,
        ),
    ]
}

static REGISTRY: Lazy<MatchingRuleRegistry> = Lazy::new(|| {
    MatchingRuleRegistry::builder()
        .rules(builtin_rules())
        .build()
        .expect("Built-in matching rules must have unique names and OIDs")
});

/// The process-wide registry of built-in rules
pub fn registry() -> &'static MatchingRuleRegistry {
    &REGISTRY
}

/// Finds a built-in rule by name or OID
pub fn find(name: &str) -> Option<&'static MatchingRule> {
    REGISTRY.find(name)
}
