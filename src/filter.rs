//! Search filter model and evaluator
//!
//! Filters arrive already decoded (see [`crate::ldap_lib::decode_message`]) and are
//! evaluated against an attribute map with three-valued logic: a filter item may
//! be `True`, `False` or `Undefined` (RFC 4511 Section 4.5.1.7).
//!
//! ```
//! use std::collections::HashMap;
//! use ldap_server_rs::filter::{evaluate, Assertion, Filter, Truth};
//!
//! let mut entry = HashMap::new();
//! entry.insert("uid".to_string(), vec!["brian".to_string()]);
//!
//! let filter = Filter::Equality(Assertion::new("uid", "brian"));
//! assert_eq!(evaluate(&filter, &entry).unwrap(), Truth::True);
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::debug;

use crate::matching_rule::{self, MatchingRule, MatchingRuleRegistry};
use crate::result::LdapError;

/// Three-valued filter outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Truth {
    True,
    False,
    Undefined,
}

impl Truth {
    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    /// Kleene negation: `Undefined` stays `Undefined`
    pub fn negate(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Undefined => Truth::Undefined,
        }
    }
}

impl From<bool> for Truth {
    fn from(value: bool) -> Self {
        if value {
            Truth::True
        } else {
            Truth::False
        }
    }
}

/// `attr <op> value`, optionally under a named matching rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub attribute: String,
    pub rule: Option<String>,
    pub value: String,
}

impl Assertion {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            rule: None,
            value: value.into(),
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringsAssertion {
    pub attribute: String,
    pub rule: Option<String>,
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub final_: Option<String>,
}

impl SubstringsAssertion {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            rule: None,
            initial: None,
            any: Vec::new(),
            final_: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn initial(mut self, segment: impl Into<String>) -> Self {
        self.initial = Some(segment.into());
        self
    }

    pub fn any(mut self, segment: impl Into<String>) -> Self {
        self.any.push(segment.into());
        self
    }

    pub fn final_(mut self, segment: impl Into<String>) -> Self {
        self.final_ = Some(segment.into());
        self
    }
}

/// A decoded search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Present(String),
    True,
    False,
    Undefined,
    Equality(Assertion),
    GreaterOrEqual(Assertion),
    LessOrEqual(Assertion),
    Substrings(SubstringsAssertion),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// A filter choice this server does not understand
    Unknown(String),
}

impl Filter {
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality(Assertion::new(attribute, value))
    }

    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }
}

/// RFC 4515 string form, used for logging
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::True => write!(f, "(&)"),
            Filter::False => write!(f, "(|)"),
            Filter::Undefined => write!(f, "(?undefined)"),
            Filter::Equality(a) => write_assertion(f, a, "="),
            Filter::GreaterOrEqual(a) => write_assertion(f, a, ">="),
            Filter::LessOrEqual(a) => write_assertion(f, a, "<="),
            Filter::Substrings(s) => {
                write!(f, "({}", s.attribute)?;
                if let Some(rule) = &s.rule {
                    write!(f, ":{}:", rule)?;
                }
                write!(f, "={}*", s.initial.as_deref().unwrap_or(""))?;
                for segment in &s.any {
                    write!(f, "{}*", segment)?;
                }
                write!(f, "{})", s.final_.as_deref().unwrap_or(""))
            }
            Filter::And(children) => write_children(f, '&', children),
            Filter::Or(children) => write_children(f, '|', children),
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Unknown(tag) => write!(f, "(?{})", tag),
        }
    }
}

fn write_assertion(f: &mut fmt::Formatter<'_>, a: &Assertion, op: &str) -> fmt::Result {
    match &a.rule {
        Some(rule) => write!(f, "({}:{}:{}{})", a.attribute, rule, op, a.value),
        None => write!(f, "({}{}{})", a.attribute, op, a.value),
    }
}

fn write_children(f: &mut fmt::Formatter<'_>, op: char, children: &[Filter]) -> fmt::Result {
    write!(f, "({}", op)?;
    for child in children {
        write!(f, "{}", child)?;
    }
    write!(f, ")")
}

/// Anything that maps an attribute name to its ordered values
pub trait AttributeSource {
    fn values(&self, attribute: &str) -> Option<&[String]>;
}

impl<S: std::hash::BuildHasher> AttributeSource for HashMap<String, Vec<String>, S> {
    fn values(&self, attribute: &str) -> Option<&[String]> {
        self.get(attribute).map(Vec::as_slice)
    }
}

impl AttributeSource for BTreeMap<String, Vec<String>> {
    fn values(&self, attribute: &str) -> Option<&[String]> {
        self.get(attribute).map(Vec::as_slice)
    }
}

impl<T: AttributeSource + ?Sized> AttributeSource for &T {
    fn values(&self, attribute: &str) -> Option<&[String]> {
        (**self).values(attribute)
    }
}

/// Evaluates `filter` using the built-in matching rules
pub fn evaluate<A>(filter: &Filter, attributes: &A) -> Result<Truth, LdapError>
where
    A: AttributeSource + ?Sized,
{
    evaluate_with(matching_rule::registry(), filter, attributes)
}

/// Evaluates `filter` against `attributes`, resolving rule names in `registry`
///
/// Fails with `OperationsError` for a filter choice outside the known set or a
/// rule name the registry does not contain.
pub fn evaluate_with<A>(
    registry: &MatchingRuleRegistry,
    filter: &Filter,
    attributes: &A,
) -> Result<Truth, LdapError>
where
    A: AttributeSource + ?Sized,
{
    match filter {
        Filter::Present(attr) => Ok(attributes.values(attr).is_some().into()),
        Filter::True => Ok(Truth::True),
        Filter::False => Ok(Truth::False),
        Filter::Undefined => Ok(Truth::Undefined),
        Filter::Equality(a) => {
            let rule = resolve_rule(registry, a.rule.as_deref())?;
            Ok(any_value(attributes, &a.attribute, |v| rule.equals(v, &a.value)))
        }
        Filter::GreaterOrEqual(a) => {
            let rule = resolve_rule(registry, a.rule.as_deref())?;
            Ok(any_value(attributes, &a.attribute, |v| {
                rule.compare(v, &a.value) != Ordering::Less
            }))
        }
        Filter::LessOrEqual(a) => {
            let rule = resolve_rule(registry, a.rule.as_deref())?;
            Ok(any_value(attributes, &a.attribute, |v| {
                rule.compare(v, &a.value) != Ordering::Greater
            }))
        }
        Filter::Substrings(s) => {
            let rule = resolve_rule(registry, s.rule.as_deref())?;
            Ok(any_value(attributes, &s.attribute, |v| {
                rule.substrings(v, s.initial.as_deref(), &s.any, s.final_.as_deref())
            }))
        }
        Filter::And(children) => {
            let mut result = Truth::True;
            for child in children {
                match evaluate_with(registry, child, attributes)? {
                    Truth::False => return Ok(Truth::False),
                    Truth::Undefined => result = Truth::Undefined,
                    Truth::True => {}
                }
            }
            Ok(result)
        }
        Filter::Or(children) => {
            let mut result = Truth::False;
            for child in children {
                match evaluate_with(registry, child, attributes)? {
                    Truth::True => return Ok(Truth::True),
                    Truth::Undefined => result = Truth::Undefined,
                    Truth::False => {}
                }
            }
            Ok(result)
        }
        Filter::Not(child) => Ok(evaluate_with(registry, child, attributes)?.negate()),
        Filter::Unknown(tag) => {
            debug!("Refusing to evaluate unknown filter type {}", tag);
            Err(LdapError::operations_error(format!(
                "Unknown filter type: {}",
                tag
            )))
        }
    }
}

fn resolve_rule<'r>(
    registry: &'r MatchingRuleRegistry,
    name: Option<&str>,
) -> Result<&'r MatchingRule, LdapError> {
    match name {
        None => Ok(registry.default_rule()),
        Some(name) => registry
            .find(name)
            .ok_or_else(|| LdapError::operations_error(format!("Unknown matching rule: {}", name))),
    }
}

/// True if any stored value satisfies `predicate`; a missing attribute is False
fn any_value<A, F>(attributes: &A, attribute: &str, predicate: F) -> Truth
where
    A: AttributeSource + ?Sized,
    F: Fn(&str) -> bool,
{
    attributes
        .values(attribute)
        .map(|values| values.iter().any(|v| predicate(v)))
        .unwrap_or(false)
        .into()
}
