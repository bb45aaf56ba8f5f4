use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::filter::{AttributeSource, Filter};

/// Attribute name to ordered values
pub type Attributes = BTreeMap<String, Vec<String>>;

/// A directory entry as streamed back by a search
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Attributes::new(),
        }
    }

    /// Appends a value, creating the attribute if needed
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(attribute.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Looks an attribute up ignoring case, as LDAP attribute descriptions are
    pub fn get(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
    }
}

/// Filters evaluated against an entry match attribute names case-insensitively
impl AttributeSource for Entry {
    fn values(&self, attribute: &str) -> Option<&[String]> {
        self.get(attribute)
    }
}

/// One decoded LDAPMessage
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: u32,
    pub op: Request,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Search(SearchRequest),
    Modify(ModifyRequest),
    Add(AddRequest),
    Delete(String),
    ModifyDn(ModifyDnRequest),
    Compare(CompareRequest),
    Abandon(u32),
    Extended(ExtendedRequest),
}

impl Request {
    /// Short operation name used in logs and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            Request::Bind(_) => "bind",
            Request::Unbind => "unbind",
            Request::Search(_) => "search",
            Request::Modify(_) => "modify",
            Request::Add(_) => "add",
            Request::Delete(_) => "delete",
            Request::ModifyDn(_) => "modify_dn",
            Request::Compare(_) => "compare",
            Request::Abandon(_) => "abandon",
            Request::Extended(_) => "extended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Vec<u8>),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

impl Scope {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Scope::BaseObject),
            1 => Some(Scope::SingleLevel),
            2 => Some(Scope::WholeSubtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never,
    InSearching,
    FindingBaseObj,
    Always,
}

impl DerefAliases {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DerefAliases::Never),
            1 => Some(DerefAliases::InSearching),
            2 => Some(DerefAliases::FindingBaseObj),
            3 => Some(DerefAliases::Always),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    /// 0 means no client-requested limit
    pub size_limit: u32,
    /// Seconds, 0 means no client-requested limit
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: Entry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

/// Successful reply to an extended operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}
