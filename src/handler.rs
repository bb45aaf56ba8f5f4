//! Operation handler contract
//!
//! An embedding application implements [`Handler`] for its directory data. The
//! server creates one handler per accepted connection through a
//! [`HandlerFactory`] and calls it for every decoded operation on that
//! connection, strictly one at a time, so per-session state such as the bound
//! identity can live in plain fields.
//!
//! Every method has a default, so a handler that only answers searches is
//! complete. Returning `Ok` means success; returning an [`LdapError`] sends its
//! result code.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::filter::Filter;
use crate::ldap_lib::encode_search_entry;
use crate::metrics;
use crate::models::{
    DerefAliases, Entry, ExtendedRequest, ExtendedResponse, ModifyDnRequest, ModifyRequest, Scope,
};
use crate::result::{LdapError, ResultCode};

/// Requests no attributes at all (RFC 4511 Section 4.5.1.8)
pub const NO_ATTRIBUTES: &str = "1.1";

/// Requests all user attributes
pub const ALL_USER_ATTRIBUTES: &str = "*";

/// Facts about the connection a handler is created for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub tls: bool,
}

#[async_trait]
pub trait Handler: Send {
    /// Simple bind; `dn` is `None` for an empty name
    ///
    /// Accepts anonymous LDAPv3 binds only.
    async fn simple_bind(
        &mut self,
        version: u8,
        dn: Option<&str>,
        password: &[u8],
    ) -> std::result::Result<(), LdapError> {
        if version != 3 {
            return Err(LdapError::protocol_error(format!(
                "LDAP version {} is not supported",
                version
            )));
        }
        match (dn, password.is_empty()) {
            (None, true) => Ok(()),
            _ => Err(LdapError::new(
                ResultCode::InappropriateAuthentication,
                "Only anonymous binds are accepted",
            )),
        }
    }

    async fn sasl_bind(
        &mut self,
        mechanism: &str,
        _credentials: Option<&[u8]>,
    ) -> std::result::Result<(), LdapError> {
        Err(LdapError::new(
            ResultCode::AuthMethodNotSupported,
            format!("SASL mechanism {} is not supported", mechanism),
        ))
    }

    /// Streams matching entries through `results` as they are found
    async fn search(
        &mut self,
        _base: &str,
        _scope: Scope,
        _deref: DerefAliases,
        _filter: &Filter,
        _results: &mut SearchResults<'_>,
    ) -> std::result::Result<(), LdapError> {
        Err(LdapError::unwilling_to_perform("Search is not supported"))
    }

    async fn modify(&mut self, _request: &ModifyRequest) -> std::result::Result<(), LdapError> {
        Err(LdapError::unwilling_to_perform("Modify is not supported"))
    }

    async fn add(&mut self, _entry: &Entry) -> std::result::Result<(), LdapError> {
        Err(LdapError::unwilling_to_perform("Add is not supported"))
    }

    async fn delete(&mut self, _dn: &str) -> std::result::Result<(), LdapError> {
        Err(LdapError::unwilling_to_perform("Delete is not supported"))
    }

    async fn modify_dn(&mut self, _request: &ModifyDnRequest) -> std::result::Result<(), LdapError> {
        Err(LdapError::unwilling_to_perform("ModifyDN is not supported"))
    }

    /// `Ok(true)` is sent as compareTrue, `Ok(false)` as compareFalse
    async fn compare(
        &mut self,
        _dn: &str,
        _attribute: &str,
        _value: &str,
    ) -> std::result::Result<bool, LdapError> {
        Err(LdapError::unwilling_to_perform("Compare is not supported"))
    }

    async fn extended(
        &mut self,
        request: &ExtendedRequest,
    ) -> std::result::Result<ExtendedResponse, LdapError> {
        Err(LdapError::protocol_error(format!(
            "Extended operation {} is not supported",
            request.name
        )))
    }
}

/// Builds the handler for each new connection
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler + 'static;

    fn create(&self, info: &ConnectionInfo) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&ConnectionInfo) -> H + Send + Sync + 'static,
    H: Handler + 'static,
{
    type Handler = H;

    fn create(&self, info: &ConnectionInfo) -> H {
        self(info)
    }
}

/// Destination of encoded response frames
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Per-search streaming channel handed to [`Handler::search`]
///
/// Each entry is projected to the requested attributes, encoded and written to
/// the transport before `send_entry` returns, so the client sees entries in the
/// order the handler produced them.
pub struct SearchResults<'a> {
    sink: &'a mut dyn FrameSink,
    message_id: u32,
    attributes: Vec<String>,
    types_only: bool,
    size_limit: u32,
    deadline: Option<Instant>,
    sent: u32,
}

impl<'a> SearchResults<'a> {
    pub fn new(sink: &'a mut dyn FrameSink, message_id: u32) -> Self {
        Self {
            sink,
            message_id,
            attributes: Vec::new(),
            types_only: false,
            size_limit: 0,
            deadline: None,
            sent: 0,
        }
    }

    /// Attribute selection requested by the client
    pub fn with_attributes(mut self, attributes: Vec<String>, types_only: bool) -> Self {
        self.attributes = attributes;
        self.types_only = types_only;
        self
    }

    /// Client size limit, 0 for none
    pub fn with_size_limit(mut self, size_limit: u32) -> Self {
        self.size_limit = size_limit;
        self
    }

    /// Client time limit, 0 for none
    pub fn with_time_limit(mut self, seconds: u32) -> Self {
        self.deadline = (seconds > 0)
            .then(|| Instant::now() + std::time::Duration::from_secs(seconds as u64));
        self
    }

    /// Writes one entry to the client
    ///
    /// Fails with SizeLimitExceeded or TimeLimitExceeded once a client limit is
    /// reached, and with Unavailable when the transport has gone away; handlers
    /// should return such an error rather than keep searching.
    pub async fn send_entry(&mut self, entry: &Entry) -> std::result::Result<(), LdapError> {
        if self.sink.is_closed() {
            return Err(LdapError::new(ResultCode::Unavailable, "Connection closed"));
        }
        if self.size_limit > 0 && self.sent >= self.size_limit {
            return Err(ResultCode::SizeLimitExceeded.into());
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(ResultCode::TimeLimitExceeded.into());
        }

        let projected = self.project(entry);
        let frame = encode_search_entry(self.message_id, &projected, self.types_only);
        if let Err(e) = self.sink.send_frame(&frame).await {
            debug!("Dropping search entry {}: {}", entry.dn, e);
            return Err(LdapError::new(ResultCode::Unavailable, "Connection closed"));
        }

        self.sent += 1;
        metrics::record_search_entry();
        Ok(())
    }

    /// True once the client connection can no longer receive entries
    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    /// Entries written so far
    pub fn sent(&self) -> u32 {
        self.sent
    }

    fn project(&self, entry: &Entry) -> Entry {
        let all = self.attributes.is_empty()
            || self.attributes.iter().any(|a| a == ALL_USER_ATTRIBUTES);
        let none = !all && self.attributes.iter().all(|a| a == NO_ATTRIBUTES);

        let attributes = entry
            .attributes
            .iter()
            .filter(|(name, _)| {
                !none
                    && (all
                        || self
                            .attributes
                            .iter()
                            .any(|wanted| wanted.eq_ignore_ascii_case(name)))
            })
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();

        Entry {
            dn: entry.dn.clone(),
            attributes,
        }
    }
}
