//! Embeddable LDAPv3 server framework
//!
//! The crate decodes LDAP messages from a byte stream, routes each operation
//! to a per-connection [`handler::Handler`] and encodes the replies. Search
//! filters are evaluated with three-valued logic against a registry of
//! matching rules.

pub mod api;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod handler;
pub mod ldap;
pub mod ldap_lib;
pub mod matching_rule;
pub mod metrics;
pub mod models;
pub mod result;
pub mod session;
pub mod tls;
