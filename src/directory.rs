//! Directory backend served by the `ldap-server` binary
//!
//! [`DirectoryStore`] abstracts where entries and credentials live, and
//! [`DirectoryHandler`] answers bind, search, compare and WhoAmI from it.
//! Each connection gets its own handler; the store is shared.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::filter::{evaluate, Assertion, Filter};
use crate::handler::{ConnectionInfo, Handler, SearchResults};
use crate::models::{Attributes, DerefAliases, Entry, ExtendedRequest, ExtendedResponse, Scope};
use crate::result::{LdapError, ResultCode};

/// "Who am I?" extended operation (RFC 4532)
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Storage behind the directory handler
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Every entry, parents before children
    async fn list_entries(&self) -> Result<Vec<Entry>>;

    /// Get an entry by DN, compared in normalized form
    async fn get_entry(&self, dn: &str) -> Result<Option<Entry>>;

    /// Verify credentials for an LDAP simple bind
    async fn verify_password(&self, dn: &str, password: &str) -> Result<bool>;

    /// Stored password of `dn`, used to warm the credential cache
    async fn password(&self, dn: &str) -> Result<Option<String>>;

    /// Health check for the backing storage
    async fn health_check(&self) -> Result<bool>;
}


/// Lowercases attribute types and values and drops blanks around `,` and `=`
///
/// Escaped separators inside values are not recognised.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| match rdn.split_once('=') {
            Some((attr, value)) => format!(
                "{}={}",
                attr.trim().to_ascii_lowercase(),
                value.trim().to_lowercase()
            ),
            None => rdn.trim().to_lowercase(),
        })
        .filter(|rdn| !rdn.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parent of a normalized DN, empty for a single RDN
fn parent_dn(dn: &str) -> &str {
    dn.split_once(',').map(|(_, parent)| parent).unwrap_or("")
}

/// True when normalized `dn` equals `base` or sits anywhere below it
fn is_within(dn: &str, base: &str) -> bool {
    base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base))
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::BaseObject => dn == base,
        Scope::SingleLevel => parent_dn(dn) == base,
        Scope::WholeSubtree => is_within(dn, base),
    }
}

/// One entry as written in a directory file
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryRecord {
    pub dn: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    entries: Vec<DirectoryRecord>,
}

/// Read-only store kept in memory
///
/// Passwords are held apart from the attributes and never leave the store.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    passwords: HashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn new(records: Vec<DirectoryRecord>) -> Result<Self> {
        let mut directory = Self::default();
        for record in records {
            let key = normalize_dn(&record.dn);
            if directory.index.contains_key(&key) {
                return Err(AppError::Directory(format!("Duplicate entry {}", record.dn)));
            }
            if let Some(password) = record.password {
                directory.passwords.insert(key.clone(), password);
            }
            directory.index.insert(key, directory.entries.len());
            directory.entries.push(Entry {
                dn: record.dn,
                attributes: record.attributes,
            });
        }
        Ok(directory)
    }

    /// Parses `{"entries": [{"dn": ..., "password": ..., "attributes": {...}}]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let file: DirectoryFile = serde_json::from_str(json)?;
        Self::new(file.entries)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AppError::Directory(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let directory = Self::from_json(&json)?;
        info!("Loaded {} entries from {}", directory.len(), path.display());
        Ok(directory)
    }

    /// Small directory with two mail users, brian and caroline
    pub fn sample(base_dn: &str) -> Result<Self> {
        let mut base = Entry::new(base_dn).with("objectClass", "top");
        if let Some((attr, value)) = base_dn.split(',').next().and_then(|rdn| rdn.split_once('=')) {
            base = base.with(attr.trim(), value.trim());
        }
        let people_dn = format!("ou=people,{}", base_dn);
        let people = Entry::new(people_dn.clone())
            .with("objectClass", "top")
            .with("objectClass", "organizationalUnit")
            .with("ou", "people");

        let mut records = vec![record(base, None), record(people, None)];
        for (id, uid, cn, password) in [
            (1, "brian", "Brian Candler", "foobar"),
            (2, "caroline", "Caroline Smith", "boing"),
        ] {
            let user = Entry::new(format!("uid={},{}", uid, people_dn))
                .with("objectClass", "top")
                .with("objectClass", "person")
                .with("objectClass", "inetOrgPerson")
                .with("uid", uid)
                .with("cn", cn)
                .with("sn", cn.rsplit(' ').next().unwrap_or(cn))
                .with("mail", format!("{}@example.com", uid))
                .with("employeeNumber", id.to_string())
                .with("maildir", format!("/netapp/{}/", uid));
            records.push(record(user, Some(password)));
        }
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn record(entry: Entry, password: Option<&str>) -> DirectoryRecord {
    DirectoryRecord {
        dn: entry.dn,
        password: password.map(str::to_string),
        attributes: entry.attributes,
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectory {
    async fn list_entries(&self) -> Result<Vec<Entry>> {
        Ok(self.entries.clone())
    }

    async fn get_entry(&self, dn: &str) -> Result<Option<Entry>> {
        Ok(self
            .index
            .get(&normalize_dn(dn))
            .map(|&i| self.entries[i].clone()))
    }

    async fn verify_password(&self, dn: &str, password: &str) -> Result<bool> {
        Ok(self
            .passwords
            .get(&normalize_dn(dn))
            .is_some_and(|stored| stored == password))
    }

    async fn password(&self, dn: &str) -> Result<Option<String>> {
        Ok(self.passwords.get(&normalize_dn(dn)).cloned())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Credentials seen by any connection, shared by all of them
///
/// Filled by successful binds and by the entries a search returns, so a bind
/// on one connection can reuse a lookup done on another.
/// Keys are normalized DNs. Holds at most `capacity` entries and evicts the
/// oldest insertion first; a capacity of 0 disables caching.
#[derive(Debug)]
pub struct CredentialCache {
    capacity: usize,
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    passwords: HashMap<String, String>,
    order: VecDeque<String>,
}

impl CredentialCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn verify(&self, dn: &str, password: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.passwords.get(dn).is_some_and(|p| p == password)
    }

    pub fn insert(&self, dn: &str, password: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state
            .passwords
            .insert(dn.to_string(), password.to_string())
            .is_none()
        {
            state.order.push_back(dn.to_string());
        }
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.passwords.remove(&oldest);
            }
        }
    }

    pub fn remove(&self, dn: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.passwords.remove(dn).is_some() {
            state.order.retain(|cached| cached != dn);
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .passwords
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-connection handler over a shared [`DirectoryStore`]
pub struct DirectoryHandler {
    store: Arc<dyn DirectoryStore>,
    cache: Option<Arc<CredentialCache>>,
    base_dn: String,
    connection_id: u64,
    bound_dn: Option<String>,
}

impl DirectoryHandler {
    pub fn new(store: Arc<dyn DirectoryStore>, base_dn: &str, info: &ConnectionInfo) -> Self {
        Self {
            store,
            cache: None,
            base_dn: normalize_dn(base_dn),
            connection_id: info.id,
            bound_dn: None,
        }
    }

    /// Checks binds against `cache` before asking the store
    pub fn with_cache(mut self, cache: Arc<CredentialCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// DN of the last successful bind, `None` while anonymous
    pub fn bound_dn(&self) -> Option<&str> {
        self.bound_dn.as_deref()
    }

    async fn remember_password(&self, dn: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        match self.store.password(dn).await {
            Ok(Some(password)) => cache.insert(&normalize_dn(dn), &password),
            Ok(None) => {}
            Err(e) => warn!(
                connection = self.connection_id,
                "Password lookup for {} failed: {}", dn, e
            ),
        }
    }
}

#[async_trait]
impl Handler for DirectoryHandler {
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
        // a failed bind leaves the connection anonymous
        self.bound_dn = None;

        let Some(dn) = dn else {
            debug!(connection = self.connection_id, "Anonymous bind");
            return Ok(());
        };
        if password.is_empty() {
            return Err(LdapError::unwilling_to_perform(
                "Unauthenticated bind is not allowed",
            ));
        }

        let normalized = normalize_dn(dn);
        if !is_within(&normalized, &self.base_dn) {
            warn!(connection = self.connection_id, "Bind outside base DN: {}", dn);
            return Err(LdapError::invalid_credentials());
        }
        let Ok(password) = std::str::from_utf8(password) else {
            warn!(
                connection = self.connection_id,
                "Bind for {} with a non UTF-8 password", dn
            );
            return Err(LdapError::invalid_credentials());
        };
        let cached = self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.verify(&normalized, password));
        let valid = cached || self.store.verify_password(dn, password).await?;

        if let Some(cache) = &self.cache {
            match (valid, cached) {
                (true, true) => {
                    debug!(connection = self.connection_id, "Bind for {} served from cache", dn)
                }
                (true, false) => cache.insert(&normalized, password),
                _ => cache.remove(&normalized),
            }
        }

        if valid {
            info!(connection = self.connection_id, "Bind successful for {}", dn);
            self.bound_dn = Some(normalized);
            Ok(())
        } else {
            warn!(connection = self.connection_id, "Bind failed for {}", dn);
            Err(LdapError::invalid_credentials())
        }
    }

    async fn search(
        &mut self,
        base: &str,
        scope: Scope,
        _deref: DerefAliases,
        filter: &Filter,
        results: &mut SearchResults<'_>,
    ) -> std::result::Result<(), LdapError> {
        let base = normalize_dn(base);
        if !is_within(&base, &self.base_dn) || self.store.get_entry(&base).await?.is_none() {
            return Err(LdapError::no_such_object(format!(
                "No such object: {}",
                base
            )));
        }

        debug!(
            connection = self.connection_id,
            "Search base={} scope={:?} filter={}", base, scope, filter
        );
        for entry in self.store.list_entries().await? {
            if !in_scope(&normalize_dn(&entry.dn), &base, scope) {
                continue;
            }
            if evaluate(filter, &entry)?.is_true() {
                results.send_entry(&entry).await?;
                self.remember_password(&entry.dn).await;
            }
        }
        Ok(())
    }

    async fn compare(
        &mut self,
        dn: &str,
        attribute: &str,
        value: &str,
    ) -> std::result::Result<bool, LdapError> {
        let entry = self
            .store
            .get_entry(dn)
            .await?
            .ok_or_else(|| LdapError::no_such_object(format!("No such object: {}", dn)))?;
        if entry.get(attribute).is_none() {
            return Err(LdapError::new(
                ResultCode::NoSuchAttribute,
                format!("{} has no attribute {}", dn, attribute),
            ));
        }
        let assertion = Filter::Equality(Assertion::new(attribute, value));
        Ok(evaluate(&assertion, &entry)?.is_true())
    }

    async fn extended(
        &mut self,
        request: &ExtendedRequest,
    ) -> std::result::Result<ExtendedResponse, LdapError> {
        if request.name != WHOAMI_OID {
            return Err(LdapError::protocol_error(format!(
                "Extended operation {} is not supported",
                request.name
            )));
        }
        let authz_id = match &self.bound_dn {
            Some(dn) => format!("dn:{}", dn),
            None => String::new(),
        };
        Ok(ExtendedResponse {
            name: None,
            value: Some(authz_id.into_bytes()),
        })
    }
}
