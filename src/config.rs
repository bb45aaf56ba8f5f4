use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::ldap::ServerOptions;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub ldap_host: String,
    pub ldap_port: u16,
    pub ldap_backlog: u32,
    pub ldap_nodelay: bool,
    pub ldap_max_message_size: usize,
    pub ldap_tls_handshake_timeout_secs: u64,
    pub ldap_base_dn: String,
    pub directory_file: Option<String>,
    pub credential_cache_size: usize,
    pub api_port: u16,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub enable_tls: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults
    /// for missing or unparsable values
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let defaults = ServerOptions::default();

        Self {
            ldap_host: lookup("LDAP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            ldap_port: parsed(lookup("LDAP_PORT"), 1389), // Non-privileged port
            ldap_backlog: parsed(lookup("LDAP_BACKLOG"), defaults.backlog),
            ldap_nodelay: parsed(lookup("LDAP_NODELAY"), defaults.nodelay),
            ldap_max_message_size: parsed(
                lookup("LDAP_MAX_MESSAGE_SIZE"),
                defaults.max_message_size,
            ),
            ldap_tls_handshake_timeout_secs: parsed(
                lookup("LDAP_TLS_HANDSHAKE_TIMEOUT"),
                defaults.tls_handshake_timeout.as_secs(),
            ),
            ldap_base_dn: lookup("LDAP_BASE_DN")
                .unwrap_or_else(|| "dc=example,dc=com".to_string()),
            directory_file: lookup("DIRECTORY_FILE"),
            credential_cache_size: parsed(lookup("CREDENTIAL_CACHE_SIZE"), 100),
            api_port: parsed(lookup("API_PORT"), 8080),
            tls_cert_path: lookup("TLS_CERT_PATH"),
            tls_key_path: lookup("TLS_KEY_PATH"),
            enable_tls: parsed(lookup("ENABLE_TLS"), false),
        }
    }

    pub fn api_address(&self) -> String {
        format!("0.0.0.0:{}", self.api_port)
    }

    pub fn ldap_address(&self) -> String {
        format!("{}:{}", self.ldap_host, self.ldap_port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            nodelay: self.ldap_nodelay,
            backlog: self.ldap_backlog,
            max_message_size: self.ldap_max_message_size,
            tls_handshake_timeout: Duration::from_secs(self.ldap_tls_handshake_timeout_secs),
        }
    }

    /// Validate configuration at startup
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT cannot be 0");
        }

        if self.ldap_port == 0 {
            anyhow::bail!("LDAP_PORT cannot be 0");
        }

        if self.ldap_port == self.api_port {
            anyhow::bail!("LDAP_PORT and API_PORT must differ");
        }

        if self.ldap_backlog == 0 {
            anyhow::bail!("LDAP_BACKLOG cannot be 0");
        }

        // smallest useful LDAPMessage plus headroom for a bind
        if self.ldap_max_message_size < 64 {
            anyhow::bail!(
                "LDAP_MAX_MESSAGE_SIZE must be at least 64 bytes, got {}",
                self.ldap_max_message_size
            );
        }

        if self.ldap_tls_handshake_timeout_secs == 0 {
            anyhow::bail!("LDAP_TLS_HANDSHAKE_TIMEOUT cannot be 0");
        }

        if self.ldap_base_dn.trim().is_empty() {
            anyhow::bail!("LDAP_BASE_DN cannot be empty");
        }

        if let Some(path) = &self.directory_file {
            if !std::path::Path::new(path).exists() {
                anyhow::bail!("Directory file not found: {}", path);
            }
        }

        // Check TLS configuration is complete if enabled
        if self.enable_tls {
            if let Some(cert_path) = &self.tls_cert_path {
                if !std::path::Path::new(cert_path).exists() {
                    anyhow::bail!("TLS certificate file not found: {}", cert_path);
                }
            } else {
                anyhow::bail!("ENABLE_TLS is true but TLS_CERT_PATH is not set");
            }

            if let Some(key_path) = &self.tls_key_path {
                if !std::path::Path::new(key_path).exists() {
                    anyhow::bail!("TLS key file not found: {}", key_path);
                }
            } else {
                anyhow::bail!("ENABLE_TLS is true but TLS_KEY_PATH is not set");
            }
        }

        // Validate addresses are parseable
        self.api_address()
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("Invalid API_PORT {}: {}", self.api_port, e))?;

        self.ldap_address()
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("Invalid LDAP_HOST {}: {}", self.ldap_host, e))?;

        Ok(())
    }
}
