use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use crate::error::{AppError, Result};

/// Load TLS configuration from PEM certificate chain and key files
///
/// The key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC); the first key in the file is used.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::Tls(format!("Failed to build TLS config: {}", e)))?;

    Ok(Arc::new(config))
}

fn load_certs(cert_path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| AppError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AppError::Tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(AppError::Tls("No certificates found in file".to_string()));
    }
    Ok(certs)
}

fn load_private_key(key_path: &str) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path)
        .map_err(|e| AppError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| AppError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| AppError::Tls("No private keys found in file".to_string()))
}
