use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ldap_server_rs::config::Config;
use ldap_server_rs::directory::{
    CredentialCache, DirectoryHandler, DirectoryStore, InMemoryDirectory,
};
use ldap_server_rs::handler::ConnectionInfo;
use ldap_server_rs::ldap::LdapServer;
use ldap_server_rs::{api, tls};

/// Signal handler for graceful shutdown
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to install SIGTERM handler: {}", e)),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => result?,
        result = terminate => result?,
    }

    info!("Received shutdown signal, shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting LDAP server");

    let config = Config::from_env();
    info!("Configuration loaded: TLS={}", config.enable_tls);
    config.validate()?;
    info!("Configuration validated successfully");

    let directory = match &config.directory_file {
        Some(path) => InMemoryDirectory::from_file(path)?,
        None => {
            info!("No DIRECTORY_FILE set, serving the sample directory");
            InMemoryDirectory::sample(&config.ldap_base_dn)?
        }
    };
    let store: Arc<dyn DirectoryStore> = Arc::new(directory);

    // Operational HTTP endpoints
    let api_addr = config.api_address();
    let app = api::create_router(store.clone());
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind API server on {}: {}", api_addr, e))?;
    info!("Starting API server on {}", api_addr);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, app).await {
            error!("API server error: {}", e);
        }
    });

    let tls_config = if config.enable_tls {
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert_path), Some(key_path)) => Some(
                tls::load_tls_config(cert_path, key_path)
                    .map_err(|e| anyhow::anyhow!("Failed to load TLS config for LDAP: {}", e))?,
            ),
            _ => anyhow::bail!("TLS enabled but certificate paths not provided"),
        }
    } else {
        None
    };

    let base_dn = config.ldap_base_dn.clone();
    let cache = Arc::new(CredentialCache::new(config.credential_cache_size));
    let ldap_server = LdapServer::new(move |info: &ConnectionInfo| {
        DirectoryHandler::new(store.clone(), &base_dn, info).with_cache(cache.clone())
    })
    .with_options(config.server_options());
    let listener = ldap_server
        .bind(&config.ldap_address())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind LDAP server: {}", e))?;

    info!("All services started successfully");

    ldap_server
        .serve(listener, tls_config, async {
            if let Err(e) = shutdown_signal().await {
                error!("{}", e);
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("LDAP server error: {}", e))?;

    api_handle.abort();
    info!("Shutdown complete");
    Ok(())
}
