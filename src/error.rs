use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Directory data error: {0}")]
    Directory(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rustls::Error> for AppError {
    fn from(err: rustls::Error) -> Self {
        AppError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
