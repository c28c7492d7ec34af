use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("token signing misconfigured: {0}")]
    SigningMisconfigured(String),

    #[error("key/cert mismatch: {0}")]
    KeyCertMismatch(String),

    #[error("no signing key for selected signing method {0}")]
    NoSigner(String),

    #[error("other startup error: {0}")]
    Other(String),
}
