//! Top-level error type for service operations.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("client id fetch failed: {0}")]
    ClientId(String),

    #[error("will message encode failed: {0}")]
    WillEncode(String),

    #[error("service has no transport yet")]
    NotInitialized,
}

impl ServiceError {
    pub fn missing(key: &'static str) -> Self {
        Self::MissingCredential(key)
    }

    pub fn client_id<S: Into<String>>(message: S) -> Self {
        Self::ClientId(message.into())
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            ServiceError::missing("mqttHost"),
            ServiceError::client_id("empty body"),
            ServiceError::NotInitialized,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_http_error_converts() {
        let error: ServiceError = HttpError::Rejected.into();
        assert!(matches!(error, ServiceError::Http(HttpError::Rejected)));
    }
}
