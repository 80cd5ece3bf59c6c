//! Service configuration.
//!
//! Covers the ambient knobs only: API origin and base, user agent, page
//! class, sign-in path, and where the persistent cache lives. Connection
//! credentials and the broker location are read from the cache at `init`
//! time, because the login flow owns them.

use crate::http::HttpSettings;
use crate::protocol::ClientKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub http: HttpSettings,
    #[serde(default)]
    pub client_kind: ClientKind,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Backing file for the persistent cache; `None` keeps everything in
    /// memory.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

fn default_login_path() -> String {
    "/login".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ServiceConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let toml = r#"
            [http]
            origin = "https://portal.example.com"
        "#;
        let config: ServiceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.http.origin, "https://portal.example.com");
        assert_eq!(config.login_path, "/login");
        assert_eq!(config.client_kind, ClientKind::BasePage);
        assert!(config.cache_file.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let toml = r#"
            login_path = "/signin"
            client_kind = "sub-page"
            cache_file = "/tmp/eventmux-cache.json"

            [http]
            origin = "https://portal.example.com"
            base = "api2"
            user_agent = "Mozilla/5.0 (iPhone)"
            language = "en-US"
        "#;
        let config: ServiceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.login_path, "/signin");
        assert_eq!(config.client_kind, ClientKind::SubPage);
        assert_eq!(config.http.base, crate::http::ApiBase::Api2);
        assert_eq!(config.http.language.as_deref(), Some("en-US"));
        assert_eq!(
            config.cache_file.as_deref(),
            Some(Path::new("/tmp/eventmux-cache.json"))
        );
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let result = toml::from_str::<ServiceConfig>("http = zzz");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventmux.toml");
        std::fs::write(&path, "[http]\norigin = \"https://a.example\"\n").unwrap();
        let config = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(config.http.origin, "https://a.example");

        let missing = ServiceConfig::load_from_file(Path::new("/nonexistent/eventmux.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead(_))));
    }
}
