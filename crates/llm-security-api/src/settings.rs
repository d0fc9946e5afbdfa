//! Server settings.
//!
//! Sources, later ones winning:
//! 1. `config/gateway.toml`, or the file named by `GATEWAY_CONFIG`
//! 2. `GATEWAY__`-prefixed environment variables, `__` between levels
//!    (e.g. `GATEWAY__ROUTER__REQUEST_DEADLINE_MS=5000`)
//! 3. `PORT`, and `GATEWAY_SHARED_SECRET` when no secret was configured

use config::{Config, Environment, File};
use llm_security_core::GatewayConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    /// Largest accepted request body.
    pub body_limit_bytes: usize,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_allowed_origins: Vec<String>,
    /// `json` or `pretty`.
    pub log_format: String,
    pub metrics_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            body_limit_bytes: 1024 * 1024,
            cors_allowed_origins: Vec::new(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_sources(&path, Environment::with_prefix("GATEWAY"))?;

        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            settings.server.port = port;
        }
        if settings.gateway.identity.shared_secret.is_empty() {
            if let Ok(secret) = std::env::var("GATEWAY_SHARED_SECRET") {
                settings.gateway.identity.shared_secret = secret;
            }
        }
        Ok(settings)
    }

    fn from_sources(path: &str, env: Environment) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(env.separator("__").prefix_separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let env = Environment::with_prefix("GATEWAY").source(Some(HashMap::new()));
        let settings = Settings::from_sources("does/not/exist.toml", env).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert!(settings.gateway.identity.shared_secret.is_empty());
    }

    #[test]
    fn file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            port = 9000

            [identity]
            shared_secret = "from-file"

            [router]
            request_deadline_ms = 1000
            "#,
        )
        .unwrap();

        let env = Environment::with_prefix("GATEWAY").source(Some(HashMap::from([(
            "GATEWAY__ROUTER__REQUEST_DEADLINE_MS".to_string(),
            "2500".to_string(),
        )])));
        let settings = Settings::from_sources(path.to_str().unwrap(), env).unwrap();

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.gateway.identity.shared_secret, "from-file");
        assert_eq!(settings.gateway.router.request_deadline_ms, 2500);
    }
}
