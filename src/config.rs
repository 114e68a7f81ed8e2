use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

/// Token encryption configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EncryptionConfig {
    /// Operator secret the token key is derived from.
    /// 64 hex chars or 44 base64 chars are used as a raw key; anything else
    /// is treated as a passphrase.
    #[serde(default)]
    pub secret: Option<String>,
    /// Refuse to start with the development fallback secret
    #[serde(default)]
    pub require_secret: bool,
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://botdeck.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: BOTDECK_)
            // e.g., BOTDECK_ENCRYPTION__SECRET, BOTDECK_DATABASE__URL
            // Values stay strings so all-digit hex secrets are not parsed as numbers
            .add_source(Environment::with_prefix("BOTDECK").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert!(config.encryption.secret.is_none());
        assert!(!config.encryption.require_secret);
        assert_eq!(config.database.url, "sqlite://botdeck.db?mode=rwc");
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(
            r#"
            [encryption]
            secret = "operator-passphrase"
            require_secret = true

            [database]
            url = "sqlite::memory:"
            max_connections = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.encryption.secret.as_deref(), Some("operator-passphrase"));
        assert!(config.encryption.require_secret);
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 1);
    }
}
