//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    pub shutdown: ShutdownConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound and inbound federation limits
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// User-Agent sent on every outbound request
    pub user_agent: String,
    /// Timeout for actor/key lookups and webfinger
    pub fast_timeout_secs: u64,
    /// Timeout for object and outbox fetches
    pub slow_timeout_secs: u64,
    /// Timeout for signed deliveries
    pub post_timeout_secs: u64,
    /// Largest response body accepted from a peer
    pub max_fetch_bytes: usize,
    /// Largest inbound activity accepted
    pub max_inbox_bytes: usize,
    pub max_concurrent_deliveries: usize,
    pub max_concurrent_transcodes: usize,
    /// Allow loopback/private destinations (tests and LAN setups)
    pub allow_private_hosts: bool,
    /// Outbox harvest period; 0 disables the sweep
    pub harvest_interval_secs: u64,
    /// JSON-lines file receiving activities we could not interpret
    pub archive_path: PathBuf,
}

impl FederationConfig {
    pub fn fast_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_timeout_secs)
    }

    pub fn slow_timeout(&self) -> Duration {
        Duration::from_secs(self.slow_timeout_secs)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_secs(self.post_timeout_secs)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum actors kept in the box cache
    pub box_capacity: u64,
    /// Maximum keys kept in the public-key cache
    pub key_capacity: u64,
    /// Public-key cache TTL in seconds
    pub key_ttl_secs: u64,
}

/// Feed retention
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Window for public feed queries, in days
    pub public_feed_days: i64,
}

/// Shutdown behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Hard limit on draining tasks and requests before forced exit
    pub grace_secs: u64,
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Admin user configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Admin username (default: "admin")
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Admin display name (default: "Admin")
    #[serde(default = "default_admin_display_name")]
    pub display_name: String,
    /// Handles (`user@host`) or actor URIs the admin follows; ensured at start-up
    #[serde(default)]
    pub follows: Vec<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_display_name() -> String {
    "Admin".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (TIDEPOOL__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/tidepool.db")?
            .set_default("federation.user_agent", "tidepool/0.1")?
            .set_default("federation.fast_timeout_secs", 5)?
            .set_default("federation.slow_timeout_secs", 30)?
            .set_default("federation.post_timeout_secs", 60)?
            .set_default("federation.max_fetch_bytes", 10 * 1024 * 1024)?
            .set_default("federation.max_inbox_bytes", 1024 * 1024)?
            .set_default("federation.max_concurrent_deliveries", 40)?
            .set_default("federation.max_concurrent_transcodes", 4)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.harvest_interval_secs", 3600)?
            .set_default("federation.archive_path", "data/unrecognized.jsonl")?
            .set_default("cache.box_capacity", 10_000)?
            .set_default("cache.key_capacity", 10_000)?
            .set_default("cache.key_ttl_secs", 86_400)?
            .set_default("retention.public_feed_days", 7)?
            .set_default("shutdown.grace_secs", 30)?
            .set_default("admin.username", "admin")?
            .set_default("admin.display_name", "Admin")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("TIDEPOOL")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("admin.follows")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        let federation = &self.federation;
        let timeouts = [
            ("federation.fast_timeout_secs", federation.fast_timeout_secs),
            ("federation.slow_timeout_secs", federation.slow_timeout_secs),
            ("federation.post_timeout_secs", federation.post_timeout_secs),
            ("shutdown.grace_secs", self.shutdown.grace_secs),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(crate::error::AppError::Config(format!(
                    "{key} must be greater than 0"
                )));
            }
        }

        if federation.max_concurrent_deliveries == 0 || federation.max_concurrent_transcodes == 0 {
            return Err(crate::error::AppError::Config(
                "federation concurrency limits must be greater than 0".to_string(),
            ));
        }

        if federation.max_fetch_bytes == 0 || federation.max_inbox_bytes == 0 {
            return Err(crate::error::AppError::Config(
                "federation body limits must be greater than 0".to_string(),
            ));
        }

        if self.retention.public_feed_days <= 0 {
            return Err(crate::error::AppError::Config(
                "retention.public_feed_days must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    host = %normalized_server_host(&self.server.domain),
                    "Serving federation over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Configuration used by unit tests across the crate.
    pub(crate) fn test_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: dir.join("tidepool.db"),
            },
            federation: FederationConfig {
                user_agent: "tidepool-test".to_string(),
                fast_timeout_secs: 5,
                slow_timeout_secs: 30,
                post_timeout_secs: 60,
                max_fetch_bytes: 10 * 1024 * 1024,
                max_inbox_bytes: 1024 * 1024,
                max_concurrent_deliveries: 40,
                max_concurrent_transcodes: 4,
                allow_private_hosts: true,
                harvest_interval_secs: 0,
                archive_path: dir.join("unrecognized.jsonl"),
            },
            cache: CacheConfig {
                box_capacity: 100,
                key_capacity: 100,
                key_ttl_secs: 3600,
            },
            retention: RetentionConfig {
                public_feed_days: 7,
            },
            shutdown: ShutdownConfig { grace_secs: 5 },
            admin: AdminConfig {
                username: "admin".to_string(),
                display_name: "Admin".to_string(),
                follows: Vec::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = test_config(std::path::Path::new("/tmp"));
        assert!(config.validate().is_ok());
        assert_eq!(config.server.base_url(), "http://localhost");
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = test_config(std::path::Path::new("/tmp"));
        config.federation.fast_timeout_secs = 0;

        let error = config.validate().expect_err("zero timeout must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("fast_timeout_secs")
        ));
    }

    #[test]
    fn validate_rejects_zero_delivery_concurrency() {
        let mut config = test_config(std::path::Path::new("/tmp"));
        config.federation.max_concurrent_deliveries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = test_config(std::path::Path::new("/tmp"));
        config.server.domain = "social.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }
}
