// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the box orchestrator.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Box configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the database, app volumes, backups and certificates
    pub data_dir: PathBuf,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Box domain; apps are served at `<location>.<fqdn>`
    pub fqdn: String,
    /// Subdomain reserved for the admin UI
    pub admin_location: String,
    /// Address published in app A-records
    pub public_ip: String,
    /// Running platform version
    pub box_version: semver::Version,
    /// URL of the box release feed
    pub box_versions_url: String,
    /// Origin of the app store / caas API
    pub api_server_origin: String,
    /// Box identity at the caas API (heartbeat, DNS)
    pub box_id: Option<String>,
    /// Token for the caas API
    pub box_token: Option<String>,
    /// DNS provider name (`noop` or `caas`)
    pub dns_provider: String,
    /// Directory holding one nginx vhost file per app
    pub nginx_appconfig_dir: PathBuf,
    /// Command run after vhost changes (e.g. `sudo systemctl reload nginx`)
    pub nginx_reload_command: Option<Vec<String>>,
    /// Host ports handed out to app HTTP endpoints
    pub http_port_range: RangeInclusive<u16>,
    /// Number of health probes before an install times out
    pub health_check_attempts: u32,
    /// Delay between health probes
    pub health_check_interval: Duration,
    /// Recipient of update and failure notifications
    pub admin_email: String,
    /// Image used for the redis addon sidecar
    pub redis_image: String,
    /// Wildcard certificate used when an app has no custom certificate
    pub fallback_cert: PathBuf,
    /// Key for the fallback certificate
    pub fallback_key: PathBuf,
    /// Age after which backup snapshots are removed
    pub backup_retention: Duration,
    /// User-defined docker network shared by app and addon containers; `None` is the default
    /// bridge, which has no name resolution between containers
    pub docker_network: Option<String>,
}

impl Config {
    /// Build a configuration rooted at `data_dir` with default values everywhere else.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let fqdn = "localhost".to_string();
        Self {
            database_path: data_dir.join("box.db"),
            nginx_appconfig_dir: data_dir.join("nginx").join("applications"),
            fallback_cert: data_dir.join("certs").join("host.cert"),
            fallback_key: data_dir.join("certs").join("host.key"),
            admin_email: format!("admin@{}", fqdn),
            fqdn,
            admin_location: "my".to_string(),
            public_ip: "127.0.0.1".to_string(),
            box_version: semver::Version::new(0, 1, 0),
            box_versions_url: "https://s3.amazonaws.com/prod-cloudron-releases/versions.json"
                .to_string(),
            api_server_origin: "https://api.cloudron.io".to_string(),
            box_id: None,
            box_token: None,
            dns_provider: "noop".to_string(),
            nginx_reload_command: None,
            http_port_range: 3001..=3999,
            health_check_attempts: 30,
            health_check_interval: Duration::from_secs(2),
            redis_image: "cloudron/redis:0.8.0".to_string(),
            backup_retention: Duration::from_secs(7 * 24 * 3600),
            docker_network: Some("cloudron".to_string()),
            data_dir,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir =
            PathBuf::from(std::env::var("BOX_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));
        let mut config = Self::new(data_dir);

        if let Ok(path) = std::env::var("BOX_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(fqdn) = std::env::var("BOX_FQDN") {
            config.admin_email = format!("admin@{}", fqdn);
            config.fqdn = fqdn;
        }

        if let Ok(location) = std::env::var("BOX_ADMIN_LOCATION") {
            config.admin_location = location;
        }

        if let Ok(ip) = std::env::var("BOX_PUBLIC_IP") {
            config.public_ip = ip;
        }

        config.box_version = match std::env::var("BOX_VERSION") {
            Ok(v) => semver::Version::parse(&v).map_err(|_| ConfigError::InvalidVersion(v))?,
            Err(_) => semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .map_err(|_| ConfigError::InvalidVersion(env!("CARGO_PKG_VERSION").to_string()))?,
        };

        if let Ok(url) = std::env::var("BOX_VERSIONS_URL") {
            config.box_versions_url = url;
        }

        if let Ok(origin) = std::env::var("BOX_API_SERVER_ORIGIN") {
            config.api_server_origin = origin.trim_end_matches('/').to_string();
        }

        config.box_id = std::env::var("BOX_ID").ok().filter(|v| !v.is_empty());
        config.box_token = std::env::var("BOX_TOKEN").ok().filter(|v| !v.is_empty());

        if let Ok(provider) = std::env::var("BOX_DNS_PROVIDER") {
            if !matches!(provider.as_str(), "noop" | "caas") {
                return Err(ConfigError::InvalidValue("BOX_DNS_PROVIDER", provider));
            }
            config.dns_provider = provider;
        }

        if let Ok(dir) = std::env::var("BOX_NGINX_APPCONFIG_DIR") {
            config.nginx_appconfig_dir = PathBuf::from(dir);
        }

        config.nginx_reload_command = std::env::var("BOX_NGINX_RELOAD_COMMAND")
            .ok()
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|args| !args.is_empty());

        if let Ok(range) = std::env::var("BOX_HTTP_PORT_RANGE") {
            config.http_port_range = parse_port_range(&range)?;
        }

        if let Ok(v) = std::env::var("BOX_HEALTH_CHECK_ATTEMPTS") {
            config.health_check_attempts = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BOX_HEALTH_CHECK_ATTEMPTS", v))?;
        }

        if let Ok(v) = std::env::var("BOX_HEALTH_CHECK_INTERVAL_SECS") {
            let secs: u64 = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BOX_HEALTH_CHECK_INTERVAL_SECS", v))?;
            config.health_check_interval = Duration::from_secs(secs);
        }

        if let Ok(email) = std::env::var("BOX_ADMIN_EMAIL") {
            config.admin_email = email;
        }

        if let Ok(image) = std::env::var("BOX_REDIS_IMAGE") {
            config.redis_image = image;
        }

        if let Ok(path) = std::env::var("BOX_FALLBACK_CERT") {
            config.fallback_cert = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("BOX_FALLBACK_KEY") {
            config.fallback_key = PathBuf::from(path);
        }

        if let Ok(v) = std::env::var("BOX_BACKUP_RETENTION_DAYS") {
            let days: u64 = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("BOX_BACKUP_RETENTION_DAYS", v))?;
            config.backup_retention = Duration::from_secs(days * 24 * 3600);
        }

        if let Ok(network) = std::env::var("BOX_DOCKER_NETWORK") {
            config.docker_network = Some(network).filter(|n| !n.is_empty());
        }

        Ok(config)
    }

    /// Directory holding per-app data volumes.
    pub fn apps_data_dir(&self) -> PathBuf {
        self.data_dir.join("appsdata")
    }

    /// Directory holding backup snapshots.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Directory holding custom app certificates.
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs").join("apps")
    }

    /// Fully qualified domain of the admin UI.
    pub fn admin_fqdn(&self) -> String {
        self.app_fqdn(&self.admin_location)
    }

    /// Origin of the admin UI, handed to apps for OAuth.
    pub fn admin_origin(&self) -> String {
        format!("https://{}", self.admin_fqdn())
    }

    /// Fully qualified domain for an app location. An empty location is the bare domain.
    pub fn app_fqdn(&self, location: &str) -> String {
        if location.is_empty() {
            self.fqdn.clone()
        } else {
            format!("{}.{}", location, self.fqdn)
        }
    }
}

fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let invalid = || ConfigError::InvalidValue("BOX_HTTP_PORT_RANGE", value.to_string());
    let (start, end) = value.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start == 0 || start > end {
        return Err(invalid());
    }
    Ok(start..=end)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has a value that cannot be used.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    /// The box version is not a semantic version.
    #[error("Invalid box version: {0}")]
    InvalidVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_rooted_at_data_dir() {
        let config = Config::new("/var/box");
        assert_eq!(config.database_path, PathBuf::from("/var/box/box.db"));
        assert_eq!(config.apps_data_dir(), PathBuf::from("/var/box/appsdata"));
        assert_eq!(
            config.nginx_appconfig_dir,
            PathBuf::from("/var/box/nginx/applications")
        );
        assert_eq!(config.http_port_range, 3001..=3999);
        assert_eq!(config.docker_network.as_deref(), Some("cloudron"));
    }

    #[test]
    fn test_app_fqdn() {
        let mut config = Config::new(".data");
        config.fqdn = "example.com".to_string();
        assert_eq!(config.app_fqdn("blog"), "blog.example.com");
        assert_eq!(config.app_fqdn(""), "example.com");
        assert_eq!(config.admin_origin(), "https://my.example.com");
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("4000-4010").unwrap(), 4000..=4010);
        assert_eq!(parse_port_range(" 5000 - 5000 ").unwrap(), 5000..=5000);
        assert!(parse_port_range("4010-4000").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("abc").is_err());
    }
}
