// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Settings store.
//!
//! Key/value settings persisted in SQLite. Typed setters validate their input and publish a
//! [`SettingChange`] to every subscriber; the scheduler uses this to reschedule jobs.

use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Time zone used for all scheduled jobs.
pub const TIME_ZONE_KEY: &str = "time_zone";
/// Cron pattern of the autoupdate job, or `never`.
pub const AUTOUPDATE_PATTERN_KEY: &str = "autoupdate_pattern";
/// Update channel options.
pub const UPDATE_CONFIG_KEY: &str = "update_config";
/// Developer mode flag.
pub const DEVELOPER_MODE_KEY: &str = "developer_mode";
/// DNS provider configuration.
pub const DNS_CONFIG_KEY: &str = "dns_config";
/// TLS provider configuration.
pub const TLS_CONFIG_KEY: &str = "tls_config";
/// Backup provider configuration.
pub const BACKUP_CONFIG_KEY: &str = "backup_config";

/// Default autoupdate pattern: at midnight on a few days of the month.
pub const DEFAULT_AUTOUPDATE_PATTERN: &str = "00 00 1,3,5,23 * * *";

/// When the autoupdate job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoupdatePattern {
    /// Autoupdate disabled
    Never,
    /// Six field cron pattern (sec min hour dom month dow)
    Cron(String),
}

impl AutoupdatePattern {
    /// Stored representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Never => "never",
            Self::Cron(pattern) => pattern,
        }
    }
}

impl Default for AutoupdatePattern {
    fn default() -> Self {
        Self::Cron(DEFAULT_AUTOUPDATE_PATTERN.to_string())
    }
}

impl fmt::Display for AutoupdatePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoupdatePattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "never" {
            return Ok(Self::Never);
        }
        cron::Schedule::from_str(s)
            .map_err(|e| Error::InvalidRequest(format!("Invalid pattern '{}': {}", s, e)))?;
        Ok(Self::Cron(s.to_string()))
    }
}

/// Update channel options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Offer prerelease box versions
    #[serde(default)]
    pub prerelease: bool,
}

/// Provider configuration for DNS, TLS and backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name
    pub provider: String,
    /// Provider specific options
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    fn named(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            options: serde_json::Map::new(),
        }
    }
}

/// Which provider configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// DNS provider
    Dns,
    /// TLS certificate provider
    Tls,
    /// Backup target
    Backup,
}

impl ProviderKind {
    fn key(&self) -> &'static str {
        match self {
            Self::Dns => DNS_CONFIG_KEY,
            Self::Tls => TLS_CONFIG_KEY,
            Self::Backup => BACKUP_CONFIG_KEY,
        }
    }

    fn default_config(&self) -> ProviderConfig {
        match self {
            Self::Dns => ProviderConfig::named("noop"),
            Self::Tls => ProviderConfig::named("fallback"),
            Self::Backup => ProviderConfig::named("filesystem"),
        }
    }
}

/// A setting changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingChange {
    /// New time zone
    TimeZone(Tz),
    /// New autoupdate pattern
    AutoupdatePattern(AutoupdatePattern),
}

/// Settings store client.
#[derive(Clone)]
pub struct Settings {
    pool: SqlitePool,
    events: broadcast::Sender<SettingChange>,
}

impl Settings {
    /// Create a settings client over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { pool, events }
    }

    /// Subscribe to changes made through this client (and its clones).
    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.events.subscribe()
    }

    /// Raw value of a setting.
    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(|(v,)| v))
    }

    /// Store a raw value. No change event is published.
    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (name, value) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a setting.
    pub async fn delete(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn publish(&self, change: SettingChange) {
        tracing::info!(change = ?change, "Setting changed");
        // no subscribers is fine
        let _ = self.events.send(change);
    }

    /// Time zone for scheduled jobs (UTC by default).
    pub async fn time_zone(&self) -> Result<Tz> {
        match self.get(TIME_ZONE_KEY).await? {
            Some(tz) => tz
                .parse()
                .map_err(|_| Error::Other(format!("stored time zone '{}' is invalid", tz))),
            None => Ok(Tz::UTC),
        }
    }

    /// Set the time zone (IANA name).
    pub async fn set_time_zone(&self, name: &str) -> Result<()> {
        let tz: Tz = name
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("Invalid time zone '{}'", name)))?;
        self.set(TIME_ZONE_KEY, tz.name()).await?;
        self.publish(SettingChange::TimeZone(tz));
        Ok(())
    }

    /// Autoupdate pattern.
    pub async fn autoupdate_pattern(&self) -> Result<AutoupdatePattern> {
        match self.get(AUTOUPDATE_PATTERN_KEY).await? {
            Some(pattern) => pattern.parse(),
            None => Ok(AutoupdatePattern::default()),
        }
    }

    /// Set the autoupdate pattern (`never` or a six field cron pattern).
    pub async fn set_autoupdate_pattern(&self, pattern: &str) -> Result<()> {
        let pattern: AutoupdatePattern = pattern.parse()?;
        self.set(AUTOUPDATE_PATTERN_KEY, pattern.as_str()).await?;
        self.publish(SettingChange::AutoupdatePattern(pattern));
        Ok(())
    }

    /// Update channel options.
    pub async fn update_config(&self) -> Result<UpdateConfig> {
        match self.get(UPDATE_CONFIG_KEY).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(UpdateConfig::default()),
        }
    }

    /// Set update channel options.
    pub async fn set_update_config(&self, config: UpdateConfig) -> Result<()> {
        self.set(UPDATE_CONFIG_KEY, &serde_json::to_string(&config)?)
            .await?;
        Ok(())
    }

    /// Whether developer mode is on.
    pub async fn developer_mode(&self) -> Result<bool> {
        Ok(self.get(DEVELOPER_MODE_KEY).await?.as_deref() == Some("true"))
    }

    /// Toggle developer mode.
    pub async fn set_developer_mode(&self, enabled: bool) -> Result<()> {
        self.set(DEVELOPER_MODE_KEY, if enabled { "true" } else { "false" })
            .await?;
        Ok(())
    }

    /// Provider configuration, with the built-in default when unset.
    pub async fn provider_config(&self, kind: ProviderKind) -> Result<ProviderConfig> {
        match self.get(kind.key()).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(kind.default_config()),
        }
    }

    /// Set a provider configuration.
    pub async fn set_provider_config(&self, kind: ProviderKind, config: ProviderConfig) -> Result<()> {
        if config.provider.is_empty() {
            return Err(Error::InvalidRequest("provider is required".to_string()));
        }
        self.set(kind.key(), &serde_json::to_string(&config)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn settings() -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(dir.path().join("box.db")).await.unwrap();
        (dir, Settings::new(pool))
    }

    #[tokio::test]
    async fn test_defaults() {
        let (_dir, settings) = settings().await;
        assert_eq!(settings.time_zone().await.unwrap(), Tz::UTC);
        assert_eq!(
            settings.autoupdate_pattern().await.unwrap(),
            AutoupdatePattern::Cron(DEFAULT_AUTOUPDATE_PATTERN.to_string())
        );
        assert!(!settings.update_config().await.unwrap().prerelease);
        assert!(!settings.developer_mode().await.unwrap());
        assert_eq!(
            settings.provider_config(ProviderKind::Dns).await.unwrap().provider,
            "noop"
        );
    }

    #[tokio::test]
    async fn test_time_zone_change_is_published() {
        let (_dir, settings) = settings().await;
        let mut events = settings.subscribe();

        settings.set_time_zone("Europe/Berlin").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SettingChange::TimeZone(chrono_tz::Europe::Berlin)
        );
        assert_eq!(settings.time_zone().await.unwrap(), chrono_tz::Europe::Berlin);

        let err = settings.set_time_zone("Mars/Olympus").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_autoupdate_pattern() {
        let (_dir, settings) = settings().await;

        settings.set_autoupdate_pattern("never").await.unwrap();
        assert_eq!(
            settings.autoupdate_pattern().await.unwrap(),
            AutoupdatePattern::Never
        );

        settings
            .set_autoupdate_pattern("00 30 2 * * *")
            .await
            .unwrap();
        assert_eq!(
            settings.autoupdate_pattern().await.unwrap(),
            AutoupdatePattern::Cron("00 30 2 * * *".to_string())
        );

        assert!(settings.set_autoupdate_pattern("every day").await.is_err());
    }

    #[tokio::test]
    async fn test_raw_values() {
        let (_dir, settings) = settings().await;
        settings.set("k", "v1").await.unwrap();
        settings.set("k", "v2").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap().as_deref(), Some("v2"));
        settings.delete("k").await.unwrap();
        assert!(settings.get("k").await.unwrap().is_none());
    }
}
