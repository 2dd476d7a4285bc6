// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update Checker
//!
//! Polls the box release feed and the app store for newer versions and keeps the result in a
//! process-wide [`UpdateInfo`] cache.
//!
//! The box feed is a JSON object keyed by version. Each release links to its successor through
//! `next`; the checker follows the chain from the running version to the furthest release it
//! may offer. Prereleases are passed over unless the `update_config` setting opts in, and a
//! release with `upgrade: false` is never offered itself (the walk continues past it).
//!
//! Notifications go out only for major/minor bumps over the running version and at most once
//! per version. Every notified version is persisted in settings, so neither a restart nor a
//! feed that goes back to an older release repeats a notification. Patch bumps are cached
//! silently and do not count as notified. A failed notification is logged and retried on the
//! next poll; it never keeps the cache from being updated.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::app_registry::AppRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::mailer::{Mailer, Notification};
use crate::manifest::Manifest;
use crate::provision::ProvisionError;
use crate::settings::Settings;

const BOX_NOTIFIED_KEY: &str = "box_update_notified_versions";

fn app_notified_key(app_id: &str) -> String {
    format!("app_update_notified_versions:{}", app_id)
}

fn default_true() -> bool {
    true
}

/// One entry of the release feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDescriptor {
    /// Version (the feed key)
    #[serde(default)]
    pub version: String,
    /// Source tarball of the release
    #[serde(default)]
    pub source_tarball_url: String,
    /// Machine image of the release
    #[serde(default)]
    pub image_id: Option<i64>,
    /// Release notes
    #[serde(default)]
    pub changelog: Vec<String>,
    /// Release date
    #[serde(default)]
    pub date: Option<String>,
    /// Release author
    #[serde(default)]
    pub author: Option<String>,
    /// Successor version
    #[serde(default)]
    pub next: Option<String>,
    /// Whether the release can be offered
    #[serde(default = "default_true")]
    pub upgrade: bool,
}

/// Box release feed keyed by version.
pub type ReleaseFeed = BTreeMap<String, ReleaseDescriptor>;

/// An app update offered by the app store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUpdate {
    /// Manifest of the new version
    pub manifest: Manifest,
}

#[derive(Debug, Deserialize)]
struct AppUpdateResponse {
    update: Option<AppUpdate>,
}

/// Cached update state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Offered box release
    #[serde(rename = "box")]
    pub box_update: Option<ReleaseDescriptor>,
    /// Offered app updates by app id
    pub apps: BTreeMap<String, AppUpdate>,
}

fn offerable(version: &Version, release: &ReleaseDescriptor, prerelease: bool) -> bool {
    release.upgrade && (prerelease || version.pre.is_empty())
}

/// Find the release to offer to a box running `current`.
///
/// Follows `next` from `current` and returns the furthest offerable release. When `current`
/// is not in the feed at all, the highest offerable version above it is returned.
pub fn resolve_box_update(
    feed: &ReleaseFeed,
    current: &Version,
    prerelease: bool,
) -> Option<ReleaseDescriptor> {
    let with_version = |version: &str, release: &ReleaseDescriptor| ReleaseDescriptor {
        version: version.to_string(),
        ..release.clone()
    };

    let Some(entry) = feed.get(&current.to_string()) else {
        return feed
            .iter()
            .filter_map(|(key, release)| Version::parse(key).ok().map(|v| (v, key, release)))
            .filter(|(v, _, release)| v > current && offerable(v, release, prerelease))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, key, release)| with_version(key, release));
    };

    let mut visited = HashSet::from([current.to_string()]);
    let mut candidate = None;
    let mut next = entry.next.clone();

    while let Some(key) = next {
        if !visited.insert(key.clone()) {
            warn!(version = %key, "Release feed has a cycle");
            break;
        }
        let Some(release) = feed.get(&key) else {
            debug!(version = %key, "Release chain ends at missing link");
            break;
        };
        let Ok(version) = Version::parse(&key) else {
            warn!(version = %key, "Release feed has an invalid version");
            break;
        };
        if version > *current && offerable(&version, release, prerelease) {
            candidate = Some(with_version(&key, release));
        }
        next = release.next.clone();
    }

    candidate
}

/// Whether `candidate` is more than a patch bump over `current`.
pub fn is_notable(current: &Version, candidate: &Version) -> bool {
    candidate.major != current.major || candidate.minor != current.minor
}

/// Polls for box and app updates.
#[derive(Clone)]
pub struct UpdateChecker {
    client: reqwest::Client,
    config: Arc<Config>,
    registry: AppRegistry,
    settings: Settings,
    mailer: Arc<dyn Mailer>,
    info: Arc<RwLock<UpdateInfo>>,
}

impl UpdateChecker {
    /// Create a checker with an empty cache.
    pub fn new(
        config: Arc<Config>,
        registry: AppRegistry,
        settings: Settings,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ProvisionError::from)?;
        Ok(Self {
            client,
            config,
            registry,
            settings,
            mailer,
            info: Arc::new(RwLock::new(UpdateInfo::default())),
        })
    }

    /// Snapshot of the cached update state.
    pub async fn update_info(&self) -> UpdateInfo {
        self.info.read().await.clone()
    }

    /// Drop the cached update of an app (after it was applied).
    pub async fn clear_app_update(&self, app_id: &str) {
        self.info.write().await.apps.remove(app_id);
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<T, ProvisionError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::Status {
                url: response.url().to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    async fn notified_versions(&self, key: &str) -> Result<BTreeSet<String>> {
        let Some(raw) = self.settings.get(key).await? else {
            return Ok(BTreeSet::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|_| BTreeSet::from([raw])))
    }

    /// Send `notification` unless `version` was notified under `key` before.
    ///
    /// The version is recorded only after the mail was handed off, so a failed send is
    /// retried on the next poll.
    async fn notify_once(
        &self,
        key: &str,
        version: &str,
        notification: Notification,
    ) -> Result<bool> {
        let mut notified = self.notified_versions(key).await?;
        if notified.contains(version) {
            return Ok(false);
        }

        self.mailer
            .send(&self.config.admin_email, notification)
            .await?;

        notified.insert(version.to_string());
        self.settings
            .set(key, &serde_json::to_string(&notified)?)
            .await?;
        Ok(true)
    }

    /// Poll the box release feed.
    ///
    /// On failure the cached box update is kept and the error returned.
    pub async fn check_box_updates(&self) -> Result<Option<ReleaseDescriptor>> {
        let feed: ReleaseFeed = self
            .fetch_json(self.client.get(&self.config.box_versions_url))
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to fetch box release feed"))?;

        let prerelease = self.settings.update_config().await?.prerelease;
        let current = &self.config.box_version;
        let candidate = resolve_box_update(&feed, current, prerelease);

        if let Some(release) = &candidate
            && let Ok(version) = Version::parse(&release.version)
        {
            if !is_notable(current, &version) {
                debug!(version = %version, "Patch release available, not notifying");
            } else {
                let notification = Notification::BoxUpdateAvailable {
                    version: release.version.clone(),
                    changelog: release.changelog.clone(),
                };
                match self
                    .notify_once(BOX_NOTIFIED_KEY, &release.version, notification)
                    .await
                {
                    Ok(true) => info!(version = %version, "Box update available"),
                    Ok(false) => debug!(version = %version, "Box update already notified"),
                    Err(e) => {
                        warn!(version = %version, error = %e, "Failed to notify box update")
                    }
                }
            }
        }

        self.info.write().await.box_update = candidate.clone();
        Ok(candidate)
    }

    async fn fetch_app_update(
        &self,
        store_id: &str,
        version: &str,
    ) -> std::result::Result<Option<AppUpdate>, ProvisionError> {
        let url = format!(
            "{}/api/v1/apps/{}/versions/{}/update",
            self.config.api_server_origin.trim_end_matches('/'),
            store_id,
            version
        );
        let box_version = self.config.box_version.to_string();
        let response: AppUpdateResponse = self
            .fetch_json(self.client.get(url).query(&[("boxVersion", box_version.as_str())]))
            .await?;
        Ok(response.update)
    }

    /// Poll the app store for every app installed from it.
    ///
    /// Rebuilds the app part of the cache. An app whose poll fails is left out and logged;
    /// the other apps are still checked.
    pub async fn check_app_updates(&self) -> Result<BTreeMap<String, AppUpdate>> {
        let mut updates = BTreeMap::new();

        for app in self.registry.all().await? {
            let Some(store_id) = app.app_store_id.as_deref() else {
                continue;
            };

            let update = match self.fetch_app_update(store_id, &app.manifest.version).await {
                Ok(Some(update)) => update,
                Ok(None) => continue,
                Err(e) => {
                    warn!(app_id = %app.id, error = %e, "Failed to check app update");
                    continue;
                }
            };

            let (Some(current), Some(offered)) = (app.manifest.semver(), update.manifest.semver())
            else {
                warn!(app_id = %app.id, version = %update.manifest.version, "Ignoring app update with invalid version");
                continue;
            };
            if offered <= current {
                continue;
            }

            if is_notable(&current, &offered) {
                let notification = Notification::AppUpdateAvailable {
                    app_id: app.id.clone(),
                    title: app.manifest.title.clone(),
                    version: update.manifest.version.clone(),
                    changelog: update.manifest.changelog.clone(),
                };
                match self
                    .notify_once(
                        &app_notified_key(&app.id),
                        &update.manifest.version,
                        notification,
                    )
                    .await
                {
                    Ok(true) => {
                        info!(app_id = %app.id, version = %offered, "App update available")
                    }
                    Ok(false) => {}
                    Err(e) => warn!(
                        app_id = %app.id,
                        version = %offered,
                        error = %e,
                        "Failed to notify app update"
                    ),
                }
            }

            updates.insert(app.id.clone(), update);
        }

        self.info.write().await.apps = updates.clone();
        Ok(updates)
    }
}
