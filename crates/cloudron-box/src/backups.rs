// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App backups.
//!
//! Snapshots live in `{BOX_DATA_DIR}/backups/{app_id}/{unix_millis}/`:
//! - `app.json` - The app record at snapshot time
//! - `data/` - Copy of the app's data volume
//!
//! The directory name is the snapshot time, so age checks do not depend on file mtimes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::app::{App, InstallationState};
use crate::app_registry::AppRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::provision::VolumeManager;

/// Minimum age of the newest snapshot before `ensure_backup` takes another.
pub const BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Creates and prunes app snapshots.
#[derive(Clone)]
pub struct BackupManager {
    dir: PathBuf,
    retention: Duration,
    registry: AppRegistry,
    volumes: Arc<dyn VolumeManager>,
}

impl BackupManager {
    /// Create a backup manager storing snapshots under the configured backups directory.
    pub fn new(config: &Config, registry: AppRegistry, volumes: Arc<dyn VolumeManager>) -> Self {
        Self {
            dir: config.backups_dir(),
            retention: config.backup_retention,
            registry,
            volumes,
        }
    }

    fn app_dir(&self, app_id: &str) -> PathBuf {
        self.dir.join(app_id)
    }

    /// Snapshot times of an app, oldest first.
    pub async fn list_backups(&self, app_id: &str) -> Result<Vec<DateTime<Utc>>> {
        let mut entries = match fs::read_dir(self.app_dir(app_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            match name
                .to_str()
                .and_then(|n| n.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis)
            {
                Some(at) => snapshots.push(at),
                None => debug!(path = %entry.path().display(), "Ignoring unknown backup entry"),
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// Snapshot an app now.
    pub async fn backup_app(&self, app: &App) -> Result<PathBuf> {
        let now = Utc::now();
        let target = self
            .app_dir(&app.id)
            .join(now.timestamp_millis().to_string());
        fs::create_dir_all(&target).await?;

        fs::write(target.join("app.json"), serde_json::to_vec_pretty(app)?).await?;

        let volume = self.volumes.volume_path(&app.id);
        if fs::try_exists(&volume).await? {
            copy_dir(&volume, &target.join("data")).await?;
        } else {
            warn!(app_id = %app.id, "App has no data volume to back up");
        }

        info!(app_id = %app.id, path = %target.display(), "Backed up app");
        Ok(target)
    }

    /// Snapshot every installed app whose newest snapshot is older than a day. Returns the
    /// number of snapshots taken; failures are logged per app.
    pub async fn ensure_backup(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(BACKUP_INTERVAL).unwrap_or_default();
        let mut taken = 0;

        for app in self.registry.all().await? {
            if app.installation_state != InstallationState::Installed {
                continue;
            }
            let latest = self.list_backups(&app.id).await?.last().copied();
            if latest.is_some_and(|at| at > cutoff) {
                debug!(app_id = %app.id, "Recent backup exists");
                continue;
            }
            match self.backup_app(&app).await {
                Ok(_) => taken += 1,
                Err(e) => error!(app_id = %app.id, error = %e, "Failed to back up app"),
            }
        }

        Ok(taken)
    }

    /// Remove snapshots older than the retention period.
    pub async fn cleanup(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| Error::Other(format!("invalid retention: {}", e)))?;
        self.cleanup_before(Utc::now() - retention).await
    }

    /// Remove snapshots taken before `cutoff`. Returns the number removed.
    pub async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut apps = match fs::read_dir(&self.dir).await {
            Ok(apps) => apps,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Backup directory does not exist, nothing to clean");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = apps.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let app_id = entry.file_name().to_string_lossy().to_string();
            for at in self.list_backups(&app_id).await? {
                if at >= cutoff {
                    continue;
                }
                let path = self.app_dir(&app_id).join(at.timestamp_millis().to_string());
                match fs::remove_dir_all(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove backup"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "Backup cleanup completed");
        }
        Ok(removed)
    }
}

async fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}
