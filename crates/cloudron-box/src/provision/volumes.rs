// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data volumes as host directories: `{root}/{appId}/data`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use super::{Result, VolumeManager};

/// Volumes stored under a root directory on the host.
pub struct LocalVolumes {
    root: PathBuf,
}

impl LocalVolumes {
    /// Create a volume manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl VolumeManager for LocalVolumes {
    fn volume_path(&self, app_id: &str) -> PathBuf {
        self.root.join(app_id).join("data")
    }

    async fn create_volume(&self, app_id: &str) -> Result<PathBuf> {
        let path = self.volume_path(app_id);
        fs::create_dir_all(&path).await?;
        info!(app_id = %app_id, path = %path.display(), "Created data volume");
        Ok(path)
    }

    async fn delete_volume(&self, app_id: &str) -> Result<()> {
        let app_dir = self.root.join(app_id);
        match fs::remove_dir_all(&app_dir).await {
            Ok(()) => {
                info!(app_id = %app_id, "Deleted data volume");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_exists(&self, app_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.volume_path(app_id)).await?)
    }
}
