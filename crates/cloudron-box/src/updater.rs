// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Automatic application of cached updates.

use tracing::{debug, info, warn};

use crate::app::InstallationState;
use crate::apps::Apps;
use crate::error::{Error, Result};
use crate::updatechecker::UpdateChecker;

/// Applies updates found by the [`UpdateChecker`].
#[derive(Clone)]
pub struct Updater {
    apps: Apps,
    checker: UpdateChecker,
}

impl Updater {
    /// Create an updater.
    pub fn new(apps: Apps, checker: UpdateChecker) -> Self {
        Self { apps, checker }
    }

    /// Apply every cached app update that needs no user input.
    ///
    /// Updates that add TCP ports are skipped since the new ports need bindings chosen by
    /// the admin. A box update is only logged; installing it is up to the platform
    /// installer. Returns the number of app updates started.
    pub async fn autoupdate(&self) -> Result<usize> {
        let info = self.checker.update_info().await;

        if let Some(release) = &info.box_update {
            info!(version = %release.version, "Box update available, waiting for installer");
        }

        let mut started = 0;
        for (app_id, update) in info.apps {
            let app = match self.apps.get_app(&app_id).await {
                Ok(app) => app,
                Err(Error::AppNotFound(_)) => {
                    self.checker.clear_app_update(&app_id).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if app.installation_state != InstallationState::Installed {
                debug!(
                    app_id = %app_id,
                    state = %app.installation_state,
                    "App is busy, not updating"
                );
                continue;
            }

            let new_ports: Vec<&String> = update
                .manifest
                .tcp_ports
                .keys()
                .filter(|name| !app.manifest.tcp_ports.contains_key(*name))
                .collect();
            if !new_ports.is_empty() {
                info!(
                    app_id = %app_id,
                    version = %update.manifest.version,
                    ports = ?new_ports,
                    "Update adds TCP ports, skipping automatic update"
                );
                continue;
            }

            match self.apps.update(&app_id, update.manifest.clone()).await {
                Ok(_) => {
                    info!(
                        app_id = %app_id,
                        version = %update.manifest.version,
                        "Started automatic update"
                    );
                    self.checker.clear_app_update(&app_id).await;
                    started += 1;
                }
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Automatic update failed to start");
                }
            }
        }

        Ok(started)
    }
}
