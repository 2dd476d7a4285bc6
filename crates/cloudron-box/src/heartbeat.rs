// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness ping to the caas API.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::provision::ProvisionError;

/// Sends the periodic box heartbeat.
#[derive(Clone)]
pub struct Heartbeat {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl Heartbeat {
    /// Create a heartbeat sender.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ProvisionError::from)?;
        Ok(Self { client, config })
    }

    /// Send one heartbeat. Returns `false` when the box has no caas identity.
    pub async fn send(&self) -> Result<bool> {
        let Some(box_id) = self.config.box_id.as_deref() else {
            debug!("No box id configured, skipping heartbeat");
            return Ok(false);
        };

        let url = format!(
            "{}/api/v1/boxes/{}/heartbeat",
            self.config.api_server_origin.trim_end_matches('/'),
            box_id
        );
        let token = self.config.box_token.as_deref().unwrap_or_default();
        let response = self
            .client
            .post(&url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(ProvisionError::from)?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Heartbeat rejected");
            return Err(ProvisionError::Status {
                url,
                status: status.as_u16(),
            }
            .into());
        }

        debug!("Heartbeat sent");
        Ok(true)
    }
}
