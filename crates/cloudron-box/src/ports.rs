// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port allocation.
//!
//! All reservations go through one global critical section so two concurrent installs never
//! pick the same port. The section is short: it reads the apps table, picks a port and
//! persists it before releasing.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::app::PortBindings;
use crate::app_registry::{AppPatch, AppRegistry};
use crate::error::{Error, Result};

/// Ports used by the box itself and its shared services.
pub const RESERVED_PORTS: &[u16] = &[
    22,   // ssh
    25,   // smtp
    53,   // dns
    80,   // http
    143,  // imap
    443,  // https
    465,  // smtps
    587,  // submission
    993,  // imaps
    2003, // graphite
    2004, // graphite
    2020, // sftp
    3000, // box api
    3306, // mysql
    4190, // sieve
    5432, // postgresql
    6379, // redis
    8000, // box internal
    27017, // mongodb
];

/// Whether `port` is reserved for the box.
pub fn is_reserved(port: u16) -> bool {
    RESERVED_PORTS.contains(&port)
}

/// Allocates host HTTP ports from a managed range.
#[derive(Clone)]
pub struct PortAllocator {
    registry: AppRegistry,
    range: RangeInclusive<u16>,
    probe_bind: bool,
    section: Arc<Mutex<()>>,
}

impl PortAllocator {
    /// Allocate from `range`, skipping ports other processes are listening on.
    pub fn new(registry: AppRegistry, range: RangeInclusive<u16>) -> Self {
        Self {
            registry,
            range,
            probe_bind: true,
            section: Arc::new(Mutex::new(())),
        }
    }

    /// Do not probe ports with a bind; only the apps table decides.
    pub fn without_bind_probe(mut self) -> Self {
        self.probe_bind = false;
        self
    }

    /// Enter the global port critical section.
    pub async fn critical_section(&self) -> MutexGuard<'_, ()> {
        self.section.lock().await
    }

    /// Ports held by apps other than `exclude_app`: HTTP ports and TCP port bindings.
    pub async fn used_ports(&self, exclude_app: Option<&str>) -> Result<BTreeSet<u16>> {
        let mut used = BTreeSet::new();
        for app in self.registry.all().await? {
            if Some(app.id.as_str()) == exclude_app {
                continue;
            }
            used.extend(app.http_port);
            used.extend(app.port_bindings.values().copied());
        }
        Ok(used)
    }

    /// Check that `bindings` collide with no other app and no reserved port.
    ///
    /// Call inside [`critical_section`](Self::critical_section) together with the write that
    /// records the bindings.
    pub async fn check_bindings(&self, app_id: &str, bindings: &PortBindings) -> Result<()> {
        let mut used = self.used_ports(Some(app_id)).await?;
        if let Ok(app) = self.registry.get(app_id).await {
            used.extend(app.http_port);
        }
        for (name, port) in bindings {
            if used.contains(port) || is_reserved(*port) {
                return Err(Error::Conflict(format!(
                    "Port {} ({}) is already in use",
                    port, name
                )));
            }
        }
        Ok(())
    }

    /// Reserve an HTTP port for `app_id` and persist it. Returns the existing port if the app
    /// already holds one.
    pub async fn allocate_http_port(&self, app_id: &str) -> Result<u16> {
        let _section = self.critical_section().await;

        let app = self.registry.get(app_id).await?;
        if let Some(port) = app.http_port {
            return Ok(port);
        }

        // the app's own TCP bindings are published on the host too
        let mut used = self.used_ports(Some(app_id)).await?;
        used.extend(app.port_bindings.values().copied());

        let mut free = None;
        for candidate in self.range.clone() {
            if used.contains(&candidate) || is_reserved(candidate) {
                continue;
            }
            if self.probe_bind && !is_bindable(candidate).await {
                continue;
            }
            free = Some(candidate);
            break;
        }
        let port = free.ok_or_else(|| {
            Error::Conflict(format!(
                "No free port in {}-{}",
                self.range.start(),
                self.range.end()
            ))
        })?;

        self.registry
            .update(
                app_id,
                AppPatch {
                    http_port: Some(Some(port)),
                    ..Default::default()
                },
            )
            .await?;

        info!(app_id = %app_id, port, "Allocated HTTP port");
        Ok(port)
    }

    /// Release the HTTP port of `app_id`.
    pub async fn release_http_port(&self, app_id: &str) -> Result<()> {
        let _section = self.critical_section().await;
        self.registry
            .update(
                app_id,
                AppPatch {
                    http_port: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

async fn is_bindable(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
