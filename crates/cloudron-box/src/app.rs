// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App records and their lifecycle states.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Manifest port name to host port.
pub type PortBindings = BTreeMap<String, u16>;

/// Persisted lifecycle phase of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationState {
    /// Install requested, pipeline not started yet
    PendingInstall,
    /// Install pipeline running
    Installing,
    /// Configure requested
    PendingConfigure,
    /// Configure pipeline running
    Configuring,
    /// Update requested
    PendingUpdate,
    /// Update pipeline running
    Updating,
    /// Uninstall requested
    PendingUninstall,
    /// Uninstall pipeline running
    Uninstalling,
    /// App is installed
    Installed,
    /// A pipeline failed; only uninstall or configure are accepted
    Error,
}

impl InstallationState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingInstall => "pending_install",
            Self::Installing => "installing",
            Self::PendingConfigure => "pending_configure",
            Self::Configuring => "configuring",
            Self::PendingUpdate => "pending_update",
            Self::Updating => "updating",
            Self::PendingUninstall => "pending_uninstall",
            Self::Uninstalling => "uninstalling",
            Self::Installed => "installed",
            Self::Error => "error",
        }
    }

    /// Whether a pipeline is requested or running.
    pub fn is_in_progress(&self) -> bool {
        !matches!(self, Self::Installed | Self::Error)
    }

    /// The running state that follows a pending state.
    pub fn running(&self) -> Self {
        match self {
            Self::PendingInstall => Self::Installing,
            Self::PendingConfigure => Self::Configuring,
            Self::PendingUpdate => Self::Updating,
            Self::PendingUninstall => Self::Uninstalling,
            other => *other,
        }
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending_install" => Self::PendingInstall,
            "installing" => Self::Installing,
            "pending_configure" => Self::PendingConfigure,
            "configuring" => Self::Configuring,
            "pending_update" => Self::PendingUpdate,
            "updating" => Self::Updating,
            "pending_uninstall" => Self::PendingUninstall,
            "uninstalling" => Self::Uninstalling,
            "installed" => Self::Installed,
            "error" => Self::Error,
            other => return Err(format!("unknown installation state: {}", other)),
        })
    }
}

/// Whether an installed app's container is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Container started
    Running,
    /// Container stopped on request
    Stopped,
    /// Not known (no container yet, or a start/stop failed)
    Unknown,
}

impl RunState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown run state: {}", other)),
        }
    }
}

/// Users allowed to use an app. `None` on the app means public.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRestriction {
    /// Authorized user ids
    #[serde(default)]
    pub users: Vec<String>,
}

impl AccessRestriction {
    /// Whether `user_id` may use the app.
    pub fn allows(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| u == user_id)
    }
}

/// Configuration an app had before a configure or update, used to tear down what changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OldConfig {
    /// Previous location
    pub location: String,
    /// Previous port bindings
    #[serde(default)]
    pub port_bindings: PortBindings,
    /// Previous manifest
    pub manifest: Manifest,
    /// Locations a failed configure moved to before being retried elsewhere
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abandoned_locations: Vec<String>,
}

impl OldConfig {
    /// Locations whose DNS record and certificate must go once the app serves `current`.
    pub fn stale_locations<'a>(&'a self, current: &'a str) -> impl Iterator<Item = &'a str> {
        std::iter::once(self.location.as_str())
            .chain(self.abandoned_locations.iter().map(String::as_str))
            .filter(move |location| *location != current)
    }
}

/// An installed application instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Opaque, stable id
    pub id: String,
    /// Catalog reference, absent for manifest-only installs
    pub app_store_id: Option<String>,
    /// Current manifest
    pub manifest: Manifest,
    /// Subdomain
    pub location: String,
    /// Host ports for manifest TCP ports
    pub port_bindings: PortBindings,
    /// Authorized users, `None` = public
    pub access_restriction: Option<AccessRestriction>,
    /// Lifecycle phase
    pub installation_state: InstallationState,
    /// Last pipeline step reached (`"<percent>, <step>"`)
    pub installation_progress: Option<String>,
    /// Container running state
    pub run_state: RunState,
    /// Container id assigned by the runtime
    pub container_id: Option<String>,
    /// Container address on the app network
    pub container_ip: Option<String>,
    /// Host port for the manifest HTTP port
    pub http_port: Option<u16>,
    /// Record id assigned by the DNS provider
    pub dns_record_id: Option<String>,
    /// Memory limit in bytes (0 = manifest or box default)
    pub memory_limit: i64,
    /// Configuration before the running configure/update
    pub old_config: Option<OldConfig>,
    /// Error of the last failed pipeline
    pub last_error: Option<String>,
    /// When the app was added
    pub created_at: DateTime<Utc>,
    /// When the record last changed
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Effective memory limit: the app setting, else the manifest's.
    pub fn effective_memory_limit(&self) -> i64 {
        if self.memory_limit > 0 {
            self.memory_limit
        } else {
            self.manifest.memory_limit
        }
    }

    /// Name of the app's main container.
    pub fn container_name(&self) -> String {
        format!("app-{}", self.id)
    }
}
