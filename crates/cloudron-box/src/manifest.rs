// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App manifests.
//!
//! A manifest declares the docker image of an app, its HTTP and TCP ports, the addons it needs,
//! its health check path and the range of box versions it runs on.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Manifest format understood by this box.
pub const MANIFEST_VERSION: u32 = 1;

/// A TCP port exposed by an app in addition to its HTTP port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpPortSpec {
    /// Human readable title
    #[serde(default)]
    pub title: String,
    /// Human readable description
    #[serde(default)]
    pub description: String,
    /// Port inside the container
    pub container_port: u16,
    /// Suggested host port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<u16>,
}

/// Declarative descriptor of an app.
///
/// Required fields default to empty values so that incomplete manifests still deserialize
/// and are rejected by [`Manifest::verify`] with a descriptive error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Catalog id (reverse domain notation)
    #[serde(default)]
    pub id: String,
    /// App title
    #[serde(default)]
    pub title: String,
    /// App version (semver)
    #[serde(default)]
    pub version: String,
    /// Manifest format version
    #[serde(default)]
    pub manifest_version: u32,
    /// Docker image reference
    #[serde(default)]
    pub docker_image: String,
    /// Path probed to decide that the app is up
    #[serde(default)]
    pub health_check_path: String,
    /// HTTP port inside the container
    #[serde(default)]
    pub http_port: u16,
    /// Additional TCP ports keyed by environment variable name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tcp_ports: BTreeMap<String, TcpPortSpec>,
    /// Addons keyed by addon name, with addon specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub addons: BTreeMap<String, serde_json::Value>,
    /// Lowest box version the app runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_box_version: Option<String>,
    /// Highest box version the app runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_box_version: Option<String>,
    /// App supports a single user only
    #[serde(default)]
    pub single_user: bool,
    /// Memory limit in bytes (0 = box default)
    #[serde(default)]
    pub memory_limit: i64,
    /// Author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Changelog of this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// Addons an app can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Addon {
    /// Persistent data volume (always provisioned)
    LocalStorage,
    /// OAuth client credentials against the box
    Oauth,
    /// LDAP bind credentials for the user directory
    Ldap,
    /// Outgoing mail through a box owned mailbox
    Sendmail,
    /// Private redis instance
    Redis,
    /// Database on the shared MySQL server
    Mysql,
    /// Database on the shared PostgreSQL server
    Postgresql,
}

impl Addon {
    /// All supported addons.
    pub const ALL: [Addon; 7] = [
        Addon::LocalStorage,
        Addon::Oauth,
        Addon::Ldap,
        Addon::Sendmail,
        Addon::Redis,
        Addon::Mysql,
        Addon::Postgresql,
    ];

    /// Manifest name of this addon.
    pub fn as_str(&self) -> &'static str {
        match self {
            Addon::LocalStorage => "localstorage",
            Addon::Oauth => "oauth",
            Addon::Ldap => "ldap",
            Addon::Sendmail => "sendmail",
            Addon::Redis => "redis",
            Addon::Mysql => "mysql",
            Addon::Postgresql => "postgresql",
        }
    }
}

impl fmt::Display for Addon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Addon {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Addon::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown addon: {}", s))
    }
}

impl Manifest {
    /// Parse a manifest from JSON.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::BadManifest("manifest must be an object".to_string()));
        }
        serde_json::from_value(value).map_err(|e| Error::BadManifest(e.to_string()))
    }

    /// Parsed app version. Only valid after [`verify`](Self::verify) succeeded.
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.version).ok()
    }

    /// Addons declared by this manifest. Unknown names are skipped; `verify` rejects them.
    pub fn addon_list(&self) -> Vec<Addon> {
        self.addons
            .keys()
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    /// Check schema completeness and compatibility with the running box version.
    pub fn verify(&self, box_version: &semver::Version) -> Result<()> {
        let mut missing = Vec::new();
        if self.id.is_empty() {
            missing.push("id");
        }
        if self.title.is_empty() {
            missing.push("title");
        }
        if self.version.is_empty() {
            missing.push("version");
        }
        if self.docker_image.is_empty() {
            missing.push("dockerImage");
        }
        if self.health_check_path.is_empty() {
            missing.push("healthCheckPath");
        }
        if self.http_port == 0 {
            missing.push("httpPort");
        }
        if self.manifest_version == 0 {
            missing.push("manifestVersion");
        }
        if !missing.is_empty() {
            return Err(Error::BadManifest(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        if self.manifest_version != MANIFEST_VERSION {
            return Err(Error::BadManifest(format!(
                "manifestVersion must be {}",
                MANIFEST_VERSION
            )));
        }

        if semver::Version::parse(&self.version).is_err() {
            return Err(Error::BadManifest(format!(
                "version '{}' is not a valid semver",
                self.version
            )));
        }

        if !self.health_check_path.starts_with('/') {
            return Err(Error::BadManifest(
                "healthCheckPath must be an absolute path".to_string(),
            ));
        }

        for (name, port) in &self.tcp_ports {
            if !is_env_name(name) {
                return Err(Error::BadManifest(format!(
                    "tcpPorts key '{}' must be an environment variable name",
                    name
                )));
            }
            if port.container_port == 0 {
                return Err(Error::BadManifest(format!(
                    "tcpPorts.{}.containerPort is required",
                    name
                )));
            }
        }

        for name in self.addons.keys() {
            name.parse::<Addon>().map_err(Error::BadManifest)?;
        }

        if let Some(min) = &self.min_box_version {
            let min = parse_bound("minBoxVersion", min)?;
            if *box_version < min {
                return Err(Error::BadManifest(format!(
                    "app requires box version {} or later (running {})",
                    min, box_version
                )));
            }
        }

        if let Some(max) = &self.max_box_version {
            let max = parse_bound("maxBoxVersion", max)?;
            if *box_version > max {
                return Err(Error::BadManifest(format!(
                    "app supports box versions up to {} (running {})",
                    max, box_version
                )));
            }
        }

        Ok(())
    }
}

fn parse_bound(field: &str, value: &str) -> Result<semver::Version> {
    semver::Version::parse(value)
        .map_err(|_| Error::BadManifest(format!("{} '{}' is not a valid semver", field, value)))
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_')
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
