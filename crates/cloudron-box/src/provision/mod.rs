// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource provisioners.
//!
//! Traits for the external collaborators the orchestrator drives: the container runtime,
//! the DNS provider, the reverse proxy, data volumes and health probes. Implementations are
//! pure adapters and never touch the app database; persisting what they return is the
//! caller's job.
//!
//! Teardown operations (`remove_*`, `delete_*`) succeed when the resource is already gone.

mod dns;
mod docker;
mod health;
pub mod mock;
mod proxy;
mod volumes;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dns::{CaasDnsProvider, NoopDnsProvider};
pub use docker::DockerCli;
pub use health::HttpHealthProbe;
pub use proxy::NginxProxy;
pub use volumes::LocalVolumes;

/// Errors from external collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// A command exited with a non-zero status.
    #[error("Command '{command}' failed with exit code {exit_code}: {stderr}")]
    Command {
        /// The command that was run.
        command: String,
        /// Exit code (-1 when killed by a signal).
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP endpoint answered with an unexpected status.
    #[error("{url} answered with status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for provisioner operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface (`0.0.0.0` for public ports)
    pub host_ip: String,
    /// Port on the host
    pub host_port: u16,
    /// Port inside the container
    pub container_port: u16,
}

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the host
    pub host_path: PathBuf,
    /// Path inside the container
    pub container_path: String,
    /// Mounted read-only
    pub read_only: bool,
}

/// Everything needed to create an app container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Container hostname
    pub hostname: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// Memory limit in bytes (0 = unlimited)
    pub memory_limit: i64,
    /// Labels used to find containers owned by an app
    pub labels: BTreeMap<String, String>,
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container id
    pub id: String,
    /// Container name
    pub name: String,
    /// Image reference the container was created from
    pub image: String,
    /// Whether the container is running
    pub running: bool,
    /// Address on the container network
    pub ip_address: Option<String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
}

/// Trait for container runtimes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Pull an image. Pulling an image that is already present is a no-op.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Remove an image.
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Whether any container still references the image.
    async fn image_in_use(&self, image: &str) -> Result<bool>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect a container by id or name. Returns `None` when it does not exist.
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>>;

    /// Run a command inside a running container and return its stdout.
    async fn exec(&self, id: &str, command: &[String]) -> Result<String>;
}

/// A DNS record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Provider assigned record id
    pub id: String,
    /// Fully qualified name
    pub name: String,
    /// Record type (`A`, `CNAME`, ...)
    pub record_type: String,
    /// Record value
    pub value: String,
}

/// Trait for DNS providers.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider type identifier (e.g., "caas", "noop")
    fn provider_type(&self) -> &'static str;

    /// Look up a single record by name and type.
    async fn get_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>>;

    /// Create the record or replace its value. Returns the record id.
    async fn upsert_record(&self, name: &str, record_type: &str, value: &str) -> Result<String>;

    /// Delete a record.
    async fn delete_record(&self, name: &str, record_type: &str) -> Result<()>;
}

/// A virtual host routing an app domain to its HTTP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    /// App owning the vhost
    pub app_id: String,
    /// Domain served
    pub fqdn: String,
    /// Upstream port on 127.0.0.1
    pub upstream_port: u16,
    /// TLS certificate
    pub cert_path: PathBuf,
    /// TLS key
    pub key_path: PathBuf,
}

/// Trait for reverse proxies.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Write (or overwrite) the vhost of an app.
    async fn write_vhost(&self, vhost: &VirtualHost) -> Result<()>;

    /// Remove the vhost of an app.
    async fn remove_vhost(&self, app_id: &str) -> Result<()>;

    /// Whether a vhost exists for the app.
    async fn has_vhost(&self, app_id: &str) -> Result<bool>;

    /// Apply configuration changes.
    async fn reload(&self) -> Result<()>;
}

/// Trait for per-app data volumes.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Host path of the app's data volume.
    fn volume_path(&self, app_id: &str) -> PathBuf;

    /// Create the volume. Creating an existing volume is a no-op.
    async fn create_volume(&self, app_id: &str) -> Result<PathBuf>;

    /// Delete the volume and its contents.
    async fn delete_volume(&self, app_id: &str) -> Result<()>;

    /// Whether the volume exists.
    async fn volume_exists(&self, app_id: &str) -> Result<bool>;
}

/// Trait for app health probes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `path` on the app's HTTP port once. `Ok(false)` means not healthy yet.
    async fn probe(&self, port: u16, path: &str) -> Result<bool>;
}
