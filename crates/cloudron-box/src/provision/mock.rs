// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provisioners for testing.
//!
//! In-memory implementations of every provisioner trait that record what was created and
//! can be told to fail specific operations, so pipelines can be exercised without Docker,
//! a DNS provider or nginx.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;

/// Set of operation names that should fail.
#[derive(Debug, Default)]
struct Failures(Mutex<HashSet<String>>);

impl Failures {
    async fn set(&self, op: &str) {
        self.0.lock().await.insert(op.to_string());
    }

    async fn clear(&self) {
        self.0.lock().await.clear();
    }

    async fn check(&self, op: &str) -> Result<()> {
        if self.0.lock().await.contains(op) {
            return Err(ProvisionError::Other(format!("Mock failure in {}", op)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    info: ContainerInfo,
    spec: ContainerSpec,
}

#[derive(Debug, Default)]
struct RuntimeState {
    images: HashSet<String>,
    containers: HashMap<String, MockContainer>,
    exec_log: Vec<(String, Vec<String>)>,
    next_ip: u8,
}

/// Mock container runtime.
#[derive(Debug, Default)]
pub struct MockContainerRuntime {
    state: Mutex<RuntimeState>,
    failures: Failures,
}

impl MockContainerRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` (a trait method name such as `create_container`) fail until cleared.
    /// `inspect_container:<id>` fails inspection of a single container.
    pub async fn fail_on(&self, op: &str) {
        self.failures.set(op).await;
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failures.clear().await;
    }

    /// All containers.
    pub async fn containers(&self) -> Vec<ContainerInfo> {
        self.state
            .lock()
            .await
            .containers
            .values()
            .map(|c| c.info.clone())
            .collect()
    }

    /// Containers labeled with `appId = app_id`.
    pub async fn containers_for_app(&self, app_id: &str) -> Vec<ContainerInfo> {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|c| c.spec.labels.get("appId").map(String::as_str) == Some(app_id))
            .map(|c| c.info.clone())
            .collect()
    }

    /// Spec a container was created with.
    pub async fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .await
            .containers
            .get(id)
            .map(|c| c.spec.clone())
    }

    /// Whether an image is present.
    pub async fn has_image(&self, image: &str) -> bool {
        self.state.lock().await.images.contains(image)
    }

    /// Commands run through `exec`.
    pub async fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().await.exec_log.clone()
    }

    /// Simulate a container dying.
    pub async fn kill(&self, id: &str) {
        if let Some(c) = self.state.lock().await.containers.get_mut(id) {
            c.info.running = false;
        }
    }
}

fn find<'a>(state: &'a mut RuntimeState, id: &str) -> Option<&'a mut MockContainer> {
    if state.containers.contains_key(id) {
        return state.containers.get_mut(id);
    }
    state.containers.values_mut().find(|c| c.info.name == id)
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.failures.check("pull_image").await?;
        self.state.lock().await.images.insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.failures.check("remove_image").await?;
        self.state.lock().await.images.remove(image);
        Ok(())
    }

    async fn image_in_use(&self, image: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .containers
            .values()
            .any(|c| c.info.image == image))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.failures.check("create_container").await?;
        let mut state = self.state.lock().await;

        if !state.images.contains(&spec.image) {
            return Err(ProvisionError::NotFound(format!("image {}", spec.image)));
        }
        if state.containers.values().any(|c| c.info.name == spec.name) {
            return Err(ProvisionError::Other(format!(
                "container name {} already in use",
                spec.name
            )));
        }

        let mut published = HashSet::new();
        for port in &spec.ports {
            let taken = state
                .containers
                .values()
                .any(|c| c.info.ports.iter().any(|p| p.host_port == port.host_port));
            if taken || !published.insert(port.host_port) {
                return Err(ProvisionError::Other(format!(
                    "port {} is already allocated",
                    port.host_port
                )));
            }
        }

        state.next_ip = state.next_ip.wrapping_add(1).max(2);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            running: false,
            ip_address: Some(format!("172.18.0.{}", state.next_ip)),
            ports: spec.ports.clone(),
            mounts: spec.mounts.clone(),
        };
        state.containers.insert(
            id.clone(),
            MockContainer {
                info,
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.failures.check("start_container").await?;
        let mut state = self.state.lock().await;
        let container =
            find(&mut state, id).ok_or_else(|| ProvisionError::NotFound(id.to_string()))?;
        container.info.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.failures.check("stop_container").await?;
        if let Some(container) = find(&mut *self.state.lock().await, id) {
            container.info.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.failures.check("remove_container").await?;
        let mut state = self.state.lock().await;
        let key = find(&mut state, id).map(|c| c.info.id.clone());
        if let Some(key) = key {
            state.containers.remove(&key);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        self.failures.check("inspect_container").await?;
        self.failures
            .check(&format!("inspect_container:{}", id))
            .await?;
        Ok(find(&mut *self.state.lock().await, id).map(|c| c.info.clone()))
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<String> {
        self.failures.check("exec").await?;
        let mut state = self.state.lock().await;
        if find(&mut state, id).is_none() {
            return Err(ProvisionError::NotFound(id.to_string()));
        }
        state.exec_log.push((id.to_string(), command.to_vec()));
        Ok(String::new())
    }
}

/// Mock DNS provider.
#[derive(Debug, Default)]
pub struct MockDnsProvider {
    records: Mutex<HashMap<(String, String), DnsRecord>>,
    upserts: AtomicU32,
    failures: Failures,
}

impl MockDnsProvider {
    /// Create a new mock DNS provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail until cleared.
    pub async fn fail_on(&self, op: &str) {
        self.failures.set(op).await;
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failures.clear().await;
    }

    /// All records.
    pub async fn records(&self) -> Vec<DnsRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Number of `upsert_record` calls that reached the provider.
    pub fn upsert_count(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn get_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>> {
        self.failures.check("get_record").await?;
        Ok(self
            .records
            .lock()
            .await
            .get(&(name.to_string(), record_type.to_string()))
            .cloned())
    }

    async fn upsert_record(&self, name: &str, record_type: &str, value: &str) -> Result<String> {
        self.failures.check("upsert_record").await?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let id = uuid::Uuid::new_v4().to_string();
        self.records.lock().await.insert(
            (name.to_string(), record_type.to_string()),
            DnsRecord {
                id: id.clone(),
                name: name.to_string(),
                record_type: record_type.to_string(),
                value: value.to_string(),
            },
        );
        Ok(id)
    }

    async fn delete_record(&self, name: &str, record_type: &str) -> Result<()> {
        self.failures.check("delete_record").await?;
        self.records
            .lock()
            .await
            .remove(&(name.to_string(), record_type.to_string()));
        Ok(())
    }
}

/// Mock reverse proxy.
#[derive(Debug, Default)]
pub struct MockReverseProxy {
    vhosts: Mutex<HashMap<String, VirtualHost>>,
    reloads: AtomicU32,
    failures: Failures,
}

impl MockReverseProxy {
    /// Create a new mock proxy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail until cleared.
    pub async fn fail_on(&self, op: &str) {
        self.failures.set(op).await;
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failures.clear().await;
    }

    /// The vhost of an app.
    pub async fn vhost(&self, app_id: &str) -> Option<VirtualHost> {
        self.vhosts.lock().await.get(app_id).cloned()
    }

    /// Number of vhosts.
    pub async fn vhost_count(&self) -> usize {
        self.vhosts.lock().await.len()
    }

    /// Number of reloads.
    pub fn reload_count(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseProxy for MockReverseProxy {
    async fn write_vhost(&self, vhost: &VirtualHost) -> Result<()> {
        self.failures.check("write_vhost").await?;
        self.vhosts
            .lock()
            .await
            .insert(vhost.app_id.clone(), vhost.clone());
        Ok(())
    }

    async fn remove_vhost(&self, app_id: &str) -> Result<()> {
        self.failures.check("remove_vhost").await?;
        self.vhosts.lock().await.remove(app_id);
        Ok(())
    }

    async fn has_vhost(&self, app_id: &str) -> Result<bool> {
        Ok(self.vhosts.lock().await.contains_key(app_id))
    }

    async fn reload(&self) -> Result<()> {
        self.failures.check("reload").await?;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Volume manager over a real directory with failure injection.
#[derive(Debug)]
pub struct MockVolumes {
    root: PathBuf,
    failures: Failures,
}

impl MockVolumes {
    /// Create volumes under `root` (usually a temp dir).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            failures: Failures::default(),
        }
    }

    /// Make `op` fail until cleared.
    pub async fn fail_on(&self, op: &str) {
        self.failures.set(op).await;
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failures.clear().await;
    }
}

#[async_trait]
impl VolumeManager for MockVolumes {
    fn volume_path(&self, app_id: &str) -> PathBuf {
        self.root.join(app_id).join("data")
    }

    async fn create_volume(&self, app_id: &str) -> Result<PathBuf> {
        self.failures.check("create_volume").await?;
        let path = self.volume_path(app_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn delete_volume(&self, app_id: &str) -> Result<()> {
        self.failures.check("delete_volume").await?;
        match tokio::fs::remove_dir_all(self.root.join(app_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn volume_exists(&self, app_id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.volume_path(app_id)).await?)
    }
}

/// Mock health probe.
#[derive(Debug)]
pub struct MockHealthProbe {
    healthy: AtomicBool,
    probes: AtomicU32,
    healthy_after: u32,
}

impl Default for MockHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHealthProbe {
    /// A probe that is healthy on the first attempt.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            probes: AtomicU32::new(0),
            healthy_after: 0,
        }
    }

    /// A probe that reports unhealthy for the first `attempts` probes.
    pub fn healthy_after(attempts: u32) -> Self {
        Self {
            healthy_after: attempts,
            ..Self::new()
        }
    }

    /// Make the app (un)healthy.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of probes made.
    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn probe(&self, _port: u16, _path: &str) -> Result<bool> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst) && n >= self.healthy_after)
    }
}
