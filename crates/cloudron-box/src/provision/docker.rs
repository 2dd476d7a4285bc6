// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker container runtime driven through the `docker` CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, Mount, PortMapping, ProvisionError, Result,
};

/// Container runtime backed by the docker CLI.
pub struct DockerCli {
    binary: String,
    network: Option<String>,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Use `docker` from `PATH` on the default bridge network.
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            network: None,
        }
    }

    /// Docker CLI attached to the network configured for the box.
    pub fn from_config(config: &Config) -> Self {
        match &config.docker_network {
            Some(network) => Self::new().with_network(network.clone()),
            None => Self::new(),
        }
    }

    /// Attach app containers to a named network.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Run docker with `args`, returning stdout on success.
    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.binary).args(args).output().await?;

        if !output.status.success() {
            return Err(ProvisionError::Command {
                command: format!(
                    "{} {}",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or_default()
                ),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn build_create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.hostname.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
        ];

        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        if spec.memory_limit > 0 {
            args.push("--memory".to_string());
            args.push(spec.memory_limit.to_string());
        }

        for (name, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", name, value));
        }

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(format!(
                "{}:{}:{}/tcp",
                port.host_ip, port.host_port, port.container_port
            ));
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push(volume);
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args
    }
}

fn is_missing(err: &ProvisionError) -> bool {
    matches!(err, ProvisionError::Command { stderr, .. }
        if stderr.contains("No such") || stderr.contains("not found"))
}

/// Parse one element of `docker inspect` output.
fn parse_inspect(value: &Value) -> Option<ContainerInfo> {
    let id = value.get("Id")?.as_str()?.to_string();
    let name = value
        .get("Name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let image = value
        .pointer("/Config/Image")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let running = value
        .pointer("/State/Running")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let ip_address = value
        .pointer("/NetworkSettings/IPAddress")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            value
                .pointer("/NetworkSettings/Networks")
                .and_then(Value::as_object)
                .and_then(|networks| {
                    networks.values().find_map(|n| {
                        n.get("IPAddress")
                            .and_then(Value::as_str)
                            .filter(|ip| !ip.is_empty())
                            .map(str::to_string)
                    })
                })
        });

    let mut ports = Vec::new();
    if let Some(bindings) = value
        .pointer("/HostConfig/PortBindings")
        .and_then(Value::as_object)
    {
        for (container_port, hosts) in bindings {
            let Some(container_port) = container_port
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            for host in hosts.as_array().into_iter().flatten() {
                let host_port = host
                    .get("HostPort")
                    .and_then(Value::as_str)
                    .and_then(|p| p.parse::<u16>().ok());
                if let Some(host_port) = host_port {
                    ports.push(PortMapping {
                        host_ip: host
                            .get("HostIp")
                            .and_then(Value::as_str)
                            .unwrap_or("0.0.0.0")
                            .to_string(),
                        host_port,
                        container_port,
                    });
                }
            }
        }
    }

    let mounts = value
        .get("Mounts")
        .and_then(Value::as_array)
        .map(|mounts| {
            mounts
                .iter()
                .filter_map(|m| {
                    Some(Mount {
                        host_path: PathBuf::from(m.get("Source")?.as_str()?),
                        container_path: m.get("Destination")?.as_str()?.to_string(),
                        read_only: !m.get("RW").and_then(Value::as_bool).unwrap_or(true),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ContainerInfo {
        id,
        name,
        image,
        running,
        ip_address,
        ports,
        mounts,
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self
            .run(&["image".into(), "inspect".into(), image.into()])
            .await
            .is_ok()
        {
            debug!(image = %image, "Image already present");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        self.run(&["pull".into(), image.into()]).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        match self.run(&["rmi".into(), image.into()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn image_in_use(&self, image: &str) -> Result<bool> {
        let out = self
            .run(&[
                "ps".into(),
                "--all".into(),
                "--quiet".into(),
                "--filter".into(),
                format!("ancestor={}", image),
            ])
            .await?;
        Ok(!out.is_empty())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.run(&self.build_create_args(spec)).await?;
        info!(container_id = %id, name = %spec.name, image = %spec.image, "Created container");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(&["start".into(), id.into()]).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.run(&["stop".into(), id.into()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        match self
            .run(&["rm".into(), "--force".into(), "--volumes".into(), id.into()])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let out = match self
            .run(&["container".into(), "inspect".into(), id.into()])
            .await
        {
            Ok(out) => out,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        let parsed: Value = serde_json::from_str(&out)?;
        Ok(parsed
            .as_array()
            .and_then(|items| items.first())
            .and_then(parse_inspect))
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<String> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(command.iter().cloned());
        self.run(&args).await
    }
}
