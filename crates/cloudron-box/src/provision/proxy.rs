// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! nginx reverse proxy: one vhost file per app.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ProvisionError, Result, ReverseProxy, VirtualHost};

/// Reverse proxy writing nginx vhost files into a directory included by the main config.
pub struct NginxProxy {
    config_dir: PathBuf,
    reload_command: Option<Vec<String>>,
}

impl NginxProxy {
    /// Create a proxy writing to `config_dir`. Without a reload command, `reload` only logs.
    pub fn new(config_dir: impl Into<PathBuf>, reload_command: Option<Vec<String>>) -> Self {
        Self {
            config_dir: config_dir.into(),
            reload_command,
        }
    }

    /// Path of the vhost file for an app.
    pub fn vhost_path(&self, app_id: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", app_id))
    }
}

/// Render the vhost for an app.
pub(crate) fn render_vhost(vhost: &VirtualHost) -> String {
    format!(
        r#"# Generated for app {app_id}
server {{
    listen 443 ssl http2;
    server_name {fqdn};

    ssl_certificate {cert};
    ssl_certificate_key {key};

    client_max_body_size 1m;

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto https;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_read_timeout 3500;
        proxy_connect_timeout 3250;
    }}
}}

server {{
    listen 80;
    server_name {fqdn};
    return 301 https://$host$request_uri;
}}
"#,
        app_id = vhost.app_id,
        fqdn = vhost.fqdn,
        cert = vhost.cert_path.display(),
        key = vhost.key_path.display(),
        port = vhost.upstream_port,
    )
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn write_vhost(&self, vhost: &VirtualHost) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        let path = self.vhost_path(&vhost.app_id);
        fs::write(&path, render_vhost(vhost)).await?;
        info!(app_id = %vhost.app_id, fqdn = %vhost.fqdn, port = vhost.upstream_port, "Wrote vhost");
        Ok(())
    }

    async fn remove_vhost(&self, app_id: &str) -> Result<()> {
        match fs::remove_file(self.vhost_path(app_id)).await {
            Ok(()) => {
                info!(app_id = %app_id, "Removed vhost");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn has_vhost(&self, app_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.vhost_path(app_id)).await?)
    }

    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self.reload_command.as_ref().and_then(|c| c.split_first())
        else {
            debug!("No nginx reload command configured");
            return Ok(());
        };

        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(ProvisionError::Command {
                command: program.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("Reloaded nginx");
        Ok(())
    }
}
