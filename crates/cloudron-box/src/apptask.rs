// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App task executor.
//!
//! Every lifecycle operation is a [`Pipeline`]: a fixed, ordered list of [`Step`]s. The
//! executor persists `installation_progress` before each step, so a run interrupted by a
//! restart resumes at the step it was in. Every step is idempotent: it checks whether its
//! work is already done (port held, record matching, container present) before acting.
//!
//! A failing step halts the pipeline and moves the app to `error` with the step and cause
//! recorded. Nothing is rolled back; uninstall tolerates missing resources.
//!
//! The executor assumes the caller holds the app's task lease.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::addons::AddonManager;
use crate::app::{App, InstallationState, RunState};
use crate::app_registry::{AppPatch, AppRegistry};
use crate::certificates::{CertificatePaths, CertificateProvider, CertificateStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::provision::{
    ContainerRuntime, ContainerSpec, DnsProvider, HealthProbe, Mount, PortMapping, ReverseProxy,
    VirtualHost, VolumeManager,
};

/// Lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    /// Provision everything and start the app
    Install,
    /// Recreate DNS, vhost and container after a location/port/cert/access change
    Configure,
    /// Move to a new manifest
    Update,
    /// Tear everything down and delete the record
    Uninstall,
    /// Start the stopped container
    Start,
    /// Stop the container
    Stop,
}

impl Pipeline {
    /// Steps of this pipeline, in execution order.
    pub fn steps(&self) -> &'static [Step] {
        use Step::*;
        match self {
            Pipeline::Install => &[
                VerifyManifest,
                ReserveHttpPort,
                CreateVolume,
                RegisterDns,
                SetupAddons,
                PullImage,
                CreateContainer,
                ConfigureProxy,
                StartContainer,
                WaitHealthy,
            ],
            Pipeline::Configure => &[
                VerifyManifest,
                RemoveContainer,
                UnregisterOldDns,
                ReserveHttpPort,
                CreateVolume,
                RegisterDns,
                SetupAddons,
                PullImage,
                CreateContainer,
                ConfigureProxy,
                StartContainer,
                WaitHealthy,
            ],
            Pipeline::Update => &[
                VerifyManifest,
                RemoveContainer,
                ReserveHttpPort,
                SetupAddons,
                TeardownUnusedAddons,
                PullImage,
                CreateContainer,
                RemoveOldImage,
                StartContainer,
                WaitHealthy,
            ],
            Pipeline::Uninstall => &[
                StopContainer,
                RemoveContainer,
                RemoveImage,
                DeleteVolume,
                UnregisterDns,
                RemoveProxyConfig,
                TeardownAddons,
                DeleteRecord,
            ],
            Pipeline::Start => &[StartContainer],
            Pipeline::Stop => &[StopContainer],
        }
    }

    /// Pipeline that drives an app out of `state`, if any.
    pub fn for_state(state: InstallationState) -> Option<Self> {
        match state {
            InstallationState::PendingInstall | InstallationState::Installing => {
                Some(Pipeline::Install)
            }
            InstallationState::PendingConfigure | InstallationState::Configuring => {
                Some(Pipeline::Configure)
            }
            InstallationState::PendingUpdate | InstallationState::Updating => {
                Some(Pipeline::Update)
            }
            InstallationState::PendingUninstall | InstallationState::Uninstalling => {
                Some(Pipeline::Uninstall)
            }
            InstallationState::Installed | InstallationState::Error => None,
        }
    }

    /// Whether the pipeline moves the installation state (start/stop only touch run state).
    pub fn changes_installation_state(&self) -> bool {
        !matches!(self, Pipeline::Start | Pipeline::Stop)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pipeline::Install => "install",
            Pipeline::Configure => "configure",
            Pipeline::Update => "update",
            Pipeline::Uninstall => "uninstall",
            Pipeline::Start => "start",
            Pipeline::Stop => "stop",
        })
    }
}

/// A single idempotent pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Check manifest completeness and box version bounds
    VerifyManifest,
    /// Reserve the host HTTP port
    ReserveHttpPort,
    /// Create the data volume
    CreateVolume,
    /// Point the app subdomain at the box
    RegisterDns,
    /// Remove the record of a previous location
    UnregisterOldDns,
    /// Provision declared addons
    SetupAddons,
    /// Remove addons the manifest no longer declares
    TeardownUnusedAddons,
    /// Pull the app image
    PullImage,
    /// Create the app container
    CreateContainer,
    /// Write the vhost and reload the proxy
    ConfigureProxy,
    /// Start the app container
    StartContainer,
    /// Poll the health check path
    WaitHealthy,
    /// Stop the app container
    StopContainer,
    /// Remove the app container
    RemoveContainer,
    /// Remove the app image unless another container uses it
    RemoveImage,
    /// Remove the previous image after an update
    RemoveOldImage,
    /// Delete the data volume
    DeleteVolume,
    /// Remove the subdomain record
    UnregisterDns,
    /// Remove the vhost and custom certificate
    RemoveProxyConfig,
    /// Remove every addon
    TeardownAddons,
    /// Delete the app record
    DeleteRecord,
}

impl Step {
    const ALL: [Step; 21] = [
        Step::VerifyManifest,
        Step::ReserveHttpPort,
        Step::CreateVolume,
        Step::RegisterDns,
        Step::UnregisterOldDns,
        Step::SetupAddons,
        Step::TeardownUnusedAddons,
        Step::PullImage,
        Step::CreateContainer,
        Step::ConfigureProxy,
        Step::StartContainer,
        Step::WaitHealthy,
        Step::StopContainer,
        Step::RemoveContainer,
        Step::RemoveImage,
        Step::RemoveOldImage,
        Step::DeleteVolume,
        Step::UnregisterDns,
        Step::RemoveProxyConfig,
        Step::TeardownAddons,
        Step::DeleteRecord,
    ];

    /// Stable name stored in `installation_progress`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::VerifyManifest => "verify_manifest",
            Step::ReserveHttpPort => "reserve_http_port",
            Step::CreateVolume => "create_volume",
            Step::RegisterDns => "register_dns",
            Step::UnregisterOldDns => "unregister_old_dns",
            Step::SetupAddons => "setup_addons",
            Step::TeardownUnusedAddons => "teardown_unused_addons",
            Step::PullImage => "pull_image",
            Step::CreateContainer => "create_container",
            Step::ConfigureProxy => "configure_proxy",
            Step::StartContainer => "start_container",
            Step::WaitHealthy => "wait_healthy",
            Step::StopContainer => "stop_container",
            Step::RemoveContainer => "remove_container",
            Step::RemoveImage => "remove_image",
            Step::RemoveOldImage => "remove_old_image",
            Step::DeleteVolume => "delete_volume",
            Step::UnregisterDns => "unregister_dns",
            Step::RemoveProxyConfig => "remove_proxy_config",
            Step::TeardownAddons => "teardown_addons",
            Step::DeleteRecord => "delete_record",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Step::ALL
            .iter()
            .find(|step| step.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown step: {}", s))
    }
}

/// Format the progress value persisted before `step`.
pub fn progress(pipeline: Pipeline, index: usize, step: Step) -> String {
    let total = pipeline.steps().len() + 1;
    format!("{}, {}", (index + 1) * 100 / total, step)
}

/// Step recorded in a progress value.
pub fn progress_step(progress: &str) -> Option<Step> {
    progress.split_once(", ")?.1.parse().ok()
}

/// Collaborators used by the executor.
#[derive(Clone)]
pub struct AppTask {
    config: Arc<Config>,
    registry: AppRegistry,
    ports: PortAllocator,
    runtime: Arc<dyn ContainerRuntime>,
    dns: Arc<dyn DnsProvider>,
    proxy: Arc<dyn ReverseProxy>,
    volumes: Arc<dyn VolumeManager>,
    health: Arc<dyn HealthProbe>,
    addons: AddonManager,
    certs: CertificateStore,
    cert_provider: Arc<dyn CertificateProvider>,
}

/// Builder input for [`AppTask`].
pub struct Provisioners {
    /// Container runtime
    pub runtime: Arc<dyn ContainerRuntime>,
    /// DNS provider
    pub dns: Arc<dyn DnsProvider>,
    /// Reverse proxy
    pub proxy: Arc<dyn ReverseProxy>,
    /// Data volumes
    pub volumes: Arc<dyn VolumeManager>,
    /// Health probe
    pub health: Arc<dyn HealthProbe>,
    /// Certificate provider for apps without a custom certificate
    pub cert_provider: Arc<dyn CertificateProvider>,
}

impl AppTask {
    /// Create an executor.
    pub fn new(
        config: Arc<Config>,
        registry: AppRegistry,
        ports: PortAllocator,
        addons: AddonManager,
        provisioners: Provisioners,
    ) -> Self {
        let certs = CertificateStore::new(config.certs_dir());
        Self {
            config,
            registry,
            ports,
            runtime: provisioners.runtime,
            dns: provisioners.dns,
            proxy: provisioners.proxy,
            volumes: provisioners.volumes,
            health: provisioners.health,
            addons,
            certs,
            cert_provider: provisioners.cert_provider,
        }
    }

    /// Custom certificate storage.
    pub fn certificates(&self) -> &CertificateStore {
        &self.certs
    }

    /// Run `pipeline` for `app_id` to completion.
    ///
    /// Resumes at the step recorded in `installation_progress` when the app is already in the
    /// pipeline's running state.
    pub async fn run(&self, app_id: &str, pipeline: Pipeline) -> Result<()> {
        let mut app = self.registry.get(app_id).await?;
        let steps = pipeline.steps();

        let resume_at = match (&app.installation_progress, pipeline.changes_installation_state()) {
            (Some(progress), true) if app.installation_state == app.installation_state.running() => {
                progress_step(progress)
                    .and_then(|step| steps.iter().position(|s| *s == step))
                    .unwrap_or(0)
            }
            _ => 0,
        };

        if pipeline.changes_installation_state() {
            app = self
                .registry
                .update(app_id, AppPatch::state(app.installation_state.running()))
                .await?;
        }

        info!(
            app_id = %app_id,
            pipeline = %pipeline,
            resume_at = %steps.get(resume_at).map(Step::as_str).unwrap_or_default(),
            "Running pipeline"
        );

        for (index, step) in steps.iter().enumerate().skip(resume_at) {
            app = self
                .registry
                .update(
                    app_id,
                    AppPatch {
                        installation_progress: Some(Some(progress(pipeline, index, *step))),
                        ..Default::default()
                    },
                )
                .await?;

            debug!(app_id = %app_id, step = %step, "Running step");

            if let Err(e) = self.run_step(*step, &mut app).await {
                self.fail(pipeline, app_id, *step, &e).await;
                return Err(e);
            }
        }

        self.finish(pipeline, app_id).await
    }

    async fn finish(&self, pipeline: Pipeline, app_id: &str) -> Result<()> {
        let patch = match pipeline {
            Pipeline::Install | Pipeline::Configure | Pipeline::Update => AppPatch {
                installation_state: Some(InstallationState::Installed),
                installation_progress: Some(None),
                old_config: Some(None),
                last_error: Some(None),
                ..Default::default()
            },
            Pipeline::Start | Pipeline::Stop => AppPatch {
                installation_progress: Some(None),
                last_error: Some(None),
                ..Default::default()
            },
            Pipeline::Uninstall => {
                info!(app_id = %app_id, "Uninstalled app");
                return Ok(());
            }
        };

        self.registry.update(app_id, patch).await?;
        info!(app_id = %app_id, pipeline = %pipeline, "Pipeline completed");
        Ok(())
    }

    async fn fail(&self, pipeline: Pipeline, app_id: &str, step: Step, err: &Error) {
        error!(
            app_id = %app_id,
            pipeline = %pipeline,
            step = %step,
            kind = %err.kind(),
            error = %err,
            "Pipeline failed"
        );

        let last_error = Some(Some(format!("{}: {}", step, err)));
        let patch = if pipeline.changes_installation_state() {
            AppPatch {
                installation_state: Some(InstallationState::Error),
                last_error,
                ..Default::default()
            }
        } else {
            AppPatch {
                run_state: Some(RunState::Unknown),
                installation_progress: Some(None),
                last_error,
                ..Default::default()
            }
        };

        if let Err(e) = self.registry.update(app_id, patch).await {
            error!(app_id = %app_id, error = %e, "Failed to record pipeline failure");
        }
    }

    async fn run_step(&self, step: Step, app: &mut App) -> Result<()> {
        match step {
            Step::VerifyManifest => app.manifest.verify(&self.config.box_version),
            Step::ReserveHttpPort => {
                let port = self.ports.allocate_http_port(&app.id).await?;
                app.http_port = Some(port);
                Ok(())
            }
            Step::CreateVolume => {
                self.volumes.create_volume(&app.id).await?;
                Ok(())
            }
            Step::RegisterDns => self.register_dns(app).await,
            Step::UnregisterOldDns => self.unregister_old_dns(app).await,
            Step::SetupAddons => self.addons.setup(app).await,
            Step::TeardownUnusedAddons => self.addons.teardown_unused(app).await,
            Step::PullImage => Ok(self.runtime.pull_image(&app.manifest.docker_image).await?),
            Step::CreateContainer => self.create_container(app).await,
            Step::ConfigureProxy => self.configure_proxy(app).await,
            Step::StartContainer => self.start_container(app).await,
            Step::WaitHealthy => self.wait_healthy(app).await,
            Step::StopContainer => self.stop_container(app).await,
            Step::RemoveContainer => self.remove_container(app).await,
            Step::RemoveImage => self.remove_image_if_unused(&app.manifest.docker_image).await,
            Step::RemoveOldImage => match &app.old_config {
                Some(old) if old.manifest.docker_image != app.manifest.docker_image => {
                    self.remove_image_if_unused(&old.manifest.docker_image).await
                }
                _ => Ok(()),
            },
            Step::DeleteVolume => Ok(self.volumes.delete_volume(&app.id).await?),
            Step::UnregisterDns => self.unregister_dns(app).await,
            Step::RemoveProxyConfig => {
                if self.proxy.has_vhost(&app.id).await? {
                    self.proxy.remove_vhost(&app.id).await?;
                    self.proxy.reload().await?;
                }
                self.ports.release_http_port(&app.id).await?;
                self.certs
                    .remove(&self.config.app_fqdn(&app.location))
                    .await
            }
            Step::TeardownAddons => self.addons.teardown(app).await,
            Step::DeleteRecord => self.registry.del(&app.id).await,
        }
    }

    async fn register_dns(&self, app: &mut App) -> Result<()> {
        let fqdn = self.config.app_fqdn(&app.location);
        let existing = self.dns.get_record(&fqdn, "A").await?;

        let record_id = match existing {
            Some(record) if record.value == self.config.public_ip => {
                debug!(app_id = %app.id, fqdn = %fqdn, "DNS record already registered");
                record.id
            }
            _ => {
                self.dns
                    .upsert_record(&fqdn, "A", &self.config.public_ip)
                    .await?
            }
        };

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    dns_record_id: Some(Some(record_id)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn unregister_old_dns(&self, app: &App) -> Result<()> {
        let Some(old) = &app.old_config else {
            return Ok(());
        };
        for location in old.stale_locations(&app.location) {
            let old_fqdn = self.config.app_fqdn(location);
            self.dns.delete_record(&old_fqdn, "A").await?;
            self.certs.remove(&old_fqdn).await?;
            info!(app_id = %app.id, fqdn = %old_fqdn, "Unregistered previous location");
        }
        Ok(())
    }

    async fn unregister_dns(&self, app: &mut App) -> Result<()> {
        self.dns
            .delete_record(&self.config.app_fqdn(&app.location), "A")
            .await?;
        self.unregister_old_dns(app).await?;

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    dns_record_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Environment of the app container.
    pub async fn container_env(&self, app: &App) -> Result<BTreeMap<String, String>> {
        let fqdn = self.config.app_fqdn(&app.location);
        let mut env = BTreeMap::from([
            ("APP_ORIGIN".to_string(), format!("https://{}", fqdn)),
            ("APP_DOMAIN".to_string(), fqdn),
            ("ADMIN_ORIGIN".to_string(), self.config.admin_origin()),
            ("CLOUDRON".to_string(), "1".to_string()),
        ]);
        for (name, port) in &app.port_bindings {
            env.insert(name.clone(), port.to_string());
        }
        env.extend(self.addons.environment(app).await?);
        Ok(env)
    }

    async fn container_spec(&self, app: &App) -> Result<ContainerSpec> {
        let http_port = app
            .http_port
            .ok_or_else(|| Error::Other(format!("app {} has no HTTP port", app.id)))?;

        let mut ports = vec![PortMapping {
            host_ip: "127.0.0.1".to_string(),
            host_port: http_port,
            container_port: app.manifest.http_port,
        }];
        for (name, host_port) in &app.port_bindings {
            let spec = app.manifest.tcp_ports.get(name).ok_or_else(|| {
                Error::InvalidRequest(format!("Port {} is not declared by the manifest", name))
            })?;
            ports.push(PortMapping {
                host_ip: "0.0.0.0".to_string(),
                host_port: *host_port,
                container_port: spec.container_port,
            });
        }

        Ok(ContainerSpec {
            name: app.container_name(),
            image: app.manifest.docker_image.clone(),
            hostname: self.config.app_fqdn(&app.location),
            env: self.container_env(app).await?,
            ports,
            mounts: vec![Mount {
                host_path: self.volumes.volume_path(&app.id),
                container_path: "/app/data".to_string(),
                read_only: false,
            }],
            memory_limit: app.effective_memory_limit(),
            labels: BTreeMap::from([
                ("appId".to_string(), app.id.clone()),
                ("location".to_string(), app.location.clone()),
            ]),
        })
    }

    async fn create_container(&self, app: &mut App) -> Result<()> {
        if let Some(id) = &app.container_id
            && self.runtime.inspect_container(id).await?.is_some()
        {
            debug!(app_id = %app.id, container_id = %id, "Container already exists");
            return Ok(());
        }

        // a run interrupted between create and persist leaves a named container behind
        let info = match self.runtime.inspect_container(&app.container_name()).await? {
            Some(info) => info,
            None => {
                let spec = self.container_spec(app).await?;
                let id = self.runtime.create_container(&spec).await?;
                self.runtime
                    .inspect_container(&id)
                    .await?
                    .ok_or_else(|| Error::Other(format!("container {} vanished", id)))?
            }
        };

        info!(app_id = %app.id, container_id = %info.id, "Created app container");

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    container_id: Some(Some(info.id)),
                    container_ip: Some(info.ip_address),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn certificate_for(&self, fqdn: &str) -> Result<CertificatePaths> {
        if let Some(paths) = self.certs.get(fqdn).await? {
            return Ok(paths);
        }
        Ok(self.cert_provider.ensure_certificate(fqdn).await?.paths)
    }

    /// Write the vhost of an app and reload the proxy.
    pub async fn configure_proxy(&self, app: &App) -> Result<()> {
        let http_port = app
            .http_port
            .ok_or_else(|| Error::Other(format!("app {} has no HTTP port", app.id)))?;
        let fqdn = self.config.app_fqdn(&app.location);
        let cert = self.certificate_for(&fqdn).await?;

        self.proxy
            .write_vhost(&VirtualHost {
                app_id: app.id.clone(),
                fqdn,
                upstream_port: http_port,
                cert_path: cert.cert_path,
                key_path: cert.key_path,
            })
            .await?;
        self.proxy.reload().await?;
        Ok(())
    }

    /// Renew the provider certificate of an app and reload its vhost when it changed.
    ///
    /// Apps with a custom certificate are left alone. Returns whether the vhost was rewritten.
    pub async fn renew_certificate(&self, app: &App) -> Result<bool> {
        let fqdn = self.config.app_fqdn(&app.location);
        if self.certs.get(&fqdn).await?.is_some() {
            debug!(app_id = %app.id, fqdn = %fqdn, "App uses a custom certificate");
            return Ok(false);
        }

        let issued = self.cert_provider.ensure_certificate(&fqdn).await?;
        if !issued.renewed {
            return Ok(false);
        }

        info!(
            app_id = %app.id,
            fqdn = %fqdn,
            provider = self.cert_provider.provider_type(),
            "Certificate renewed"
        );
        self.configure_proxy(app).await?;
        Ok(true)
    }

    async fn start_container(&self, app: &mut App) -> Result<()> {
        let id = app
            .container_id
            .clone()
            .ok_or_else(|| Error::Other(format!("app {} has no container", app.id)))?;
        self.runtime.start_container(&id).await?;

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    run_state: Some(RunState::Running),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn stop_container(&self, app: &mut App) -> Result<()> {
        if let Some(id) = &app.container_id {
            self.runtime.stop_container(id).await?;
        }

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    run_state: Some(RunState::Stopped),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn wait_healthy(&self, app: &App) -> Result<()> {
        let port = app
            .http_port
            .ok_or_else(|| Error::Other(format!("app {} has no HTTP port", app.id)))?;
        let path = &app.manifest.health_check_path;
        let attempts = self.config.health_check_attempts.max(1);

        for attempt in 1..=attempts {
            match self.health.probe(port, path).await {
                Ok(true) => {
                    info!(app_id = %app.id, attempt, "App is healthy");
                    return Ok(());
                }
                Ok(false) => debug!(app_id = %app.id, attempt, "App not healthy yet"),
                Err(e) => warn!(app_id = %app.id, attempt, error = %e, "Health probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.health_check_interval).await;
            }
        }

        Err(Error::Timeout(format!(
            "app {} not healthy after {} attempts",
            app.id, attempts
        )))
    }

    async fn remove_container(&self, app: &mut App) -> Result<()> {
        if let Some(id) = &app.container_id {
            self.runtime.remove_container(id).await?;
        }
        self.runtime.remove_container(&app.container_name()).await?;

        *app = self
            .registry
            .update(
                &app.id,
                AppPatch {
                    container_id: Some(None),
                    container_ip: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_image_if_unused(&self, image: &str) -> Result<()> {
        if self.runtime.image_in_use(image).await? {
            debug!(image = %image, "Image still in use");
            return Ok(());
        }
        self.runtime.remove_image(image).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipelines_end_where_expected() {
        assert_eq!(Pipeline::Install.steps().first(), Some(&Step::VerifyManifest));
        assert_eq!(Pipeline::Install.steps().last(), Some(&Step::WaitHealthy));
        assert_eq!(Pipeline::Uninstall.steps().last(), Some(&Step::DeleteRecord));

        // configure recreates the container
        let configure = Pipeline::Configure.steps();
        let remove = configure.iter().position(|s| *s == Step::RemoveContainer);
        let create = configure.iter().position(|s| *s == Step::CreateContainer);
        assert!(remove < create);
        assert!(!configure.contains(&Step::DeleteVolume));
    }

    #[test]
    fn test_progress_round_trip() {
        let value = progress(Pipeline::Install, 3, Step::RegisterDns);
        assert_eq!(value, "36, register_dns");
        assert_eq!(progress_step(&value), Some(Step::RegisterDns));
        assert_eq!(progress_step("garbage"), None);
    }

    #[test]
    fn test_pipeline_for_state() {
        assert_eq!(
            Pipeline::for_state(InstallationState::Installing),
            Some(Pipeline::Install)
        );
        assert_eq!(
            Pipeline::for_state(InstallationState::PendingUninstall),
            Some(Pipeline::Uninstall)
        );
        assert_eq!(Pipeline::for_state(InstallationState::Installed), None);
        assert_eq!(Pipeline::for_state(InstallationState::Error), None);
    }

    #[test]
    fn test_step_names_are_unique() {
        for step in Step::ALL {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
        }
    }
}
