// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Apps
//!
//! The public orchestrator API. Requests are validated and recorded synchronously; the
//! pipeline itself runs in the background under the app's task lease. Callers poll
//! [`Apps::get_app`] for progress.
//!
//! Validation and conflict errors (`BAD_MANIFEST`, `BAD_REQUEST`, `CONFLICT`, `LOCKED`) are
//! returned before any external resource is touched.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::addons::AddonManager;
use crate::app::{AccessRestriction, App, InstallationState, OldConfig, PortBindings, RunState};
use crate::app_registry::{AppPatch, AppRegistry, NewAppFields};
use crate::apptask::{AppTask, Pipeline};
use crate::certificates::CertificatePem;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mailer::{Mailer, Notification};
use crate::manifest::Manifest;
use crate::ports::{PortAllocator, is_reserved};
use crate::provision::ContainerRuntime;
use crate::task_manager::{TaskLease, TaskManager};

const HOSTNAME_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";

/// Subdomains that can never be used by apps, besides the admin location.
pub const RESERVED_LOCATIONS: &[&str] = &["api"];

/// Lowest host port an app may bind.
pub const MIN_BINDABLE_PORT: u16 = 1024;

/// Request to install an app.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    /// App id; a fresh UUID when `None`
    pub app_id: Option<String>,
    /// Catalog reference
    pub app_store_id: Option<String>,
    /// App manifest
    pub manifest: Manifest,
    /// Subdomain (empty for the bare domain)
    pub location: String,
    /// Host ports for manifest TCP ports
    pub port_bindings: PortBindings,
    /// Authorized users, `None` = public
    pub access_restriction: Option<AccessRestriction>,
    /// Memory limit in bytes (0 = manifest default)
    pub memory_limit: i64,
}

/// Request to reconfigure an installed app. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigureRequest {
    /// New subdomain
    pub location: Option<String>,
    /// New port bindings
    pub port_bindings: Option<PortBindings>,
    /// New access restriction
    pub access_restriction: Option<Option<AccessRestriction>>,
    /// New memory limit
    pub memory_limit: Option<i64>,
    /// Custom certificate (PEM), requires `key`
    pub cert: Option<String>,
    /// Custom certificate key (PEM), requires `cert`
    pub key: Option<String>,
}

/// Check that `location` is a valid, unreserved subdomain.
pub fn validate_location(location: &str, config: &Config) -> Result<()> {
    if location.is_empty() {
        return Ok(());
    }
    if location == config.admin_location || RESERVED_LOCATIONS.contains(&location) {
        return Err(Error::InvalidRequest(format!("{} is reserved", location)));
    }
    let pattern = Regex::new(HOSTNAME_PATTERN).map_err(|e| Error::Other(e.to_string()))?;
    if !pattern.is_match(location) {
        return Err(Error::InvalidRequest(
            "Hostname can only contain alphanumerics and hyphen".to_string(),
        ));
    }
    Ok(())
}

/// Check that every binding names a manifest TCP port and uses an allowed host port.
pub fn validate_port_bindings(bindings: &PortBindings, manifest: &Manifest) -> Result<()> {
    for (name, port) in bindings {
        if !manifest.tcp_ports.contains_key(name) {
            return Err(Error::InvalidRequest(format!(
                "Invalid portBindings {}: not declared in tcpPorts",
                name
            )));
        }
        if *port < MIN_BINDABLE_PORT || is_reserved(*port) {
            return Err(Error::InvalidRequest(format!(
                "Invalid portBindings {}: port {} is not available",
                name, port
            )));
        }
    }
    Ok(())
}

/// Check the access restriction against the manifest.
pub fn validate_access_restriction(
    restriction: Option<&AccessRestriction>,
    manifest: &Manifest,
) -> Result<()> {
    if manifest.single_user && restriction.is_none_or(|r| r.users.len() != 1) {
        return Err(Error::InvalidRequest(
            "accessRestriction must specify one user".to_string(),
        ));
    }
    Ok(())
}

fn validate_memory_limit(limit: i64) -> Result<()> {
    if limit < 0 {
        return Err(Error::InvalidRequest(
            "memoryLimit must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// The configuration to tear down after a configure of `app`.
///
/// A retry from `error` keeps the configuration the app had before the failed run, since its
/// resources may not have been removed yet. The location the failed run moved to is kept as
/// well because its DNS record may already exist.
fn retained_old_config(app: &App) -> OldConfig {
    match &app.old_config {
        Some(old) if app.installation_state == InstallationState::Error => {
            let mut old = old.clone();
            if app.location != old.location && !old.abandoned_locations.contains(&app.location) {
                old.abandoned_locations.push(app.location.clone());
            }
            old
        }
        _ => OldConfig {
            location: app.location.clone(),
            port_bindings: app.port_bindings.clone(),
            manifest: app.manifest.clone(),
            abandoned_locations: Vec::new(),
        },
    }
}

fn require_state(app: &App, accepted: &[InstallationState], expected: &'static str) -> Result<()> {
    if accepted.contains(&app.installation_state) {
        Ok(())
    } else {
        Err(Error::InvalidState {
            app_id: app.id.clone(),
            state: app.installation_state.to_string(),
            expected,
        })
    }
}

/// The app orchestrator.
#[derive(Clone)]
pub struct Apps {
    config: Arc<Config>,
    registry: AppRegistry,
    ports: PortAllocator,
    tasks: TaskManager,
    task: AppTask,
    addons: AddonManager,
    runtime: Arc<dyn ContainerRuntime>,
    mailer: Arc<dyn Mailer>,
}

impl Apps {
    /// Create the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: AppRegistry,
        ports: PortAllocator,
        tasks: TaskManager,
        task: AppTask,
        addons: AddonManager,
        runtime: Arc<dyn ContainerRuntime>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            config,
            registry,
            ports,
            tasks,
            task,
            addons,
            runtime,
            mailer,
        }
    }

    /// The app record store.
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// The per-app task manager.
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    fn spawn(&self, lease: TaskLease, pipeline: Pipeline) {
        let task = self.task.clone();
        let app_id = lease.app_id().to_string();
        self.tasks.spawn(lease, async move {
            if let Err(e) = task.run(&app_id, pipeline).await {
                debug!(app_id = %app_id, pipeline = %pipeline, error = %e, "Pipeline ended with error");
            }
        });
    }

    async fn check_location_free(&self, app_id: &str, location: &str) -> Result<()> {
        let taken = self
            .registry
            .all()
            .await?
            .into_iter()
            .any(|a| a.id != app_id && a.location == location);
        if taken {
            return Err(Error::Conflict(format!(
                "location '{}' is already in use",
                location
            )));
        }
        Ok(())
    }

    /// Install an app. Returns the record in `pending_install`; the pipeline runs in the
    /// background.
    pub async fn install(&self, request: InstallRequest) -> Result<App> {
        validate_location(&request.location, &self.config)?;
        validate_port_bindings(&request.port_bindings, &request.manifest)?;
        validate_access_restriction(request.access_restriction.as_ref(), &request.manifest)?;
        validate_memory_limit(request.memory_limit)?;
        request.manifest.verify(&self.config.box_version)?;

        let app_id = request
            .app_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lease = self.tasks.try_acquire(&app_id)?;

        let app = {
            let _section = self.ports.critical_section().await;
            self.check_location_free(&app_id, &request.location).await?;
            self.ports
                .check_bindings(&app_id, &request.port_bindings)
                .await?;
            self.registry
                .add(
                    &app_id,
                    request.app_store_id.as_deref(),
                    &request.manifest,
                    &request.location,
                    &request.port_bindings,
                    NewAppFields {
                        access_restriction: request.access_restriction.clone(),
                        installation_state: InstallationState::PendingInstall,
                        memory_limit: request.memory_limit,
                    },
                )
                .await?
        };

        info!(app_id = %app_id, location = %app.location, "Installing app");
        self.spawn(lease, Pipeline::Install);
        Ok(app)
    }

    /// Uninstall an app. Accepted in any state that has no running pipeline.
    pub async fn uninstall(&self, app_id: &str) -> Result<App> {
        let lease = self.tasks.try_acquire(app_id)?;
        self.registry.get(app_id).await?;

        let app = self
            .registry
            .update(
                app_id,
                AppPatch {
                    installation_state: Some(InstallationState::PendingUninstall),
                    installation_progress: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!(app_id = %app_id, "Uninstalling app");
        self.spawn(lease, Pipeline::Uninstall);
        Ok(app)
    }

    /// Reconfigure an app (location, ports, access, memory, certificate). Accepted while
    /// `installed` or `error`; the container is always recreated.
    pub async fn configure(&self, app_id: &str, request: ConfigureRequest) -> Result<App> {
        let cert = CertificatePem::validate(request.cert.as_deref(), request.key.as_deref())?;

        let lease = self.tasks.try_acquire(app_id)?;
        let app = self.registry.get(app_id).await?;
        require_state(
            &app,
            &[InstallationState::Installed, InstallationState::Error],
            "installed or error",
        )?;

        let location = request.location.unwrap_or_else(|| app.location.clone());
        let port_bindings = request
            .port_bindings
            .unwrap_or_else(|| app.port_bindings.clone());
        let access_restriction = request
            .access_restriction
            .unwrap_or_else(|| app.access_restriction.clone());
        let memory_limit = request.memory_limit.unwrap_or(app.memory_limit);

        validate_location(&location, &self.config)?;
        validate_port_bindings(&port_bindings, &app.manifest)?;
        validate_access_restriction(access_restriction.as_ref(), &app.manifest)?;
        validate_memory_limit(memory_limit)?;

        let old_config = retained_old_config(&app);

        let updated = {
            let _section = self.ports.critical_section().await;
            self.check_location_free(app_id, &location).await?;
            self.ports.check_bindings(app_id, &port_bindings).await?;
            self.registry
                .update(
                    app_id,
                    AppPatch {
                        old_config: Some(Some(old_config)),
                        location: Some(location.clone()),
                        port_bindings: Some(port_bindings),
                        access_restriction: Some(access_restriction),
                        memory_limit: Some(memory_limit),
                        installation_state: Some(InstallationState::PendingConfigure),
                        installation_progress: Some(None),
                        ..Default::default()
                    },
                )
                .await?
        };

        if let Some(pem) = cert {
            self.task
                .certificates()
                .install(&self.config.app_fqdn(&location), &pem)
                .await?;
        }

        info!(app_id = %app_id, location = %location, "Configuring app");
        self.spawn(lease, Pipeline::Configure);
        Ok(updated)
    }

    /// Move an installed app to `manifest`. Port bindings for ports the new manifest no
    /// longer declares are dropped.
    pub async fn update(&self, app_id: &str, manifest: Manifest) -> Result<App> {
        manifest.verify(&self.config.box_version)?;

        let lease = self.tasks.try_acquire(app_id)?;
        let app = self.registry.get(app_id).await?;
        require_state(&app, &[InstallationState::Installed], "installed")?;

        if manifest.id != app.manifest.id {
            return Err(Error::BadManifest(format!(
                "manifest id '{}' does not match installed '{}'",
                manifest.id, app.manifest.id
            )));
        }

        let port_bindings: PortBindings = app
            .port_bindings
            .iter()
            .filter(|(name, _)| manifest.tcp_ports.contains_key(*name))
            .map(|(name, port)| (name.clone(), *port))
            .collect();

        let updated = self
            .registry
            .update(
                app_id,
                AppPatch {
                    old_config: Some(Some(OldConfig {
                        location: app.location.clone(),
                        port_bindings: app.port_bindings.clone(),
                        manifest: app.manifest.clone(),
                        abandoned_locations: Vec::new(),
                    })),
                    manifest: Some(manifest),
                    port_bindings: Some(port_bindings),
                    installation_state: Some(InstallationState::PendingUpdate),
                    installation_progress: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            app_id = %app_id,
            from = %app.manifest.version,
            to = %updated.manifest.version,
            "Updating app"
        );
        self.spawn(lease, Pipeline::Update);
        Ok(updated)
    }

    /// Start an installed app.
    pub async fn start(&self, app_id: &str) -> Result<()> {
        let lease = self.tasks.try_acquire(app_id)?;
        let app = self.registry.get(app_id).await?;
        require_state(&app, &[InstallationState::Installed], "installed")?;

        info!(app_id = %app_id, "Starting app");
        self.spawn(lease, Pipeline::Start);
        Ok(())
    }

    /// Stop an installed app.
    pub async fn stop(&self, app_id: &str) -> Result<()> {
        let lease = self.tasks.try_acquire(app_id)?;
        let app = self.registry.get(app_id).await?;
        require_state(&app, &[InstallationState::Installed], "installed")?;

        info!(app_id = %app_id, "Stopping app");
        self.spawn(lease, Pipeline::Stop);
        Ok(())
    }

    /// Get an app.
    pub async fn get_app(&self, app_id: &str) -> Result<App> {
        self.registry.get(app_id).await
    }

    /// All apps.
    pub async fn list_apps(&self) -> Result<Vec<App>> {
        self.registry.all().await
    }

    /// Mailbox of an app.
    pub async fn mailbox(&self, app_id: &str) -> Result<Option<String>> {
        self.registry.get(app_id).await?;
        self.addons.mailbox(app_id).await
    }

    /// Rename the mailbox of an app. Applied to the container by the next configure.
    pub async fn set_mailbox(&self, app_id: &str, name: &str) -> Result<()> {
        self.registry.get(app_id).await?;
        self.addons.set_mailbox(app_id, name).await
    }

    /// Decide whether an LDAP bind from container address `ip` for `user_id` is allowed.
    ///
    /// Callers that do not map to an app are denied.
    pub async fn authorize_ldap_caller(&self, ip: &str, user_id: &str) -> Result<bool> {
        let app = match self.registry.get_by_ip_address(ip).await {
            Ok(app) => app,
            Err(Error::NotFound(_)) => {
                warn!(ip = %ip, "LDAP bind from unknown address denied");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let allowed = app
            .access_restriction
            .as_ref()
            .is_none_or(|restriction| restriction.allows(user_id));
        debug!(app_id = %app.id, user_id = %user_id, allowed, "LDAP caller check");
        Ok(allowed)
    }

    /// Renew provider certificates of installed apps. Returns the number renewed; failures
    /// are logged per app.
    pub async fn renew_certificates(&self) -> Result<usize> {
        let mut renewed = 0;
        for app in self.registry.all().await? {
            if app.installation_state != InstallationState::Installed {
                continue;
            }
            let Ok(_lease) = self.tasks.try_acquire(&app.id) else {
                debug!(app_id = %app.id, "App is busy, renewing its certificate later");
                continue;
            };
            match self.task.renew_certificate(&app).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => warn!(app_id = %app.id, error = %e, "Failed to renew certificate"),
            }
        }
        Ok(renewed)
    }

    /// Reconcile apps with reality.
    ///
    /// Resumes pipelines that were requested or interrupted (e.g. by a restart) and restarts
    /// installed apps whose container is no longer running. Apps with a running pipeline are
    /// skipped. Returns the number of pipelines started.
    pub async fn sync(&self) -> Result<usize> {
        let mut started = 0;

        for app in self.registry.all().await? {
            let Ok(lease) = self.tasks.try_acquire(&app.id) else {
                continue;
            };

            if let Some(pipeline) = Pipeline::for_state(app.installation_state) {
                info!(app_id = %app.id, state = %app.installation_state, "Resuming pipeline");
                self.spawn(lease, pipeline);
                started += 1;
                continue;
            }

            if app.installation_state != InstallationState::Installed
                || app.run_state != RunState::Running
            {
                continue;
            }

            let container = match &app.container_id {
                Some(id) => match self.runtime.inspect_container(id).await {
                    Ok(container) => container,
                    Err(e) => {
                        warn!(app_id = %app.id, error = %e, "Failed to inspect app container");
                        continue;
                    }
                },
                None => None,
            };
            let pipeline = match container {
                Some(info) if info.running => continue,
                Some(_) => Pipeline::Start,
                None => {
                    let patch = AppPatch {
                        installation_state: Some(InstallationState::PendingConfigure),
                        installation_progress: Some(None),
                        ..Default::default()
                    };
                    if let Err(e) = self.registry.update(&app.id, patch).await {
                        warn!(app_id = %app.id, error = %e, "Failed to schedule container rebuild");
                        continue;
                    }
                    Pipeline::Configure
                }
            };

            warn!(app_id = %app.id, pipeline = %pipeline, "App container is not running");
            if let Err(e) = self
                .mailer
                .send(
                    &self.config.admin_email,
                    Notification::AppRestarted {
                        app_id: app.id.clone(),
                        location: app.location.clone(),
                    },
                )
                .await
            {
                warn!(app_id = %app.id, error = %e, "Failed to send notification");
            }
            self.spawn(lease, pipeline);
            started += 1;
        }

        Ok(started)
    }
}
