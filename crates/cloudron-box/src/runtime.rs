// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable box runtime.
//!
//! [`BoxRuntime`] wires the orchestrator together and runs the maintenance scheduler.
//! Collaborators default to the real implementations selected by [`Config`] and can be
//! replaced one by one, which is how the integration tests run against mocks.
//!
//! ```rust,ignore
//! use cloudron_box::config::Config;
//! use cloudron_box::runtime::BoxRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = cloudron_box::db::connect(&config.database_path).await?;
//!
//!     let runtime = BoxRuntime::builder()
//!         .config(config)
//!         .pool(pool)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::addons::AddonManager;
use crate::app_registry::AppRegistry;
use crate::apps::Apps;
use crate::apptask::{AppTask, Provisioners};
use crate::backups::BackupManager;
use crate::certificates::{CertificateProvider, FallbackCertificateProvider};
use crate::config::Config;
use crate::heartbeat::Heartbeat;
use crate::mailer::{MailQueue, Mailer};
use crate::ports::PortAllocator;
use crate::provision::{
    CaasDnsProvider, ContainerRuntime, DnsProvider, DockerCli, HealthProbe, HttpHealthProbe,
    LocalVolumes, NginxProxy, NoopDnsProvider, ReverseProxy, VolumeManager,
};
use crate::scheduler::{
    APP_SYNC_PATTERN, BACKUP_PATTERN, CERTIFICATE_RENEWAL_PATTERN, CLEANUP_PATTERN,
    HEARTBEAT_PATTERN, JobDefinition, Scheduler, UPDATE_CHECK_PATTERN, job_action,
};
use crate::settings::Settings;
use crate::task_manager::TaskManager;
use crate::updatechecker::UpdateChecker;
use crate::updater::Updater;

/// Builder for creating a [`BoxRuntime`].
#[derive(Default)]
pub struct BoxRuntimeBuilder {
    config: Option<Config>,
    pool: Option<SqlitePool>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    dns: Option<Arc<dyn DnsProvider>>,
    proxy: Option<Arc<dyn ReverseProxy>>,
    volumes: Option<Arc<dyn VolumeManager>>,
    health: Option<Arc<dyn HealthProbe>>,
    cert_provider: Option<Arc<dyn CertificateProvider>>,
    mailer: Option<Arc<dyn Mailer>>,
    probe_ports: bool,
}

impl BoxRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            probe_ports: true,
            ..Default::default()
        }
    }

    /// Set the box configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the SQLite pool (required). See [`crate::db::connect`].
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the container runtime.
    ///
    /// Default: [`DockerCli`] on `BOX_DOCKER_NETWORK`
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the DNS provider.
    ///
    /// Default: selected by `BOX_DNS_PROVIDER`
    pub fn dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Set the reverse proxy.
    ///
    /// Default: [`NginxProxy`] writing to `BOX_NGINX_APPCONFIG_DIR`
    pub fn proxy(mut self, proxy: Arc<dyn ReverseProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the volume manager.
    ///
    /// Default: [`LocalVolumes`] under the data directory
    pub fn volumes(mut self, volumes: Arc<dyn VolumeManager>) -> Self {
        self.volumes = Some(volumes);
        self
    }

    /// Set the health probe.
    ///
    /// Default: [`HttpHealthProbe`] on 127.0.0.1
    pub fn health(mut self, health: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the certificate provider.
    ///
    /// Default: [`FallbackCertificateProvider`] serving the box wildcard pair
    pub fn cert_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.cert_provider = Some(provider);
        self
    }

    /// Set the notification sender.
    ///
    /// Default: [`MailQueue`]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Skip the bind check when allocating HTTP ports.
    pub fn without_port_probe(mut self) -> Self {
        self.probe_ports = false;
        self
    }

    fn default_dns(config: &Config) -> Result<Arc<dyn DnsProvider>> {
        match config.dns_provider.as_str() {
            "caas" => {
                let box_id = config
                    .box_id
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("BOX_ID is required for caas DNS"))?;
                let token = config
                    .box_token
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("BOX_TOKEN is required for caas DNS"))?;
                Ok(Arc::new(CaasDnsProvider::new(
                    &config.api_server_origin,
                    box_id,
                    token,
                )?))
            }
            _ => Ok(Arc::new(NoopDnsProvider)),
        }
    }

    /// Wire every component.
    ///
    /// Returns an error if required fields are missing or a default collaborator cannot be
    /// created.
    pub fn build(self) -> Result<BoxRuntimeConfig> {
        let config = Arc::new(
            self.config
                .ok_or_else(|| anyhow::anyhow!("config is required"))?,
        );
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;

        let container_runtime: Arc<dyn ContainerRuntime> = match self.container_runtime {
            Some(runtime) => runtime,
            None => Arc::new(DockerCli::from_config(&config)),
        };
        let dns = match self.dns {
            Some(dns) => dns,
            None => Self::default_dns(&config)?,
        };
        let proxy: Arc<dyn ReverseProxy> = match self.proxy {
            Some(proxy) => proxy,
            None => Arc::new(NginxProxy::new(
                &config.nginx_appconfig_dir,
                config.nginx_reload_command.clone(),
            )),
        };
        let volumes: Arc<dyn VolumeManager> = match self.volumes {
            Some(volumes) => volumes,
            None => Arc::new(LocalVolumes::new(config.apps_data_dir())),
        };
        let health: Arc<dyn HealthProbe> = match self.health {
            Some(health) => health,
            None => Arc::new(HttpHealthProbe::new()?),
        };
        let cert_provider: Arc<dyn CertificateProvider> = match self.cert_provider {
            Some(provider) => provider,
            None => Arc::new(FallbackCertificateProvider::new(
                &config.fallback_cert,
                &config.fallback_key,
            )),
        };
        let mailer: Arc<dyn Mailer> = match self.mailer {
            Some(mailer) => mailer,
            None => Arc::new(MailQueue::new()),
        };

        info!(
            container_runtime = container_runtime.runtime_type(),
            dns = dns.provider_type(),
            certificates = cert_provider.provider_type(),
            mailer = mailer.mailer_type(),
            "Provisioners initialized"
        );

        let registry = AppRegistry::new(pool.clone());
        let settings = Settings::new(pool.clone());
        let mut ports = PortAllocator::new(registry.clone(), config.http_port_range.clone());
        if !self.probe_ports {
            ports = ports.without_bind_probe();
        }
        let tasks = TaskManager::new();
        let addons = AddonManager::new(pool.clone(), config.clone(), container_runtime.clone());

        let task = AppTask::new(
            config.clone(),
            registry.clone(),
            ports.clone(),
            addons.clone(),
            Provisioners {
                runtime: container_runtime.clone(),
                dns,
                proxy,
                volumes: volumes.clone(),
                health,
                cert_provider,
            },
        );
        let apps = Apps::new(
            config.clone(),
            registry.clone(),
            ports,
            tasks,
            task,
            addons,
            container_runtime,
            mailer.clone(),
        );
        let checker =
            UpdateChecker::new(config.clone(), registry.clone(), settings.clone(), mailer)?;
        let updater = Updater::new(apps.clone(), checker.clone());
        let backups = BackupManager::new(&config, registry, volumes);
        let heartbeat = Heartbeat::new(config.clone())?;

        let scheduler = Scheduler::new(
            settings.clone(),
            fixed_jobs(&apps, &checker, &backups, &heartbeat),
            {
                let updater = updater.clone();
                job_action(move || {
                    let updater = updater.clone();
                    async move { updater.autoupdate().await.map(|_| ()) }
                })
            },
        );

        Ok(BoxRuntimeConfig {
            config,
            pool,
            settings,
            apps,
            checker,
            updater,
            backups,
            scheduler: Arc::new(scheduler),
        })
    }
}

fn fixed_jobs(
    apps: &Apps,
    checker: &UpdateChecker,
    backups: &BackupManager,
    heartbeat: &Heartbeat,
) -> Vec<JobDefinition> {
    let heartbeat = heartbeat.clone();
    let backup = backups.clone();
    let cleanup = backups.clone();
    let checker = checker.clone();
    let renewal = apps.clone();
    let sync = apps.clone();

    vec![
        JobDefinition::new(
            "heartbeat",
            HEARTBEAT_PATTERN,
            job_action(move || {
                let heartbeat = heartbeat.clone();
                async move { heartbeat.send().await.map(|_| ()) }
            }),
        ),
        JobDefinition::new(
            "backup",
            BACKUP_PATTERN,
            job_action(move || {
                let backups = backup.clone();
                async move { backups.ensure_backup().await.map(|_| ()) }
            }),
        ),
        JobDefinition::new(
            "update_check",
            UPDATE_CHECK_PATTERN,
            job_action(move || {
                let checker = checker.clone();
                async move {
                    // app updates are still checked when the box feed is down
                    let box_result = checker.check_box_updates().await;
                    checker.check_app_updates().await?;
                    box_result.map(|_| ())
                }
            }),
        ),
        JobDefinition::new(
            "cleanup",
            CLEANUP_PATTERN,
            job_action(move || {
                let backups = cleanup.clone();
                async move { backups.cleanup().await.map(|_| ()) }
            }),
        ),
        JobDefinition::new(
            "certificate_renewal",
            CERTIFICATE_RENEWAL_PATTERN,
            job_action(move || {
                let apps = renewal.clone();
                async move { apps.renew_certificates().await.map(|_| ()) }
            }),
        ),
        JobDefinition::new(
            "app_sync",
            APP_SYNC_PATTERN,
            job_action(move || {
                let apps = sync.clone();
                async move { apps.sync().await.map(|_| ()) }
            }),
        ),
    ]
}

/// Wired components of a [`BoxRuntime`], ready to start.
pub struct BoxRuntimeConfig {
    config: Arc<Config>,
    pool: SqlitePool,
    settings: Settings,
    apps: Apps,
    checker: UpdateChecker,
    updater: Updater,
    backups: BackupManager,
    scheduler: Arc<Scheduler>,
}

impl BoxRuntimeConfig {
    /// Resume interrupted pipelines, then start the scheduler.
    pub async fn start(self) -> Result<BoxRuntime> {
        match self.apps.sync().await {
            Ok(started) if started > 0 => info!(started, "Resumed app pipelines"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to sync apps on startup"),
        }

        self.scheduler.start().await?;
        let scheduler_shutdown = self.scheduler.shutdown_handle();
        let scheduler = self.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        info!(
            fqdn = %self.config.fqdn,
            version = %self.config.box_version,
            time_zone = %self.scheduler.time_zone().name(),
            "BoxRuntime started"
        );

        Ok(BoxRuntime {
            config: self.config,
            pool: self.pool,
            settings: self.settings,
            apps: self.apps,
            checker: self.checker,
            updater: self.updater,
            backups: self.backups,
            scheduler: self.scheduler,
            scheduler_handle,
            scheduler_shutdown,
        })
    }
}

/// A running box orchestrator.
///
/// The runtime manages:
/// - The app orchestrator and its background pipelines
/// - The cron scheduler (heartbeat, backups, update checks, cleanup, certificate renewal,
///   app sync, autoupdate)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BoxRuntime {
    config: Arc<Config>,
    pool: SqlitePool,
    settings: Settings,
    apps: Apps,
    checker: UpdateChecker,
    updater: Updater,
    backups: BackupManager,
    scheduler: Arc<Scheduler>,
    scheduler_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
}

impl BoxRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BoxRuntimeBuilder {
        BoxRuntimeBuilder::new()
    }

    /// The box configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The app orchestrator.
    pub fn apps(&self) -> &Apps {
        &self.apps
    }

    /// Box settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The update checker.
    pub fn update_checker(&self) -> &UpdateChecker {
        &self.checker
    }

    /// The updater.
    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    /// The backup manager.
    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// The maintenance scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Check if the scheduler is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the scheduler and its jobs, then waits for running pipelines so that every app
    /// reaches a persisted state before the pool is closed.
    pub async fn shutdown(self) -> Result<()> {
        info!("BoxRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
        }

        self.apps.tasks().wait_all().await;
        self.pool.close().await;

        info!("BoxRuntime shutdown complete");
        Ok(())
    }
}
