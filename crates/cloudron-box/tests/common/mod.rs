// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cloudron-box integration tests.
//!
//! Provides TestContext wiring the orchestrator against mock provisioners and a temporary
//! SQLite database.

#![allow(dead_code)]

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;

use cloudron_box::addons::AddonManager;
use cloudron_box::app::App;
use cloudron_box::app_registry::AppRegistry;
use cloudron_box::apps::{Apps, InstallRequest};
use cloudron_box::apptask::{AppTask, Provisioners};
use cloudron_box::certificates::{
    CertificatePaths, CertificateProvider, FallbackCertificateProvider, IssuedCertificate,
};
use cloudron_box::config::Config;
use cloudron_box::mailer::MailQueue;
use cloudron_box::manifest::Manifest;
use cloudron_box::ports::PortAllocator;
use cloudron_box::provision::mock::{
    MockContainerRuntime, MockDnsProvider, MockHealthProbe, MockReverseProxy, MockVolumes,
};
use cloudron_box::settings::Settings;
use cloudron_box::task_manager::TaskManager;

/// Certificate provider that reports a renewal on every call.
pub struct RenewingCertificateProvider {
    calls: AtomicU32,
    paths: CertificatePaths,
}

impl RenewingCertificateProvider {
    pub fn new(dir: &std::path::Path) -> Self {
        Self {
            calls: AtomicU32::new(0),
            paths: CertificatePaths {
                cert_path: dir.join("acme.cert"),
                key_path: dir.join("acme.key"),
            },
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateProvider for RenewingCertificateProvider {
    fn provider_type(&self) -> &'static str {
        "renewing"
    }

    async fn ensure_certificate(
        &self,
        _fqdn: &str,
    ) -> cloudron_box::error::Result<IssuedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCertificate {
            paths: self.paths.clone(),
            renewed: true,
        })
    }
}

/// Orchestrator wired against mocks.
pub struct TestContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub registry: AppRegistry,
    pub settings: Settings,
    pub runtime: Arc<MockContainerRuntime>,
    pub dns: Arc<MockDnsProvider>,
    pub proxy: Arc<MockReverseProxy>,
    pub volumes: Arc<MockVolumes>,
    pub health: Arc<MockHealthProbe>,
    pub mailer: Arc<MailQueue>,
    pub apps: Apps,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

/// Configuration for tests rooted at `data_dir`.
pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::new(data_dir);
    config.fqdn = "box.example.com".to_string();
    config.admin_email = "admin@box.example.com".to_string();
    config.public_ip = "203.0.113.10".to_string();
    config.box_version = semver::Version::new(1, 0, 0);
    config.http_port_range = 4001..=4999;
    config.health_check_attempts = 3;
    config.health_check_interval = Duration::from_millis(10);
    config
}

impl TestContext {
    /// Create a context with the default fallback certificate provider.
    pub async fn new() -> Self {
        Self::build(None, |_| {}).await
    }

    /// Create a context using `provider` for app certificates.
    pub async fn with_cert_provider(provider: Arc<dyn CertificateProvider>) -> Self {
        Self::build(Some(provider), |_| {}).await
    }

    /// Create a context handing out HTTP ports from `range`.
    pub async fn with_port_range(range: RangeInclusive<u16>) -> Self {
        Self::build(None, |config| config.http_port_range = range).await
    }

    async fn build(
        cert_provider: Option<Arc<dyn CertificateProvider>>,
        adjust: impl FnOnce(&mut Config),
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_path_buf();
        let mut config = test_config(&data_dir);
        adjust(&mut config);
        let config = Arc::new(config);

        let pool = cloudron_box::db::connect(&config.database_path)
            .await
            .expect("Failed to open database");

        let runtime = Arc::new(MockContainerRuntime::new());
        let dns = Arc::new(MockDnsProvider::new());
        let proxy = Arc::new(MockReverseProxy::new());
        let volumes = Arc::new(MockVolumes::new(config.apps_data_dir()));
        let health = Arc::new(MockHealthProbe::new());
        let mailer = Arc::new(MailQueue::new());
        let cert_provider: Arc<dyn CertificateProvider> = match cert_provider {
            Some(provider) => provider,
            None => Arc::new(FallbackCertificateProvider::new(
                &config.fallback_cert,
                &config.fallback_key,
            )),
        };

        let registry = AppRegistry::new(pool.clone());
        let settings = Settings::new(pool.clone());
        let ports = PortAllocator::new(registry.clone(), config.http_port_range.clone())
            .without_bind_probe();
        let addons = AddonManager::new(pool.clone(), config.clone(), runtime.clone());
        let task = AppTask::new(
            config.clone(),
            registry.clone(),
            ports.clone(),
            addons.clone(),
            Provisioners {
                runtime: runtime.clone(),
                dns: dns.clone(),
                proxy: proxy.clone(),
                volumes: volumes.clone(),
                health: health.clone(),
                cert_provider,
            },
        );
        let apps = Apps::new(
            config.clone(),
            registry.clone(),
            ports,
            TaskManager::new(),
            task,
            addons,
            runtime.clone(),
            mailer.clone(),
        );

        Self {
            config,
            pool,
            registry,
            settings,
            runtime,
            dns,
            proxy,
            volumes,
            health,
            mailer,
            apps,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Start installing an app at `location` with the default test manifest.
    pub async fn install(&self, app_id: &str, location: &str) -> cloudron_box::error::Result<App> {
        self.apps
            .install(InstallRequest {
                app_id: Some(app_id.to_string()),
                app_store_id: Some("io.example.blog".to_string()),
                manifest: manifest("1.0.0"),
                location: location.to_string(),
                ..Default::default()
            })
            .await
    }

    /// Wait for the pipeline of `app_id` and return the app record.
    pub async fn settle(&self, app_id: &str) -> App {
        self.apps.tasks().wait(app_id).await;
        self.registry.get(app_id).await.expect("app record")
    }

    /// Install an app and wait for the pipeline to finish.
    pub async fn install_and_wait(&self, app_id: &str, location: &str) -> App {
        self.install(app_id, location).await.expect("install accepted");
        self.settle(app_id).await
    }

    /// Fail `op` on every mock.
    pub async fn fail_on(&self, op: &str) {
        self.runtime.fail_on(op).await;
        self.dns.fail_on(op).await;
        self.proxy.fail_on(op).await;
        self.volumes.fail_on(op).await;
    }

    /// Stop failing on every mock.
    pub async fn clear_failures(&self) {
        self.runtime.clear_failures().await;
        self.dns.clear_failures().await;
        self.proxy.clear_failures().await;
        self.volumes.clear_failures().await;
        self.health.set_healthy(true);
    }
}

/// The test manifest with an extra TCP port `name` listening on `container_port`.
pub fn manifest_with_tcp_port(name: &str, container_port: u16) -> Manifest {
    let mut manifest = manifest("1.0.0");
    manifest.tcp_ports.insert(
        name.to_string(),
        serde_json::from_value(json!({ "title": name, "containerPort": container_port }))
            .expect("valid port spec"),
    );
    manifest
}

/// A valid manifest at `version`, with the image tagged by version.
pub fn manifest(version: &str) -> Manifest {
    Manifest::from_value(json!({
        "id": "io.example.blog",
        "title": "Blog",
        "version": version,
        "manifestVersion": 1,
        "dockerImage": format!("example/blog:{}", version),
        "healthCheckPath": "/healthz",
        "httpPort": 8000,
        "addons": { "localstorage": {}, "sendmail": {}, "oauth": {} }
    }))
    .expect("valid manifest")
}
