// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloudron Box - App Lifecycle Orchestration
//!
//! This crate runs the apps of a single self-hosted box. Each app is a container built from a
//! manifest, reachable at `<location>.<fqdn>` through the reverse proxy, with its own DNS
//! record, data volume and addon resources (databases, mail, LDAP, OAuth).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Admin API / LDAP bridge                        │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Apps (validate, lease, record)  ──spawn──►  AppTask (pipelines)  │
//! │  Scheduler: heartbeat, backups, update check, cleanup,            │
//! │             certificate renewal, app sync, autoupdate             │
//! └───────────────────────────────────────────────────────────────────┘
//!        │                │               │              │
//!        ▼                ▼               ▼              ▼
//!   Docker daemon     DNS provider      nginx       caas / app store
//!        │
//!        ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                SQLite (apps, settings, addon state)               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipelines
//!
//! | Pipeline | Entered from | Ends in |
//! |----------|--------------|---------|
//! | install | `pending_install` | `installed` |
//! | configure | `pending_configure` | `installed` |
//! | update | `pending_update` | `installed` |
//! | uninstall | `pending_uninstall` | record deleted |
//! | start / stop | `installed` | `installed` (run state changes) |
//!
//! A failing step moves the app to `error` with the step recorded in `last_error`. Progress is
//! persisted before each step, so a restarted box resumes where it stopped.
//!
//! # Configuration
//!
//! | Environment Variable | Required | Default | Description |
//! |---------------------|----------|---------|-------------|
//! | `BOX_DATA_DIR` | No | `.data` | Database, volumes, backups, certificates |
//! | `BOX_DATABASE_PATH` | No | `{BOX_DATA_DIR}/box.db` | SQLite database |
//! | `BOX_FQDN` | No | `localhost` | Box domain |
//! | `BOX_ADMIN_LOCATION` | No | `my` | Admin UI subdomain |
//! | `BOX_PUBLIC_IP` | No | `127.0.0.1` | Address in app A-records |
//! | `BOX_VERSION` | No | crate version | Running platform version |
//! | `BOX_VERSIONS_URL` | No | release bucket | Box release feed |
//! | `BOX_API_SERVER_ORIGIN` | No | `https://api.cloudron.io` | App store and caas API |
//! | `BOX_ID` / `BOX_TOKEN` | caas only | - | Box identity at the caas API |
//! | `BOX_DNS_PROVIDER` | No | `noop` | `noop` or `caas` |
//! | `BOX_NGINX_APPCONFIG_DIR` | No | `{BOX_DATA_DIR}/nginx/applications` | Vhost files |
//! | `BOX_NGINX_RELOAD_COMMAND` | No | - | Command run after vhost changes |
//! | `BOX_HTTP_PORT_RANGE` | No | `3001-3999` | Host ports for app HTTP endpoints |
//! | `BOX_HEALTH_CHECK_ATTEMPTS` | No | `30` | Probes before an install times out |
//! | `BOX_HEALTH_CHECK_INTERVAL_SECS` | No | `2` | Delay between probes |
//! | `BOX_ADMIN_EMAIL` | No | `admin@{BOX_FQDN}` | Notification recipient |
//! | `BOX_REDIS_IMAGE` | No | `cloudron/redis:0.8.0` | Redis addon image |
//! | `BOX_FALLBACK_CERT` / `BOX_FALLBACK_KEY` | No | `{BOX_DATA_DIR}/certs/host.*` | Wildcard pair |
//! | `BOX_BACKUP_RETENTION_DAYS` | No | `7` | Snapshot retention |
//! | `BOX_DOCKER_NETWORK` | No | `cloudron` | Network for app and addon containers (empty = default bridge) |
//! | `RUST_LOG` | No | `cloudron_box=info` | Log filter |

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types and error kinds.
pub mod error;

/// SQLite pool and migrations.
pub mod db;

/// App records and their states.
pub mod app;

/// App manifests.
pub mod manifest;

/// Persistence of app records.
pub mod app_registry;

/// Box settings with change notifications.
pub mod settings;

/// Per-app task exclusivity.
pub mod task_manager;

/// Host port allocation.
pub mod ports;

/// Container runtime, DNS, reverse proxy, volume and health collaborators.
pub mod provision;

/// Addon resources (databases, mail, LDAP, OAuth, redis).
pub mod addons;

/// TLS certificates for app domains.
pub mod certificates;

/// Lifecycle pipelines and their steps.
pub mod apptask;

/// The app orchestrator API.
pub mod apps;

/// Notifications to the box owner.
pub mod mailer;

/// Box and app update discovery.
pub mod updatechecker;

/// Automatic application of updates.
pub mod updater;

/// App backup snapshots.
pub mod backups;

/// Liveness ping to the caas API.
pub mod heartbeat;

/// Cron scheduler for maintenance jobs.
pub mod scheduler;

/// Embeddable runtime wiring everything together.
pub mod runtime;

pub use config::Config;
pub use error::Error;
