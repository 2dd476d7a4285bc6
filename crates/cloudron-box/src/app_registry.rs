// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App Registry
//!
//! SQLite-backed store of app records, the single source of truth for installation and run
//! state. Writes are durable when the call returns.
//!
//! The registry does NOT serialize concurrent updates of the same app; callers hold the
//! per-app task lock for that (see [`crate::task_manager`]).

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::app::{AccessRestriction, App, InstallationState, OldConfig, PortBindings, RunState};
use crate::error::{Error, Result};
use crate::manifest::Manifest;

/// Optional fields of a new app record.
#[derive(Debug, Clone)]
pub struct NewAppFields {
    /// Authorized users, `None` = public
    pub access_restriction: Option<AccessRestriction>,
    /// Initial state
    pub installation_state: InstallationState,
    /// Memory limit in bytes (0 = manifest default)
    pub memory_limit: i64,
}

impl Default for NewAppFields {
    fn default() -> Self {
        Self {
            access_restriction: None,
            installation_state: InstallationState::PendingInstall,
            memory_limit: 0,
        }
    }
}

/// Partial update of an app record. `None` leaves a field untouched; nullable fields take
/// `Some(None)` to clear them.
#[derive(Debug, Clone, Default)]
pub struct AppPatch {
    /// New manifest
    pub manifest: Option<Manifest>,
    /// New location
    pub location: Option<String>,
    /// New port bindings
    pub port_bindings: Option<PortBindings>,
    /// New access restriction
    pub access_restriction: Option<Option<AccessRestriction>>,
    /// New installation state
    pub installation_state: Option<InstallationState>,
    /// New progress
    pub installation_progress: Option<Option<String>>,
    /// New run state
    pub run_state: Option<RunState>,
    /// New container id
    pub container_id: Option<Option<String>>,
    /// New container address
    pub container_ip: Option<Option<String>>,
    /// New HTTP port
    pub http_port: Option<Option<u16>>,
    /// New DNS record id
    pub dns_record_id: Option<Option<String>>,
    /// New memory limit
    pub memory_limit: Option<i64>,
    /// New old configuration
    pub old_config: Option<Option<OldConfig>>,
    /// New error
    pub last_error: Option<Option<String>>,
}

impl AppPatch {
    /// Patch that only changes the installation state.
    pub fn state(state: InstallationState) -> Self {
        Self {
            installation_state: Some(state),
            ..Default::default()
        }
    }
}

#[derive(sqlx::FromRow)]
struct AppRow {
    id: String,
    app_store_id: Option<String>,
    manifest_json: String,
    location: String,
    port_bindings_json: String,
    access_restriction_json: Option<String>,
    installation_state: String,
    installation_progress: Option<String>,
    run_state: String,
    container_id: Option<String>,
    container_ip: Option<String>,
    http_port: Option<i64>,
    dns_record_id: Option<String>,
    memory_limit: i64,
    old_config_json: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AppRow> for App {
    type Error = Error;

    fn try_from(row: AppRow) -> Result<Self> {
        Ok(App {
            manifest: serde_json::from_str(&row.manifest_json)?,
            port_bindings: serde_json::from_str(&row.port_bindings_json)?,
            access_restriction: row
                .access_restriction_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            installation_state: row.installation_state.parse().map_err(Error::Other)?,
            run_state: row.run_state.parse().map_err(Error::Other)?,
            http_port: row
                .http_port
                .map(|p| u16::try_from(p).map_err(|_| Error::Other(format!("bad port {}", p))))
                .transpose()?,
            old_config: row
                .old_config_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: row.id,
            app_store_id: row.app_store_id,
            location: row.location,
            installation_progress: row.installation_progress,
            container_id: row.container_id,
            container_ip: row.container_ip,
            dns_record_id: row.dns_record_id,
            memory_limit: row.memory_limit,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return Error::Conflict(what());
    }
    Error::Database(err)
}

/// App registry client for SQLite operations
#[derive(Clone)]
pub struct AppRegistry {
    pool: SqlitePool,
}

impl AppRegistry {
    /// Create a new registry client
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add an app record.
    ///
    /// Fails with `Conflict` when the id, location or a port is already taken.
    pub async fn add(
        &self,
        id: &str,
        app_store_id: Option<&str>,
        manifest: &Manifest,
        location: &str,
        port_bindings: &PortBindings,
        fields: NewAppFields,
    ) -> Result<App> {
        let now = Utc::now();
        let access_restriction = fields
            .access_restriction
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO apps (
                id, app_store_id, manifest_json, location, port_bindings_json,
                access_restriction_json, installation_state, run_state, memory_limit,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(app_store_id)
        .bind(serde_json::to_string(manifest)?)
        .bind(location)
        .bind(serde_json::to_string(port_bindings)?)
        .bind(access_restriction)
        .bind(fields.installation_state.as_str())
        .bind(RunState::Unknown.as_str())
        .bind(fields.memory_limit)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_unique_violation(e, || {
                format!("app '{}' or location '{}' already exists", id, location)
            })
        })?;

        tracing::info!(
            app_id = %id,
            location = %location,
            state = %fields.installation_state,
            "Added app"
        );

        self.get(id).await
    }

    /// Get an app. Fails with `AppNotFound` for unknown ids.
    pub async fn get(&self, id: &str) -> Result<App> {
        let row = sqlx::query_as::<_, AppRow>("SELECT * FROM apps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::AppNotFound(id.to_string()))?;

        row.try_into()
    }

    /// Reverse lookup by container network address.
    pub async fn get_by_ip_address(&self, ip: &str) -> Result<App> {
        let row = sqlx::query_as::<_, AppRow>("SELECT * FROM apps WHERE container_ip = ?")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no app with address {}", ip)))?;

        row.try_into()
    }

    /// All apps ordered by creation time.
    pub async fn all(&self) -> Result<Vec<App>> {
        let rows = sqlx::query_as::<_, AppRow>("SELECT * FROM apps ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(App::try_from).collect()
    }

    /// Apply a patch. Fails with `AppNotFound` for unknown ids and `Conflict` when the new
    /// location or port is taken.
    pub async fn update(&self, id: &str, patch: AppPatch) -> Result<App> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE apps SET updated_at = ");
        builder.push_bind(Utc::now());

        if let Some(manifest) = &patch.manifest {
            builder
                .push(", manifest_json = ")
                .push_bind(serde_json::to_string(manifest)?);
        }
        if let Some(location) = &patch.location {
            builder.push(", location = ").push_bind(location.clone());
        }
        if let Some(bindings) = &patch.port_bindings {
            builder
                .push(", port_bindings_json = ")
                .push_bind(serde_json::to_string(bindings)?);
        }
        if let Some(restriction) = &patch.access_restriction {
            builder
                .push(", access_restriction_json = ")
                .push_bind(restriction.as_ref().map(serde_json::to_string).transpose()?);
        }
        if let Some(state) = patch.installation_state {
            builder
                .push(", installation_state = ")
                .push_bind(state.as_str());
        }
        if let Some(progress) = &patch.installation_progress {
            builder
                .push(", installation_progress = ")
                .push_bind(progress.clone());
        }
        if let Some(run_state) = patch.run_state {
            builder.push(", run_state = ").push_bind(run_state.as_str());
        }
        if let Some(container_id) = &patch.container_id {
            builder
                .push(", container_id = ")
                .push_bind(container_id.clone());
        }
        if let Some(container_ip) = &patch.container_ip {
            builder
                .push(", container_ip = ")
                .push_bind(container_ip.clone());
        }
        if let Some(http_port) = patch.http_port {
            builder
                .push(", http_port = ")
                .push_bind(http_port.map(i64::from));
        }
        if let Some(record_id) = &patch.dns_record_id {
            builder
                .push(", dns_record_id = ")
                .push_bind(record_id.clone());
        }
        if let Some(limit) = patch.memory_limit {
            builder.push(", memory_limit = ").push_bind(limit);
        }
        if let Some(old_config) = &patch.old_config {
            builder
                .push(", old_config_json = ")
                .push_bind(old_config.as_ref().map(serde_json::to_string).transpose()?);
        }
        if let Some(last_error) = &patch.last_error {
            builder.push(", last_error = ").push_bind(last_error.clone());
        }

        builder.push(" WHERE id = ").push_bind(id);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, || format!("location or port of app '{}' is taken", id))
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::AppNotFound(id.to_string()));
        }

        self.get(id).await
    }

    /// Delete an app record. Fails with `AppNotFound` for unknown ids.
    pub async fn del(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AppNotFound(id.to_string()));
        }

        tracing::info!(app_id = %id, "Deleted app record");
        Ok(())
    }
}
