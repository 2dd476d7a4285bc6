// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the box orchestrator.
//!
//! Every error maps to an [`ErrorKind`] so callers (HTTP routes, the LDAP bridge) can translate
//! failures without matching on individual variants.

use std::fmt;

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An external collaborator (container runtime, DNS, proxy, HTTP API) failed.
    #[error("External failure: {0}")]
    Provision(#[from] crate::provision::ProvisionError),

    /// App was not found.
    #[error("App not found: {0}")]
    AppNotFound(String),

    /// Some other entity was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Manifest is incomplete or incompatible with this box.
    #[error("Bad manifest: {0}")]
    BadManifest(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Location, port or id collides with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation is not valid in the app's current state.
    #[error("App '{app_id}' is {state}, expected {expected}")]
    InvalidState {
        /// The app ID.
        app_id: String,
        /// The current installation state.
        state: String,
        /// The states the operation accepts.
        expected: &'static str,
    },

    /// Health check never succeeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A pipeline is already running for this app.
    #[error("App '{0}' is locked by a running task")]
    Locked(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown app or entity.
    NotFound,
    /// Manifest schema or version incompatibility.
    BadManifest,
    /// Malformed request field.
    BadRequest,
    /// Location/port/id collision or invalid state for the operation.
    Conflict,
    /// Docker/DNS/nginx/HTTP call failed.
    ExternalFailure,
    /// Health check never succeeded.
    Timeout,
    /// Pipeline already running for this app id.
    Locked,
    /// Database, filesystem or programming error.
    Internal,
}

impl ErrorKind {
    /// Stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::BadManifest => "BAD_MANIFEST",
            Self::BadRequest => "BAD_REQUEST",
            Self::Conflict => "CONFLICT",
            Self::ExternalFailure => "EXTERNAL_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Locked => "LOCKED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AppNotFound(_) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadManifest(_) => ErrorKind::BadManifest,
            Self::InvalidRequest(_) => ErrorKind::BadRequest,
            Self::Conflict(_) | Self::InvalidState { .. } => ErrorKind::Conflict,
            Self::Provision(_) => ErrorKind::ExternalFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Locked(_) => ErrorKind::Locked,
            Self::Config(_)
            | Self::Database(_)
            | Self::Migrate(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }
}
