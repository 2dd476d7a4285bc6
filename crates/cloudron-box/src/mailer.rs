// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notifications to the box owner.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

/// A templated notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new box version is available
    BoxUpdateAvailable {
        /// Offered version
        version: String,
        /// Release notes
        changelog: Vec<String>,
    },
    /// A new version of an installed app is available
    AppUpdateAvailable {
        /// App id
        app_id: String,
        /// App title
        title: String,
        /// Offered version
        version: String,
        /// Release notes
        changelog: Option<String>,
    },
    /// An app container died and was restarted
    AppRestarted {
        /// App id
        app_id: String,
        /// App location
        location: String,
    },
}

impl Notification {
    /// Mail subject.
    pub fn subject(&self) -> String {
        match self {
            Notification::BoxUpdateAvailable { version, .. } => {
                format!("Cloudron update available: {}", version)
            }
            Notification::AppUpdateAvailable { title, version, .. } => {
                format!("{} update available: {}", title, version)
            }
            Notification::AppRestarted { location, .. } => {
                format!("App at {} was restarted", location)
            }
        }
    }

    /// Mail body.
    pub fn body(&self) -> String {
        match self {
            Notification::BoxUpdateAvailable { version, changelog } => {
                let mut body = format!("Version {} of your Cloudron is available.\n", version);
                for line in changelog {
                    body.push_str(&format!("\n* {}", line));
                }
                body
            }
            Notification::AppUpdateAvailable {
                app_id,
                title,
                version,
                changelog,
            } => format!(
                "Version {} of {} ({}) is available.\n\n{}",
                version,
                title,
                app_id,
                changelog.as_deref().unwrap_or_default()
            ),
            Notification::AppRestarted { app_id, location } => format!(
                "The container of app {} at {} was not running and has been restarted.",
                app_id, location
            ),
        }
    }
}

/// Trait for notification senders.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sender type identifier
    fn mailer_type(&self) -> &'static str;

    /// Enqueue `notification` for `to`.
    async fn send(&self, to: &str, notification: Notification) -> Result<()>;
}

/// Mailer that logs and keeps every notification in memory.
///
/// Delivery is done by the mail server collaborator, which drains this queue.
#[derive(Debug, Default)]
pub struct MailQueue {
    queue: Mutex<Vec<(String, Notification)>>,
}

impl MailQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued notifications.
    pub fn queued(&self) -> Vec<(String, Notification)> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all queued notifications.
    pub fn drain(&self) -> Vec<(String, Notification)> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

#[async_trait]
impl Mailer for MailQueue {
    fn mailer_type(&self) -> &'static str {
        "queue"
    }

    async fn send(&self, to: &str, notification: Notification) -> Result<()> {
        info!(to = %to, subject = %notification.subject(), "Queued notification");
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((to.to_string(), notification));
        Ok(())
    }
}
