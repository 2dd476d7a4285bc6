// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduler.
//!
//! Named jobs run on six field cron patterns (sec min hour dom month dow) evaluated in the box
//! time zone. Jobs live in a [`JobRegistry`]; replacing a job aborts the old task and waits for
//! it to end before the new one is spawned, so two generations of a job never coexist.
//!
//! Each tick spawns the job action in its own task and moves on to the next tick, so a slow
//! action never delays the schedule. Actions prevent their own overlap (the per-app task lease,
//! for instance). Failures are logged and do not affect later ticks.
//!
//! The [`Scheduler`] follows settings changes: a new time zone recreates every job, a new
//! autoupdate pattern replaces only the autoupdate job (`never` removes it).

use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::settings::{AutoupdatePattern, SettingChange, Settings};

/// Heartbeat to the API server, every minute.
pub const HEARTBEAT_PATTERN: &str = "0 * * * * *";
/// App backups, every four hours.
pub const BACKUP_PATTERN: &str = "0 0 */4 * * *";
/// Box and app update check, every ten minutes.
pub const UPDATE_CHECK_PATTERN: &str = "0 */10 * * * *";
/// Backup cleanup, daily.
pub const CLEANUP_PATTERN: &str = "0 30 3 * * *";
/// Certificate renewal, twice a day.
pub const CERTIFICATE_RENEWAL_PATTERN: &str = "0 0 */12 * * *";
/// App sync, every five minutes.
pub const APP_SYNC_PATTERN: &str = "0 */5 * * * *";

/// Name of the autoupdate job.
pub const AUTOUPDATE_JOB: &str = "autoupdate";

/// A job action. Called once per tick.
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`JobAction`].
pub fn job_action<F, Fut>(f: F) -> JobAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// A named job.
#[derive(Clone)]
pub struct JobDefinition {
    /// Job name
    pub name: String,
    /// Cron pattern
    pub pattern: String,
    /// What to run on each tick
    pub action: JobAction,
}

impl JobDefinition {
    /// Create a job definition.
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, action: JobAction) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            action,
        }
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .finish()
    }
}

struct RunningJob {
    pattern: String,
    time_zone: Tz,
    handle: JoinHandle<()>,
}

/// Pattern and time zone of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Cron pattern
    pub pattern: String,
    /// Time zone the pattern is evaluated in
    pub time_zone: Tz,
}

/// Running jobs by name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<String, RunningJob>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `job` in `time_zone`, stopping any job with the same name first.
    pub async fn replace(&self, job: &JobDefinition, time_zone: Tz) -> Result<()> {
        let schedule = Schedule::from_str(&job.pattern).map_err(|e| {
            Error::InvalidRequest(format!("Invalid pattern '{}': {}", job.pattern, e))
        })?;

        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&job.name) {
            stop(&job.name, old).await;
        }

        let handle = tokio::spawn(run_job(
            job.name.clone(),
            schedule,
            time_zone,
            job.action.clone(),
        ));
        jobs.insert(
            job.name.clone(),
            RunningJob {
                pattern: job.pattern.clone(),
                time_zone,
                handle,
            },
        );

        info!(
            job = %job.name,
            pattern = %job.pattern,
            time_zone = %time_zone.name(),
            "Scheduled job"
        );
        Ok(())
    }

    /// Stop and remove a job. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> bool {
        let old = self.jobs.lock().await.remove(name);
        match old {
            Some(old) => {
                stop(name, old).await;
                true
            }
            None => false,
        }
    }

    /// Stop every job.
    pub async fn stop_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().await);
        for (name, job) in jobs {
            stop(&name, job).await;
        }
    }

    /// Names of scheduled jobs.
    pub async fn names(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    /// Pattern and time zone of a job.
    pub async fn info(&self, name: &str) -> Option<JobInfo> {
        self.jobs.lock().await.get(name).map(|job| JobInfo {
            pattern: job.pattern.clone(),
            time_zone: job.time_zone,
        })
    }
}

async fn stop(name: &str, job: RunningJob) {
    job.handle.abort();
    // the task only ends by abort; a JoinError is expected
    let _ = job.handle.await;
    debug!(job = %name, "Stopped job");
}

/// The tick following `previous`, or the first upcoming one when the job has not ticked yet.
///
/// Counting from the previous tick keeps a late wakeup from skipping or repeating a tick.
fn next_tick(
    schedule: &Schedule,
    time_zone: Tz,
    previous: Option<&DateTime<Tz>>,
) -> Option<DateTime<Tz>> {
    match previous {
        Some(previous) => schedule.after(previous).next(),
        None => schedule.upcoming(time_zone).next(),
    }
}

async fn run_job(name: String, schedule: Schedule, time_zone: Tz, action: JobAction) {
    let mut previous = None;
    loop {
        let Some(next) = next_tick(&schedule, time_zone, previous.as_ref()) else {
            warn!(job = %name, "Schedule has no upcoming ticks");
            return;
        };
        let delay = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;
        previous = Some(next);

        debug!(job = %name, "Job tick");
        let tick = action();
        let job = name.clone();
        tokio::spawn(async move {
            if let Err(e) = tick.await {
                error!(job = %job, error = %e, "Job failed");
            }
        });
    }
}

/// Keeps the box jobs scheduled according to the settings.
pub struct Scheduler {
    settings: Settings,
    registry: JobRegistry,
    time_zone: Arc<RwLock<Tz>>,
    fixed_jobs: Vec<JobDefinition>,
    autoupdate: JobAction,
    events: Mutex<broadcast::Receiver<SettingChange>>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler for `fixed_jobs` plus the autoupdate job running `autoupdate`.
    pub fn new(settings: Settings, fixed_jobs: Vec<JobDefinition>, autoupdate: JobAction) -> Self {
        let events = Mutex::new(settings.subscribe());
        Self {
            settings,
            registry: JobRegistry::new(),
            time_zone: Arc::new(RwLock::new(Tz::UTC)),
            fixed_jobs,
            autoupdate,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The job registry.
    pub fn jobs(&self) -> &JobRegistry {
        &self.registry
    }

    /// Time zone the jobs currently run in.
    pub fn time_zone(&self) -> Tz {
        *self.time_zone.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_time_zone(&self, tz: Tz) {
        *self.time_zone.write().unwrap_or_else(|p| p.into_inner()) = tz;
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Load time zone and autoupdate pattern from settings and (re)create every job.
    pub async fn start(&self) -> Result<()> {
        self.set_time_zone(self.settings.time_zone().await?);
        self.recreate_all().await
    }

    async fn recreate_all(&self) -> Result<()> {
        let tz = self.time_zone();
        self.registry.stop_all().await;
        for job in &self.fixed_jobs {
            self.registry.replace(job, tz).await?;
        }
        let pattern = self.settings.autoupdate_pattern().await?;
        self.apply_autoupdate(&pattern).await
    }

    async fn apply_autoupdate(&self, pattern: &AutoupdatePattern) -> Result<()> {
        match pattern {
            AutoupdatePattern::Never => {
                if self.registry.remove(AUTOUPDATE_JOB).await {
                    info!("Autoupdate disabled");
                }
                Ok(())
            }
            AutoupdatePattern::Cron(pattern) => {
                let job =
                    JobDefinition::new(AUTOUPDATE_JOB, pattern.clone(), self.autoupdate.clone());
                self.registry.replace(&job, self.time_zone()).await
            }
        }
    }

    /// React to a settings change.
    pub async fn handle_change(&self, change: &SettingChange) -> Result<()> {
        match change {
            SettingChange::TimeZone(tz) => {
                info!(time_zone = %tz.name(), "Time zone changed, recreating jobs");
                self.set_time_zone(*tz);
                self.recreate_all().await
            }
            SettingChange::AutoupdatePattern(pattern) => self.apply_autoupdate(pattern).await,
        }
    }

    /// Follow settings changes until shutdown, then stop every job.
    pub async fn run(&self) {
        info!(jobs = self.fixed_jobs.len() + 1, "Scheduler started");
        let mut events = self.events.lock().await;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(change) => {
                        if let Err(e) = self.handle_change(&change).await {
                            error!(error = %e, "Failed to apply setting change");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed setting changes, reloading schedule");
                        if let Err(e) = self.start().await {
                            error!(error = %e, "Failed to reload schedule");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.registry.stop_all().await;
        info!("Scheduler stopped");
    }
}
