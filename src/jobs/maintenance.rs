//! Cron-scheduled daily upkeep, independent of request traffic.
//!
//! Each run:
//! 1. Learning maintenance (pattern deactivation, stale snapshots, cache)
//! 2. Stale processing-lock reset
//! 3. Token and zombie-entry sweep
//!
//! Steps are isolated: one failing does not skip the others.
//!
//! Stale processing locks are also reclaimed on their own short interval,
//! so a crashed worker's letters come back well inside a day.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::runner::BatchRunner;
use super::sweep::SweepReport;
use crate::config::MaintenanceConfig;
use crate::error::ConfigError;
use crate::learning::{LearningEngine, MaintenanceReport};
use crate::workflow::Workflow;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub learning: Option<MaintenanceReport>,
    pub locks_reset: Option<usize>,
    pub sweep: Option<SweepReport>,
}

pub struct MaintenanceTicker {
    learning: Arc<LearningEngine>,
    workflow: Arc<Workflow>,
    runner: Arc<BatchRunner>,
    schedule: cron::Schedule,
}

impl MaintenanceTicker {
    pub fn new(
        learning: Arc<LearningEngine>,
        workflow: Arc<Workflow>,
        runner: Arc<BatchRunner>,
        config: &MaintenanceConfig,
    ) -> Result<Self, ConfigError> {
        let schedule = cron::Schedule::from_str(&config.schedule).map_err(|e| {
            ConfigError::InvalidSchedule {
                schedule: config.schedule.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            learning,
            workflow,
            runner,
            schedule,
        })
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.learning.run_maintenance().await {
            Ok(r) => report.learning = Some(r),
            Err(e) => error!("Learning maintenance failed: {e}"),
        }
        match self.workflow.reset_stale_locks().await {
            Ok(n) => report.locks_reset = Some(n),
            Err(e) => error!("Stale lock reset failed: {e}"),
        }
        match self.runner.sweep().await {
            Ok(r) => report.sweep = Some(r),
            Err(e) => error!("Job sweep failed: {e}"),
        }

        info!(
            patterns = report.learning.as_ref().map(|r| r.patterns_deactivated),
            snapshots = report.learning.as_ref().map(|r| r.snapshots_removed),
            locks = report.locks_reset,
            "Maintenance run finished"
        );
        report
    }
}

/// Spawn the maintenance loop. Sleeps until each cron fire time.
pub fn spawn_maintenance_ticker(ticker: Arc<MaintenanceTicker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = ticker.next_fire(now) else {
                warn!("Maintenance schedule has no future fire time; ticker stopped");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.to_rfc3339(), "Next maintenance run scheduled");
            tokio::time::sleep(wait).await;
            ticker.run_once().await;
        }
    })
}

/// Spawn the stale-lock reaper.
pub fn spawn_lock_reaper(
    workflow: Arc<Workflow>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match workflow.reset_stale_locks().await {
                Ok(0) => {}
                Ok(n) => info!(reset = n, "Reclaimed stale processing locks"),
                Err(e) => warn!("Stale lock sweep failed: {e}"),
            }
        }
    })
}
