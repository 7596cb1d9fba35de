//! Single-writer tick loop.
//!
//! The scheduler owns the [`Universe`] and is the only thing that ever calls
//! `run_tick`. Control surfaces talk to it through the command bus and read its
//! [`SchedulerStatus`]; a manual tick request is just another queued command, so it
//! is served between scheduled ticks and never alongside one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use universe_core::{
    CacheRefreshHook, Tick, TickGate, Universe, UniverseConfig, UniverseError, WorldSnapshot,
};

use crate::command::{CommandReceiver, SchedulerCommand, drain_pending_commands};

/// Externally visible view of the scheduler, refreshed after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub tick: Tick,
    pub config: UniverseConfig,
    /// Bumped whenever a config update is accepted by the scheduler.
    pub config_revision: u64,
    pub latest: Option<WorldSnapshot>,
    pub ticks_run: u64,
    pub failed_ticks: u64,
    /// Bumped by the cache-refresh hook after each committed tick.
    pub view_generation: u64,
}

impl SchedulerStatus {
    pub fn new(config: UniverseConfig, tick: Tick) -> Self {
        Self {
            tick,
            config,
            config_revision: 0,
            latest: None,
            ticks_run: 0,
            failed_ticks: 0,
            view_generation: 0,
        }
    }
}

pub type SharedStatus = Arc<Mutex<SchedulerStatus>>;

pub(crate) fn lock_status(status: &SharedStatus) -> MutexGuard<'_, SchedulerStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache hook that marks the status' active-particle view stale.
struct StatusViewHook(SharedStatus);

impl CacheRefreshHook for StatusViewHook {
    fn invalidate_active_particles_view(&mut self) {
        lock_status(&self.0).view_generation += 1;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Stop after this many successful ticks.
    pub tick_limit: Option<u64>,
    /// Longest sleep between command polls while waiting for the next tick.
    pub idle_poll: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_limit: None,
            idle_poll: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub ticks_run: u64,
    pub failed_ticks: u64,
    pub last_tick: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickTrigger {
    Scheduled,
    Manual,
}

pub struct Scheduler {
    universe: Universe,
    receiver: CommandReceiver,
    status: SharedStatus,
    options: SchedulerOptions,
    ticks_run: u64,
    failed_ticks: u64,
}

impl Scheduler {
    pub fn new(mut universe: Universe, receiver: CommandReceiver, options: SchedulerOptions) -> Self {
        let status = Arc::new(Mutex::new(SchedulerStatus::new(
            universe.config().clone(),
            universe.tick(),
        )));
        universe.set_cache_hook(Box::new(StatusViewHook(Arc::clone(&status))));
        Self {
            universe,
            receiver,
            status,
            options,
            ticks_run: 0,
            failed_ticks: 0,
        }
    }

    #[must_use]
    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    #[must_use]
    pub fn gate(&self) -> TickGate {
        self.universe.gate()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.universe.config().tick_interval_ms)
    }

    fn limit_reached(&self) -> bool {
        self.options
            .tick_limit
            .is_some_and(|limit| self.ticks_run >= limit)
    }

    /// Run until shutdown is requested or the tick limit is hit.
    ///
    /// The first scheduled tick fires immediately; later ones follow the configured
    /// interval measured from the end of the previous tick.
    pub fn run(mut self) -> SchedulerSummary {
        info!(
            tick = self.universe.tick().0,
            interval_ms = self.universe.config().tick_interval_ms,
            limit = ?self.options.tick_limit,
            "scheduler started"
        );
        let mut next_due = Instant::now();
        'outer: loop {
            for command in drain_pending_commands(&self.receiver) {
                match command {
                    SchedulerCommand::TickNow => {
                        self.tick(TickTrigger::Manual);
                        next_due = Instant::now() + self.interval();
                    }
                    SchedulerCommand::UpdateConfig(config) => self.apply_config(*config),
                    SchedulerCommand::Shutdown => {
                        info!("shutdown requested");
                        break 'outer;
                    }
                }
                if self.limit_reached() {
                    break 'outer;
                }
            }
            if self.limit_reached() {
                break;
            }

            let now = Instant::now();
            if now >= next_due {
                self.tick(TickTrigger::Scheduled);
                next_due = Instant::now() + self.interval();
                continue;
            }
            thread::sleep((next_due - now).min(self.options.idle_poll));
        }

        let summary = SchedulerSummary {
            ticks_run: self.ticks_run,
            failed_ticks: self.failed_ticks,
            last_tick: self.universe.tick(),
        };
        info!(
            ticks = summary.ticks_run,
            failed = summary.failed_ticks,
            last_tick = summary.last_tick.0,
            "scheduler stopped"
        );
        summary
    }

    fn tick(&mut self, trigger: TickTrigger) {
        debug!(?trigger, "starting tick");
        match self.universe.run_tick() {
            Ok(outcome) => {
                self.ticks_run += 1;
                let mut status = lock_status(&self.status);
                status.tick = outcome.snapshot.tick;
                status.latest = Some(outcome.snapshot);
                status.ticks_run = self.ticks_run;
            }
            Err(UniverseError::TickInProgress) => {
                warn!(?trigger, "tick skipped; another tick is in flight");
            }
            Err(err) => {
                self.failed_ticks += 1;
                lock_status(&self.status).failed_ticks = self.failed_ticks;
                error!(?trigger, error = %err, "tick failed");
            }
        }
    }

    fn apply_config(&mut self, config: UniverseConfig) {
        match self.universe.update_config(config.clone()) {
            Ok(()) => {
                let mut status = lock_status(&self.status);
                status.config = config;
                status.config_revision += 1;
                info!(revision = status.config_revision, "configuration updated");
            }
            Err(err) => warn!(error = %err, "configuration update rejected"),
        }
    }
}
