//! Redundant restart triggers for the resident process.
//!
//! Each trigger is independent and best-effort. The controller runs every
//! registered trigger, logs each failure with the trigger's name and moves on.
//! `install` arms platform-scheduled triggers (at create and after task
//! removal); `fire` runs at teardown and task removal.

use hero_watch_protocol::RestartReason;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ResurrectionConfig;
use crate::error::Result;
use crate::scheduler::{Scheduler, Task};

pub const AGGRESSIVE_ALARM_KEY: &str = "aggressive_restart";
pub const IMMEDIATE_ALARM_KEY: &str = "immediate_restart";
pub const PRIMARY_ALARM_KEY: &str = "restart_service";
pub const BACKUP_ALARM_KEY: &str = "backup_restart_service";
pub const WATCHDOG_JOB_NAME: &str = "service_watchdog";

/// Starts the resident process, directly or through the restart receiver.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<()>;
    /// Hands a restart request to the separate restart receiver.
    fn broadcast(&self, reason: RestartReason) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmSpec {
    /// Alarms with the same key replace each other.
    pub key: &'static str,
    pub after: Duration,
    pub reason: RestartReason,
    pub repeat: Option<Duration>,
}

/// Platform alarms that outlive the process and deliver a restart request.
pub trait AlarmScheduler: Send + Sync {
    fn set_exact(&self, alarm: &AlarmSpec) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: &'static str,
    pub every: Duration,
    pub requires_network: bool,
}

pub trait JobScheduler: Send + Sync {
    fn enqueue_periodic(&self, job: &JobSpec) -> Result<()>;
}

pub trait RestartTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Arms whatever the platform keeps for us. `None` when there is nothing to arm.
    fn install(&self) -> Option<Result<()>> {
        None
    }

    /// Acts at teardown. `None` when the trigger only installs.
    fn fire(&self) -> Option<Result<()>> {
        None
    }
}

pub struct DirectRestart {
    launcher: Arc<dyn Launcher>,
}

impl DirectRestart {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }
}

impl RestartTrigger for DirectRestart {
    fn name(&self) -> &'static str {
        "direct_restart"
    }

    fn fire(&self) -> Option<Result<()>> {
        Some(self.launcher.launch())
    }
}

pub struct BroadcastRestart {
    launcher: Arc<dyn Launcher>,
}

impl BroadcastRestart {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }
}

impl RestartTrigger for BroadcastRestart {
    fn name(&self) -> &'static str {
        "broadcast_restart"
    }

    fn fire(&self) -> Option<Result<()>> {
        Some(self.launcher.broadcast(RestartReason::ImmediateRestart))
    }
}

/// Relaunch attempts on the process's own timer queue.
pub struct StaggeredRestart {
    scheduler: Arc<Scheduler>,
    delays: Vec<Duration>,
}

impl StaggeredRestart {
    pub fn new(scheduler: Arc<Scheduler>, delays: Vec<Duration>) -> Self {
        Self { scheduler, delays }
    }
}

impl RestartTrigger for StaggeredRestart {
    fn name(&self) -> &'static str {
        "staggered_restart"
    }

    fn fire(&self) -> Option<Result<()>> {
        let already = self
            .scheduler
            .pending(|task| matches!(task, Task::DelayedRestart { .. }));
        if already > 0 {
            debug!(already, "Delayed restarts already scheduled");
            return Some(Ok(()));
        }
        for delay in &self.delays {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.scheduler
                .post_delayed(*delay, Task::DelayedRestart { delay_ms });
        }
        Some(Ok(()))
    }
}

pub struct ShortHorizonAlarm {
    alarms: Arc<dyn AlarmScheduler>,
    short: Duration,
    immediate: Duration,
}

impl ShortHorizonAlarm {
    pub fn new(alarms: Arc<dyn AlarmScheduler>, short: Duration, immediate: Duration) -> Self {
        Self {
            alarms,
            short,
            immediate,
        }
    }
}

impl RestartTrigger for ShortHorizonAlarm {
    fn name(&self) -> &'static str {
        "short_horizon_alarm"
    }

    fn install(&self) -> Option<Result<()>> {
        Some(self.alarms.set_exact(&AlarmSpec {
            key: IMMEDIATE_ALARM_KEY,
            after: self.immediate,
            reason: RestartReason::ImmediateRestart,
            repeat: None,
        }))
    }

    fn fire(&self) -> Option<Result<()>> {
        Some(self.alarms.set_exact(&AlarmSpec {
            key: AGGRESSIVE_ALARM_KEY,
            after: self.short,
            reason: RestartReason::AggressiveRestart,
            repeat: None,
        }))
    }
}

pub struct PeriodicAlarms {
    alarms: Arc<dyn AlarmScheduler>,
    primary: Duration,
    backup: Duration,
}

impl PeriodicAlarms {
    pub fn new(alarms: Arc<dyn AlarmScheduler>, primary: Duration, backup: Duration) -> Self {
        Self {
            alarms,
            primary,
            backup,
        }
    }
}

impl RestartTrigger for PeriodicAlarms {
    fn name(&self) -> &'static str {
        "periodic_alarms"
    }

    fn install(&self) -> Option<Result<()>> {
        // The backup is armed even when the primary is rejected.
        let primary = self.alarms.set_exact(&AlarmSpec {
            key: PRIMARY_ALARM_KEY,
            after: self.primary,
            reason: RestartReason::RestartService,
            repeat: Some(self.primary),
        });
        let backup = self.alarms.set_exact(&AlarmSpec {
            key: BACKUP_ALARM_KEY,
            after: self.backup,
            reason: RestartReason::BackupRestart,
            repeat: Some(self.backup),
        });
        Some(primary.and(backup))
    }
}

pub struct WatchdogJob {
    jobs: Arc<dyn JobScheduler>,
    every: Duration,
}

impl WatchdogJob {
    pub fn new(jobs: Arc<dyn JobScheduler>, every: Duration) -> Self {
        Self { jobs, every }
    }
}

impl RestartTrigger for WatchdogJob {
    fn name(&self) -> &'static str {
        "watchdog_job"
    }

    fn install(&self) -> Option<Result<()>> {
        Some(self.jobs.enqueue_periodic(&JobSpec {
            name: WATCHDOG_JOB_NAME,
            every: self.every,
            requires_network: true,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAttempt {
    pub trigger: &'static str,
    pub outcome: std::result::Result<(), String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResurrectionReport {
    pub attempts: Vec<TriggerAttempt>,
}

impl ResurrectionReport {
    pub fn attempted(&self, trigger: &str) -> bool {
        self.attempts.iter().any(|attempt| attempt.trigger == trigger)
    }

    pub fn succeeded(&self) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome.is_ok())
            .count()
    }

    pub fn failed(&self) -> Vec<&'static str> {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome.is_err())
            .map(|attempt| attempt.trigger)
            .collect()
    }
}

pub struct ResurrectionController {
    launcher: Arc<dyn Launcher>,
    triggers: Vec<Arc<dyn RestartTrigger>>,
}

impl ResurrectionController {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            triggers: Vec::new(),
        }
    }

    /// Registers the full trigger set. Platform timers are left out when disabled.
    pub fn standard(
        launcher: Arc<dyn Launcher>,
        alarms: Arc<dyn AlarmScheduler>,
        jobs: Arc<dyn JobScheduler>,
        scheduler: Arc<Scheduler>,
        config: &ResurrectionConfig,
    ) -> Self {
        let mut controller = Self::new(Arc::clone(&launcher));
        controller.register(Arc::new(DirectRestart::new(Arc::clone(&launcher))));
        controller.register(Arc::new(BroadcastRestart::new(launcher)));
        controller.register(Arc::new(StaggeredRestart::new(
            scheduler,
            config.staggered_delays(),
        )));

        if config.platform_timers {
            controller.register(Arc::new(ShortHorizonAlarm::new(
                Arc::clone(&alarms),
                config.short_alarm(),
                config.immediate_alarm(),
            )));
            controller.register(Arc::new(PeriodicAlarms::new(
                alarms,
                config.primary_alarm(),
                config.backup_alarm(),
            )));
            controller.register(Arc::new(WatchdogJob::new(jobs, config.watchdog_interval())));
        } else {
            info!("Platform restart timers disabled by configuration");
        }
        controller
    }

    pub fn register(&mut self, trigger: Arc<dyn RestartTrigger>) {
        self.triggers.push(trigger);
    }

    pub fn trigger_names(&self) -> Vec<&'static str> {
        self.triggers.iter().map(|trigger| trigger.name()).collect()
    }

    pub fn install_all(&self) -> ResurrectionReport {
        self.run_phase("install", |trigger| trigger.install())
    }

    pub fn resurrect(&self) -> ResurrectionReport {
        self.run_phase("fire", |trigger| trigger.fire())
    }

    /// Runs one of the staggered relaunch attempts once its delay elapses.
    pub fn on_delayed_restart(&self, delay_ms: u64) -> Result<()> {
        match self.launcher.launch() {
            Ok(()) => {
                info!(delay_ms, "Delayed restart executed");
                Ok(())
            }
            Err(err) => {
                warn!(delay_ms, error = %err, "Delayed restart failed");
                Err(err)
            }
        }
    }

    fn run_phase(
        &self,
        phase: &'static str,
        run: impl Fn(&dyn RestartTrigger) -> Option<Result<()>>,
    ) -> ResurrectionReport {
        let mut report = ResurrectionReport::default();
        for trigger in &self.triggers {
            let Some(result) = run(trigger.as_ref()) else {
                continue;
            };
            let outcome = match result {
                Ok(()) => {
                    debug!(trigger = trigger.name(), phase, "Restart trigger succeeded");
                    Ok(())
                }
                Err(err) => {
                    warn!(trigger = trigger.name(), phase, error = %err, "Restart trigger failed");
                    Err(err.to_string())
                }
            };
            report.attempts.push(TriggerAttempt {
                trigger: trigger.name(),
                outcome,
            });
        }
        info!(
            phase,
            succeeded = report.succeeded(),
            failed = report.failed().len(),
            "Resurrection phase finished"
        );
        report
    }
}
