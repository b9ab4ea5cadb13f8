//! The long-lived resident process: lifecycle, scheduling loop and host surface.
//!
//! Lifecycle callbacks (`on_create`, `on_start`, `on_task_removed`,
//! `on_destroy`) may arrive from the control socket threads; timer tasks and
//! inbox messages are handled on the scheduling thread in [`ResidentProcess::run`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::alert::{AlertDispatcher, AlertPolicy, DispatchOutcome, SilenceReport};
use crate::clock::Clock;
use crate::config::WatchConfig;
use crate::effects::{
    ActiveEffects, Effects, Notification, NotificationChannel, WakeKind, STATUS_CHANNEL_ID,
    STATUS_NOTIFICATION_ID,
};
use crate::identity::{CookieSource, PersistentIdentityStore, SessionIdentity};
use crate::instance::InstanceLock;
use crate::poller::{OrderEndpoint, OrderPoller};
use crate::resurrection::{
    AlarmScheduler, JobScheduler, Launcher, ResurrectionController, ResurrectionReport,
};
use crate::scheduler::{Executor, Message, Scheduler, Task};

pub const STATUS_TITLE: &str = "ZooBox Hero Driver";

pub fn status_text(connected: bool) -> String {
    format!(
        "Active Monitoring - Orders: {}",
        if connected { "Connected" } else { "Connecting" }
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Created,
    Started,
    TaskRemoved,
    Destroyed,
}

/// Everything the resident process is wired with.
pub struct ResidentDeps {
    pub config: WatchConfig,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<PersistentIdentityStore>,
    pub session: Arc<SessionIdentity>,
    pub cookies: Arc<dyn CookieSource>,
    pub endpoint: Arc<dyn OrderEndpoint>,
    pub executor: Arc<dyn Executor>,
    pub effects: Effects,
    pub launcher: Arc<dyn Launcher>,
    pub alarms: Arc<dyn AlarmScheduler>,
    pub jobs: Arc<dyn JobScheduler>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub running: bool,
    pub lifecycle: Lifecycle,
    pub pid: u32,
    pub version: String,
    pub restart_count: u64,
    pub session_present: bool,
    pub foreground: bool,
    pub alert_active: bool,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_alert_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRemovedReport {
    pub fired: ResurrectionReport,
    pub reinstalled: ResurrectionReport,
}

pub struct ResidentProcess {
    scheduler: Arc<Scheduler>,
    poller: OrderPoller,
    alerts: AlertDispatcher,
    resurrection: ResurrectionController,
    effects: Effects,
    store: Arc<PersistentIdentityStore>,
    session: Arc<SessionIdentity>,
    running: AtomicBool,
    foreground: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    instance_lock: Mutex<Option<InstanceLock>>,
    started_at: DateTime<Utc>,
}

impl ResidentProcess {
    pub fn new(deps: ResidentDeps) -> (Self, Receiver<Message>) {
        let (scheduler, inbox) = Scheduler::new(deps.clock);
        let poller = OrderPoller::new(
            deps.endpoint,
            deps.executor,
            Arc::clone(&scheduler),
            Arc::clone(&deps.session),
            Arc::clone(&deps.store),
            deps.cookies,
            deps.config.polling.interval(),
        );
        let alerts = AlertDispatcher::new(
            AlertPolicy::from_config(&deps.config.endpoint, &deps.config.alerts),
            deps.effects.clone(),
            Arc::new(ActiveEffects::new()),
            Arc::clone(&scheduler),
        );
        let resurrection = ResurrectionController::standard(
            deps.launcher,
            deps.alarms,
            deps.jobs,
            Arc::clone(&scheduler),
            &deps.config.resurrection,
        );
        let started_at = scheduler.now();

        let process = Self {
            scheduler,
            poller,
            alerts,
            resurrection,
            effects: deps.effects,
            store: deps.store,
            session: deps.session,
            running: AtomicBool::new(false),
            foreground: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Idle),
            instance_lock: Mutex::new(None),
            started_at,
        };
        (process, inbox)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn poller(&self) -> &OrderPoller {
        &self.poller
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle_guard()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Keeps `lock` until teardown, then releases it for the replacement instance.
    pub fn hold_instance_lock(&self, lock: InstanceLock) {
        *self
            .instance_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(lock);
    }

    pub fn holds_instance_lock(&self) -> bool {
        self.instance_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn on_create(&self) {
        {
            let mut lifecycle = self.lifecycle_guard();
            if *lifecycle != Lifecycle::Idle {
                debug!(lifecycle = ?*lifecycle, "Create ignored; already created");
                return;
            }
            *lifecycle = Lifecycle::Created;
        }
        self.running.store(true, Ordering::SeqCst);
        info!("Resident process created");

        for channel in [NotificationChannel::status(), NotificationChannel::orders()] {
            if let Err(err) = self.effects.notifier.create_channel(&channel) {
                warn!(channel = channel.id, error = %err, "Failed to create notification channel");
            }
        }
        if let Err(err) = self.effects.wake.acquire(WakeKind::Partial, None) {
            warn!(error = %err, "Failed to acquire partial wake lock");
        }
        self.resurrection.install_all();
    }

    /// Enters Started. Repeatable; each call leaves exactly one tick chain.
    pub fn on_start(&self) {
        match self.lifecycle() {
            Lifecycle::Destroyed => {
                warn!("Start ignored; resident process already destroyed");
                return;
            }
            Lifecycle::Idle => self.on_create(),
            _ => {}
        }
        *self.lifecycle_guard() = Lifecycle::Started;
        self.running.store(true, Ordering::SeqCst);

        if !self.session.is_present() {
            match self.store.driver_id() {
                Ok(Some(driver_id)) => {
                    info!("Recovered session identifier from durable storage");
                    self.session.set(Some(&driver_id));
                }
                Ok(None) => debug!("No session identifier yet"),
                Err(err) => warn!(error = %err, "Failed to read durable session identifier"),
            }
        }

        self.post_status_notification();
        self.poller.start();
        info!(
            session_present = self.session.is_present(),
            "Resident process started"
        );
    }

    pub fn on_task_removed(&self) -> TaskRemovedReport {
        if self.lifecycle() == Lifecycle::Destroyed {
            return TaskRemovedReport::default();
        }
        *self.lifecycle_guard() = Lifecycle::TaskRemoved;
        self.running.store(false, Ordering::SeqCst);
        info!("Task removed; firing restart triggers");

        let fired = self.resurrection.resurrect();
        let reinstalled = self.resurrection.install_all();
        TaskRemovedReport { fired, reinstalled }
    }

    /// Terminal teardown. Returns `None` if already destroyed.
    pub fn on_destroy(&self) -> Option<ResurrectionReport> {
        {
            let mut lifecycle = self.lifecycle_guard();
            if *lifecycle == Lifecycle::Destroyed {
                return None;
            }
            *lifecycle = Lifecycle::Destroyed;
        }
        self.running.store(false, Ordering::SeqCst);

        match self.store.increment_restart_count() {
            Ok(count) => info!(restart_count = count, "Resident process destroyed"),
            Err(err) => warn!(error = %err, "Failed to persist restart count"),
        }

        self.poller.stop();
        self.alerts.release_all();
        if let Err(err) = self.effects.wake.release(WakeKind::Partial) {
            warn!(error = %err, "Failed to release partial wake lock");
        }
        if let Err(err) = self.effects.notifier.cancel(STATUS_NOTIFICATION_ID) {
            debug!(error = %err, "Failed to cancel status notification");
        }
        self.instance_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        Some(self.resurrection.resurrect())
    }

    /// Sets the current session identifier and mirrors it to durable storage.
    pub fn set_session_identifier(&self, driver_id: &str) {
        self.session.set(Some(driver_id));
        if let Err(err) = self.store.set_driver_id(driver_id) {
            warn!(error = %err, "Failed to persist session identifier");
        }
        debug!("Session identifier updated");
        if self.lifecycle() == Lifecycle::Started {
            self.post_status_notification();
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
        debug!(foreground, "Host UI foreground state changed");
    }

    pub fn silence(&self) -> SilenceReport {
        self.alerts.silence()
    }

    /// Silences only while the host UI is foregrounded. `None` means the key was not consumed.
    pub fn volume_key(&self) -> Option<SilenceReport> {
        if !self.is_foreground() {
            debug!("Volume key ignored; host UI not in foreground");
            return None;
        }
        Some(self.alerts.silence())
    }

    pub fn handle_message(&self, message: Message) {
        match message {
            Message::PollCompleted {
                generation,
                outcome,
            } => {
                let Some(signal) = self.poller.on_completed(generation, outcome) else {
                    return;
                };
                if self.lifecycle() == Lifecycle::Destroyed {
                    debug!("Dropping order signal after teardown");
                    return;
                }
                if let DispatchOutcome::Alerted(report) = self.alerts.dispatch(&signal) {
                    debug!(?report, "Alert sequence started");
                }
            }
            Message::SoundFinished { alert_id, end } => {
                self.alerts.on_sound_finished(alert_id, end);
            }
            Message::Wake => {}
            Message::Shutdown => {
                self.on_destroy();
            }
        }
    }

    pub fn run_due_tasks(&self) {
        while let Some(task) = self.scheduler.take_due() {
            match task {
                Task::PollTick => {
                    if self.lifecycle() == Lifecycle::Destroyed {
                        continue;
                    }
                    let report = self.poller.on_tick();
                    debug!(?report, "Poll tick");
                }
                Task::AlertExpiry { alert_id } => self.alerts.on_alert_expired(alert_id),
                Task::ScreenWakeRelease { alert_id } => {
                    self.alerts.on_screen_wake_expired(alert_id)
                }
                Task::NotificationTimeout { id } => self.alerts.on_notification_timeout(id),
                Task::DelayedRestart { delay_ms } => {
                    let _ = self.resurrection.on_delayed_restart(delay_ms);
                }
            }
        }
    }

    /// Runs the scheduling loop until teardown has drained its delayed restarts.
    pub fn run(&self, inbox: Receiver<Message>) {
        loop {
            self.run_due_tasks();

            if self.lifecycle() == Lifecycle::Destroyed && self.scheduler.next_due().is_none() {
                info!("Scheduling loop finished");
                return;
            }

            let received = match self.scheduler.time_until_next() {
                Some(wait) => match inbox.recv_timeout(wait) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match inbox.recv() {
                    Ok(message) => Some(message),
                    Err(_) => return,
                },
            };

            if let Some(message) = received {
                self.handle_message(message);
            }
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let record = self.store.load().unwrap_or_default();
        HealthSnapshot {
            running: self.is_running(),
            lifecycle: self.lifecycle(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            restart_count: record.service_restart_count,
            session_present: self.session.is_present(),
            foreground: self.is_foreground(),
            alert_active: !self.alerts.active().is_idle(),
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            last_alert_at: self
                .alerts
                .last_alert_at()
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            last_poll_at: record.last_poll_at,
        }
    }

    fn post_status_notification(&self) {
        if let Err(err) = self.effects.notifier.cancel(STATUS_NOTIFICATION_ID) {
            debug!(error = %err, "Failed to cancel previous status notification");
        }
        let notification = Notification {
            channel_id: STATUS_CHANNEL_ID,
            title: STATUS_TITLE.to_string(),
            body: status_text(self.session.is_present()),
            deep_link: None,
            ongoing: true,
            colorized: false,
            alarm_category: false,
            timeout: None,
        };
        if let Err(err) = self
            .effects
            .notifier
            .post(STATUS_NOTIFICATION_ID, &notification)
        {
            warn!(error = %err, "Failed to post status notification");
        }
    }

    fn lifecycle_guard(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::ORDER_CHANNEL_ID;
    use crate::testing::ResidentHarness;

    #[test]
    fn create_prepares_channels_wake_lock_and_timers() {
        let h = ResidentHarness::new();
        h.process.on_create();

        let channels = h.effects.notifier.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].id, ORDER_CHANNEL_ID);
        assert!(channels[1].bypass_dnd);
        assert!(h.effects.wake.is_held_now(WakeKind::Partial));
        assert_eq!(h.alarms.alarms().len(), 3);
        assert_eq!(h.jobs.jobs().len(), 1);
        assert!(h.process.is_running());
        assert_eq!(h.process.lifecycle(), Lifecycle::Created);
    }

    #[test]
    fn start_posts_status_and_recovers_identity() {
        let h = ResidentHarness::new();
        h.store.set_driver_id("driver-1").expect("seed");
        h.process.on_start();

        assert_eq!(h.session.get(), Some("driver-1".to_string()));
        let status = h.effects.notifier.last_posted(STATUS_NOTIFICATION_ID).expect("status");
        assert_eq!(status.body, "Active Monitoring - Orders: Connected");
        assert!(status.ongoing);
        assert_eq!(h.process.lifecycle(), Lifecycle::Started);
    }

    #[test]
    fn status_text_reflects_missing_identity() {
        let h = ResidentHarness::new();
        h.process.on_start();
        let status = h.effects.notifier.last_posted(STATUS_NOTIFICATION_ID).expect("status");
        assert_eq!(status.body, status_text(false));
    }

    #[test]
    fn duplicate_start_keeps_one_tick_chain() {
        let h = ResidentHarness::new();
        h.process.on_start();
        h.process.on_start();
        assert_eq!(h.process.poller().scheduled_ticks(), 1);
        assert_eq!(h.effects.wake.acquisitions(WakeKind::Partial), 1);
    }

    #[test]
    fn volume_key_only_silences_in_foreground() {
        let h = ResidentHarness::new();
        h.process.on_start();
        assert!(h.process.volume_key().is_none());
        assert!(h.effects.feedback.messages().is_empty());

        h.process.set_foreground(true);
        assert!(h.process.volume_key().is_some());
        assert_eq!(h.effects.feedback.messages().len(), 1);
    }

    #[test]
    fn set_session_identifier_is_mirrored_to_store() {
        let h = ResidentHarness::new();
        h.process.set_session_identifier("driver-88");
        assert_eq!(h.session.get(), Some("driver-88".to_string()));
        assert_eq!(h.store.driver_id().expect("read"), Some("driver-88".to_string()));
    }

    #[test]
    fn destroy_is_terminal_and_counted_once() {
        let h = ResidentHarness::new();
        h.process.on_start();

        assert!(h.process.on_destroy().is_some());
        assert!(h.process.on_destroy().is_none());
        assert_eq!(h.store.restart_count().expect("count"), 1);
        assert!(!h.process.is_running());
        assert!(!h.effects.wake.is_held_now(WakeKind::Partial));

        h.process.on_start();
        assert_eq!(h.process.lifecycle(), Lifecycle::Destroyed);
        assert_eq!(h.process.poller().scheduled_ticks(), 0);
    }

    #[test]
    fn destroy_hands_instance_lock_to_replacement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("watch.lock");
        let h = ResidentHarness::new();
        h.process
            .hold_instance_lock(InstanceLock::try_acquire(&path).expect("lock").expect("free"));
        h.process.on_start();

        assert!(InstanceLock::try_acquire(&path).expect("lock").is_none());
        h.process.on_destroy();
        assert!(!h.process.holds_instance_lock());
        assert!(InstanceLock::try_acquire(&path).expect("lock").is_some());
    }

    #[test]
    fn health_reports_lifecycle_and_counters() {
        let h = ResidentHarness::new();
        h.process.on_start();
        h.process.set_session_identifier("d");

        let health = h.process.health();
        assert!(health.running);
        assert_eq!(health.lifecycle, Lifecycle::Started);
        assert!(health.session_present);
        assert_eq!(health.restart_count, 0);
        assert!(!health.alert_active);

        let json = serde_json::to_value(&health).expect("serialize");
        assert_eq!(json["lifecycle"], "started");
    }
}
