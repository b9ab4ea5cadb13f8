//! The locked-device alert sequence for a pending-order signal.
//!
//! Effects run in a fixed order (screen wake, vibration, sound, notification)
//! and each is guarded on its own: a failure is logged and the next effect
//! still runs. Sound and vibration share one auto-stop timer; the screen wake
//! and each order notification have their own release timers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AlertConfig, EndpointConfig, RingerMode};
use crate::effects::{
    ActiveEffects, ActiveSound, Effects, Notification, SoundEnd, WakeKind,
    ORDER_CHANNEL_ID, ORDER_NOTIFICATION_BASE_ID,
};
use crate::poller::PendingOrderSignal;
use crate::scheduler::{Message, Scheduler, Task};

pub const ALERT_TITLE: &str = "NEW ORDER ALERT!";
pub const SILENCED_TEXT: &str = "Notification silenced";

/// Off/on timings in milliseconds; repeated to fill the effect bound.
pub const VIBRATION_PATTERN: [u64; 10] = [0, 800, 200, 800, 200, 1200, 300, 800, 200, 800];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPolicy {
    pub rate_limit: Duration,
    pub effect_bound: Duration,
    pub notification_timeout: Duration,
    pub orders_url: String,
}

impl AlertPolicy {
    pub fn from_config(endpoint: &EndpointConfig, alerts: &AlertConfig) -> Self {
        Self {
            rate_limit: alerts.rate_limit(),
            effect_bound: alerts.effect_bound(),
            notification_timeout: alerts.notification_timeout(),
            orders_url: endpoint.orders_url.clone(),
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from_config(&EndpointConfig::default(), &AlertConfig::default())
    }
}

/// Builds the vibration waveform: the base pattern repeated as many whole
/// times as fit in `bound`, and at least once.
pub fn vibration_waveform(bound: Duration) -> Vec<u64> {
    let cycle: u64 = VIBRATION_PATTERN.iter().sum();
    let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    let repeats = (bound_ms / cycle).max(1) as usize;
    VIBRATION_PATTERN.repeat(repeats)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertReport {
    pub alert_id: u64,
    pub notification_id: u32,
    pub screen_wake: bool,
    pub vibration: bool,
    pub sound: bool,
    pub notification: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Dropped by the rate limit; `since_last` is the gap to the previous alert.
    Suppressed { since_last: Duration },
    Alerted(AlertReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SilenceReport {
    pub sound_stopped: bool,
    pub vibration_cancelled: bool,
    pub timer_cancelled: bool,
}

impl SilenceReport {
    pub fn changed_anything(&self) -> bool {
        self.sound_stopped || self.vibration_cancelled || self.timer_cancelled
    }
}

pub struct AlertDispatcher {
    policy: AlertPolicy,
    effects: Effects,
    active: Arc<ActiveEffects>,
    scheduler: Arc<Scheduler>,
    last_alert_at: Mutex<Option<DateTime<Utc>>>,
    next_alert_id: AtomicU64,
    notification_seq: AtomicU32,
}

impl AlertDispatcher {
    pub fn new(
        policy: AlertPolicy,
        effects: Effects,
        active: Arc<ActiveEffects>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            policy,
            effects,
            active,
            scheduler,
            last_alert_at: Mutex::new(None),
            next_alert_id: AtomicU64::new(0),
            notification_seq: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    pub fn active(&self) -> &Arc<ActiveEffects> {
        &self.active
    }

    pub fn last_alert_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_alert_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn deep_link(&self, tab: &str) -> String {
        format!("{}?tab={}", self.policy.orders_url, tab)
    }

    pub fn dispatch(&self, signal: &PendingOrderSignal) -> DispatchOutcome {
        let now = self.scheduler.now();
        {
            let mut last = self
                .last_alert_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = *last {
                let since_last = (now - previous).to_std().unwrap_or(Duration::ZERO);
                if since_last < self.policy.rate_limit {
                    debug!(
                        since_last_ms = since_last.as_millis() as u64,
                        "Alert suppressed by rate limit"
                    );
                    return DispatchOutcome::Suppressed { since_last };
                }
            }
            *last = Some(now);
        }

        let alert_id = self.next_alert_id.fetch_add(1, Ordering::SeqCst) + 1;
        let sequence = self.notification_seq.fetch_add(1, Ordering::SeqCst);
        let notification_id = ORDER_NOTIFICATION_BASE_ID.wrapping_add(sequence);
        info!(alert_id, message = %signal.message, tab = %signal.tab, "Raising order alert");

        self.effects.feedback.show(&signal.message);

        let screen_wake = self.start_screen_wake(alert_id);
        let vibration = self.start_vibration(alert_id);
        let sound = self.start_sound(alert_id);
        if vibration || sound {
            self.arm_expiry(alert_id);
        }
        let notification = self.post_notification(signal, notification_id);

        DispatchOutcome::Alerted(AlertReport {
            alert_id,
            notification_id,
            screen_wake,
            vibration,
            sound,
            notification,
        })
    }

    /// Stops sound and vibration and cancels the auto-stop timer.
    pub fn silence(&self) -> SilenceReport {
        let (sound, vibration, timer) = {
            let mut slots = self.active.lock();
            (
                slots.sound.take(),
                slots.vibration.take(),
                slots.expiry_timer.take(),
            )
        };

        let mut report = SilenceReport::default();
        if let Some(sound) = sound {
            self.stop_sound(sound);
            report.sound_stopped = true;
        }
        if vibration.is_some() {
            self.cancel_vibration();
            report.vibration_cancelled = true;
        }
        if let Some((_, task)) = timer {
            report.timer_cancelled = self.scheduler.cancel(task);
        }

        self.effects.feedback.show(SILENCED_TEXT);
        if report.changed_anything() {
            info!(?report, "Order alert silenced");
        } else {
            debug!("Silence requested with no active alert");
        }
        report
    }

    pub fn on_sound_finished(&self, alert_id: u64, end: SoundEnd) {
        let finished = {
            let mut slots = self.active.lock();
            match &slots.sound {
                Some(active) if active.alert_id == alert_id => slots.sound.take(),
                _ => None,
            }
        };

        match (&end, finished) {
            (SoundEnd::Completed, Some(sound)) => {
                debug!(alert_id, "Alert sound completed");
                self.release_sound(sound);
            }
            (SoundEnd::Failed(details), Some(sound)) => {
                warn!(alert_id, error = %details, "Alert sound failed during playback");
                self.release_sound(sound);
            }
            (_, None) => debug!(alert_id, "Ignoring completion for a sound already released"),
        }
    }

    /// Auto-stop at the effect bound.
    pub fn on_alert_expired(&self, alert_id: u64) {
        let (sound, vibration) = {
            let mut slots = self.active.lock();
            if matches!(slots.expiry_timer, Some((id, _)) if id == alert_id) {
                slots.expiry_timer = None;
            }
            let sound = match &slots.sound {
                Some(active) if active.alert_id == alert_id => slots.sound.take(),
                _ => None,
            };
            let vibration = if slots.vibration == Some(alert_id) {
                slots.vibration.take()
            } else {
                None
            };
            (sound, vibration)
        };

        if let Some(sound) = sound {
            self.stop_sound(sound);
        }
        if vibration.is_some() {
            self.cancel_vibration();
        }
        debug!(alert_id, "Alert effects reached their bound");
    }

    pub fn on_screen_wake_expired(&self, alert_id: u64) {
        let held = {
            let mut slots = self.active.lock();
            match slots.screen_wake {
                Some((id, _)) if id == alert_id => slots.screen_wake.take(),
                _ => None,
            }
        };
        if held.is_some() {
            self.release_screen_wake();
        }
    }

    /// Dismisses an order notification at its timeout.
    pub fn on_notification_timeout(&self, id: u32) {
        let pending = {
            let mut slots = self.active.lock();
            let before = slots.notification_timers.len();
            slots.notification_timers.retain(|(posted, _)| *posted != id);
            slots.notification_timers.len() != before
        };
        if !pending {
            return;
        }
        self.dismiss_notification(id);
        debug!(notification_id = id, "Order notification reached its timeout");
    }

    /// Releases every effect, dismisses order notifications and cancels all timers. Used at teardown.
    pub fn release_all(&self) {
        let (sound, vibration, timer, screen_wake, notifications) = {
            let mut slots = self.active.lock();
            (
                slots.sound.take(),
                slots.vibration.take(),
                slots.expiry_timer.take(),
                slots.screen_wake.take(),
                std::mem::take(&mut slots.notification_timers),
            )
        };

        if let Some((_, task)) = timer {
            self.scheduler.cancel(task);
        }
        if let Some(sound) = sound {
            self.stop_sound(sound);
        }
        if vibration.is_some() {
            self.cancel_vibration();
        }
        if let Some((_, task)) = screen_wake {
            self.scheduler.cancel(task);
            self.release_screen_wake();
        }
        for (id, task) in notifications {
            self.scheduler.cancel(task);
            self.dismiss_notification(id);
        }
    }

    fn start_screen_wake(&self, alert_id: u64) -> bool {
        let previous = self.active.lock().screen_wake.take();
        if let Some((_, task)) = previous {
            self.scheduler.cancel(task);
            self.release_screen_wake();
        }

        let bound = self.policy.effect_bound;
        if let Err(err) = self.effects.wake.acquire(WakeKind::Screen, Some(bound)) {
            warn!(alert_id, error = %err, "Failed to acquire screen wake");
            return false;
        }
        let task = self
            .scheduler
            .post_delayed(bound, Task::ScreenWakeRelease { alert_id });
        self.active.lock().screen_wake = Some((alert_id, task));
        true
    }

    fn start_vibration(&self, alert_id: u64) -> bool {
        let previous = self.active.lock().vibration.take();
        if previous.is_some() {
            self.cancel_vibration();
        }

        let waveform = vibration_waveform(self.policy.effect_bound);
        match self.effects.vibrator.vibrate(&waveform) {
            Ok(()) => {
                self.active.lock().vibration = Some(alert_id);
                true
            }
            Err(err) => {
                warn!(alert_id, error = %err, "Failed to start vibration");
                false
            }
        }
    }

    fn start_sound(&self, alert_id: u64) -> bool {
        let previous = self.active.lock().sound.take();
        if let Some(sound) = previous {
            self.stop_sound(sound);
        }

        if self.effects.audio.ringer_mode() == RingerMode::Silent {
            debug!(alert_id, "Ringer is silent; skipping alert sound");
            return false;
        }

        let scheduler = Arc::clone(&self.scheduler);
        let on_end = Box::new(move |end: SoundEnd| {
            scheduler.post(Message::SoundFinished { alert_id, end });
        });
        match self.effects.sound.play(on_end) {
            Ok(handle) => {
                self.active.lock().sound = Some(ActiveSound { alert_id, handle });
                true
            }
            Err(err) => {
                warn!(alert_id, error = %err, "Failed to start alert sound");
                false
            }
        }
    }

    fn arm_expiry(&self, alert_id: u64) {
        let previous = self.active.lock().expiry_timer.take();
        if let Some((_, task)) = previous {
            self.scheduler.cancel(task);
        }
        let task = self
            .scheduler
            .post_delayed(self.policy.effect_bound, Task::AlertExpiry { alert_id });
        self.active.lock().expiry_timer = Some((alert_id, task));
    }

    fn post_notification(&self, signal: &PendingOrderSignal, id: u32) -> bool {
        let notification = Notification {
            channel_id: ORDER_CHANNEL_ID,
            title: ALERT_TITLE.to_string(),
            body: signal.message.clone(),
            deep_link: Some(self.deep_link(&signal.tab)),
            ongoing: false,
            colorized: true,
            alarm_category: true,
            timeout: Some(self.policy.notification_timeout),
        };
        match self.effects.notifier.post(id, &notification) {
            Ok(()) => {
                let task = self.scheduler.post_delayed(
                    self.policy.notification_timeout,
                    Task::NotificationTimeout { id },
                );
                self.active.lock().notification_timers.push((id, task));
                true
            }
            Err(err) => {
                warn!(notification_id = id, error = %err, "Failed to post order notification");
                false
            }
        }
    }

    fn stop_sound(&self, mut sound: ActiveSound) {
        if sound.handle.is_playing() {
            if let Err(err) = sound.handle.stop() {
                warn!(alert_id = sound.alert_id, error = %err, "Failed to stop alert sound");
            }
        }
        self.release_sound(sound);
    }

    fn release_sound(&self, mut sound: ActiveSound) {
        if let Err(err) = sound.handle.release() {
            warn!(alert_id = sound.alert_id, error = %err, "Failed to release alert sound");
        }
    }

    fn cancel_vibration(&self) {
        if let Err(err) = self.effects.vibrator.cancel() {
            warn!(error = %err, "Failed to cancel vibration");
        }
    }

    fn dismiss_notification(&self, id: u32) {
        if let Err(err) = self.effects.notifier.cancel(id) {
            warn!(notification_id = id, error = %err, "Failed to dismiss order notification");
        }
    }

    fn release_screen_wake(&self) {
        if let Err(err) = self.effects.wake.release(WakeKind::Screen) {
            warn!(error = %err, "Failed to release screen wake");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EffectsRig, TestRig};
    use chrono::Duration as ChronoDuration;

    fn signal(message: &str, tab: &str) -> PendingOrderSignal {
        PendingOrderSignal {
            message: message.to_string(),
            tab: tab.to_string(),
        }
    }

    fn dispatcher(rig: &TestRig, effects: &EffectsRig) -> AlertDispatcher {
        AlertDispatcher::new(
            AlertPolicy::default(),
            effects.effects(),
            Arc::new(ActiveEffects::new()),
            Arc::clone(&rig.scheduler),
        )
    }

    #[test]
    fn waveform_fills_bound_with_whole_cycles() {
        let waveform = vibration_waveform(Duration::from_secs(30));
        assert_eq!(waveform.len(), VIBRATION_PATTERN.len() * 5);
        assert_eq!(&waveform[..10], &VIBRATION_PATTERN);
        assert!(waveform.iter().sum::<u64>() <= 30_000);

        assert_eq!(vibration_waveform(Duration::from_secs(1)), VIBRATION_PATTERN.to_vec());
    }

    #[test]
    fn rate_limit_scenario_alerts_at_zero_and_sixty_five() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);

        let first = dispatcher.dispatch(&signal("New order", "food"));
        assert!(matches!(first, DispatchOutcome::Alerted(_)));

        rig.advance(ChronoDuration::seconds(10));
        assert_eq!(
            dispatcher.dispatch(&signal("New order", "food")),
            DispatchOutcome::Suppressed {
                since_last: Duration::from_secs(10)
            }
        );

        rig.advance(ChronoDuration::seconds(55));
        assert!(matches!(
            dispatcher.dispatch(&signal("New order", "food")),
            DispatchOutcome::Alerted(_)
        ));

        let posted = effects.notifier.posted();
        assert_eq!(posted.len(), 2);
        assert_ne!(posted[0].0, posted[1].0);
        assert_eq!(
            posted[0].1.deep_link.as_deref(),
            Some("https://mikmik.site/heroes/pending_orders.php?tab=food")
        );
        assert_eq!(posted[0].1.title, ALERT_TITLE);
        assert_eq!(posted[0].1.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn exactly_one_window_later_alerts_again() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);

        dispatcher.dispatch(&signal("a", "food"));
        rig.advance(ChronoDuration::seconds(60));
        assert!(matches!(
            dispatcher.dispatch(&signal("b", "food")),
            DispatchOutcome::Alerted(_)
        ));
    }

    #[test]
    fn alert_runs_every_effect_and_shows_message() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);

        let DispatchOutcome::Alerted(report) = dispatcher.dispatch(&signal("Order #12", "grocery"))
        else {
            panic!("expected alert");
        };
        assert!(report.screen_wake && report.vibration && report.sound && report.notification);
        assert_eq!(report.notification_id, ORDER_NOTIFICATION_BASE_ID);
        assert_eq!(effects.feedback.messages(), vec!["Order #12".to_string()]);
        assert!(effects.wake.is_held_now(WakeKind::Screen));
        assert_eq!(effects.vibrator.patterns().len(), 1);
        assert_eq!(effects.sound.live_handles(), 1);
        assert_eq!(effects.notifier.posted()[0].1.body, "Order #12");
    }

    #[test]
    fn one_failing_effect_does_not_block_the_rest() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        effects.wake.fail_acquire(true);
        effects.vibrator.fail(true);
        let dispatcher = dispatcher(&rig, &effects);

        let DispatchOutcome::Alerted(report) = dispatcher.dispatch(&signal("x", "food")) else {
            panic!("expected alert");
        };
        assert!(!report.screen_wake);
        assert!(!report.vibration);
        assert!(report.sound);
        assert!(report.notification);
    }

    #[test]
    fn silent_ringer_skips_sound_only() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        effects.audio.set(RingerMode::Silent);
        let dispatcher = dispatcher(&rig, &effects);

        let DispatchOutcome::Alerted(report) = dispatcher.dispatch(&signal("x", "food")) else {
            panic!("expected alert");
        };
        assert!(!report.sound);
        assert!(report.vibration);
        assert_eq!(effects.sound.plays(), 0);
    }

    #[test]
    fn silence_is_idempotent_and_releases_effects() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);
        dispatcher.dispatch(&signal("x", "food"));

        let first = dispatcher.silence();
        assert!(first.sound_stopped && first.vibration_cancelled && first.timer_cancelled);
        let second = dispatcher.silence();
        assert!(!second.changed_anything());

        assert_eq!(effects.sound.live_handles(), 0);
        assert_eq!(effects.vibrator.cancels(), 1);
        assert_eq!(rig.scheduler.pending(|task| matches!(task, Task::AlertExpiry { .. })), 0);
        assert_eq!(
            effects.feedback.messages(),
            vec!["x".to_string(), SILENCED_TEXT.to_string(), SILENCED_TEXT.to_string()]
        );
    }

    #[test]
    fn effects_stop_at_bound_and_screen_wake_is_released() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);
        dispatcher.dispatch(&signal("x", "food"));

        rig.advance(ChronoDuration::seconds(30));
        while let Some(task) = rig.scheduler.take_due() {
            match task {
                Task::AlertExpiry { alert_id } => dispatcher.on_alert_expired(alert_id),
                Task::ScreenWakeRelease { alert_id } => dispatcher.on_screen_wake_expired(alert_id),
                other => panic!("unexpected task {:?}", other),
            }
        }

        assert!(dispatcher.active().is_idle());
        assert_eq!(effects.sound.live_handles(), 0);
        assert_eq!(effects.vibrator.cancels(), 1);
        assert!(!effects.wake.is_held_now(WakeKind::Screen));
    }

    #[test]
    fn natural_sound_completion_releases_handle() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);
        dispatcher.dispatch(&signal("x", "food"));

        effects.sound.finish_all(SoundEnd::Completed);
        for message in rig.drain_inbox() {
            if let Message::SoundFinished { alert_id, end } = message {
                dispatcher.on_sound_finished(alert_id, end);
            }
        }
        assert!(!dispatcher.active().sound_active());
        assert_eq!(effects.sound.live_handles(), 0);
        assert_eq!(effects.sound.stops(), 0);
    }

    #[test]
    fn release_all_leaves_nothing_held() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);
        dispatcher.dispatch(&signal("x", "food"));

        dispatcher.release_all();
        assert!(dispatcher.active().is_idle());
        assert_eq!(rig.scheduler.next_due(), None);
        assert_eq!(effects.sound.live_handles(), 0);
        assert!(!effects.wake.is_held_now(WakeKind::Screen));
        assert_eq!(effects.notifier.cancelled(), vec![ORDER_NOTIFICATION_BASE_ID]);
    }

    fn run_due(rig: &TestRig, dispatcher: &AlertDispatcher) {
        while let Some(task) = rig.scheduler.take_due() {
            match task {
                Task::AlertExpiry { alert_id } => dispatcher.on_alert_expired(alert_id),
                Task::ScreenWakeRelease { alert_id } => dispatcher.on_screen_wake_expired(alert_id),
                Task::NotificationTimeout { id } => dispatcher.on_notification_timeout(id),
                other => panic!("unexpected task {:?}", other),
            }
        }
    }

    #[test]
    fn order_notification_is_dismissed_at_its_timeout() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = dispatcher(&rig, &effects);
        let DispatchOutcome::Alerted(report) = dispatcher.dispatch(&signal("x", "food")) else {
            panic!("expected alert");
        };

        rig.advance(ChronoDuration::seconds(59));
        run_due(&rig, &dispatcher);
        assert!(effects.notifier.cancelled().is_empty());

        rig.advance(ChronoDuration::seconds(1));
        run_due(&rig, &dispatcher);
        assert_eq!(effects.notifier.cancelled(), vec![report.notification_id]);
        assert!(dispatcher.active().lock().notification_timers.is_empty());
        assert_eq!(rig.scheduler.next_due(), None);

        dispatcher.on_notification_timeout(report.notification_id);
        assert_eq!(effects.notifier.cancelled().len(), 1);
    }

    #[test]
    fn failed_post_arms_no_dismissal() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        effects.notifier.fail(true);
        let dispatcher = dispatcher(&rig, &effects);
        dispatcher.dispatch(&signal("x", "food"));

        assert_eq!(
            rig.scheduler
                .pending(|task| matches!(task, Task::NotificationTimeout { .. })),
            0
        );
    }

    #[test]
    fn silent_ringer_still_stops_the_previous_sound() {
        let rig = TestRig::new();
        let effects = EffectsRig::new();
        let dispatcher = AlertDispatcher::new(
            AlertPolicy {
                rate_limit: Duration::from_secs(5),
                ..AlertPolicy::default()
            },
            effects.effects(),
            Arc::new(ActiveEffects::new()),
            Arc::clone(&rig.scheduler),
        );
        dispatcher.dispatch(&signal("first", "food"));
        assert_eq!(effects.sound.live_handles(), 1);

        effects.audio.set(RingerMode::Silent);
        rig.advance(ChronoDuration::seconds(10));
        let DispatchOutcome::Alerted(report) = dispatcher.dispatch(&signal("second", "food"))
        else {
            panic!("expected alert");
        };

        assert!(!report.sound);
        assert!(!dispatcher.active().sound_active());
        assert_eq!(effects.sound.stops(), 1);
        assert_eq!(effects.sound.live_handles(), 0);
    }
}
