//! Platform capabilities used by the alert sequence and the status notification.
//!
//! Each capability is a trait so the host binary can wire real devices while
//! tests substitute recording fakes. [`ActiveEffects`] is the process-wide
//! registry of effect handles; whichever component starts an effect owns it
//! until it is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::RingerMode;
use crate::error::Result;
use crate::scheduler::TaskId;

pub const STATUS_CHANNEL_ID: &str = "order_check_service";
pub const ORDER_CHANNEL_ID: &str = "order_notifications";
pub const STATUS_NOTIFICATION_ID: u32 = 1001;
pub const ORDER_NOTIFICATION_BASE_ID: u32 = STATUS_NOTIFICATION_ID + 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeKind {
    /// Keeps the CPU running for the lifetime of the resident process.
    Partial,
    /// Turns the screen on for an alert.
    Screen,
}

pub trait WakeLocks: Send + Sync {
    fn acquire(&self, kind: WakeKind, timeout: Option<Duration>) -> Result<()>;
    fn release(&self, kind: WakeKind) -> Result<()>;
    fn is_held(&self, kind: WakeKind) -> bool;
}

pub trait Vibrator: Send + Sync {
    /// Plays the waveform once (timings in milliseconds, off/on alternating).
    fn vibrate(&self, pattern: &[u64]) -> Result<()>;
    fn cancel(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundEnd {
    Completed,
    Failed(String),
}

pub type SoundCallback = Box<dyn FnOnce(SoundEnd) + Send + 'static>;

pub trait SoundHandle: Send {
    fn is_playing(&self) -> bool;
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

pub trait SoundPlayer: Send + Sync {
    /// Starts the order sound. `on_end` runs on any thread when playback ends by itself.
    fn play(&self, on_end: SoundCallback) -> Result<Box<dyn SoundHandle>>;
}

pub trait AudioPolicy: Send + Sync {
    fn ringer_mode(&self) -> RingerMode;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Importance {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationChannel {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub importance: Importance,
    pub bypass_dnd: bool,
    pub vibration: bool,
    pub lights: bool,
    pub show_badge: bool,
}

impl NotificationChannel {
    pub fn status() -> Self {
        Self {
            id: STATUS_CHANNEL_ID,
            name: "Order Check Service",
            description: "Background service to check for pending orders",
            importance: Importance::Low,
            bypass_dnd: false,
            vibration: false,
            lights: false,
            show_badge: false,
        }
    }

    pub fn orders() -> Self {
        Self {
            id: ORDER_CHANNEL_ID,
            name: "New Orders",
            description: "Critical notifications for new orders",
            importance: Importance::High,
            bypass_dnd: true,
            vibration: true,
            lights: true,
            show_badge: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel_id: &'static str,
    pub title: String,
    pub body: String,
    pub deep_link: Option<String>,
    pub ongoing: bool,
    pub colorized: bool,
    pub alarm_category: bool,
    pub timeout: Option<Duration>,
}

pub trait Notifier: Send + Sync {
    fn create_channel(&self, channel: &NotificationChannel) -> Result<()>;
    fn post(&self, id: u32, notification: &Notification) -> Result<()>;
    fn cancel(&self, id: u32) -> Result<()>;
}

/// Short, non-blocking confirmation shown to the user (a toast on phones).
pub trait UserFeedback: Send + Sync {
    fn show(&self, text: &str);
}

#[derive(Clone)]
pub struct Effects {
    pub wake: Arc<dyn WakeLocks>,
    pub vibrator: Arc<dyn Vibrator>,
    pub sound: Arc<dyn SoundPlayer>,
    pub audio: Arc<dyn AudioPolicy>,
    pub notifier: Arc<dyn Notifier>,
    pub feedback: Arc<dyn UserFeedback>,
}

pub struct ActiveSound {
    pub alert_id: u64,
    pub handle: Box<dyn SoundHandle>,
}

#[derive(Default)]
pub struct EffectSlots {
    pub sound: Option<ActiveSound>,
    /// Alert id whose vibration is running.
    pub vibration: Option<u64>,
    /// `(alert_id, task)` of the auto-stop timer bounding sound and vibration.
    pub expiry_timer: Option<(u64, TaskId)>,
    /// `(alert_id, task)` of the screen wake and its release timer.
    pub screen_wake: Option<(u64, TaskId)>,
    /// Dismissal timers of posted order notifications. Not counted by `is_idle`.
    pub notification_timers: Vec<(u32, TaskId)>,
}

impl EffectSlots {
    pub fn is_idle(&self) -> bool {
        self.sound.is_none()
            && self.vibration.is_none()
            && self.expiry_timer.is_none()
            && self.screen_wake.is_none()
    }
}

/// Process-wide registry of active alert effects. Readers tolerate empty slots.
#[derive(Default)]
pub struct ActiveEffects {
    slots: Mutex<EffectSlots>,
}

impl ActiveEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, EffectSlots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    pub fn sound_active(&self) -> bool {
        self.lock().sound.is_some()
    }

    pub fn vibration_active(&self) -> bool {
        self.lock().vibration.is_some()
    }
}
