//! Effect adapters for a Linux desktop session.
//!
//! Each adapter shells out to a configurable command. An empty command turns
//! the adapter into a no-op, which is how headless hosts and tests run.

use hero_watch_core::config::{HostConfig, RingerMode, WatchConfig};
use hero_watch_core::effects::{
    AudioPolicy, Effects, Notification, NotificationChannel, Notifier, SoundCallback, SoundEnd,
    SoundHandle, SoundPlayer, UserFeedback, Vibrator, WakeKind, WakeLocks, ORDER_CHANNEL_ID,
};
use hero_watch_core::host::run_command;
use hero_watch_core::{Result, WatchError};
use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const APP_NAME: &str = "Hero Watch";
const SOUND_POLL_INTERVAL_MS: u64 = 100;
const FEEDBACK_EXPIRE_MS: u64 = 2_000;

pub fn effects(config: &WatchConfig) -> Effects {
    let host = &config.host;
    Effects {
        wake: Arc::new(CommandWakeLocks::new(host)),
        vibrator: Arc::new(CommandVibrator::new(host.vibrate_command.clone())),
        sound: Arc::new(CommandSoundPlayer::new(host.sound_command.clone())),
        audio: Arc::new(ConfigAudio::new(config.alerts.ringer)),
        notifier: Arc::new(DesktopNotifier::new(host.notify_command.clone())),
        feedback: Arc::new(NotifyFeedback::new(host.notify_command.clone())),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Replaces `placeholder` in every argument.
fn expand(command: &[String], placeholder: &str, value: &str) -> Vec<String> {
    command
        .iter()
        .map(|arg| arg.replace(placeholder, value))
        .collect()
}

fn spawn_quiet(command: &[String], effect: &'static str) -> Result<Child> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| WatchError::effect(effect, "no command configured"))?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| WatchError::effect(effect, format!("{}: {}", program, err)))
}

fn stop_child(mut child: Child, effect: &'static str) -> Result<()> {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return Ok(());
    }
    child
        .kill()
        .map_err(|err| WatchError::effect(effect, err.to_string()))?;
    let _ = child.wait();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wake locks
// ─────────────────────────────────────────────────────────────────────────────

/// Holds an inhibitor process per wake kind.
pub struct CommandWakeLocks {
    partial: Vec<String>,
    screen: Vec<String>,
    held: Mutex<HashMap<WakeKind, Child>>,
}

impl CommandWakeLocks {
    pub fn new(host: &HostConfig) -> Self {
        Self {
            partial: host.partial_wake_command.clone(),
            screen: host.screen_wake_command.clone(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn command_for(&self, kind: WakeKind) -> &[String] {
        match kind {
            WakeKind::Partial => &self.partial,
            WakeKind::Screen => &self.screen,
        }
    }
}

impl WakeLocks for CommandWakeLocks {
    fn acquire(&self, kind: WakeKind, timeout: Option<Duration>) -> Result<()> {
        let command = self.command_for(kind);
        if command.is_empty() {
            debug!(?kind, "Wake lock command disabled");
            return Ok(());
        }
        if self.is_held(kind) {
            return Ok(());
        }

        let secs = timeout
            .map(|timeout| timeout.as_secs().max(1).to_string())
            .unwrap_or_else(|| "infinity".to_string());
        let child = spawn_quiet(&expand(command, "{secs}", &secs), "wake lock")?;
        lock(&self.held).insert(kind, child);
        Ok(())
    }

    fn release(&self, kind: WakeKind) -> Result<()> {
        let child = lock(&self.held).remove(&kind);
        match child {
            Some(child) => stop_child(child, "wake lock"),
            None => Ok(()),
        }
    }

    fn is_held(&self, kind: WakeKind) -> bool {
        let mut held = lock(&self.held);
        match held.get_mut(&kind) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vibration
// ─────────────────────────────────────────────────────────────────────────────

/// Runs an external vibration helper with `{pattern}` as comma-separated timings.
pub struct CommandVibrator {
    command: Vec<String>,
    active: Mutex<Option<Child>>,
}

impl CommandVibrator {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            active: Mutex::new(None),
        }
    }
}

impl Vibrator for CommandVibrator {
    fn vibrate(&self, pattern: &[u64]) -> Result<()> {
        if self.command.is_empty() {
            debug!("No vibration helper configured");
            return Ok(());
        }
        let timings = pattern
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let child = spawn_quiet(&expand(&self.command, "{pattern}", &timings), "vibration")?;
        let previous = lock(&self.active).replace(child);
        if let Some(previous) = previous {
            stop_child(previous, "vibration")?;
        }
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        let active = lock(&self.active).take();
        match active {
            Some(child) => stop_child(child, "vibration"),
            None => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sound
// ─────────────────────────────────────────────────────────────────────────────

pub struct CommandSoundPlayer {
    command: Vec<String>,
}

impl CommandSoundPlayer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl SoundPlayer for CommandSoundPlayer {
    fn play(&self, on_end: SoundCallback) -> Result<Box<dyn SoundHandle>> {
        let child = Arc::new(Mutex::new(spawn_quiet(&self.command, "sound")?));
        let stopped = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let monitor_child = Arc::clone(&child);
        let monitor_stopped = Arc::clone(&stopped);
        let monitor_finished = Arc::clone(&finished);
        thread::Builder::new()
            .name("sound-monitor".to_string())
            .spawn(move || loop {
                if monitor_stopped.load(Ordering::SeqCst) {
                    return;
                }
                let status = lock(&monitor_child).try_wait();
                match status {
                    Ok(Some(status)) => {
                        monitor_finished.store(true, Ordering::SeqCst);
                        if monitor_stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        let end = if status.success() {
                            SoundEnd::Completed
                        } else {
                            SoundEnd::Failed(format!("player exited with {}", status))
                        };
                        on_end(end);
                        return;
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(SOUND_POLL_INTERVAL_MS)),
                    Err(err) => {
                        monitor_finished.store(true, Ordering::SeqCst);
                        on_end(SoundEnd::Failed(err.to_string()));
                        return;
                    }
                }
            })
            .map_err(|err| WatchError::effect("sound", err.to_string()))?;

        Ok(Box::new(CommandSoundHandle {
            child,
            stopped,
            finished,
        }))
    }
}

struct CommandSoundHandle {
    child: Arc<Mutex<Child>>,
    stopped: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl SoundHandle for CommandSoundHandle {
    fn is_playing(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.finished.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let mut child = lock(&self.child);
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        child
            .kill()
            .map_err(|err| WatchError::effect("sound", err.to_string()))
    }

    fn release(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let mut child = lock(&self.child);
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
        }
        let _ = child.wait();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ringer mode
// ─────────────────────────────────────────────────────────────────────────────

pub struct ConfigAudio {
    mode: RingerMode,
}

impl ConfigAudio {
    pub fn new(mode: RingerMode) -> Self {
        Self { mode }
    }
}

impl AudioPolicy for ConfigAudio {
    fn ringer_mode(&self) -> RingerMode {
        self.mode
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Desktop notifications through `notify-send`, closed over D-Bus.
pub struct DesktopNotifier {
    command: String,
    server_ids: Mutex<HashMap<u32, u32>>,
}

impl DesktopNotifier {
    pub fn new(command: String) -> Self {
        Self {
            command,
            server_ids: Mutex::new(HashMap::new()),
        }
    }
}

pub fn notify_arguments(notification: &Notification, replace_id: Option<u32>) -> Vec<String> {
    let urgency = if notification.channel_id == ORDER_CHANNEL_ID {
        "critical"
    } else {
        "low"
    };
    let mut args = vec![
        format!("--app-name={}", APP_NAME),
        format!("--urgency={}", urgency),
        "--print-id".to_string(),
    ];
    if let Some(timeout) = notification.timeout {
        args.push(format!("--expire-time={}", timeout.as_millis()));
    }
    if notification.alarm_category {
        args.push("--category=im.received".to_string());
    }
    if notification.ongoing {
        args.push("--hint=boolean:resident:true".to_string());
    }
    if let Some(link) = &notification.deep_link {
        args.push(format!("--hint=string:x-hero-deep-link:{}", link));
    }
    if let Some(id) = replace_id {
        args.push(format!("--replace-id={}", id));
    }
    args.push(notification.title.clone());
    args.push(notification.body.clone());
    args
}

impl Notifier for DesktopNotifier {
    fn create_channel(&self, channel: &NotificationChannel) -> Result<()> {
        debug!(
            channel = channel.id,
            importance = ?channel.importance,
            bypass_dnd = channel.bypass_dnd,
            "Notification channel registered"
        );
        Ok(())
    }

    fn post(&self, id: u32, notification: &Notification) -> Result<()> {
        if self.command.is_empty() {
            debug!(id, title = %notification.title, "Notification command disabled");
            return Ok(());
        }
        let replace_id = lock(&self.server_ids).get(&id).copied();
        let output = Command::new(&self.command)
            .args(notify_arguments(notification, replace_id))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| WatchError::effect("notification", err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WatchError::effect("notification", stderr.trim().to_string()));
        }

        let printed = String::from_utf8_lossy(&output.stdout);
        match printed.trim().parse::<u32>() {
            Ok(server_id) => {
                lock(&self.server_ids).insert(id, server_id);
            }
            Err(_) => debug!(id, "Notification server id not reported"),
        }
        Ok(())
    }

    fn cancel(&self, id: u32) -> Result<()> {
        let server_id = lock(&self.server_ids).remove(&id);
        let Some(server_id) = server_id else {
            return Ok(());
        };
        let args: Vec<String> = [
            "call",
            "--session",
            "--dest=org.freedesktop.Notifications",
            "--object-path=/org/freedesktop/Notifications",
            "--method=org.freedesktop.Notifications.CloseNotification",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .chain(std::iter::once(server_id.to_string()))
        .collect();
        run_command("gdbus", &args)
    }
}

/// Short confirmation toast.
pub struct NotifyFeedback {
    command: String,
}

impl NotifyFeedback {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl UserFeedback for NotifyFeedback {
    fn show(&self, text: &str) {
        info!(text, "User feedback");
        if self.command.is_empty() {
            return;
        }
        let args = vec![
            format!("--app-name={}", APP_NAME),
            "--urgency=low".to_string(),
            format!("--expire-time={}", FEEDBACK_EXPIRE_MS),
            APP_NAME.to_string(),
            text.to_string(),
        ];
        if let Err(err) = run_command(&self.command, &args) {
            warn!(error = %err, "Failed to show feedback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn expand_substitutes_placeholders() {
        let command = strings(&["systemd-inhibit", "--what=idle", "sleep", "{secs}"]);
        assert_eq!(
            expand(&command, "{secs}", "30"),
            strings(&["systemd-inhibit", "--what=idle", "sleep", "30"])
        );
    }

    #[test]
    fn order_notification_arguments() {
        let notification = Notification {
            channel_id: ORDER_CHANNEL_ID,
            title: "NEW ORDER ALERT!".to_string(),
            body: "New food order".to_string(),
            deep_link: Some("https://orders.example/pending?tab=food".to_string()),
            ongoing: false,
            colorized: true,
            alarm_category: true,
            timeout: Some(Duration::from_secs(60)),
        };
        let args = notify_arguments(&notification, Some(17));
        assert!(args.contains(&"--urgency=critical".to_string()));
        assert!(args.contains(&"--expire-time=60000".to_string()));
        assert!(args.contains(&"--replace-id=17".to_string()));
        assert!(args.contains(&"--hint=string:x-hero-deep-link:https://orders.example/pending?tab=food".to_string()));
        assert_eq!(&args[args.len() - 2..], &strings(&["NEW ORDER ALERT!", "New food order"])[..]);
    }

    #[test]
    fn disabled_adapters_are_no_ops() {
        let host = HostConfig {
            sound_command: Vec::new(),
            vibrate_command: Vec::new(),
            partial_wake_command: Vec::new(),
            screen_wake_command: Vec::new(),
            notify_command: String::new(),
        };
        let wake = CommandWakeLocks::new(&host);
        assert!(wake.acquire(WakeKind::Partial, None).is_ok());
        assert!(!wake.is_held(WakeKind::Partial));
        assert!(wake.release(WakeKind::Partial).is_ok());

        let vibrator = CommandVibrator::new(Vec::new());
        assert!(vibrator.vibrate(&[0, 800]).is_ok());
        assert!(vibrator.cancel().is_ok());

        let player = CommandSoundPlayer::new(Vec::new());
        assert!(player.play(Box::new(|_| {})).is_err());

        let notifier = DesktopNotifier::new(String::new());
        let channel = NotificationChannel::orders();
        assert!(notifier.create_channel(&channel).is_ok());
        assert!(notifier.cancel(1101).is_ok());
    }

    #[test]
    fn dismissing_forgets_the_server_id() {
        let notifier = DesktopNotifier::new("notify-send".to_string());
        lock(&notifier.server_ids).insert(1101, 42);
        lock(&notifier.server_ids).insert(1102, 43);

        // The bus call may fail on hosts without a session bus.
        let _ = notifier.cancel(1101);
        let tracked: Vec<u32> = lock(&notifier.server_ids).keys().copied().collect();
        assert_eq!(tracked, vec![1102]);
    }

    #[test]
    fn wake_lock_holds_process_until_released() {
        let host = HostConfig {
            partial_wake_command: strings(&["sleep", "{secs}"]),
            ..HostConfig::default()
        };
        let wake = CommandWakeLocks::new(&host);
        wake.acquire(WakeKind::Partial, Some(Duration::from_secs(30)))
            .expect("acquire");
        assert!(wake.is_held(WakeKind::Partial));
        wake.release(WakeKind::Partial).expect("release");
        assert!(!wake.is_held(WakeKind::Partial));
    }

    #[test]
    fn sound_reports_natural_completion() {
        let player = CommandSoundPlayer::new(strings(&["true"]));
        let (tx, rx) = mpsc::channel();
        let mut handle = player
            .play(Box::new(move |end| {
                let _ = tx.send(end);
            }))
            .expect("play");
        let end = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert_eq!(end, SoundEnd::Completed);
        assert!(!handle.is_playing());
        handle.release().expect("release");
    }

    #[test]
    fn sound_reports_player_failure() {
        let player = CommandSoundPlayer::new(strings(&["false"]));
        let (tx, rx) = mpsc::channel();
        let _handle = player
            .play(Box::new(move |end| {
                let _ = tx.send(end);
            }))
            .expect("play");
        let end = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(matches!(end, SoundEnd::Failed(_)));
    }

    #[test]
    fn stopped_sound_does_not_report_completion() {
        let player = CommandSoundPlayer::new(strings(&["sleep", "5"]));
        let (tx, rx) = mpsc::channel();
        let mut handle = player
            .play(Box::new(move |end| {
                let _ = tx.send(end);
            }))
            .expect("play");
        assert!(handle.is_playing());
        handle.stop().expect("stop");
        handle.release().expect("release");
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }
}
