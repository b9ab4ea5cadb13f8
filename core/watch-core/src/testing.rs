//! Recording fakes for every platform seam, plus harnesses driving a manual clock.
//!
//! Compiled for this crate's tests and behind the `testing` feature, which
//! the daemon's dev-dependencies enable.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hero_watch_protocol::RestartReason;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, ManualClock};
use crate::config::{RingerMode, WatchConfig};
use crate::effects::{
    AudioPolicy, Effects, Notification, NotificationChannel, Notifier, SoundCallback, SoundEnd,
    SoundHandle, SoundPlayer, UserFeedback, Vibrator, WakeKind, WakeLocks,
};
use crate::error::{Result, WatchError};
use crate::identity::{PersistentIdentityStore, SessionIdentity, StoredCookies};
use crate::poller::OrderEndpoint;
use crate::resident::{ResidentDeps, ResidentProcess};
use crate::resurrection::{AlarmScheduler, AlarmSpec, JobScheduler, JobSpec, Launcher};
use crate::scheduler::{InlineExecutor, Message, Scheduler};
use crate::watchdog::{ProcessRegistry, RunningProbe};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_772_352_000, 0).unwrap_or_default()
}

#[derive(Default)]
pub struct FakeEndpoint {
    responses: Mutex<VecDeque<Result<String>>>,
    default_body: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeEndpoint {
    pub fn push_body(&self, body: &str) {
        lock(&self.responses).push_back(Ok(body.to_string()));
    }

    pub fn push_error(&self, error: WatchError) {
        lock(&self.responses).push_back(Err(error));
    }

    /// Body returned once the queued responses run out.
    pub fn set_default_body(&self, body: &str) {
        *lock(&self.default_body) = Some(body.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl OrderEndpoint for FakeEndpoint {
    fn fetch(&self, driver_id: &str) -> Result<String> {
        lock(&self.calls).push(driver_id.to_string());
        if let Some(response) = lock(&self.responses).pop_front() {
            return response;
        }
        Ok(lock(&self.default_body)
            .clone()
            .unwrap_or_else(|| r#"{"success":false}"#.to_string()))
    }
}

#[derive(Default)]
pub struct RecordingLauncher {
    launches: AtomicUsize,
    broadcasts: Mutex<Vec<RestartReason>>,
    fail: AtomicBool,
    fail_next: AtomicUsize,
}

impl RecordingLauncher {
    /// Number of launch attempts, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn broadcasts(&self) -> Vec<RestartReason> {
        lock(&self.broadcasts).clone()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_launches(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&self) -> Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if scripted || self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::platform("launch", "launch rejected"));
        }
        Ok(())
    }

    fn broadcast(&self, reason: RestartReason) -> Result<()> {
        lock(&self.broadcasts).push(reason);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlarms {
    alarms: Mutex<Vec<AlarmSpec>>,
    rejected: Mutex<Vec<&'static str>>,
    fail: AtomicBool,
}

impl RecordingAlarms {
    /// Alarms that were accepted, in order.
    pub fn alarms(&self) -> Vec<AlarmSpec> {
        lock(&self.alarms).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn reject_key(&self, key: &'static str) {
        lock(&self.rejected).push(key);
    }
}

impl AlarmScheduler for RecordingAlarms {
    fn set_exact(&self, alarm: &AlarmSpec) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) || lock(&self.rejected).contains(&alarm.key) {
            return Err(WatchError::platform("set alarm", "alarm rejected"));
        }
        lock(&self.alarms).push(alarm.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingJobs {
    jobs: Mutex<Vec<JobSpec>>,
    fail: AtomicBool,
}

impl RecordingJobs {
    pub fn jobs(&self) -> Vec<JobSpec> {
        lock(&self.jobs).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl JobScheduler for RecordingJobs {
    fn enqueue_periodic(&self, job: &JobSpec) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::platform("enqueue job", "job rejected"));
        }
        lock(&self.jobs).push(job.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WakeRecord {
    held: bool,
    acquisitions: usize,
    releases: usize,
}

#[derive(Default)]
pub struct FakeWakeLocks {
    records: Mutex<HashMap<WakeKind, WakeRecord>>,
    fail_acquire: AtomicBool,
}

impl FakeWakeLocks {
    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn is_held_now(&self, kind: WakeKind) -> bool {
        self.record(kind).held
    }

    pub fn acquisitions(&self, kind: WakeKind) -> usize {
        self.record(kind).acquisitions
    }

    pub fn releases(&self, kind: WakeKind) -> usize {
        self.record(kind).releases
    }

    fn record(&self, kind: WakeKind) -> WakeRecord {
        lock(&self.records).get(&kind).copied().unwrap_or_default()
    }
}

impl WakeLocks for FakeWakeLocks {
    fn acquire(&self, kind: WakeKind, _timeout: Option<Duration>) -> Result<()> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(WatchError::effect("wake lock", "acquire rejected"));
        }
        let mut records = lock(&self.records);
        let record = records.entry(kind).or_default();
        record.held = true;
        record.acquisitions += 1;
        Ok(())
    }

    fn release(&self, kind: WakeKind) -> Result<()> {
        let mut records = lock(&self.records);
        let record = records.entry(kind).or_default();
        if record.held {
            record.held = false;
            record.releases += 1;
        }
        Ok(())
    }

    fn is_held(&self, kind: WakeKind) -> bool {
        self.is_held_now(kind)
    }
}

#[derive(Default)]
pub struct FakeVibrator {
    patterns: Mutex<Vec<Vec<u64>>>,
    cancels: AtomicUsize,
    fail: AtomicBool,
}

impl FakeVibrator {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn patterns(&self) -> Vec<Vec<u64>> {
        lock(&self.patterns).clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Vibrator for FakeVibrator {
    fn vibrate(&self, pattern: &[u64]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::effect("vibration", "vibrator unavailable"));
        }
        lock(&self.patterns).push(pattern.to_vec());
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SoundLedger {
    plays: usize,
    stops: usize,
    releases: usize,
    live: usize,
    playing: Vec<Arc<AtomicBool>>,
    callbacks: Vec<SoundCallback>,
}

/// Sound player whose handles count stops and releases. A dropped,
/// unreleased handle stays counted in [`FakeSoundPlayer::live_handles`].
#[derive(Default)]
pub struct FakeSoundPlayer {
    ledger: Arc<Mutex<SoundLedger>>,
    fail: AtomicBool,
}

impl FakeSoundPlayer {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn plays(&self) -> usize {
        lock(&self.ledger).plays
    }

    pub fn stops(&self) -> usize {
        lock(&self.ledger).stops
    }

    pub fn releases(&self) -> usize {
        lock(&self.ledger).releases
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.ledger).live
    }

    /// Ends every pending playback as if the clip ran out.
    pub fn finish_all(&self, end: SoundEnd) {
        let callbacks = {
            let mut ledger = lock(&self.ledger);
            for playing in ledger.playing.drain(..) {
                playing.store(false, Ordering::SeqCst);
            }
            std::mem::take(&mut ledger.callbacks)
        };
        for callback in callbacks {
            callback(end.clone());
        }
    }
}

impl SoundPlayer for FakeSoundPlayer {
    fn play(&self, on_end: SoundCallback) -> Result<Box<dyn SoundHandle>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::effect("sound", "audio device busy"));
        }
        let playing = Arc::new(AtomicBool::new(true));
        let mut ledger = lock(&self.ledger);
        ledger.plays += 1;
        ledger.live += 1;
        ledger.playing.push(Arc::clone(&playing));
        ledger.callbacks.push(on_end);
        Ok(Box::new(FakeSoundHandle {
            ledger: Arc::clone(&self.ledger),
            playing,
            released: false,
        }))
    }
}

struct FakeSoundHandle {
    ledger: Arc<Mutex<SoundLedger>>,
    playing: Arc<AtomicBool>,
    released: bool,
}

impl SoundHandle for FakeSoundHandle {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn stop(&mut self) -> Result<()> {
        self.playing.store(false, Ordering::SeqCst);
        lock(&self.ledger).stops += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.playing.store(false, Ordering::SeqCst);
            let mut ledger = lock(&self.ledger);
            ledger.releases += 1;
            ledger.live = ledger.live.saturating_sub(1);
        }
        Ok(())
    }
}

pub struct FixedAudio {
    mode: Mutex<RingerMode>,
}

impl FixedAudio {
    pub fn new(mode: RingerMode) -> Self {
        Self {
            mode: Mutex::new(mode),
        }
    }

    pub fn set(&self, mode: RingerMode) {
        *lock(&self.mode) = mode;
    }
}

impl AudioPolicy for FixedAudio {
    fn ringer_mode(&self) -> RingerMode {
        *lock(&self.mode)
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    channels: Mutex<Vec<NotificationChannel>>,
    posted: Mutex<Vec<(u32, Notification)>>,
    cancelled: Mutex<Vec<u32>>,
    fail: AtomicBool,
}

impl FakeNotifier {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn channels(&self) -> Vec<NotificationChannel> {
        lock(&self.channels).clone()
    }

    pub fn posted(&self) -> Vec<(u32, Notification)> {
        lock(&self.posted).clone()
    }

    pub fn posted_on(&self, channel_id: &str) -> Vec<(u32, Notification)> {
        self.posted()
            .into_iter()
            .filter(|(_, notification)| notification.channel_id == channel_id)
            .collect()
    }

    pub fn last_posted(&self, id: u32) -> Option<Notification> {
        lock(&self.posted)
            .iter()
            .rev()
            .find(|(posted_id, _)| *posted_id == id)
            .map(|(_, notification)| notification.clone())
    }

    pub fn cancelled(&self) -> Vec<u32> {
        lock(&self.cancelled).clone()
    }
}

impl Notifier for FakeNotifier {
    fn create_channel(&self, channel: &NotificationChannel) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::effect("notification", "channel rejected"));
        }
        lock(&self.channels).push(channel.clone());
        Ok(())
    }

    fn post(&self, id: u32, notification: &Notification) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WatchError::effect("notification", "post rejected"));
        }
        lock(&self.posted).push((id, notification.clone()));
        Ok(())
    }

    fn cancel(&self, id: u32) -> Result<()> {
        lock(&self.cancelled).push(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFeedback {
    messages: Mutex<Vec<String>>,
}

impl RecordingFeedback {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl UserFeedback for RecordingFeedback {
    fn show(&self, text: &str) {
        lock(&self.messages).push(text.to_string());
    }
}

pub struct FakeRegistry {
    alive: AtomicBool,
}

impl FakeRegistry {
    pub fn alive(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
        }
    }
}

impl ProcessRegistry for FakeRegistry {
    fn is_resident_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

pub struct FakeProbe {
    answer: Option<bool>,
}

impl FakeProbe {
    pub fn running() -> Self {
        Self { answer: Some(true) }
    }

    pub fn stopped() -> Self {
        Self {
            answer: Some(false),
        }
    }

    pub fn unreachable() -> Self {
        Self { answer: None }
    }
}

impl RunningProbe for FakeProbe {
    fn reports_running(&self) -> Option<bool> {
        self.answer
    }
}

/// One fake per effect capability.
pub struct EffectsRig {
    pub wake: Arc<FakeWakeLocks>,
    pub vibrator: Arc<FakeVibrator>,
    pub sound: Arc<FakeSoundPlayer>,
    pub audio: Arc<FixedAudio>,
    pub notifier: Arc<FakeNotifier>,
    pub feedback: Arc<RecordingFeedback>,
}

impl EffectsRig {
    pub fn new() -> Self {
        Self {
            wake: Arc::new(FakeWakeLocks::default()),
            vibrator: Arc::new(FakeVibrator::default()),
            sound: Arc::new(FakeSoundPlayer::default()),
            audio: Arc::new(FixedAudio::new(RingerMode::Normal)),
            notifier: Arc::new(FakeNotifier::default()),
            feedback: Arc::new(RecordingFeedback::default()),
        }
    }

    pub fn effects(&self) -> Effects {
        Effects {
            wake: self.wake.clone(),
            vibrator: self.vibrator.clone(),
            sound: self.sound.clone(),
            audio: self.audio.clone(),
            notifier: self.notifier.clone(),
            feedback: self.feedback.clone(),
        }
    }
}

impl Default for EffectsRig {
    fn default() -> Self {
        Self::new()
    }
}

/// A scheduler on a manual clock, for component-level tests.
pub struct TestRig {
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<Scheduler>,
    pub inbox: Receiver<Message>,
}

impl TestRig {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let (scheduler, inbox) = Scheduler::new(clock.clone());
        Self {
            clock,
            scheduler,
            inbox,
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        self.clock.advance(by);
    }

    pub fn drain_inbox(&self) -> Vec<Message> {
        self.inbox.try_iter().collect()
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired resident process on a manual clock with inline poll calls.
pub struct ResidentHarness {
    pub clock: Arc<ManualClock>,
    pub endpoint: Arc<FakeEndpoint>,
    pub launcher: Arc<RecordingLauncher>,
    pub alarms: Arc<RecordingAlarms>,
    pub jobs: Arc<RecordingJobs>,
    pub effects: EffectsRig,
    pub store: Arc<PersistentIdentityStore>,
    pub session: Arc<SessionIdentity>,
    pub process: ResidentProcess,
    pub inbox: Receiver<Message>,
}

impl ResidentHarness {
    pub fn new() -> Self {
        Self::with_parts(
            WatchConfig::default(),
            Arc::new(PersistentIdentityStore::in_memory()),
        )
    }

    pub fn with_parts(config: WatchConfig, store: Arc<PersistentIdentityStore>) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let endpoint = Arc::new(FakeEndpoint::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let alarms = Arc::new(RecordingAlarms::default());
        let jobs = Arc::new(RecordingJobs::default());
        let effects = EffectsRig::new();
        let session = Arc::new(SessionIdentity::new());

        let (process, inbox) = ResidentProcess::new(ResidentDeps {
            config,
            clock: clock.clone(),
            store: Arc::clone(&store),
            session: Arc::clone(&session),
            cookies: Arc::new(StoredCookies::new(Arc::clone(&store))),
            endpoint: endpoint.clone(),
            executor: Arc::new(InlineExecutor),
            effects: effects.effects(),
            launcher: launcher.clone(),
            alarms: alarms.clone(),
            jobs: jobs.clone(),
        });

        Self {
            clock,
            endpoint,
            launcher,
            alarms,
            jobs,
            effects,
            store,
            session,
            process,
            inbox,
        }
    }

    /// Enters Started and runs the immediate first tick.
    pub fn start(&self) {
        self.process.on_start();
        self.pump();
    }

    /// Runs due tasks and handles queued messages until both are quiet.
    pub fn pump(&self) {
        loop {
            self.process.run_due_tasks();
            let mut handled = false;
            while let Ok(message) = self.inbox.try_recv() {
                handled = true;
                self.process.handle_message(message);
            }
            if !handled {
                break;
            }
        }
    }

    /// Advances the clock, stopping at every deadline on the way.
    pub fn advance(&self, by: ChronoDuration) {
        let target = self.clock.now() + by;
        while let Some(due) = self.process.scheduler().next_due() {
            if due > target {
                break;
            }
            if due > self.clock.now() {
                self.clock.set(due);
            }
            self.pump();
        }
        self.clock.set(target);
        self.pump();
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(ChronoDuration::seconds(secs));
    }
}

impl Default for ResidentHarness {
    fn default() -> Self {
        Self::new()
    }
}
