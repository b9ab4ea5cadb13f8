//! Single-threaded timer queue and inbox for the resident process.
//!
//! Tasks are plain data so they can be cancelled, counted and inspected.
//! Work finishing on other threads (poll calls, sound playback) reports back
//! by posting a [`Message`] to the inbox; the scheduling thread acts on it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::effects::SoundEnd;
use crate::poller::PollOutcome;

pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    PollTick,
    AlertExpiry { alert_id: u64 },
    ScreenWakeRelease { alert_id: u64 },
    NotificationTimeout { id: u32 },
    DelayedRestart { delay_ms: u64 },
}

#[derive(Debug)]
pub enum Message {
    PollCompleted {
        generation: u64,
        outcome: PollOutcome,
    },
    SoundFinished {
        alert_id: u64,
        end: SoundEnd,
    },
    /// A task was scheduled from another thread; recompute the wait.
    Wake,
    Shutdown,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: TaskId,
    entries: BTreeMap<(DateTime<Utc>, TaskId), Task>,
    due_by_id: HashMap<TaskId, DateTime<Utc>>,
}

impl TimerQueue {
    pub fn schedule_at(&mut self, due: DateTime<Utc>, task: Task) -> TaskId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.entries.insert((due, id), task);
        self.due_by_id.insert(id, due);
        id
    }

    /// Removes a task. Unknown or already-fired ids are a no-op.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.due_by_id.remove(&id) {
            Some(due) => self.entries.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    pub fn cancel_matching(&mut self, predicate: impl Fn(&Task) -> bool) -> usize {
        let doomed: Vec<(DateTime<Utc>, TaskId)> = self
            .entries
            .iter()
            .filter(|(_, task)| predicate(task))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.entries.remove(key);
            self.due_by_id.remove(&key.1);
        }
        doomed.len()
    }

    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(TaskId, Task)> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        let task = self.entries.remove(&key)?;
        self.due_by_id.remove(&key.1);
        Some((key.1, task))
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(due, _)| *due)
    }

    pub fn count_matching(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        self.entries.values().filter(|task| predicate(task)).count()
    }

    pub fn due_of(&self, id: TaskId) -> Option<DateTime<Utc>> {
        self.due_by_id.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    timers: Mutex<TimerQueue>,
    inbox: Sender<Message>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<Self>, Receiver<Message>) {
        let (inbox, receiver) = mpsc::channel();
        let scheduler = Arc::new(Self {
            clock,
            timers: Mutex::new(TimerQueue::default()),
            inbox,
        });
        (scheduler, receiver)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn post(&self, message: Message) {
        if self.inbox.send(message).is_err() {
            debug!("Scheduler inbox closed; dropping message");
        }
    }

    pub fn post_delayed(&self, delay: Duration, task: Task) -> TaskId {
        let offset = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        let due = self.clock.now() + offset;
        let id = self.timers().schedule_at(due, task);
        self.post(Message::Wake);
        id
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.timers().cancel(id)
    }

    pub fn cancel_matching(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        self.timers().cancel_matching(predicate)
    }

    pub fn pending(&self, predicate: impl Fn(&Task) -> bool) -> usize {
        self.timers().count_matching(predicate)
    }

    pub fn due_of(&self, id: TaskId) -> Option<DateTime<Utc>> {
        self.timers().due_of(id)
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.timers().next_due()
    }

    /// Pops the earliest task whose deadline has passed.
    pub fn take_due(&self) -> Option<Task> {
        let now = self.clock.now();
        self.timers().pop_due(now).map(|(_, task)| task)
    }

    /// How long the scheduling thread may block before the next deadline.
    pub fn time_until_next(&self) -> Option<Duration> {
        let due = self.next_due()?;
        let remaining = due - self.clock.now();
        Some(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking work (network calls) off the scheduling thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if let Err(err) = thread::Builder::new()
            .name("poll-call".to_string())
            .spawn(job)
        {
            warn!(error = %err, "Failed to spawn poll worker thread");
        }
    }
}

/// Runs the job on the caller's thread. Completion still arrives through the inbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}
