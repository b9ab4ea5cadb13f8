//! Periodic pending-order check.
//!
//! Each tick re-arms the next one first, resolves the session identifier,
//! mirrors it to durable storage and hands the HTTP call to an executor.
//! The call's outcome comes back through the scheduler inbox.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, WatchError};
use crate::identity::{
    resolve_identity, CookieSource, IdentitySource, PersistentIdentityStore, SessionIdentity,
};
use crate::scheduler::{Executor, Message, Scheduler, Task};

pub const DEFAULT_MESSAGE: &str = "Operation completed";
pub const DEFAULT_TAB: &str = "food";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrderSignal {
    pub message: String,
    pub tab: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Signal(PendingOrderSignal),
    NoOrders,
    Malformed(String),
    Failed(String),
}

/// The remote "pending orders" check.
pub trait OrderEndpoint: Send + Sync {
    /// Returns the raw response body for `driver_id`.
    fn fetch(&self, driver_id: &str) -> Result<String>;
}

pub struct HttpOrderEndpoint {
    client: reqwest::blocking::Client,
    poll_url: reqwest::Url,
}

impl HttpOrderEndpoint {
    pub fn new(poll_url: &str, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let poll_url = reqwest::Url::parse(poll_url).map_err(|err| WatchError::InvalidUrl {
            url: poll_url.to_string(),
            details: err.to_string(),
        })?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|err| WatchError::Http(format!("failed to build HTTP client: {}", err)))?;
        Ok(Self { client, poll_url })
    }

    pub fn request_url(&self, driver_id: &str) -> reqwest::Url {
        let mut url = self.poll_url.clone();
        url.query_pairs_mut().append_pair("driver_id", driver_id);
        url
    }
}

impl OrderEndpoint for HttpOrderEndpoint {
    fn fetch(&self, driver_id: &str) -> Result<String> {
        let response = self
            .client
            .get(self.request_url(driver_id))
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    WatchError::Timeout(err.to_string())
                } else {
                    WatchError::Http(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WatchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        response.text().map_err(|err| {
            if err.is_timeout() {
                WatchError::Timeout(err.to_string())
            } else {
                WatchError::Http(err.to_string())
            }
        })
    }
}

/// Classifies a response body. Only `success: true` produces a signal.
pub fn classify_body(body: &str) -> PollOutcome {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => return PollOutcome::Malformed(format!("response was not JSON: {}", err)),
    };
    let Some(object) = value.as_object() else {
        return PollOutcome::Malformed("response was not a JSON object".to_string());
    };

    let success = match object.get("success") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.trim().eq_ignore_ascii_case("true"),
        _ => false,
    };
    if !success {
        return PollOutcome::NoOrders;
    }

    let message = string_field(object.get("message")).unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
    let tab = string_field(object.get("tab"))
        .filter(|tab| !tab.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TAB.to_string());

    PollOutcome::Signal(PendingOrderSignal { message, tab })
}

pub fn parse_poll_response(body: &str) -> Option<PendingOrderSignal> {
    match classify_body(body) {
        PollOutcome::Signal(signal) => Some(signal),
        _ => None,
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    NoIdentity,
    SkippedInFlight,
    Dispatched { source: IdentitySource },
}

/// Posts a completion exactly once, even if the job is dropped unrun.
struct PendingCall {
    scheduler: Arc<Scheduler>,
    generation: u64,
    sent: bool,
}

impl PendingCall {
    fn complete(mut self, outcome: PollOutcome) {
        self.sent = true;
        self.scheduler.post(Message::PollCompleted {
            generation: self.generation,
            outcome,
        });
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.sent {
            self.scheduler.post(Message::PollCompleted {
                generation: self.generation,
                outcome: PollOutcome::Failed("poll call abandoned".to_string()),
            });
        }
    }
}

pub struct OrderPoller {
    endpoint: Arc<dyn OrderEndpoint>,
    executor: Arc<dyn Executor>,
    scheduler: Arc<Scheduler>,
    session: Arc<SessionIdentity>,
    store: Arc<PersistentIdentityStore>,
    cookies: Arc<dyn CookieSource>,
    interval: Duration,
    in_flight: AtomicBool,
    generation: AtomicU64,
}

impl OrderPoller {
    pub fn new(
        endpoint: Arc<dyn OrderEndpoint>,
        executor: Arc<dyn Executor>,
        scheduler: Arc<Scheduler>,
        session: Arc<SessionIdentity>,
        store: Arc<PersistentIdentityStore>,
        cookies: Arc<dyn CookieSource>,
        interval: Duration,
    ) -> Self {
        Self {
            endpoint,
            executor,
            scheduler,
            session,
            store,
            cookies,
            interval,
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Replaces any scheduled tick chain with a fresh one firing now.
    pub fn start(&self) {
        let cancelled = self.scheduler.cancel_matching(is_tick);
        if cancelled > 0 {
            debug!(cancelled, "Cancelled previously scheduled poll ticks");
        }
        self.scheduler.post_delayed(Duration::ZERO, Task::PollTick);
    }

    /// Cancels the tick chain and disowns any call still in flight.
    pub fn stop(&self) {
        self.scheduler.cancel_matching(is_tick);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn scheduled_ticks(&self) -> usize {
        self.scheduler.pending(is_tick)
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn on_tick(&self) -> TickReport {
        self.scheduler.post_delayed(self.interval, Task::PollTick);

        let Some((driver_id, source)) =
            resolve_identity(&self.session, &self.store, self.cookies.as_ref())
        else {
            debug!("No session identifier; skipping poll");
            return TickReport::NoIdentity;
        };

        if source != IdentitySource::Memory {
            info!(source = ?source, "Recovered session identifier for polling");
        }
        if let Err(err) = self.store.record_poll(&driver_id, self.scheduler.now()) {
            warn!(error = %err, "Failed to persist session identifier");
        }

        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Previous poll still in flight; skipping this tick's call");
            return TickReport::SkippedInFlight;
        }

        let pending = PendingCall {
            scheduler: Arc::clone(&self.scheduler),
            generation: self.generation.load(Ordering::SeqCst),
            sent: false,
        };
        let endpoint = Arc::clone(&self.endpoint);
        self.executor.execute(Box::new(move || {
            let outcome = match endpoint.fetch(&driver_id) {
                Ok(body) => classify_body(&body),
                Err(err) => PollOutcome::Failed(err.to_string()),
            };
            pending.complete(outcome);
        }));

        TickReport::Dispatched { source }
    }

    /// Handles a finished call on the scheduling thread.
    pub fn on_completed(&self, generation: u64, outcome: PollOutcome) -> Option<PendingOrderSignal> {
        self.in_flight.store(false, Ordering::SeqCst);
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(generation, "Dropping poll result from a stopped loop");
            return None;
        }

        match outcome {
            PollOutcome::Signal(signal) => {
                info!(message = %signal.message, tab = %signal.tab, "Pending order reported");
                Some(signal)
            }
            PollOutcome::NoOrders => {
                debug!("No pending orders");
                None
            }
            PollOutcome::Malformed(details) => {
                warn!(details = %details, "Ignoring malformed poll response");
                None
            }
            PollOutcome::Failed(error) => {
                warn!(error = %error, "Poll request failed; next tick retries");
                None
            }
        }
    }
}

fn is_tick(task: &Task) -> bool {
    *task == Task::PollTick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::StoredCookies;
    use crate::scheduler::InlineExecutor;
    use crate::testing::FakeEndpoint;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::mpsc::Receiver;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
    }

    struct Harness {
        clock: Arc<ManualClock>,
        scheduler: Arc<Scheduler>,
        inbox: Receiver<Message>,
        endpoint: Arc<FakeEndpoint>,
        session: Arc<SessionIdentity>,
        store: Arc<PersistentIdentityStore>,
        poller: OrderPoller,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let (scheduler, inbox) = Scheduler::new(clock.clone());
        let endpoint = Arc::new(FakeEndpoint::default());
        let session = Arc::new(SessionIdentity::new());
        let store = Arc::new(PersistentIdentityStore::in_memory());
        let poller = OrderPoller::new(
            endpoint.clone(),
            Arc::new(InlineExecutor),
            Arc::clone(&scheduler),
            Arc::clone(&session),
            Arc::clone(&store),
            Arc::new(StoredCookies::new(Arc::clone(&store))),
            Duration::from_secs(15),
        );
        Harness {
            clock,
            scheduler,
            inbox,
            endpoint,
            session,
            store,
            poller,
        }
    }

    fn next_completion(inbox: &Receiver<Message>) -> (u64, PollOutcome) {
        loop {
            match inbox.try_recv().expect("completion message") {
                Message::PollCompleted {
                    generation,
                    outcome,
                } => return (generation, outcome),
                _ => continue,
            }
        }
    }

    #[test]
    fn classify_success_with_defaults() {
        assert_eq!(
            classify_body(r#"{"success":true}"#),
            PollOutcome::Signal(PendingOrderSignal {
                message: DEFAULT_MESSAGE.to_string(),
                tab: DEFAULT_TAB.to_string(),
            })
        );
    }

    #[test]
    fn classify_success_with_fields() {
        let signal = parse_poll_response(
            r#"{"success":true,"message":"New grocery order","tab":"grocery"}"#,
        )
        .expect("signal");
        assert_eq!(signal.message, "New grocery order");
        assert_eq!(signal.tab, "grocery");
    }

    #[test]
    fn classify_never_signals_on_failure_or_garbage() {
        assert_eq!(classify_body(r#"{"success":false,"message":"x"}"#), PollOutcome::NoOrders);
        assert_eq!(classify_body(r#"{"message":"x"}"#), PollOutcome::NoOrders);
        assert!(matches!(classify_body("<html>502</html>"), PollOutcome::Malformed(_)));
        assert!(matches!(classify_body("[true]"), PollOutcome::Malformed(_)));
        assert!(matches!(classify_body(""), PollOutcome::Malformed(_)));
        assert_eq!(parse_poll_response(r#"{"success":"nope"}"#), None);
    }

    #[test]
    fn classify_accepts_string_flag_and_blank_tab() {
        let signal = parse_poll_response(r#"{"success":"true","tab":"  ","message":7}"#)
            .expect("signal");
        assert_eq!(signal.tab, DEFAULT_TAB);
        assert_eq!(signal.message, "7");
    }

    #[test]
    fn request_url_carries_driver_id_query() {
        let endpoint = HttpOrderEndpoint::new(
            "https://orders.example/heroes/check_pending_orders.php",
            Duration::from_secs(15),
            Duration::from_secs(15),
        )
        .expect("endpoint");
        assert_eq!(
            endpoint.request_url("42 a").as_str(),
            "https://orders.example/heroes/check_pending_orders.php?driver_id=42+a"
        );
    }

    #[test]
    fn invalid_poll_url_is_rejected() {
        let result = HttpOrderEndpoint::new("not a url", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(WatchError::InvalidUrl { .. })));
    }

    #[test]
    fn tick_without_identity_skips_call_and_rearms() {
        let h = harness();
        let report = h.poller.on_tick();

        assert_eq!(report, TickReport::NoIdentity);
        assert!(h.endpoint.calls().is_empty());
        assert_eq!(h.poller.scheduled_ticks(), 1);
        assert_eq!(h.scheduler.next_due(), Some(start() + ChronoDuration::seconds(15)));
    }

    #[test]
    fn tick_uses_durable_identity_and_repersists_it() {
        let h = harness();
        h.store.set_driver_id("durable-7").expect("seed store");
        h.endpoint.push_body(r#"{"success":false}"#);

        let report = h.poller.on_tick();
        assert_eq!(
            report,
            TickReport::Dispatched {
                source: IdentitySource::Durable
            }
        );
        assert_eq!(h.endpoint.calls(), vec!["durable-7".to_string()]);
        assert_eq!(h.session.get(), Some("durable-7".to_string()));
        assert_eq!(h.store.last_poll_at().expect("last poll"), Some(start()));

        let (generation, outcome) = next_completion(&h.inbox);
        assert_eq!(h.poller.on_completed(generation, outcome), None);
        assert!(!h.poller.in_flight());
    }

    #[test]
    fn successful_response_yields_signal() {
        let h = harness();
        h.session.set(Some("9"));
        h.endpoint.push_body(r#"{"success":true,"message":"New food order","tab":"food"}"#);

        h.poller.on_tick();
        let (generation, outcome) = next_completion(&h.inbox);
        let signal = h.poller.on_completed(generation, outcome).expect("signal");
        assert_eq!(signal.message, "New food order");
    }

    #[test]
    fn transport_failure_is_suppressed() {
        let h = harness();
        h.session.set(Some("9"));
        h.endpoint.push_error(WatchError::Timeout("read timed out".to_string()));

        h.poller.on_tick();
        let (generation, outcome) = next_completion(&h.inbox);
        assert!(matches!(outcome, PollOutcome::Failed(_)));
        assert_eq!(h.poller.on_completed(generation, outcome), None);
        assert_eq!(h.poller.scheduled_ticks(), 1);
    }

    #[test]
    fn overlapping_tick_does_not_issue_second_call() {
        let h = harness();
        h.session.set(Some("9"));
        h.endpoint.push_body(r#"{"success":false}"#);

        h.poller.on_tick();
        h.clock.advance(ChronoDuration::seconds(15));
        assert_eq!(h.poller.on_tick(), TickReport::SkippedInFlight);
        assert_eq!(h.endpoint.calls().len(), 1);
        assert_eq!(h.poller.scheduled_ticks(), 2);
    }

    #[test]
    fn start_twice_leaves_single_tick_chain() {
        let h = harness();
        h.poller.start();
        h.poller.start();
        assert_eq!(h.poller.scheduled_ticks(), 1);
    }

    #[test]
    fn stop_discards_in_flight_result() {
        let h = harness();
        h.session.set(Some("9"));
        h.endpoint.push_body(r#"{"success":true}"#);

        h.poller.on_tick();
        h.poller.stop();
        assert_eq!(h.poller.scheduled_ticks(), 0);
        let (generation, outcome) = next_completion(&h.inbox);
        assert_eq!(h.poller.on_completed(generation, outcome), None);
    }
}
