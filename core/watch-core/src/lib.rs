//! # hero-watch-core
//!
//! Background order polling, alert delivery and self-resurrection for the
//! delivery-driver shell app.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. One scheduling thread owns the timer
//!   queue; network calls run on an [`Executor`] and report back through the inbox.
//! - **Platform behind traits**: Wake locks, sound, vibration, notifications,
//!   launching and platform timers are capability traits. [`host`] wires them
//!   to a Linux desktop session; `testing` (tests or the `testing` feature)
//!   provides recording fakes.
//! - **Never crash the host**: Every platform call is guarded locally; failures
//!   are logged and the surrounding operation degrades.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hero_watch_core::{ResidentDeps, ResidentProcess};
//!
//! let (process, inbox) = ResidentProcess::new(deps);
//! process.on_start();
//! process.run(inbox);
//! ```

pub mod alert;
pub mod boot;
pub mod clock;
pub mod config;
pub mod effects;
pub mod error;
pub mod host;
pub mod identity;
pub mod instance;
pub mod poller;
pub mod resident;
pub mod resurrection;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod watchdog;

pub use alert::{AlertDispatcher, AlertPolicy, DispatchOutcome, SilenceReport};
pub use boot::{handle_restart_request, BootOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, state_dir, store_path, WatchConfig};
pub use effects::{ActiveEffects, Effects};
pub use error::{Result, WatchError};
pub use identity::{PersistentIdentityStore, SessionIdentity, StoredCookies};
pub use instance::{lock_path_for, InstanceLock};
pub use poller::{HttpOrderEndpoint, OrderPoller, PendingOrderSignal};
pub use resident::{HealthSnapshot, Lifecycle, ResidentDeps, ResidentProcess};
pub use resurrection::{Launcher, ResurrectionController, RestartTrigger};
pub use scheduler::{Executor, Message, Scheduler, ThreadExecutor};
pub use watchdog::{run_watchdog, WatchdogVerdict};
