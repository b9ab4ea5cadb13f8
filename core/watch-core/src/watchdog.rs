//! The periodic watchdog job: relaunch the resident process when it is gone.
//!
//! Two independent checks: the process's own running flag (asked over the
//! control socket) and the platform process registry. Either one reporting
//! "not running" triggers a relaunch.

use std::fmt;
use tracing::{info, warn};

use crate::resurrection::Launcher;

pub trait ProcessRegistry: Send + Sync {
    fn is_resident_alive(&self) -> bool;
}

pub trait RunningProbe: Send + Sync {
    /// The process's own running flag; `None` when nothing answered.
    fn reports_running(&self) -> Option<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotRunningCause {
    /// The process answered but has marked itself stopped.
    FlagCleared,
    /// Nothing answered on the control channel.
    Unreachable,
    /// The process registry has no live resident process.
    ProcessMissing,
}

impl fmt::Display for NotRunningCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NotRunningCause::FlagCleared => "running flag cleared",
            NotRunningCause::Unreachable => "control socket unreachable",
            NotRunningCause::ProcessMissing => "no live process",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    Relaunched { cause: NotRunningCause },
    /// Relaunch failed; the job scheduler should run the job again.
    Retry { cause: NotRunningCause, error: String },
}

impl WatchdogVerdict {
    pub fn needs_retry(&self) -> bool {
        matches!(self, WatchdogVerdict::Retry { .. })
    }
}

pub fn run_watchdog(
    probe: &dyn RunningProbe,
    registry: &dyn ProcessRegistry,
    launcher: &dyn Launcher,
) -> WatchdogVerdict {
    let cause = match probe.reports_running() {
        Some(false) => Some(NotRunningCause::FlagCleared),
        None => Some(NotRunningCause::Unreachable),
        Some(true) if !registry.is_resident_alive() => Some(NotRunningCause::ProcessMissing),
        Some(true) => None,
    };

    let Some(cause) = cause else {
        info!("Watchdog: resident process is running");
        return WatchdogVerdict::Healthy;
    };

    info!(%cause, "Watchdog: resident process not running; relaunching");
    match launcher.launch() {
        Ok(()) => WatchdogVerdict::Relaunched { cause },
        Err(err) => {
            warn!(%cause, error = %err, "Watchdog relaunch failed");
            WatchdogVerdict::Retry {
                cause,
                error: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, FakeRegistry, RecordingLauncher};

    #[test]
    fn healthy_process_is_left_alone() {
        let launcher = RecordingLauncher::default();
        let verdict = run_watchdog(&FakeProbe::running(), &FakeRegistry::alive(true), &launcher);
        assert_eq!(verdict, WatchdogVerdict::Healthy);
        assert_eq!(launcher.launches(), 0);
    }

    #[test]
    fn cleared_flag_triggers_relaunch_even_if_process_exists() {
        let launcher = RecordingLauncher::default();
        let verdict = run_watchdog(&FakeProbe::stopped(), &FakeRegistry::alive(true), &launcher);
        assert_eq!(
            verdict,
            WatchdogVerdict::Relaunched {
                cause: NotRunningCause::FlagCleared
            }
        );
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn missing_process_triggers_relaunch() {
        let launcher = RecordingLauncher::default();
        let verdict = run_watchdog(&FakeProbe::running(), &FakeRegistry::alive(false), &launcher);
        assert_eq!(
            verdict,
            WatchdogVerdict::Relaunched {
                cause: NotRunningCause::ProcessMissing
            }
        );
    }

    #[test]
    fn failed_relaunch_asks_for_retry() {
        let launcher = RecordingLauncher::default();
        launcher.fail_launches(true);
        let verdict = run_watchdog(&FakeProbe::unreachable(), &FakeRegistry::alive(false), &launcher);
        assert!(verdict.needs_retry());
        assert!(matches!(
            verdict,
            WatchdogVerdict::Retry {
                cause: NotRunningCause::Unreachable,
                ..
            }
        ));
    }
}
