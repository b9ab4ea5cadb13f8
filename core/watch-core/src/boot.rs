//! Restart receiver for boot, package replacement and explicit restart requests.
//!
//! Every reason is handled the same way: recover the durable session
//! identifier, relaunch, and retry the relaunch once if it fails.

use hero_watch_protocol::RestartReason;
use tracing::{info, warn};

use crate::identity::{PersistentIdentityStore, SessionIdentity};
use crate::resurrection::Launcher;

const MAX_LAUNCH_ATTEMPTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    Launched {
        attempts: u8,
        identity_recovered: bool,
    },
    GaveUp {
        error: String,
        identity_recovered: bool,
    },
}

impl BootOutcome {
    pub fn launched(&self) -> bool {
        matches!(self, BootOutcome::Launched { .. })
    }
}

pub fn handle_restart_request(
    reason: RestartReason,
    store: &PersistentIdentityStore,
    session: &SessionIdentity,
    launcher: &dyn Launcher,
) -> BootOutcome {
    info!(%reason, "Restart request received");

    let identity_recovered = match store.driver_id() {
        Ok(Some(driver_id)) => {
            session.set(Some(&driver_id));
            true
        }
        Ok(None) => false,
        Err(err) => {
            warn!(error = %err, "Failed to read durable session identifier");
            false
        }
    };

    let mut last_error = String::new();
    for attempt in 1..=MAX_LAUNCH_ATTEMPTS {
        match launcher.launch() {
            Ok(()) => {
                info!(%reason, attempt, identity_recovered, "Resident process launched");
                return BootOutcome::Launched {
                    attempts: attempt,
                    identity_recovered,
                };
            }
            Err(err) => {
                warn!(%reason, attempt, error = %err, "Failed to launch resident process");
                last_error = err.to_string();
            }
        }
    }

    BootOutcome::GaveUp {
        error: last_error,
        identity_recovered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingLauncher;

    #[test]
    fn every_reason_recovers_identity_and_launches() {
        for reason in RestartReason::ALL {
            let store = PersistentIdentityStore::in_memory();
            store.set_driver_id("driver-5").expect("seed");
            let session = SessionIdentity::new();
            let launcher = RecordingLauncher::default();

            let outcome = handle_restart_request(reason, &store, &session, &launcher);
            assert_eq!(
                outcome,
                BootOutcome::Launched {
                    attempts: 1,
                    identity_recovered: true
                }
            );
            assert_eq!(session.get(), Some("driver-5".to_string()));
            assert_eq!(launcher.launches(), 1);
        }
    }

    #[test]
    fn failed_launch_is_retried_once() {
        let store = PersistentIdentityStore::in_memory();
        let session = SessionIdentity::new();
        let launcher = RecordingLauncher::default();
        launcher.fail_next_launches(1);

        let outcome = handle_restart_request(RestartReason::Boot, &store, &session, &launcher);
        assert_eq!(
            outcome,
            BootOutcome::Launched {
                attempts: 2,
                identity_recovered: false
            }
        );
    }

    #[test]
    fn gives_up_after_second_failure() {
        let store = PersistentIdentityStore::in_memory();
        let session = SessionIdentity::new();
        let launcher = RecordingLauncher::default();
        launcher.fail_launches(true);

        let outcome =
            handle_restart_request(RestartReason::AggressiveRestart, &store, &session, &launcher);
        assert!(!outcome.launched());
        assert_eq!(launcher.launches(), 2);
    }
}
