//! hero-watch-ctl: control and restart-receiver CLI for the resident process.
//!
//! ## Subcommands
//!
//! - `restart`: restart receiver, run by boot hooks, package updates and alarms
//! - `watchdog`: periodic liveness check, run by the watchdog timer
//! - `set-session`, `save-cookies`: identity hand-off from the web shell
//! - `silence`, `volume-key`, `foreground`, `task-removed`: host UI signals
//! - `status`: prints the live instance's health

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use hero_watch_core::host::{socket_path, ProcessLauncher, SocketProbe, SysinfoRegistry};
use hero_watch_core::{
    handle_restart_request, run_watchdog, state_dir, store_path, BootOutcome,
    PersistentIdentityStore, SessionIdentity, WatchdogVerdict,
};
use hero_watch_protocol::{parse_session_identifier, Method, RestartReason};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hero-watch-ctl")]
#[command(about = "Controls the hero-watch resident process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relaunch the resident process after boot, an update or an alarm
    Restart {
        #[arg(long, default_value = "restart_service")]
        reason: RestartReason,
    },

    /// Relaunch the resident process if it is not running
    Watchdog,

    /// Hand the driver's session identifier to the resident process
    SetSession {
        #[arg(value_name = "DRIVER_ID")]
        driver_id: String,
    },

    /// Mirror the web session's cookie header into durable storage
    SaveCookies {
        #[arg(value_name = "COOKIES")]
        cookies: String,
    },

    /// Stop the active alert's sound and vibration
    Silence,

    /// Forward a volume key press; silences only while the UI is in front
    VolumeKey,

    /// Report whether the host UI is in the foreground
    Foreground {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Report that the user swiped the app away
    TaskRemoved,

    /// Print the resident process's health
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn as_bool(self) -> bool {
        matches!(self, Toggle::On)
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli.command) {
        tracing::error!(error = %err, "hero-watch-ctl failed");
        eprintln!("hero-watch-ctl: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), String> {
    match command {
        Commands::Restart { reason } => restart(reason),
        Commands::Watchdog => watchdog(),
        Commands::SetSession { driver_id } => set_session(&driver_id),
        Commands::SaveCookies { cookies } => {
            open_store()?
                .set_saved_cookies(&cookies)
                .map_err(String::from)?;
            tracing::info!("Session cookies saved");
            Ok(())
        }
        Commands::Silence => forward(Method::Silence, None),
        Commands::VolumeKey => forward(Method::VolumeKey, None),
        Commands::Foreground { state } => forward(
            Method::SetForeground,
            Some(json!({ "foreground": state.as_bool() })),
        ),
        Commands::TaskRemoved => forward(Method::TaskRemoved, None),
        Commands::Status => forward(Method::GetHealth, None),
    }
}

fn open_store() -> Result<PersistentIdentityStore, String> {
    let dir = state_dir().map_err(String::from)?;
    Ok(PersistentIdentityStore::open(store_path(&dir)))
}

fn socket() -> Result<PathBuf, String> {
    socket_path().map_err(String::from)
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn forward(method: Method, params: Option<Value>) -> Result<(), String> {
    let data = daemon_client::call(&socket()?, method, params)?;
    print_json(&data);
    Ok(())
}

fn restart(reason: RestartReason) -> Result<(), String> {
    let store = open_store()?;
    let session = SessionIdentity::new();
    let launcher = ProcessLauncher::from_current_exe().map_err(String::from)?;

    match handle_restart_request(reason, &store, &session, &launcher) {
        BootOutcome::Launched { .. } => Ok(()),
        BootOutcome::GaveUp { error, .. } => Err(format!("relaunch failed: {}", error)),
    }
}

fn watchdog() -> Result<(), String> {
    let launcher = ProcessLauncher::from_current_exe().map_err(String::from)?;
    let probe = SocketProbe::new(socket()?);

    match run_watchdog(&probe, &SysinfoRegistry, &launcher) {
        WatchdogVerdict::Retry { error, .. } => Err(format!("watchdog relaunch failed: {}", error)),
        verdict => {
            tracing::debug!(?verdict, "Watchdog finished");
            Ok(())
        }
    }
}

/// Persists the identifier, then tells a live instance. A stopped instance
/// picks it up from storage on its next start.
fn set_session(driver_id: &str) -> Result<(), String> {
    let parsed = parse_session_identifier(json!({ "driver_id": driver_id }))
        .map_err(|err| err.message)?;
    open_store()?
        .set_driver_id(&parsed.driver_id)
        .map_err(String::from)?;

    match daemon_client::call(
        &socket()?,
        Method::SetSessionIdentifier,
        Some(json!({ "driver_id": parsed.driver_id })),
    ) {
        Ok(_) => tracing::info!("Session identifier delivered"),
        Err(err) => tracing::info!(error = %err, "Session identifier stored for next start"),
    }
    Ok(())
}
