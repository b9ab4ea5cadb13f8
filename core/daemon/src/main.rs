//! hero-watch daemon entrypoint.
//!
//! Owns the resident order watch: a control socket for the host shell, the
//! polling loop and the alert sequence. At most one live instance runs per
//! control socket: it holds the instance lock, and any other launch forwards
//! `start` to it and exits.

use fs_err as fs;
use std::env;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hero_watch_core::host::{
    is_live_instance, query_health, request, send_request, sibling_executable, socket_path,
    ProcessLauncher, SystemdAlarms, SystemdJobs, CTL_BIN, DAEMON_BIN,
};
use hero_watch_core::{
    load_config, lock_path_for, state_dir, store_path, HttpOrderEndpoint, InstanceLock, Message,
    PersistentIdentityStore, ResidentDeps, ResidentProcess, SessionIdentity, StoredCookies,
    SystemClock, ThreadExecutor, WatchConfig,
};
use hero_watch_protocol::Method;

mod platform;
mod server;

const DEBUG_LOG_ENV: &str = "HERO_WATCH_DEBUG_LOG";
const CLAIM_ATTEMPTS: u32 = 30;
const CLAIM_RETRY_MS: u64 = 100;

fn main() {
    init_logging();

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            WatchConfig::default()
        }
    };

    let state_dir = match state_dir() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve state directory");
            std::process::exit(1);
        }
    };

    let socket_path = match socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve control socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare control socket directory");
        std::process::exit(1);
    }

    let instance_lock = match claim_instance(&socket_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => return,
        Err(err) => {
            error!(error = %err, "Failed to take instance lock");
            std::process::exit(1);
        }
    };

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind control socket");
            std::process::exit(1);
        }
    };

    let endpoint = match HttpOrderEndpoint::new(
        &config.endpoint.poll_url,
        config.endpoint.connect_timeout(),
        config.endpoint.read_timeout(),
    ) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!(error = %err, "Failed to build order endpoint");
            std::process::exit(1);
        }
    };

    let ctl = sibling_executable(CTL_BIN);
    let store = Arc::new(PersistentIdentityStore::open(store_path(&state_dir)));
    let effects = platform::effects(&config);
    let (process, inbox) = ResidentProcess::new(ResidentDeps {
        clock: Arc::new(SystemClock),
        store: Arc::clone(&store),
        session: Arc::new(SessionIdentity::new()),
        cookies: Arc::new(StoredCookies::new(Arc::clone(&store))),
        endpoint: Arc::new(endpoint),
        executor: Arc::new(ThreadExecutor),
        effects,
        launcher: Arc::new(ProcessLauncher::new(
            sibling_executable(DAEMON_BIN),
            ctl.clone(),
            socket_path.clone(),
        )),
        alarms: Arc::new(SystemdAlarms::new(ctl.clone())),
        jobs: Arc::new(SystemdJobs::new(ctl)),
        config,
    });
    process.hold_instance_lock(instance_lock);
    let process = Arc::new(process);

    let scheduler = Arc::clone(process.scheduler());
    if let Err(err) = ctrlc::set_handler(move || scheduler.post(Message::Shutdown)) {
        warn!(error = %err, "Failed to install termination handler");
    }

    process.on_start();

    let server_process = Arc::clone(&process);
    let spawned = thread::Builder::new()
        .name("control-socket".to_string())
        .spawn(move || server::serve(listener, server_process));
    if let Err(err) = spawned {
        error!(error = %err, "Failed to start control socket thread");
        std::process::exit(1);
    }

    info!(
        path = %socket_path.display(),
        pid = std::process::id(),
        "hero-watch daemon started"
    );
    process.run(inbox);
    info!("hero-watch daemon exiting");
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Takes the instance lock, or hands `start` to the instance holding it.
///
/// `Ok(None)` means this launch is redundant and should exit. The holder may
/// not have bound its socket yet, so forwarding is retried briefly.
fn claim_instance(socket_path: &Path) -> Result<Option<InstanceLock>, String> {
    let lock_path = lock_path_for(socket_path);
    for attempt in 0..CLAIM_ATTEMPTS {
        if let Some(lock) = InstanceLock::try_acquire(&lock_path)? {
            debug!(path = %lock.path().display(), attempt, "Instance lock taken");
            return Ok(Some(lock));
        }
        if forward_to_live_instance(socket_path) {
            info!("Start forwarded to live instance");
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(CLAIM_RETRY_MS));
    }
    info!("Another instance holds the lock and did not answer; exiting");
    Ok(None)
}

/// Sends `start` to a live instance. True when one took it.
fn forward_to_live_instance(socket_path: &Path) -> bool {
    let Some(health) = query_health(socket_path) else {
        return false;
    };
    if !is_live_instance(&health) {
        debug!("Socket owner is tearing down");
        return false;
    }
    match send_request(socket_path, &request(Method::Start, None, None)) {
        Ok(response) if response.ok => true,
        Ok(response) => {
            warn!(error = ?response.error, "Live instance refused start");
            false
        }
        Err(err) => {
            warn!(error = %err, "Failed to reach live instance");
            false
        }
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}
