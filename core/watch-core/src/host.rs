//! Host adapters for the platform seams on a Linux desktop session.
//!
//! Relaunching spawns the daemon binary detached; restart requests go to
//! `hero-watch-ctl restart`; alarms and the watchdog job are transient
//! `systemd-run --user` timers so they outlive the daemon. Liveness comes from
//! the control socket and the process table.

use hero_watch_protocol::{
    Method, Request, Response, RestartReason, MAX_REQUEST_BYTES, PROTOCOL_VERSION, SOCKET_NAME,
};
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, info, warn};

use crate::config::state_dir;
use crate::error::{Result, WatchError};
use crate::resurrection::{AlarmScheduler, AlarmSpec, JobScheduler, JobSpec, Launcher};
use crate::watchdog::{ProcessRegistry, RunningProbe};

pub const DAEMON_BIN: &str = "hero-watch-daemon";
pub const CTL_BIN: &str = "hero-watch-ctl";
pub const SOCKET_ENV: &str = "HERO_WATCH_SOCKET";
const UNIT_PREFIX: &str = "hero-watch-";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;

pub fn socket_path() -> Result<PathBuf> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(state_dir()?.join(SOCKET_NAME))
}

/// Locates a sibling binary next to the running executable, else relies on `PATH`.
pub fn sibling_executable(name: &str) -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

// ─────────────────────────────────────────────────────────────────────────────
// Control socket client
// ─────────────────────────────────────────────────────────────────────────────

pub fn request(method: Method, id: Option<String>, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id,
        params,
    }
}

pub fn send_request(socket: &Path, request: &Request) -> std::result::Result<Response, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> std::result::Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

/// Health data of a live instance, or `None` when nothing answers.
pub fn query_health(socket: &Path) -> Option<Value> {
    let response = send_request(
        socket,
        &request(Method::GetHealth, Some("health-probe".to_string()), None),
    )
    .ok()?;
    if !response.ok {
        return None;
    }
    response.data
}

/// True when `health` belongs to an instance that has not torn down.
pub fn is_live_instance(health: &Value) -> bool {
    health
        .get("lifecycle")
        .and_then(Value::as_str)
        .map(|lifecycle| lifecycle != "destroyed")
        .unwrap_or(false)
}

pub struct SocketProbe {
    socket: PathBuf,
}

impl SocketProbe {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }
}

impl RunningProbe for SocketProbe {
    fn reports_running(&self) -> Option<bool> {
        let health = query_health(&self.socket)?;
        Some(
            health
                .get("running")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Launching
// ─────────────────────────────────────────────────────────────────────────────

pub struct ProcessLauncher {
    daemon: PathBuf,
    ctl: PathBuf,
    socket: PathBuf,
}

impl ProcessLauncher {
    pub fn new(daemon: PathBuf, ctl: PathBuf, socket: PathBuf) -> Self {
        Self {
            daemon,
            ctl,
            socket,
        }
    }

    pub fn from_current_exe() -> Result<Self> {
        Ok(Self::new(
            sibling_executable(DAEMON_BIN),
            sibling_executable(CTL_BIN),
            socket_path()?,
        ))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<()> {
        if let Some(health) = query_health(&self.socket) {
            if is_live_instance(&health) {
                let response = send_request(
                    &self.socket,
                    &request(Method::Start, Some("relaunch".to_string()), None),
                )
                .map_err(|err| WatchError::platform("start live instance", err))?;
                if response.ok {
                    debug!("Live instance re-entered Started");
                    return Ok(());
                }
                warn!("Live instance refused start; spawning a new one");
            }
        }
        spawn_detached(&self.daemon, &[])?;
        info!(daemon = %self.daemon.display(), "Spawned resident process");
        Ok(())
    }

    fn broadcast(&self, reason: RestartReason) -> Result<()> {
        spawn_detached(&self.ctl, &["restart", "--reason", reason.as_str()])
    }
}

fn spawn_detached(program: &Path, args: &[&str]) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|err| {
            WatchError::platform(format!("spawn {}", program.display()), err.to_string())
        })?;

    // Reap the child so it does not linger as a zombie while we run.
    let spawned = thread::Builder::new()
        .name("child-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(err) = spawned {
        debug!(error = %err, "Failed to spawn child reaper");
    }
    Ok(())
}

/// Runs a command to completion; non-zero exit becomes a platform error.
pub fn run_command(program: &str, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| WatchError::platform(program, err.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(WatchError::platform(
        program,
        format!("{}: {}", output.status, stderr.trim()),
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// systemd user timers
// ─────────────────────────────────────────────────────────────────────────────

pub fn unit_name(key: &str) -> String {
    format!("{}{}", UNIT_PREFIX, key.replace('_', "-"))
}

fn systemd_seconds(duration: Duration) -> String {
    format!("{}s", duration.as_secs().max(1))
}

pub fn alarm_arguments(ctl: &Path, alarm: &AlarmSpec) -> Vec<String> {
    let mut args = vec![
        "--user".to_string(),
        format!("--unit={}", unit_name(alarm.key)),
        format!("--on-active={}", systemd_seconds(alarm.after)),
    ];
    if let Some(every) = alarm.repeat {
        args.push(format!("--on-unit-active={}", systemd_seconds(every)));
    }
    args.push("--timer-property=AccuracySec=1s".to_string());
    args.push(ctl.display().to_string());
    args.push("restart".to_string());
    args.push("--reason".to_string());
    args.push(alarm.reason.as_str().to_string());
    args
}

pub fn job_arguments(ctl: &Path, job: &JobSpec) -> Vec<String> {
    let every = systemd_seconds(job.every);
    let mut args = vec![
        "--user".to_string(),
        format!("--unit={}", unit_name(job.name)),
        format!("--on-active={}", every),
        format!("--on-unit-active={}", every),
    ];
    if job.requires_network {
        args.push("--property=After=network-online.target".to_string());
        args.push("--property=Wants=network-online.target".to_string());
    }
    args.push(ctl.display().to_string());
    args.push("watchdog".to_string());
    args
}

/// Stops an earlier timer with the same unit so the new one replaces it.
fn replace_unit(unit: &str) {
    let args = vec![
        "--user".to_string(),
        "stop".to_string(),
        format!("{}.timer", unit),
    ];
    if let Err(err) = run_command("systemctl", &args) {
        debug!(unit, error = %err, "No previous timer to stop");
    }
}

pub struct SystemdAlarms {
    ctl: PathBuf,
}

impl SystemdAlarms {
    pub fn new(ctl: PathBuf) -> Self {
        Self { ctl }
    }
}

impl AlarmScheduler for SystemdAlarms {
    fn set_exact(&self, alarm: &AlarmSpec) -> Result<()> {
        replace_unit(&unit_name(alarm.key));
        run_command("systemd-run", &alarm_arguments(&self.ctl, alarm))?;
        debug!(key = alarm.key, after_secs = alarm.after.as_secs(), "Alarm armed");
        Ok(())
    }
}

pub struct SystemdJobs {
    ctl: PathBuf,
}

impl SystemdJobs {
    pub fn new(ctl: PathBuf) -> Self {
        Self { ctl }
    }
}

impl JobScheduler for SystemdJobs {
    fn enqueue_periodic(&self, job: &JobSpec) -> Result<()> {
        replace_unit(&unit_name(job.name));
        run_command("systemd-run", &job_arguments(&self.ctl, job))?;
        debug!(job = job.name, every_secs = job.every.as_secs(), "Periodic job enqueued");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process registry
// ─────────────────────────────────────────────────────────────────────────────

/// Looks for a live daemon process other than the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoRegistry;

impl ProcessRegistry for SysinfoRegistry {
    fn is_resident_alive(&self) -> bool {
        let own_pid = std::process::id();
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        sys.processes().iter().any(|(pid, process)| {
            pid.as_u32() != own_pid && is_daemon_process(process.name(), process.cmd())
        })
    }
}

fn is_daemon_process(name: &str, cmd: &[String]) -> bool {
    // Kernel process names are cut at 15 bytes, so check argv[0] too.
    name == DAEMON_BIN
        || cmd
            .first()
            .and_then(|arg0| Path::new(arg0).file_name())
            .map(|file| file == DAEMON_BIN)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    #[test]
    fn unit_names_are_prefixed_and_dashed() {
        assert_eq!(unit_name("backup_restart_service"), "hero-watch-backup-restart-service");
    }

    #[test]
    fn repeating_alarm_arguments() {
        let alarm = AlarmSpec {
            key: "restart_service",
            after: Duration::from_secs(300),
            reason: RestartReason::RestartService,
            repeat: Some(Duration::from_secs(300)),
        };
        let args = alarm_arguments(Path::new("/opt/hero/hero-watch-ctl"), &alarm);
        assert_eq!(
            args,
            vec![
                "--user",
                "--unit=hero-watch-restart-service",
                "--on-active=300s",
                "--on-unit-active=300s",
                "--timer-property=AccuracySec=1s",
                "/opt/hero/hero-watch-ctl",
                "restart",
                "--reason",
                "restart_service",
            ]
        );
    }

    #[test]
    fn watchdog_job_waits_for_network() {
        let job = JobSpec {
            name: "service_watchdog",
            every: Duration::from_secs(900),
            requires_network: true,
        };
        let args = job_arguments(Path::new("hero-watch-ctl"), &job);
        assert!(args.contains(&"--on-unit-active=900s".to_string()));
        assert!(args.contains(&"--property=After=network-online.target".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("watchdog"));
    }

    #[test]
    fn daemon_process_is_matched_by_argv0() {
        assert!(is_daemon_process("hero-watch-daem", &["/usr/bin/hero-watch-daemon".to_string()]));
        assert!(is_daemon_process(DAEMON_BIN, &[]));
        assert!(!is_daemon_process("hero-watch-ctl", &["hero-watch-ctl".to_string()]));
    }

    #[test]
    fn live_instance_requires_non_destroyed_lifecycle() {
        assert!(is_live_instance(&serde_json::json!({"lifecycle": "started"})));
        assert!(!is_live_instance(&serde_json::json!({"lifecycle": "destroyed"})));
        assert!(!is_live_instance(&serde_json::json!({})));
    }

    #[test]
    fn probe_reports_unreachable_socket_as_none() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let probe = SocketProbe::new(temp_dir.path().join("missing.sock"));
        assert_eq!(probe.reports_running(), None);
    }

    #[test]
    fn probe_reads_running_flag_from_health() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("watch.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("read");
            let request: Request = serde_json::from_str(line.trim()).expect("request");
            assert_eq!(request.method, Method::GetHealth);

            let response = Response::ok(
                request.id,
                serde_json::json!({"running": false, "lifecycle": "task_removed"}),
            );
            let mut writer = stream;
            serde_json::to_writer(&mut writer, &response).expect("write");
            writer.write_all(b"\n").expect("newline");
        });

        let probe = SocketProbe::new(socket);
        assert_eq!(probe.reports_running(), Some(false));
        server.join().expect("server thread");
    }
}
