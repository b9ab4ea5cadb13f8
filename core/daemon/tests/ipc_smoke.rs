use hero_watch_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const TEST_CONFIG: &str = r#"
[endpoint]
poll_url = "http://127.0.0.1:9/check"
connect_timeout_secs = 1
read_timeout_secs = 1

[resurrection]
platform_timers = false

[host]
sound_command = []
vibrate_command = []
partial_wake_command = []
screen_wake_command = []
notify_command = ""
"#;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn state_dir(home: &Path) -> PathBuf {
    home.join(".hero-watch")
}

fn socket_path(home: &Path) -> PathBuf {
    state_dir(home).join("watch.sock")
}

fn write_config(home: &Path) {
    std::fs::create_dir_all(state_dir(home)).expect("create state dir");
    std::fs::write(state_dir(home).join("config.toml"), TEST_CONFIG).expect("write config");
}

fn daemon_command(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_hero-watch-daemon"));
    command
        .env("HOME", home)
        .env_remove("HERO_WATCH_STATE_DIR")
        .env_remove("HERO_WATCH_CONFIG")
        .env_remove("HERO_WATCH_SOCKET")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn spawn_daemon(home: &Path) -> Child {
    daemon_command(home)
        .spawn()
        .expect("Failed to spawn hero-watch-daemon")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn request(method: Method, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(format!("{:?}", method)),
        params,
    }
}

fn send_raw(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    stream.write_all(payload).expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut payload = serde_json::to_vec(&request).expect("Failed to serialize request");
    payload.push(b'\n');
    send_raw(socket, &payload)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn error_code(response: &Response) -> &str {
    response
        .error
        .as_ref()
        .map(|error| error.code.as_str())
        .unwrap_or("missing")
}

#[test]
fn daemon_ipc_health_and_controls_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let health = send_request(&socket, request(Method::GetHealth, None));
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health payload");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["lifecycle"], "started");
    assert_eq!(data["running"], true);
    assert_eq!(data["session_present"], false);

    let session = send_request(
        &socket,
        request(
            Method::SetSessionIdentifier,
            Some(json!({ "driver_id": "driver-42" })),
        ),
    );
    assert!(session.ok, "set_session_identifier was not ok");

    let health = send_request(&socket, request(Method::GetHealth, None));
    assert_eq!(health.data.expect("health payload")["session_present"], true);

    let prefs = std::fs::read_to_string(state_dir(home.path()).join("prefs.json"))
        .expect("read durable store");
    assert!(prefs.contains("driver-42"));

    let silence = send_request(&socket, request(Method::Silence, None));
    assert!(silence.ok);
    assert_eq!(silence.data.expect("silence payload")["sound_stopped"], false);

    let volume = send_request(&socket, request(Method::VolumeKey, None));
    assert_eq!(volume.data.expect("volume payload")["consumed"], false);

    let foreground = send_request(
        &socket,
        request(Method::SetForeground, Some(json!({ "foreground": true }))),
    );
    assert!(foreground.ok);

    let volume = send_request(&socket, request(Method::VolumeKey, None));
    assert_eq!(volume.data.expect("volume payload")["consumed"], true);
}

#[test]
fn daemon_rejects_malformed_requests() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut mismatch = request(Method::GetHealth, None);
    mismatch.protocol_version = PROTOCOL_VERSION + 1;
    let response = send_request(&socket, mismatch);
    assert!(!response.ok);
    assert_eq!(error_code(&response), "protocol_mismatch");

    let response = send_raw(&socket, b"{not json}\n");
    assert_eq!(error_code(&response), "invalid_json");

    let response = send_raw(&socket, b"   \n");
    assert_eq!(error_code(&response), "empty_request");

    let response = send_request(&socket, request(Method::SetSessionIdentifier, None));
    assert_eq!(error_code(&response), "invalid_params");

    let response = send_request(
        &socket,
        request(Method::SetForeground, Some(json!({ "foreground": "yes" }))),
    );
    assert_eq!(error_code(&response), "invalid_params");
}

#[test]
fn second_start_is_forwarded_to_live_instance() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let first = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let status = daemon_command(home.path())
        .status()
        .expect("run second daemon");
    assert!(status.success(), "second daemon should exit cleanly");

    let health = send_request(&socket, request(Method::GetHealth, None));
    let data = health.data.expect("health payload");
    assert_eq!(data["pid"], first.child.id());
    assert_eq!(data["lifecycle"], "started");
}

#[test]
fn concurrent_launches_leave_one_live_daemon() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path());
    let socket = socket_path(home.path());
    let mut guards: Vec<DaemonGuard> = (0..6)
        .map(|_| DaemonGuard {
            child: spawn_daemon(home.path()),
        })
        .collect();
    wait_for_socket(&socket, Duration::from_secs(5));

    let deadline = Instant::now() + Duration::from_secs(8);
    let mut live: Vec<u32> = Vec::new();
    while Instant::now() < deadline {
        live = guards
            .iter_mut()
            .filter_map(|guard| {
                matches!(guard.child.try_wait(), Ok(None)).then(|| guard.child.id())
            })
            .collect();
        if live.len() <= 1 {
            break;
        }
        sleep(Duration::from_millis(50));
    }
    assert_eq!(live.len(), 1, "live daemons after concurrent launches: {:?}", live);

    let health = send_request(&socket, request(Method::GetHealth, None));
    let data = health.data.expect("health payload");
    assert_eq!(data["pid"], live[0]);
    assert_eq!(data["lifecycle"], "started");

    let lock = std::fs::read_to_string(state_dir(home.path()).join("watch.lock"))
        .expect("read instance lock");
    assert_eq!(lock.trim(), live[0].to_string());
}
