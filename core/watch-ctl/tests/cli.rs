use std::path::Path;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

fn run_ctl(state_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hero-watch-ctl"))
        .args(args)
        .env("HERO_WATCH_STATE_DIR", state_dir)
        .env_remove("HERO_WATCH_SOCKET")
        .env_remove("HERO_WATCH_CONFIG")
        .stdin(Stdio::null())
        .output()
        .expect("run hero-watch-ctl")
}

fn read_prefs(state_dir: &Path) -> serde_json::Value {
    let raw = std::fs::read_to_string(state_dir.join("prefs.json")).expect("read prefs");
    serde_json::from_str(&raw).expect("parse prefs")
}

#[test]
fn set_session_persists_without_a_running_daemon() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_ctl(dir.path(), &["set-session", "  driver-9  "]);
    assert!(output.status.success(), "set-session failed: {:?}", output);

    assert_eq!(read_prefs(dir.path())["driver_id"], "driver-9");
}

#[test]
fn set_session_rejects_blank_identifier() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_ctl(dir.path(), &["set-session", "   "]);
    assert!(!output.status.success());
    assert!(!dir.path().join("prefs.json").exists());
}

#[test]
fn save_cookies_writes_durable_store() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_ctl(dir.path(), &["save-cookies", "PHPSESSID=abc; driver_id=77"]);
    assert!(output.status.success(), "save-cookies failed: {:?}", output);

    assert_eq!(
        read_prefs(dir.path())["saved_cookies"],
        "PHPSESSID=abc; driver_id=77"
    );
}

#[test]
fn status_fails_when_nothing_is_listening() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_ctl(dir.path(), &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to connect"));
}
