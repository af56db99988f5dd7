use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const EVENTS: &str = r#"{"tabId":0,"event":{"type":2,"timestamp":1000}}
{"tabId":0,"event":{"type":3,"timestamp":1000}}
{"tabId":1,"event":{"type":2,"timestamp":1100}}
{"tabId":0,"event":{"type":5,"timestamp":1200}}
{"tabId":0,"event":{"type":3,"timestamp":1500}}
"#;

const DRIVER: &str = r#"
printf '%s\n' '{"tabId":0,"event":{"type":4,"timestamp":1000,"data":{"href":"https://example.test/"}}}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"close"'*) printf '{"id":%s,"ok":true}\n' "$id"; exit 0 ;;
    *) printf '{"id":%s,"ok":true,"result":null}\n' "$id" ;;
  esac
done
"#;

fn rewind(socket: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rewind").unwrap();
    cmd.env("REWIND_SOCKET", socket)
        .env("NO_COLOR", "1")
        .env_remove("REWIND_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn run_dir(dir: &TempDir) -> PathBuf {
    let run = dir.path().join("run");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("events.jsonl"), EVENTS).unwrap();
    run
}

fn json_stdout(output: &[u8]) -> Value {
    serde_json::from_slice(output).unwrap()
}

#[test]
fn test_status_without_recorder_is_not_running() {
    let dir = TempDir::new().unwrap();
    rewind(&dir.path().join("absent.sock"))
        .arg("status")
        .assert()
        .code(69)
        .stderr(predicate::str::contains("Error: Recorder not running"))
        .stderr(predicate::str::contains("Suggestion:"));
}

#[test]
fn test_unknown_tool_is_usage_error() {
    let dir = TempDir::new().unwrap();
    rewind(&dir.path().join("absent.sock"))
        .args(["action", "teleport"])
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Unknown tool 'teleport'"));
}

#[test]
fn test_bad_action_json_is_usage_error() {
    let dir = TempDir::new().unwrap();
    rewind(&dir.path().join("absent.sock"))
        .args(["action", "click", "{selector"])
        .assert()
        .code(64)
        .stderr(predicate::str::contains("not valid JSON"));
}

#[test]
fn test_daemon_requires_browser_driver() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("r.sock");
    rewind(&socket)
        .env("REWIND_HOME", dir.path().join("home"))
        .env_remove("REWIND_BROWSER_CMD")
        .arg("daemon")
        .assert()
        .code(69)
        .stderr(predicate::str::contains("No browser driver configured"))
        .stderr(predicate::str::contains("REWIND_BROWSER_CMD"));
    assert!(!socket.exists());
}

#[test]
fn test_stop_without_recorder_succeeds() {
    let dir = TempDir::new().unwrap();
    rewind(&dir.path().join("absent.sock"))
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn test_offline_resolve_rounds_down() {
    let dir = TempDir::new().unwrap();
    let run = run_dir(&dir);
    let socket = dir.path().join("absent.sock");

    let output = rewind(&socket)
        .args(["resolve", "@1200", "--json", "--run"])
        .arg(&run)
        .output()
        .unwrap();
    assert!(output.status.success());
    let result = json_stdout(&output.stdout);
    assert_eq!(result["locator"], "1100#0");
    assert_eq!(result["resolution"]["frame"]["i"], 2);

    let output = rewind(&socket)
        .args(["resolve", "@1200", "--tab", "0", "--json", "--run"])
        .arg(&run)
        .output()
        .unwrap();
    let result = json_stdout(&output.stdout);
    assert_eq!(result["locator"], "1000#1");

    rewind(&socket)
        .args(["resolve", "1500#0", "--run"])
        .arg(&run)
        .assert()
        .success()
        .stdout(predicate::str::contains("Frame 3 at 1500#0 (tab 0)"));
}

#[test]
fn test_offline_resolve_before_first_frame_is_not_found() {
    let dir = TempDir::new().unwrap();
    let run = run_dir(&dir);
    rewind(&dir.path().join("absent.sock"))
        .args(["resolve", "@900", "--run"])
        .arg(&run)
        .assert()
        .code(69)
        .stderr(predicate::str::contains("No frame matches"));

    rewind(&dir.path().join("absent.sock"))
        .args(["resolve", "@900", "--run"])
        .arg(dir.path().join("nowhere"))
        .assert()
        .code(69)
        .stderr(predicate::str::contains("No event log"));
}

#[test]
fn test_invalid_locator_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let run = run_dir(&dir);
    rewind(&dir.path().join("absent.sock"))
        .args(["resolve", "yesterday-ish", "--run"])
        .arg(&run)
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Invalid locator"));
}

#[test]
fn test_reindex_verify_then_rebuild() {
    let dir = TempDir::new().unwrap();
    let run = run_dir(&dir);
    let socket = dir.path().join("absent.sock");

    rewind(&socket)
        .args(["reindex", "--verify"])
        .arg(&run)
        .assert()
        .code(64)
        .stdout(predicate::str::contains("Missing tail: 4 frames"))
        .stderr(predicate::str::contains("does not match its event log"));
    assert!(!run.join("frames.jsonl").exists());

    rewind(&socket)
        .arg("reindex")
        .arg(&run)
        .assert()
        .success()
        .stdout(predicate::str::contains("Index rebuilt (4 frames"));
    assert_eq!(
        std::fs::read_to_string(run.join("frames.jsonl"))
            .unwrap()
            .lines()
            .count(),
        4
    );

    rewind(&socket)
        .args(["reindex", "--verify"])
        .arg(&run)
        .assert()
        .success()
        .stdout(predicate::str::contains("Index matches event log (4 frames)"));
}

struct Recorder {
    child: Child,
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_recorder_end_to_end() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("r.sock");
    let script = dir.path().join("driver.sh");
    std::fs::write(&script, DRIVER).unwrap();

    let mut recorder = Recorder {
        child: std::process::Command::new(assert_cmd::cargo::cargo_bin("rewind"))
            .args(["daemon", "--url", "https://example.test/"])
            .env("REWIND_SOCKET", &socket)
            .env("REWIND_HOME", dir.path().join("home"))
            .env("REWIND_BROWSER_CMD", format!("sh {}", script.display()))
            .env("REWIND_LOG_SYNC", "flush")
            .env("REWIND_KILL_GRACE_MS", "200")
            .env_remove("REWIND_REPLAY_CMD")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap(),
    };

    let active = wait_until(Duration::from_secs(10), || {
        let output = rewind(&socket).args(["status", "--json"]).output().unwrap();
        output.status.success() && json_stdout(&output.stdout)["state"] == "active"
    });
    assert!(active, "recorder never became active");

    rewind(&socket).arg("ping").assert().success();

    let output = rewind(&socket).args(["tabs", "--json"]).output().unwrap();
    let tabs = json_stdout(&output.stdout);
    assert_eq!(tabs["tabs"][0]["url"], "https://example.test/");

    let output = rewind(&socket)
        .args(["resolve", "#0", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(json_stdout(&output.stdout)["locator"], "1000#0");

    rewind(&socket)
        .args(["replay", "#0"])
        .assert()
        .code(69)
        .stderr(predicate::str::contains("unhandled"));

    rewind(&socket)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));

    let exited = wait_until(Duration::from_secs(10), || {
        matches!(recorder.child.try_wait(), Ok(Some(_)))
    });
    assert!(exited, "recorder did not exit after stop");
    assert!(!socket.exists());
}
