//! End-to-end protocol tests against the real pinentry-stub binary.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

fn spawn_stub(break_dir: &std::path::Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_pinentry-stub"))
        .env("PINENTRY_BREAK_DIR", break_dir)
        .env_remove("LOG_DIR")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn pinentry-stub")
}

fn converse(mut child: Child, requests: &str) -> (String, i32) {
    child
        .stdin
        .take()
        .unwrap()
        .write_all(requests.as_bytes())
        .unwrap();
    // Dropping stdin closes it, ending the request loop.
    let mut output = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut output)
        .unwrap();
    let status = child.wait().unwrap();
    (output, status.code().unwrap_or(-1))
}

#[test]
fn greeting_precedes_request_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (output, code) = converse(spawn_stub(dir.path()), "");
    assert!(output.starts_with("OK Your orders please\n"));
    assert_eq!(code, 0);
}

#[test]
fn getpin_serves_fixed_secret() {
    let dir = tempfile::tempdir().unwrap();
    let (output, code) = converse(spawn_stub(dir.path()), "GETPIN\n");
    assert_eq!(output, "OK Your orders please\nD trustno1\nOK\n");
    assert_eq!(code, 0);
}

#[test]
fn break_mode_errors_with_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".pinentry.break"), b"").unwrap();

    let (output, code) = converse(spawn_stub(dir.path()), "GETPIN\n");
    assert!(output.contains("ERR 83918950"));
    assert!(!output.contains("D trustno1"));
    assert_ne!(code, 0);
}

#[test]
fn getinfo_pid_reports_own_process_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = spawn_stub(dir.path());
    let pid = child.id();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"GETINFO pid\n")
        .unwrap();
    let mut output = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut output)
        .unwrap();
    child.wait().unwrap();

    assert!(output.contains(&format!("D {pid}\n")));
}

#[test]
fn unknown_requests_are_accepted_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (output, code) = converse(
        spawn_stub(dir.path()),
        "OPTION no-grab\nGETINFO version\nSETDESC hi\n",
    );
    assert_eq!(
        output,
        "OK Your orders please\nOK\nD 0.0.0\nOK\nOK\n"
    );
    assert_eq!(code, 0);
}

#[test]
fn invocation_is_logged_per_trial() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = tempfile::tempdir().unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_pinentry-stub"))
        .env("PINENTRY_BREAK_DIR", dir.path())
        .env("LOG_DIR", log_dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    drop(child.stdin.take());
    child.wait().unwrap();

    let log = std::fs::read_to_string(log_dir.path().join("pinentry.log")).unwrap();
    assert!(log.contains("break=false"));
}
