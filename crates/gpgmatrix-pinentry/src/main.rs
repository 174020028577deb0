//! pinentry-stub: line loop wrapping the protocol dispatch.
//!
//! Reads newline-terminated requests from stdin and answers on stdout with
//! unbuffered writes until input is exhausted. Break mode is decided once
//! at startup from the flag file; every invocation is recorded in
//! `$LOG_DIR/pinentry.log` for post-hoc diagnosis.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use gpgmatrix_pinentry::{respond, StubSession, GREETING};

fn flag_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PINENTRY_BREAK_DIR") {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn log_invocation(session: &StubSession) {
    let Ok(log_dir) = std::env::var("LOG_DIR") else {
        return;
    };
    let line = format!(
        "{} pinentry invoked with break={}\n",
        chrono::Utc::now().to_rfc3339(),
        session.break_mode
    );
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(PathBuf::from(log_dir).join("pinentry.log"))
    {
        file.write_all(line.as_bytes()).ok();
    }
}

fn main() {
    let session = StubSession::detect(&flag_dir());
    log_invocation(&session);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let pid = std::process::id();

    writeln!(out, "{GREETING}").ok();
    out.flush().ok();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let reply = respond(&line, &session, pid);
        for reply_line in &reply.lines {
            writeln!(out, "{reply_line}").ok();
        }
        out.flush().ok();
        if let Some(code) = reply.exit {
            std::process::exit(code);
        }
    }
}
