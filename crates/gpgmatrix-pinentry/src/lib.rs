//! Minimal pinentry protocol implementation.
//!
//! A signing tool talks to its passphrase-entry helper over a line-based
//! request/response exchange. This stub always serves a fixed secret.
//! When a break flag file exists it instead simulates a non-functional
//! entry device, so fallback paths can be exercised without changing any
//! code.
//!
//! Dispatch is pure ([`respond`]) and unit-testable; the `pinentry-stub`
//! binary wraps it around stdin/stdout.

use std::path::Path;

/// The fixed secret served for every `GETPIN`.
pub const SECRET: &str = "trustno1";

/// Flavor string reported to `GETINFO flavor`.
pub const FLAVOR: &str = "matrix:matrix";

/// Version string reported to `GETINFO version`.
pub const STUB_VERSION: &str = "0.0.0";

/// Greeting emitted before the request loop.
pub const GREETING: &str = "OK Your orders please";

/// Break flag file name; its presence switches the stub into break mode.
pub const BREAK_FLAG_NAME: &str = ".pinentry.break";

/// Error line emitted for `GETPIN` in break mode, matching the agent's
/// "no usable terminal" failure.
pub const BREAK_ERROR: &str = "ERR 83918950 Inappropriate ioctl for device <Pinentry>";

/// Per-invocation stub state: break mode is read once at startup and never
/// changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubSession {
    pub break_mode: bool,
}

impl StubSession {
    /// Detect break mode from the flag file in `flag_dir`.
    pub fn detect(flag_dir: &Path) -> Self {
        Self {
            break_mode: flag_dir.join(BREAK_FLAG_NAME).is_file(),
        }
    }
}

/// Response to one request line: the lines to write, and an exit code when
/// the stub must terminate instead of serving further requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub exit: Option<i32>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            lines: vec!["OK".to_string()],
            exit: None,
        }
    }

    fn data(value: impl Into<String>) -> Self {
        Self {
            lines: vec![format!("D {}", value.into()), "OK".to_string()],
            exit: None,
        }
    }
}

/// Dispatch one request line. Commands match on a case-insensitive prefix;
/// anything unrecognized is accepted with a bare `OK`.
pub fn respond(line: &str, session: &StubSession, pid: u32) -> Reply {
    let upper = line.trim().to_ascii_uppercase();

    if upper.starts_with("GETPIN") {
        if session.break_mode {
            return Reply {
                lines: vec![BREAK_ERROR.to_string()],
                exit: Some(1),
            };
        }
        return Reply::data(SECRET);
    }

    if upper.starts_with("GETINFO FLAVOR") {
        return Reply::data(FLAVOR);
    }
    if upper.starts_with("GETINFO VERSION") {
        return Reply::data(STUB_VERSION);
    }
    if upper.starts_with("GETINFO PID") {
        return Reply::data(pid.to_string());
    }

    Reply::ok()
}
