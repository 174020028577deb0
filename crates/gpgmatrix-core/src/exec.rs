//! Subprocess execution seam.
//!
//! Every external command (configure, make, tar, patch, git, gpg) goes
//! through the [`CommandRunner`] trait so the pipeline and trial engine can
//! be exercised in tests without a compiler toolchain or network. The real
//! implementation, [`ShellRunner`], runs commands via `tokio::process` with
//! captured output and an optional timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GpgMatrixError, Result};

/// Explicit environment map handed to each subprocess invocation.
///
/// The process-wide environment table is never mutated; per-trial and
/// per-build variables exist only inside one of these maps, so nothing can
/// leak from one trial into the next.
pub type EnvMap = BTreeMap<String, String>;

/// Specification of a single external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, in order.
    pub args: Vec<String>,

    /// Working directory, if different from the parent's.
    pub cwd: Option<PathBuf>,

    /// Environment overlay (or the whole environment when `clear_env`).
    pub env: EnvMap,

    /// When true, the child sees only `env`; nothing is inherited.
    pub clear_env: bool,

    /// File to connect to the child's stdin (batch keygen parameter file).
    pub stdin_file: Option<PathBuf>,

    /// Timeout in seconds; 0 means wait indefinitely.
    pub timeout_secs: u64,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: EnvMap::new(),
            clear_env: false,
            stdin_file: None,
            timeout_secs: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, map: &EnvMap) -> Self {
        for (k, v) in map {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Drop the inherited environment entirely.
    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// One-line rendering for logs and error messages.
    pub fn rendered(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Whether the command exited zero.
    pub success: bool,
}

impl CommandOutput {
    /// Convenience constructor for fakes and tests.
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            success: exit_code == 0,
        }
    }
}

/// Trait for subprocess backends.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute a command to completion and capture its output.
    ///
    /// A non-zero exit is *not* an error at this level; callers decide which
    /// taxonomy variant a failed step maps to.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Real subprocess runner.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.rendered(), cwd = ?spec.cwd, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);

        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        match &spec.stdin_file {
            Some(path) => {
                cmd.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        let child = cmd.spawn()?;

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                GpgMatrixError::Timeout(format!(
                    "{} after {} seconds",
                    spec.rendered(),
                    spec.timeout_secs
                ))
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }
}
