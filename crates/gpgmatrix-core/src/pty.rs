//! Pseudo-terminal prompt driver.
//!
//! Models the interactive passphrase exchange as a byte-stream protocol:
//! read until a pattern matches (bounded by a deadline, so a child that
//! never prompts cannot hang the run), write a fixed reply, then drain to
//! end-of-output. Reads happen on a dedicated thread feeding a channel;
//! the driver itself only ever blocks with a timeout.
//!
//! An EIO from the master side after the prompt was answered means the
//! child closed its terminal and is treated as end-of-output, not as a
//! failure; the pass/fail signal is the child's exit status.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use tracing::debug;

use crate::error::{GpgMatrixError, Result};
use crate::exec::EnvMap;

/// A child process attached to a pseudo-terminal.
pub struct PromptDriver {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    chunks: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    // Keeps the master side open until the driver is dropped.
    _master: Box<dyn MasterPty + Send>,
}

impl PromptDriver {
    /// Spawn `program args` on a fresh PTY with exactly `env` as its
    /// environment, in `cwd`.
    pub fn spawn(program: &str, args: &[&str], cwd: &Path, env: &EnvMap) -> Result<Self> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GpgMatrixError::Commit(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        cmd.env_clear();
        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GpgMatrixError::Commit(format!("pty spawn failed: {e}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GpgMatrixError::Commit(format!("pty reader failed: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GpgMatrixError::Commit(format!("pty writer failed: {e}")))?;

        let (tx, chunks) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    // EOF, or EIO once the child hung up its terminal.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            child,
            writer,
            chunks,
            buffer: Vec::new(),
            _master: pair.master,
        })
    }

    /// Read output until `pattern` matches or `wait` elapses.
    ///
    /// Returns the accumulated output on a match, `None` on deadline or
    /// end-of-output without a match. Never blocks past the deadline.
    pub fn expect(&mut self, pattern: &Regex, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        loop {
            let seen = String::from_utf8_lossy(&self.buffer).to_string();
            if pattern.is_match(&seen) {
                return Some(seen);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.chunks.recv_timeout(remaining) {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }

    /// Write `text` followed by carriage-return/newline, as a terminal user
    /// ending a line would.
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(format!("{text}\r\n").as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| GpgMatrixError::Commit(format!("pty write failed: {e}")))
    }

    /// Consume the rest of the child's output, up to `wait` of quiet time.
    /// Transport errors here are tolerated by construction: the reader
    /// thread already folded them into end-of-stream.
    pub fn drain(&mut self, wait: Duration) -> String {
        loop {
            match self.chunks.recv_timeout(wait) {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&self.buffer).to_string()
    }

    /// Forcibly terminate the child (used when a prompt never appeared and
    /// the child would otherwise outlive the trial).
    pub fn terminate(&mut self) {
        self.child.kill().ok();
    }

    /// Poll for child exit for at most `wait`. `Ok(None)` means the child
    /// is still running when the deadline passes.
    pub fn wait_timeout(&mut self, wait: Duration) -> Result<Option<bool>> {
        let deadline = Instant::now() + wait;
        loop {
            let status = self
                .child
                .try_wait()
                .map_err(|e| GpgMatrixError::Commit(format!("pty try_wait failed: {e}")))?;
            if let Some(status) = status {
                return Ok(Some(status.success()));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Wait for the child to exit; true when it exited zero.
    pub fn wait(&mut self) -> Result<bool> {
        let status = self
            .child
            .wait()
            .map_err(|e| GpgMatrixError::Commit(format!("pty wait failed: {e}")))?;
        debug!(success = status.success(), "pty child exited");
        Ok(status.success())
    }
}
