//! In-memory fakes for the subprocess and artifact seams (testing only)
//!
//! Provides `RecordingRunner` and `StaticSource` that satisfy the trait
//! contracts without spawning processes or touching the network, so build
//! ordering and idempotency can be asserted directly.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::fetch::ArtifactSource;
use crate::error::Result;

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

/// Command runner that records every invocation instead of executing it.
///
/// Commands succeed with empty output unless a registered failure substring
/// matches their rendered form. Canned stdout can be registered per
/// substring for commands whose output the caller parses.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    fail_matching: Mutex<Vec<String>>,
    stdout_for: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command whose rendered form contains `substr` exit 1.
    pub fn fail_when(&self, substr: impl Into<String>) {
        self.fail_matching.lock().unwrap().push(substr.into());
    }

    /// Serve `stdout` for commands whose rendered form contains `substr`.
    pub fn stdout_when(&self, substr: impl Into<String>, stdout: impl Into<String>) {
        self.stdout_for
            .lock()
            .unwrap()
            .push((substr.into(), stdout.into()));
    }

    /// Snapshot of everything run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, in invocation order.
    pub fn rendered_calls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(CommandSpec::rendered)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let rendered = spec.rendered();
        self.calls.lock().unwrap().push(spec.clone());

        let fails = self
            .fail_matching
            .lock()
            .unwrap()
            .iter()
            .any(|s| rendered.contains(s.as_str()));
        if fails {
            return Ok(CommandOutput::exited(1));
        }

        let stdout = self
            .stdout_for
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| rendered.contains(s.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            success: true,
        })
    }
}

// ---------------------------------------------------------------------------
// StaticSource
// ---------------------------------------------------------------------------

/// Artifact source serving a fixed link list; downloads create an empty file.
#[derive(Default)]
pub struct StaticSource {
    links: Vec<String>,
    downloads: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn new(links: Vec<String>) -> Self {
        Self {
            links,
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// URLs downloaded so far.
    pub fn downloaded(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactSource for StaticSource {
    async fn index_links(&self) -> Result<Vec<String>> {
        Ok(self.links.clone())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.downloads.lock().unwrap().push(url.to_string());
        std::fs::write(dest, b"")?;
        Ok(())
    }
}
