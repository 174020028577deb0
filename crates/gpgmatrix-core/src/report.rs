//! Result aggregation and matrix rendering.
//!
//! Runs every trial kind against every release, mapping any raised error to
//! a FAIL cell and any clean return to OK. No error escapes to abort the
//! run; the overall process exit reflects whether any cell failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::build::{build_dependencies, build_version};
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::fetch::ArtifactSource;
use crate::trial::{run_trial, TrialConfig, TrialKind};
use crate::versions::{HarnessLayout, ToolVersion};

/// Outcome of one (version, trial-kind) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrialOutcome {
    Pending,
    Ok,
    Fail,
}

impl std::fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TrialOutcome::Pending => "PENDING",
            TrialOutcome::Ok => "OK",
            TrialOutcome::Fail => "FAIL",
        };
        f.write_str(label)
    }
}

/// One cell of the final matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixCell {
    pub version: String,
    pub trial: TrialKind,
    pub outcome: TrialOutcome,
}

/// The full version × trial-kind matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub run_at: DateTime<Utc>,
    pub cells: Vec<MatrixCell>,
}

impl MatrixReport {
    /// All cells created PENDING, in run order.
    pub fn pending(versions: &[ToolVersion]) -> Self {
        let cells = versions
            .iter()
            .flat_map(|tool| {
                TrialKind::all().into_iter().map(|trial| MatrixCell {
                    version: tool.version.clone(),
                    trial,
                    outcome: TrialOutcome::Pending,
                })
            })
            .collect();
        Self {
            run_at: Utc::now(),
            cells,
        }
    }

    /// Record the outcome of one cell. A cell is written exactly once.
    pub fn set(&mut self, version: &str, trial: TrialKind, outcome: TrialOutcome) {
        if let Some(cell) = self
            .cells
            .iter_mut()
            .find(|c| c.version == version && c.trial == trial)
        {
            cell.outcome = outcome;
        }
    }

    /// True when every cell is OK.
    pub fn is_success(&self) -> bool {
        self.cells.iter().all(|c| c.outcome == TrialOutcome::Ok)
    }

    /// Process exit status: 0 on full success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Aligned text table, one row per version.
    pub fn render_table(&self) -> String {
        let kinds = TrialKind::all();
        let mut versions: Vec<&str> = Vec::new();
        for cell in &self.cells {
            if !versions.contains(&cell.version.as_str()) {
                versions.push(&cell.version);
            }
        }

        let mut table = format!("{:>10}", "version");
        for kind in &kinds {
            table.push_str(&format!("  {:<17}", kind.name()));
        }
        table.push('\n');

        for version in versions {
            table.push_str(&format!("{version:>10}"));
            for kind in &kinds {
                let outcome = self
                    .cells
                    .iter()
                    .find(|c| c.version == version && c.trial == *kind)
                    .map(|c| c.outcome)
                    .unwrap_or(TrialOutcome::Pending);
                table.push_str(&format!("  {:<17}", outcome.to_string()));
            }
            table.push('\n');
        }
        table
    }
}

/// Build every release, run every trial, and aggregate the matrix.
///
/// Build failures mark every cell of the affected version FAIL and move on
/// to the next version; trial failures mark their own cell. The returned
/// report is complete even when everything failed.
pub async fn run_matrix(
    layout: &HarnessLayout,
    versions: &[ToolVersion],
    config: &TrialConfig,
    source: &dyn ArtifactSource,
    runner: &dyn CommandRunner,
) -> Result<MatrixReport> {
    let mut report = MatrixReport::pending(versions);

    let prefixes = match build_dependencies(layout, source, runner).await {
        Ok(p) => p,
        Err(e) => {
            // Nothing can build without the library chain.
            error!(error = %e, "dependency chain build failed");
            for cell in &mut report.cells {
                cell.outcome = TrialOutcome::Fail;
            }
            return Ok(report);
        }
    };

    for tool in versions {
        info!(version = %tool.version, "verifying release");

        if let Err(e) = build_version(tool, &prefixes, source, runner).await {
            error!(version = %tool.version, error = %e, "build failed");
            for kind in TrialKind::all() {
                report.set(&tool.version, kind, TrialOutcome::Fail);
            }
            continue;
        }

        for kind in TrialKind::all() {
            let outcome = match run_trial(tool, kind, config, runner).await {
                Ok(()) => TrialOutcome::Ok,
                Err(e) => {
                    error!(version = %tool.version, trial = %kind, error = %e, "trial failed");
                    TrialOutcome::Fail
                }
            };
            report.set(&tool.version, kind, outcome);
        }
    }

    Ok(report)
}
