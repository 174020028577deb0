//! gpg-agent session management for the 2.x releases.
//!
//! The agent configuration is a one-substitution template: only the
//! pinentry executable path is rendered in. Agent daemonization output is
//! parsed structurally for `GPG_AGENT_INFO` (pre-2.1 agents print it; 2.1+
//! agents use a standard socket and print nothing).

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{GpgMatrixError, Result};
use crate::exec::{CommandRunner, CommandSpec, EnvMap};
use crate::versions::ToolVersion;

/// Agent configuration template; `{{pinentry}}` is the only substitution.
pub const AGENT_CONF_TEMPLATE: &str = include_str!("../conf/gpg-agent.conf.tmpl");

/// Render the agent configuration for a given pinentry executable.
pub fn render_agent_conf(pinentry: &Path) -> String {
    AGENT_CONF_TEMPLATE.replace("{{pinentry}}", &pinentry.to_string_lossy())
}

/// Write the rendered agent configuration into a fresh credential store.
pub fn write_agent_conf(home: &Path, pinentry: &Path) -> Result<()> {
    std::fs::write(home.join("gpg-agent.conf"), render_agent_conf(pinentry))?;
    Ok(())
}

/// Pull the socket descriptor out of `gpg-agent --daemon` stdout.
///
/// The agent prints a shell export of the form
/// `GPG_AGENT_INFO=<socket>:<pid>:1; export GPG_AGENT_INFO;`.
pub fn parse_agent_info(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if let Some(rest) = line.trim().strip_prefix("GPG_AGENT_INFO=") {
            let value = rest.split(';').next().unwrap_or("").trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Start a daemonized agent for this release. Returns the `GPG_AGENT_INFO`
/// value when the agent printed one.
pub async fn start_agent(
    tool: &ToolVersion,
    env: &EnvMap,
    runner: &dyn CommandRunner,
) -> Result<Option<String>> {
    let spec = CommandSpec::new(tool.agent_binary().to_string_lossy())
        .arg("--daemon")
        .clear_env()
        .envs(env);

    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::Agent(format!(
            "gpg-agent --daemon exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }

    let info = parse_agent_info(&out.stdout);
    debug!(agent_info = ?info, "agent started");
    Ok(info)
}

/// Terminate any agent left running for this trial. Failure to find one is
/// not an error.
pub async fn stop_agent(env: &EnvMap, runner: &dyn CommandRunner) {
    let spec = CommandSpec::new("killall")
        .arg("gpg-agent")
        .clear_env()
        .envs(env);
    match runner.run(&spec).await {
        Ok(out) if !out.success => {
            debug!("no running gpg-agent to stop");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to run killall gpg-agent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_pinentry_path() {
        let conf = render_agent_conf(Path::new("/opt/stub/pinentry-stub"));
        assert!(conf.contains("pinentry-program /opt/stub/pinentry-stub"));
        assert!(!conf.contains("{{pinentry}}"));
    }

    #[test]
    fn test_parse_agent_info() {
        let stdout = "GPG_AGENT_INFO=/tmp/gpg-abc/S.gpg-agent:12345:1; export GPG_AGENT_INFO;\n";
        assert_eq!(
            parse_agent_info(stdout).unwrap(),
            "/tmp/gpg-abc/S.gpg-agent:12345:1"
        );
    }

    #[test]
    fn test_parse_agent_info_absent() {
        assert_eq!(parse_agent_info("gpg-agent[99]: started\n"), None);
        assert_eq!(parse_agent_info(""), None);
    }

    #[tokio::test]
    async fn test_start_agent_failure_maps_to_agent_error() {
        use crate::fakes::RecordingRunner;
        use crate::versions::{HarnessLayout, ToolVersion};

        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "2.0.29").unwrap();
        let runner = RecordingRunner::new();
        runner.fail_when("gpg-agent");

        let err = start_agent(&tool, &EnvMap::new(), &runner).await.unwrap_err();
        assert!(matches!(err, GpgMatrixError::Agent(_)));
    }
}
