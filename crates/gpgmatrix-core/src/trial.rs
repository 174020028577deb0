//! Interactive verification engine.
//!
//! One trial = one isolated credential store + working repository, a fresh
//! key, one signed commit, and a `verify-commit` check. Every subprocess in
//! the trial runs with an explicit, freshly constructed environment map, so
//! nothing a previous trial set can leak into the next one. Temporary
//! directories are owned by the trial and removed on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent;
use crate::error::{GpgMatrixError, Result};
use crate::exec::{CommandRunner, CommandSpec, EnvMap};
use crate::keys;
use crate::pty::PromptDriver;
use crate::versions::{ToolVersion, PASSPHRASE};

/// Commit message used by every trial.
const COMMIT_MESSAGE: &str = "blorp";

/// The passphrase prompt the 1.x line writes to its terminal.
const PROMPT_PATTERN: &str = "Enter passphrase";

/// The kind of passphrase-entry path a trial exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialKind {
    /// Drive the prompt over a pseudo-terminal, typing the passphrase.
    Raw,

    /// Entry goes through the pinentry stub; the stub behaves.
    StubRelay,

    /// The stub is broken (flag file present); the relay fallback path
    /// must still produce a verifiable commit.
    StubRelayBroken,
}

impl TrialKind {
    /// Every trial kind, in the order the matrix runs them.
    pub fn all() -> [TrialKind; 3] {
        [TrialKind::Raw, TrialKind::StubRelay, TrialKind::StubRelayBroken]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrialKind::Raw => "raw",
            TrialKind::StubRelay => "stub_relay",
            TrialKind::StubRelayBroken => "stub_relay_broken",
        }
    }

    fn breaks_stub(&self) -> bool {
        matches!(self, TrialKind::StubRelayBroken)
    }
}

impl std::fmt::Display for TrialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Paths and knobs shared by every trial in a run.
#[derive(Debug, Clone)]
pub struct TrialConfig {
    /// Pinentry stub executable, substituted into the agent configuration.
    pub pinentry_path: PathBuf,

    /// Passphrase-relay askpass helper for the stub-relay trials.
    pub relay_askpass_path: PathBuf,

    /// Vendored git client handed to the embedding workflow; `None` uses
    /// whatever `git` the PATH resolves.
    pub vendored_git_path: Option<PathBuf>,

    /// Bound on waiting for the passphrase prompt and on draining output.
    pub prompt_timeout_secs: u64,
}

impl TrialConfig {
    pub fn new(pinentry_path: impl Into<PathBuf>, relay_askpass_path: impl Into<PathBuf>) -> Self {
        Self {
            pinentry_path: pinentry_path.into(),
            relay_askpass_path: relay_askpass_path.into(),
            vendored_git_path: None,
            prompt_timeout_secs: 60,
        }
    }
}

/// Fresh per-trial environment: a minimal passthrough of the parent's
/// session variables plus the isolated credential-store locations. Built
/// from scratch each trial, so prior-trial variables cannot survive.
pub fn base_env(home: &Path, log_dir: &Path) -> EnvMap {
    let mut env = EnvMap::new();
    for key in ["PATH", "HOME", "USER", "LOGNAME", "TERM", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    env.insert("GNUPGHOME".to_string(), home.to_string_lossy().to_string());
    env.insert("LOG_DIR".to_string(), log_dir.to_string_lossy().to_string());
    // The stub looks for its break flag next to the credential store.
    env.insert(
        "PINENTRY_BREAK_DIR".to_string(),
        home.to_string_lossy().to_string(),
    );
    env
}

/// Point the embedding workflow's variables at the relay helper, the stub
/// and the working directory.
fn embedding_env(env: &mut EnvMap, config: &TrialConfig, repo: &Path, tmp: &Path) {
    let askpass = config.relay_askpass_path.to_string_lossy().to_string();
    let git = config
        .vendored_git_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| "git".to_string());

    env.insert("ATOM_GITHUB_TMP".to_string(), tmp.to_string_lossy().to_string());
    env.insert("ATOM_GITHUB_ASKPASS_PATH".to_string(), askpass.clone());
    env.insert(
        "ATOM_GITHUB_WORKDIR_PATH".to_string(),
        repo.to_string_lossy().to_string(),
    );
    env.insert("ATOM_GITHUB_DUGITE_PATH".to_string(), git);
    env.insert(
        "ATOM_GITHUB_PINENTRY_PATH".to_string(),
        config.pinentry_path.to_string_lossy().to_string(),
    );
    env.insert(
        "ATOM_GITHUB_ORIGINAL_PATH".to_string(),
        env.get("PATH").cloned().unwrap_or_default(),
    );
    env.insert(
        "ATOM_GITHUB_ORIGINAL_GIT_ASKPASS".to_string(),
        env.get("GIT_ASKPASS").cloned().unwrap_or_default(),
    );
    env.insert(
        "ATOM_GITHUB_ORIGINAL_SSH_ASKPASS".to_string(),
        env.get("SSH_ASKPASS").cloned().unwrap_or_default(),
    );
    env.insert("GIT_ASKPASS".to_string(), askpass.clone());
    env.insert("SSH_ASKPASS".to_string(), askpass);
    env.insert("DISPLAY".to_string(), "atom-github-placeholder".to_string());
}

/// Run one trial for one release. Any step error short-circuits the rest of
/// the trial and is reported to the caller; the temporary directories are
/// removed regardless.
pub async fn run_trial(
    tool: &ToolVersion,
    kind: TrialKind,
    config: &TrialConfig,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let home = tempfile::Builder::new()
        .prefix(&format!("gpg-home-{}-", tool.version))
        .tempdir()?;
    let repo = tempfile::Builder::new()
        .prefix(&format!("gpg-git-{}-", tool.version))
        .tempdir()?;
    let log_dir = home.path().join("logs");
    std::fs::create_dir_all(&log_dir)?;

    info!(version = %tool.version, trial = %kind, home = %home.path().display(), "starting trial");
    log_line(&log_dir, &format!("trial {kind} start, gnupg {}", tool.version));

    let mut env = base_env(home.path(), &log_dir);

    agent::write_agent_conf(home.path(), &config.pinentry_path)?;
    let params_file = home.path().join("key-parameters");
    std::fs::write(&params_file, keys::KEY_PARAMETERS)?;

    let mut agent_started = false;
    let result = async {
        if tool.requires_agent {
            if let Some(agent_info) = agent::start_agent(tool, &env, runner).await? {
                env.insert("GPG_AGENT_INFO".to_string(), agent_info);
            }
            agent_started = true;
        }
        run_steps(
            tool,
            kind,
            config,
            runner,
            repo.path(),
            home.path(),
            &params_file,
            &env,
        )
        .await
    }
    .await;

    if agent_started {
        agent::stop_agent(&env, runner).await;
    }

    let verdict = if result.is_ok() { "ok" } else { "fail" };
    log_line(&log_dir, &format!("trial {kind} {verdict}"));
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_steps(
    tool: &ToolVersion,
    kind: TrialKind,
    config: &TrialConfig,
    runner: &dyn CommandRunner,
    repo: &Path,
    home: &Path,
    params_file: &Path,
    env: &EnvMap,
) -> Result<()> {
    let gpg_bin = tool.gpg_binary();

    keys::generate_key(&gpg_bin, params_file, env, runner).await?;

    let listing = keys::list_keys(&gpg_bin, env, runner).await?;
    let signing_key = keys::parse_signing_key(&listing)?;
    info!(signing_key = %signing_key, "key generated");

    init_signing_repo(repo, &gpg_bin, &signing_key, env, runner).await?;

    match kind {
        TrialKind::Raw => raw_commit(repo, config, env).await?,
        TrialKind::StubRelay | TrialKind::StubRelayBroken => {
            let mut relay_env = env.clone();
            embedding_env(&mut relay_env, config, repo, home);
            if kind.breaks_stub() {
                // Forces the primary entry path to fail before the commit
                // is attempted; the relay fallback must carry it.
                std::fs::write(home.join(".pinentry.break"), b"")?;
            }
            relay_commit(repo, &relay_env, runner).await?;
        }
    }

    verify_commit(repo, env, runner).await
}

/// Create the working repository: one tracked file, signing configuration
/// pointing at this release's binary and key.
pub async fn init_signing_repo(
    repo: &Path,
    gpg_bin: &Path,
    signing_key: &str,
    env: &EnvMap,
    runner: &dyn CommandRunner,
) -> Result<()> {
    std::fs::write(repo.join("afile.txt"), "contents\n")?;

    let gpg_program = gpg_bin.to_string_lossy();
    let steps: Vec<Vec<&str>> = vec![
        vec!["init", "."],
        vec!["config", "gpg.program", &gpg_program],
        vec!["config", "commit.gpgsign", "true"],
        vec!["config", "user.signingkey", signing_key],
        vec!["config", "user.name", "gpgmatrix harness"],
        vec!["config", "user.email", "harness@gpgmatrix.invalid"],
        vec!["add", "afile.txt"],
    ];
    for args in steps {
        git(repo, env, &args, runner).await?;
    }
    Ok(())
}

/// Raw trial: commit on a pseudo-terminal, answer the passphrase prompt.
async fn raw_commit(repo: &Path, config: &TrialConfig, env: &EnvMap) -> Result<()> {
    let repo = repo.to_path_buf();
    let env = env.clone();
    let timeout = Duration::from_secs(config.prompt_timeout_secs);

    let success = tokio::task::spawn_blocking(move || -> Result<bool> {
        let script = format!("export GPG_TTY=$(tty); exec git commit -m {COMMIT_MESSAGE}");
        let mut driver = PromptDriver::spawn("sh", &["-c", &script], &repo, &env)?;

        let prompt = Regex::new(PROMPT_PATTERN).expect("static prompt pattern");
        match driver.expect(&prompt, timeout) {
            Some(_) => driver.send_line(PASSPHRASE)?,
            // Agent-backed releases satisfy the prompt through pinentry;
            // the exit status is the real pass/fail signal either way.
            None => warn!("no passphrase prompt observed on the terminal"),
        }
        driver.drain(timeout);

        match driver.wait_timeout(timeout)? {
            Some(success) => Ok(success),
            None => {
                driver.terminate();
                Err(GpgMatrixError::Timeout(
                    "git commit did not exit within the prompt deadline".to_string(),
                ))
            }
        }
    })
    .await
    .map_err(|e| GpgMatrixError::Commit(format!("pty task panicked: {e}")))??;

    if !success {
        return Err(GpgMatrixError::Commit(
            "git commit exited non-zero under the pseudo-terminal".to_string(),
        ));
    }
    Ok(())
}

/// Stub-relay trial: no terminal, entry handled by the stub or the relay
/// fallback; a zero exit is required.
async fn relay_commit(repo: &Path, env: &EnvMap, runner: &dyn CommandRunner) -> Result<()> {
    git(repo, env, &["commit", "-m", COMMIT_MESSAGE], runner).await
}

async fn verify_commit(repo: &Path, env: &EnvMap, runner: &dyn CommandRunner) -> Result<()> {
    let spec = CommandSpec::new("git")
        .args(["verify-commit", "HEAD"])
        .cwd(repo)
        .clear_env()
        .envs(env);
    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::Verification(format!(
            "git verify-commit exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(())
}

async fn git(
    repo: &Path,
    env: &EnvMap,
    args: &[&str],
    runner: &dyn CommandRunner,
) -> Result<()> {
    let spec = CommandSpec::new("git")
        .args(args.iter().copied())
        .cwd(repo)
        .clear_env()
        .envs(env);
    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::Commit(format!(
            "`{}` exited {}: {}",
            spec.rendered(),
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(())
}

fn log_line(log_dir: &Path, message: &str) {
    use std::io::Write;
    let line = format!("{} {message}\n", Utc::now().to_rfc3339());
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("trial.log"))
    {
        file.write_all(line.as_bytes()).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingRunner;
    use crate::versions::{HarnessLayout, ToolVersion};

    const LISTING: &str = "pub:u:1024:17:KEYID123:2017-06-22:::u:::scESC:\n";

    fn config_for_test() -> TrialConfig {
        TrialConfig::new("/opt/stub/pinentry-stub", "/opt/stub/askpass-relay")
    }

    #[test]
    fn test_trial_kind_names() {
        let names: Vec<&str> = TrialKind::all().iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["raw", "stub_relay", "stub_relay_broken"]);
    }

    #[test]
    fn test_base_env_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let env = base_env(dir.path(), &dir.path().join("logs"));

        // Construction copies a fixed passthrough list and nothing else, so
        // variables a prior trial exported (GPG_AGENT_INFO, the embedding
        // set) are structurally excluded.
        let allowed = [
            "PATH",
            "HOME",
            "USER",
            "LOGNAME",
            "TERM",
            "LANG",
            "GNUPGHOME",
            "LOG_DIR",
            "PINENTRY_BREAK_DIR",
        ];
        for key in env.keys() {
            assert!(allowed.contains(&key.as_str()), "unexpected key {key}");
        }
        assert_eq!(
            env.get("GNUPGHOME").unwrap(),
            &dir.path().to_string_lossy().to_string()
        );
    }

    #[test]
    fn test_embedding_env_points_at_relay_and_stub() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = base_env(dir.path(), &dir.path().join("logs"));
        let config = config_for_test();
        embedding_env(&mut env, &config, Path::new("/work/repo"), Path::new("/work/tmp"));

        assert_eq!(env.get("GIT_ASKPASS").unwrap(), "/opt/stub/askpass-relay");
        assert_eq!(
            env.get("ATOM_GITHUB_PINENTRY_PATH").unwrap(),
            "/opt/stub/pinentry-stub"
        );
        assert_eq!(env.get("ATOM_GITHUB_WORKDIR_PATH").unwrap(), "/work/repo");
        assert_eq!(env.get("ATOM_GITHUB_DUGITE_PATH").unwrap(), "git");
        assert_eq!(env.get("DISPLAY").unwrap(), "atom-github-placeholder");
    }

    #[tokio::test]
    async fn test_stub_relay_trial_happy_path() {
        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
        let runner = RecordingRunner::new();
        runner.stdout_when("--list-keys", LISTING);

        run_trial(&tool, TrialKind::StubRelay, &config_for_test(), &runner)
            .await
            .unwrap();

        let calls = runner.rendered_calls();
        assert!(calls.iter().any(|c| c.contains("--gen-key")));
        assert!(calls.iter().any(|c| c == "git config user.signingkey KEYID123"));
        assert!(calls.iter().any(|c| c == "git commit -m blorp"));
        assert!(calls.iter().any(|c| c == "git verify-commit HEAD"));
    }

    #[tokio::test]
    async fn test_broken_stub_trial_creates_flag_before_commit() {
        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
        let runner = RecordingRunner::new();
        runner.stdout_when("--list-keys", LISTING);

        run_trial(&tool, TrialKind::StubRelayBroken, &config_for_test(), &runner)
            .await
            .unwrap();

        // The commit command carried the break-dir variable so the stub can
        // find the flag the trial dropped.
        let commit = runner
            .calls()
            .into_iter()
            .find(|c| c.rendered() == "git commit -m blorp")
            .expect("commit was run");
        assert!(commit.env.contains_key("PINENTRY_BREAK_DIR"));
        assert!(commit.env.contains_key("GIT_ASKPASS"));
    }

    #[tokio::test]
    async fn test_keygen_failure_short_circuits_trial() {
        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
        let runner = RecordingRunner::new();
        runner.fail_when("--gen-key");

        let err = run_trial(&tool, TrialKind::StubRelay, &config_for_test(), &runner)
            .await
            .unwrap_err();
        assert!(matches!(err, GpgMatrixError::Keygen(_)));
        assert!(!runner.rendered_calls().iter().any(|c| c.starts_with("git")));
    }

    #[tokio::test]
    async fn test_verification_failure_maps_to_verification_error() {
        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
        let runner = RecordingRunner::new();
        runner.stdout_when("--list-keys", LISTING);
        runner.fail_when("verify-commit");

        let err = run_trial(&tool, TrialKind::StubRelay, &config_for_test(), &runner)
            .await
            .unwrap_err();
        assert!(matches!(err, GpgMatrixError::Verification(_)));
    }

    #[tokio::test]
    async fn test_agent_lifecycle_for_2x_releases() {
        let layout = HarnessLayout::new("/tmp/.gpg");
        let tool = ToolVersion::lookup(&layout, "2.0.29").unwrap();
        let runner = RecordingRunner::new();
        runner.stdout_when("--list-keys", LISTING);
        runner.stdout_when(
            "gpg-agent --daemon",
            "GPG_AGENT_INFO=/tmp/S.gpg-agent:111:1; export GPG_AGENT_INFO;\n",
        );

        run_trial(&tool, TrialKind::StubRelay, &config_for_test(), &runner)
            .await
            .unwrap();

        let calls = runner.rendered_calls();
        assert!(calls.first().unwrap().contains("gpg-agent --daemon"));
        assert_eq!(calls.last().unwrap(), "killall gpg-agent");

        // Commands after agent startup carry the parsed socket descriptor.
        let keygen = runner
            .calls()
            .into_iter()
            .find(|c| c.rendered().contains("--gen-key"))
            .unwrap();
        assert_eq!(
            keygen.env.get("GPG_AGENT_INFO").unwrap(),
            "/tmp/S.gpg-agent:111:1"
        );
    }
}
