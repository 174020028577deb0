//! gpgmatrix - historical GnuPG signing verification harness
//!
//! Builds a matrix of GnuPG releases from source and checks that each one
//! can produce a verifiable signed git commit, both at a pseudo-terminal
//! passphrase prompt and through a pinentry-stub relay.
//!
//! ## Commands
//!
//! - `build`: Fetch and build the library chain and every GnuPG release
//! - `verify`: Run the signing trial matrix and print the result table
//! - `use`: Stand up an interactive signing sandbox for one release

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use gpgmatrix_core::{
    agent, build_all, keys, parse_signing_key, run_matrix, trial, GnupgOrgSource, HarnessLayout,
    ShellRunner, ToolVersion, TrialConfig, GPG_VERSIONS, PASSPHRASE,
};

#[derive(Parser)]
#[command(name = "gpgmatrix")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build historical GnuPG releases and verify commit signing", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root directory for sources, installs, and markers
    #[arg(long, global = true, default_value = ".gpg")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and build the dependency chain and every GnuPG release
    Build {
        /// Build only this release (default: all)
        #[arg(long)]
        version: Option<String>,
    },

    /// Build everything, run the signing trial matrix, print the table
    Verify {
        /// Verify only this release (default: all)
        #[arg(long)]
        version: Option<String>,

        /// Write the matrix report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Seconds to wait for the passphrase prompt
        #[arg(long, default_value_t = 60)]
        prompt_timeout: u64,

        /// Vendored git binary for the relay trials (default: PATH git)
        #[arg(long)]
        git: Option<PathBuf>,
    },

    /// Prepare an isolated signing sandbox for one release and print the
    /// shell exports needed to use it
    Use {
        /// Release to use, e.g. 1.4.21
        version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Invalid usage is a failure, not a clap-internal condition: map parse
    // errors to exit 1 while help and version keep their normal exit.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            e.print().ok();
            std::process::exit(1);
        }
    };

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gpgmatrix_core::init_tracing(cli.json, level);

    let layout = HarnessLayout::new(&cli.root);

    match cli.command {
        Commands::Build { version } => cmd_build(&layout, version.as_deref()).await,
        Commands::Verify {
            version,
            report,
            prompt_timeout,
            git,
        } => {
            cmd_verify(
                &layout,
                version.as_deref(),
                report.as_deref(),
                prompt_timeout,
                git,
            )
            .await
        }
        Commands::Use { version } => cmd_use(&layout, version.as_deref()).await,
    }
}

/// Resolve either one named release or the whole catalog.
fn select_versions(layout: &HarnessLayout, version: Option<&str>) -> Result<Vec<ToolVersion>> {
    match version {
        Some(v) => Ok(vec![ToolVersion::lookup(layout, v)?]),
        None => Ok(ToolVersion::catalog(layout)),
    }
}

/// Helper binaries ship next to the gpgmatrix binary itself.
fn sibling_helper(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the gpgmatrix binary")?;
    let dir = exe
        .parent()
        .context("gpgmatrix binary has no parent directory")?;
    Ok(dir.join(name))
}

fn trial_config(prompt_timeout: u64, git: Option<PathBuf>) -> Result<TrialConfig> {
    let mut config = TrialConfig::new(
        sibling_helper("pinentry-stub")?,
        sibling_helper("askpass-relay")?,
    );
    config.prompt_timeout_secs = prompt_timeout;
    config.vendored_git_path = git;
    Ok(config)
}

async fn cmd_build(layout: &HarnessLayout, version: Option<&str>) -> Result<()> {
    let versions = select_versions(layout, version)?;
    let source = GnupgOrgSource::new();
    let runner = ShellRunner;

    build_all(layout, &versions, &source, &runner)
        .await
        .context("build failed")?;

    for tool in &versions {
        println!("{}: {}", tool.version, tool.gpg_binary().display());
    }
    Ok(())
}

async fn cmd_verify(
    layout: &HarnessLayout,
    version: Option<&str>,
    report_path: Option<&Path>,
    prompt_timeout: u64,
    git: Option<PathBuf>,
) -> Result<()> {
    let versions = select_versions(layout, version)?;
    let config = trial_config(prompt_timeout, git)?;
    let source = GnupgOrgSource::new();
    let runner = ShellRunner;

    let report = run_matrix(layout, &versions, &config, &source, &runner)
        .await
        .context("matrix run failed")?;

    println!("{}", report.render_table());

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    std::process::exit(report.exit_code());
}

/// Stand up a signing sandbox: isolated credential store, fresh key, and a
/// git repository already configured to sign with this release. Prints the
/// exports a shell needs to work inside it. The sandbox directories are
/// left on disk for the caller to remove.
async fn cmd_use(layout: &HarnessLayout, version: Option<&str>) -> Result<()> {
    let tool = match version {
        Some(v) => match ToolVersion::lookup(layout, v) {
            Ok(tool) => tool,
            Err(_) => return use_usage(v),
        },
        None => return use_usage("(missing)"),
    };

    let gpg_bin = tool.gpg_binary();
    if !gpg_bin.is_file() {
        bail!(
            "{} is not built yet; run `gpgmatrix build --version {}` first",
            tool.version,
            tool.version
        );
    }

    let runner = ShellRunner;

    let home = tempfile::Builder::new()
        .prefix(&format!("gpg-home-{}-", tool.version))
        .tempdir()?
        .into_path();
    let repo = tempfile::Builder::new()
        .prefix(&format!("gpg-git-{}-", tool.version))
        .tempdir()?
        .into_path();
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let pinentry = sibling_helper("pinentry-stub")?;
    agent::write_agent_conf(&home, &pinentry)?;
    let params_file = home.join("key-parameters");
    std::fs::write(&params_file, keys::KEY_PARAMETERS)?;

    let mut env = trial::base_env(&home, &log_dir);

    let mut agent_info = None;
    if tool.requires_agent {
        agent_info = agent::start_agent(&tool, &env, &runner).await?;
        if let Some(info) = &agent_info {
            env.insert("GPG_AGENT_INFO".to_string(), info.clone());
        }
    }

    keys::generate_key(&gpg_bin, &params_file, &env, &runner).await?;
    let listing = keys::list_keys(&gpg_bin, &env, &runner).await?;
    let signing_key = parse_signing_key(&listing)?;
    info!(version = %tool.version, signing_key = %signing_key, "sandbox key ready");

    trial::init_signing_repo(&repo, &gpg_bin, &signing_key, &env, &runner).await?;

    println!("# signing sandbox for gnupg {}", tool.version);
    println!("cd {}", repo.display());
    println!("export GNUPGHOME={}", home.display());
    if let Some(info) = &agent_info {
        println!("export GPG_AGENT_INFO={info}");
    }
    println!("# signing key: {signing_key}");
    println!("# passphrase:  {PASSPHRASE}");
    Ok(())
}

fn use_usage(given: &str) -> Result<()> {
    eprintln!("usage: gpgmatrix use <version>");
    eprintln!("unknown version: {given}");
    eprintln!("available versions:");
    for v in GPG_VERSIONS {
        eprintln!("  {v}");
    }
    std::process::exit(1);
}
