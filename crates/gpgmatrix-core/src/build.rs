//! Dependency-ordered, idempotent build pipeline.
//!
//! Every node (native library or GnuPG release) is configured, built and
//! installed exactly once: a `.success` sentinel in the install tree marks a
//! completed build. The sentinel is written via write-then-rename so a crash
//! mid-write can never leave a false positive behind. A failed step aborts
//! the node immediately; with no sentinel present, the next run retries the
//! node from scratch.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{GpgMatrixError, Result};
use crate::exec::{CommandRunner, CommandSpec, EnvMap};
use crate::fetch::{ensure_dependency_source, ensure_tool_source, ArtifactSource};
use crate::versions::{
    find_source_subdir, DependencyDescriptor, HarnessLayout, ToolVersion,
};

/// Install prefixes of every dependency built so far, in build order.
///
/// Downstream configures receive one `--with-<dep>-prefix=<path>` argument
/// per entry, so a node never references a dependency that was not built
/// before it.
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    entries: Vec<(String, PathBuf)>,
}

impl PrefixSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, prefix: impl Into<PathBuf>) {
        self.entries.push((name.into(), prefix.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the configure arguments for all accumulated prefixes.
    pub fn configure_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, prefix)| format!("--with-{}-prefix={}", name, prefix.display()))
            .collect()
    }
}

/// Everything `ensure_built` needs to know about one buildable node.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub name: String,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub subdir_prefixes: Vec<String>,
    pub configure_flags: Vec<String>,
    pub build_env: Vec<(String, String)>,
    pub make_target: Option<String>,
}

impl From<&DependencyDescriptor> for BuildNode {
    fn from(dep: &DependencyDescriptor) -> Self {
        BuildNode {
            name: dep.name.clone(),
            src_dir: dep.src_dir.clone(),
            out_dir: dep.out_dir.clone(),
            subdir_prefixes: dep.subdir_prefixes(),
            configure_flags: Vec::new(),
            build_env: Vec::new(),
            make_target: None,
        }
    }
}

impl From<&ToolVersion> for BuildNode {
    fn from(tool: &ToolVersion) -> Self {
        BuildNode {
            name: format!("gnupg-{}", tool.version),
            src_dir: tool.src_dir(),
            out_dir: tool.out_dir(),
            subdir_prefixes: vec![tool.subdir_prefix()],
            configure_flags: tool.configure_flags.clone(),
            build_env: tool.build_env.clone(),
            make_target: tool.make_target.clone(),
        }
    }
}

impl BuildNode {
    pub fn marker_path(&self) -> PathBuf {
        self.out_dir.join(".success")
    }
}

/// Configure, build and install one node unless its sentinel already exists.
///
/// Returns the install prefix. With the sentinel present this performs zero
/// subprocess invocations.
pub async fn ensure_built(
    node: &BuildNode,
    prefixes: &PrefixSet,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    let marker = node.marker_path();
    if marker.is_file() {
        debug!(node = %node.name, "already built, skipping");
        return Ok(node.out_dir.clone());
    }

    info!(node = %node.name, "building");

    // A sentinel-less output tree is a partial build from an earlier,
    // failed run; start it over.
    if node.out_dir.exists() {
        std::fs::remove_dir_all(&node.out_dir)?;
    }
    std::fs::create_dir_all(&node.out_dir)?;

    let subdir = find_source_subdir(&node.src_dir, &node.subdir_prefixes, &node.name)?;

    let env: EnvMap = node
        .build_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut configure_args = vec![
        "./configure".to_string(),
        format!("--prefix={}", node.out_dir.display()),
    ];
    configure_args.extend(node.configure_flags.iter().cloned());
    configure_args.extend(prefixes.configure_args());

    run_step(
        runner,
        "configure",
        CommandSpec::new("sh")
            .args(configure_args)
            .cwd(&subdir)
            .envs(&env),
    )
    .await?;

    let mut make = CommandSpec::new("make").cwd(&subdir).envs(&env);
    if let Some(target) = &node.make_target {
        make = make.arg(target);
    }
    run_step(runner, "make", make).await?;

    run_step(
        runner,
        "make install",
        CommandSpec::new("make").arg("install").cwd(&subdir).envs(&env),
    )
    .await?;

    write_marker(&marker)?;
    info!(node = %node.name, out = %node.out_dir.display(), "built");
    Ok(node.out_dir.clone())
}

async fn run_step(runner: &dyn CommandRunner, step: &str, spec: CommandSpec) -> Result<()> {
    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::Build {
            step: step.to_string(),
            detail: format!(
                "`{}` exited {}: {}",
                spec.rendered(),
                out.exit_code,
                out.stderr.lines().last().unwrap_or("").trim()
            ),
        });
    }
    Ok(())
}

/// Atomic sentinel write: the sentinel name only ever appears complete.
fn write_marker(marker: &Path) -> Result<()> {
    let tmp = marker.with_extension("tmp");
    std::fs::write(&tmp, b"")?;
    std::fs::rename(&tmp, marker)?;
    Ok(())
}

/// Build the full dependency chain, accumulating install prefixes in
/// declared order.
pub async fn build_dependencies(
    layout: &HarnessLayout,
    source: &dyn ArtifactSource,
    runner: &dyn CommandRunner,
) -> Result<PrefixSet> {
    let mut prefixes = PrefixSet::new();
    for dep in layout.dependencies() {
        ensure_dependency_source(&dep, source, runner).await?;
        let prefix = ensure_built(&BuildNode::from(&dep), &prefixes, runner).await?;
        prefixes.insert(dep.name.clone(), prefix);
    }
    Ok(prefixes)
}

/// Build one GnuPG release on top of an already-built dependency chain.
/// Returns the path of the installed gpg binary.
pub async fn build_version(
    tool: &ToolVersion,
    prefixes: &PrefixSet,
    source: &dyn ArtifactSource,
    runner: &dyn CommandRunner,
) -> Result<PathBuf> {
    ensure_tool_source(tool, source, runner).await?;
    ensure_built(&BuildNode::from(tool), prefixes, runner).await?;
    Ok(tool.gpg_binary())
}

/// Build everything: the dependency chain, then every release in `tools`.
pub async fn build_all(
    layout: &HarnessLayout,
    tools: &[ToolVersion],
    source: &dyn ArtifactSource,
    runner: &dyn CommandRunner,
) -> Result<PrefixSet> {
    let prefixes = build_dependencies(layout, source, runner).await?;
    for tool in tools {
        build_version(tool, &prefixes, source, runner).await?;
    }
    Ok(prefixes)
}
