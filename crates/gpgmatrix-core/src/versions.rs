//! Version catalog and on-disk layout.
//!
//! The set of GnuPG releases under test and the native library chain they
//! are compiled against are fixed at startup; descriptors are immutable
//! after construction. All build state lives under one root directory
//! (`.gpg` by default):
//!
//! ```text
//! <root>/deps/<libname>/{src,out}         native library chain
//! <root>/<version>/{src,out,logs}         one tree per GnuPG release
//! <root>/patches/<version>/*.patch        per-release source patches
//! ```

use std::path::{Path, PathBuf};

use crate::error::{GpgMatrixError, Result};

/// Fixed trial passphrase, shared by the key parameter file, the pinentry
/// stub, and the PTY prompt answer.
pub const PASSPHRASE: &str = "trustno1";

/// Native library chain, in build order. Each later library's configure may
/// consume the install prefix of an earlier one, so the order is load-bearing.
pub const DEPENDENCY_CHAIN: [&str; 5] = ["libgpg-error", "libgcrypt", "libassuan", "ksba", "npth"];

/// GnuPG releases under test.
pub const GPG_VERSIONS: [&str; 4] = ["1.2.0", "1.4.21", "2.0.29", "2.1.21"];

/// Root directory holding all fetched sources, build output and patches.
#[derive(Debug, Clone)]
pub struct HarnessLayout {
    pub root: PathBuf,
}

impl HarnessLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.root.join("deps")
    }

    pub fn dependency(&self, name: &str) -> DependencyDescriptor {
        let base = self.deps_dir().join(name);
        DependencyDescriptor {
            name: name.to_string(),
            src_dir: base.join("src"),
            out_dir: base.join("out"),
        }
    }

    /// All dependency descriptors, in build order.
    pub fn dependencies(&self) -> Vec<DependencyDescriptor> {
        DEPENDENCY_CHAIN.iter().map(|n| self.dependency(n)).collect()
    }

    pub fn patch_dir(&self, version: &str) -> PathBuf {
        self.root.join("patches").join(version)
    }
}

/// One node of the native library chain.
#[derive(Debug, Clone)]
pub struct DependencyDescriptor {
    pub name: String,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl DependencyDescriptor {
    /// Sentinel whose presence means a build previously succeeded. Source
    /// directory presence alone never counts as built.
    pub fn marker_path(&self) -> PathBuf {
        self.out_dir.join(".success")
    }

    /// Acceptable extracted-subdirectory name prefixes (`ksba` extracts as
    /// `libksba-1.x`, `npth` as `npth-1.x`).
    pub fn subdir_prefixes(&self) -> Vec<String> {
        vec![format!("{}-", self.name), format!("lib{}-", self.name)]
    }
}

/// One GnuPG release: where its source and install trees live plus the
/// release-specific knobs its build needs.
#[derive(Debug, Clone)]
pub struct ToolVersion {
    pub version: String,
    pub root_dir: PathBuf,
    pub patch_dir: PathBuf,

    /// Extra `./configure` arguments for this release.
    pub configure_flags: Vec<String>,

    /// Compiler-flag overrides, supplied only on this release's build
    /// commands (never written to the process environment).
    pub build_env: Vec<(String, String)>,

    /// Non-default `make` target, if the release needs one.
    pub make_target: Option<String>,

    /// Installed binary name: `gpg` for the 1.x and modern 2.1 line,
    /// `gpg2` for 2.0.
    pub gpg_binary_name: &'static str,

    /// Whether signing goes through gpg-agent (the 2.x line).
    pub requires_agent: bool,
}

impl ToolVersion {
    pub fn src_dir(&self) -> PathBuf {
        self.root_dir.join("src")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root_dir.join("out")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root_dir.join("logs")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.out_dir().join(".success")
    }

    pub fn gpg_binary(&self) -> PathBuf {
        self.out_dir().join("bin").join(self.gpg_binary_name)
    }

    pub fn agent_binary(&self) -> PathBuf {
        self.out_dir().join("bin").join("gpg-agent")
    }

    /// Release tarball URL on the gnupg.org FTP mirror.
    pub fn source_url(&self) -> String {
        format!(
            "https://gnupg.org/ftp/gcrypt/gnupg/gnupg-{}.tar.bz2",
            self.version
        )
    }

    /// Extracted source subdirectory prefix (`gnupg-<version>`).
    pub fn subdir_prefix(&self) -> String {
        format!("gnupg-{}", self.version)
    }

    /// The full release catalog rooted at `layout`.
    pub fn catalog(layout: &HarnessLayout) -> Vec<ToolVersion> {
        GPG_VERSIONS
            .iter()
            .map(|v| Self::describe(layout, v))
            .collect()
    }

    /// Resolve one version string against the catalog.
    pub fn lookup(layout: &HarnessLayout, version: &str) -> Result<ToolVersion> {
        if GPG_VERSIONS.contains(&version) {
            Ok(Self::describe(layout, version))
        } else {
            Err(GpgMatrixError::UnknownVersion(version.to_string()))
        }
    }

    fn describe(layout: &HarnessLayout, version: &str) -> ToolVersion {
        let base = ToolVersion {
            version: version.to_string(),
            root_dir: layout.root.join(version),
            patch_dir: layout.patch_dir(version),
            configure_flags: Vec::new(),
            build_env: Vec::new(),
            make_target: None,
            gpg_binary_name: "gpg",
            requires_agent: false,
        };

        // Release-specific knobs. The 1.x line predates C99-default
        // compilers; 2.0 installs the binary as gpg2 and needs the agent.
        match version {
            "1.2.0" => ToolVersion {
                configure_flags: vec!["--disable-asm".to_string()],
                build_env: vec![(
                    "CFLAGS".to_string(),
                    "-std=gnu89 -O2 -fcommon".to_string(),
                )],
                ..base
            },
            "1.4.21" => ToolVersion {
                build_env: vec![("CFLAGS".to_string(), "-std=gnu89 -O2".to_string())],
                ..base
            },
            "2.0.29" => ToolVersion {
                gpg_binary_name: "gpg2",
                requires_agent: true,
                ..base
            },
            "2.1.21" => ToolVersion {
                configure_flags: vec!["--disable-doc".to_string()],
                requires_agent: true,
                ..base
            },
            _ => base,
        }
    }
}

/// Locate the extracted source subdirectory of `src_dir` whose name starts
/// with one of `prefixes`.
pub fn find_source_subdir(src_dir: &Path, prefixes: &[String], name: &str) -> Result<PathBuf> {
    for entry in std::fs::read_dir(src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
            return Ok(entry.path());
        }
    }
    Err(GpgMatrixError::SourceLayout {
        name: name.to_string(),
    })
}
