//! gpgmatrix core library
//!
//! Builds historical GnuPG releases from source (native library chain
//! included) and verifies that each release can sign a git commit through
//! both a pseudo-terminal passphrase prompt and a pinentry-stub relay.

pub mod agent;
pub mod build;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod fetch;
pub mod keys;
pub mod pty;
pub mod report;
pub mod telemetry;
pub mod trial;
pub mod versions;

pub use build::{build_all, build_dependencies, build_version, ensure_built, BuildNode, PrefixSet};
pub use error::{GpgMatrixError, Result};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, EnvMap, ShellRunner};
pub use fetch::{find_archive_url, ArtifactSource, GnupgOrgSource, DOWNLOAD_INDEX_URL};
pub use keys::{parse_signing_key, KEY_PARAMETERS};
pub use report::{run_matrix, MatrixCell, MatrixReport, TrialOutcome};
pub use telemetry::init_tracing;
pub use trial::{run_trial, TrialConfig, TrialKind};
pub use versions::{
    HarnessLayout, ToolVersion, DEPENDENCY_CHAIN, GPG_VERSIONS, PASSPHRASE,
};

/// gpgmatrix version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
