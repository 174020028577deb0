//! Error taxonomy for the build pipeline and verification engine.

/// Errors produced by gpgmatrix operations.
///
/// Build-side variants (`Fetch`, `NotFound`, `SourceLayout`, `Build`) abort
/// the current build node; trial-side variants (`Keygen`, `KeyIdParse`,
/// `Commit`, `Verification`, `Agent`) short-circuit the current trial. The
/// aggregator converts all of them into FAIL cells, so no error escapes a
/// multi-version run.
#[derive(Debug, thiserror::Error)]
pub enum GpgMatrixError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("no download link found for {name}")]
    NotFound { name: String },

    #[error("no extracted source subdirectory found for {name}")]
    SourceLayout { name: String },

    #[error("build step `{step}` failed: {detail}")]
    Build { step: String, detail: String },

    #[error("command timed out: {0}")]
    Timeout(String),

    #[error("key generation failed: {0}")]
    Keygen(String),

    #[error("unable to parse signing key ID: {0}")]
    KeyIdParse(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("signature verification failed: {0}")]
    Verification(String),

    #[error("gpg-agent error: {0}")]
    Agent(String),

    #[error("unknown gpg version: {0}")]
    UnknownVersion(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gpgmatrix operations.
pub type Result<T> = std::result::Result<T, GpgMatrixError>;
