//! Key generation and colon-listing parsing.
//!
//! Key generation runs the resolved gpg binary in unattended batch mode
//! against a static parameter file. The signing key ID comes out of
//! `--list-keys --with-colons`: the fifth colon-delimited field of the
//! first `pub` record, parsed structurally rather than with indexed
//! regex captures.

use std::path::Path;

use crate::error::{GpgMatrixError, Result};
use crate::exec::{CommandRunner, CommandSpec, EnvMap};

/// Batch key-generation parameters, shared by every trial. The passphrase
/// here must stay in sync with [`crate::versions::PASSPHRASE`].
pub const KEY_PARAMETERS: &str = include_str!("../conf/key-parameters");

/// Extract the signing key ID from `--with-colons` key-listing output.
pub fn parse_signing_key(listing: &str) -> Result<String> {
    for line in listing.lines() {
        let mut fields = line.split(':');
        if fields.next() != Some("pub") {
            continue;
        }
        // pub:<validity>:<length>:<algo>:<keyid>:...
        let key_id = fields.nth(3).unwrap_or("");
        if key_id.is_empty() {
            return Err(GpgMatrixError::KeyIdParse(format!(
                "pub record has empty key field: {line}"
            )));
        }
        return Ok(key_id.to_string());
    }
    Err(GpgMatrixError::KeyIdParse(
        "no pub record in key listing".to_string(),
    ))
}

/// Generate the trial key in the isolated home, feeding the parameter file
/// on stdin.
pub async fn generate_key(
    gpg_bin: &Path,
    params_file: &Path,
    env: &EnvMap,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let spec = CommandSpec::new(gpg_bin.to_string_lossy())
        .args(["--batch", "--gen-key"])
        .clear_env()
        .envs(env)
        .stdin_file(params_file);

    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::Keygen(format!(
            "gpg --gen-key exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// List keys in machine-readable colon format and return the raw output.
pub async fn list_keys(
    gpg_bin: &Path,
    env: &EnvMap,
    runner: &dyn CommandRunner,
) -> Result<String> {
    let spec = CommandSpec::new(gpg_bin.to_string_lossy())
        .args(["--list-keys", "--with-colons"])
        .clear_env()
        .envs(env);

    let out = runner.run(&spec).await?;
    if !out.success {
        return Err(GpgMatrixError::KeyIdParse(format!(
            "gpg --list-keys exited {}: {}",
            out.exit_code,
            out.stderr.trim()
        )));
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LISTING: &str = "\
tru::1:1498144669:0:3:1:5
pub:u:1024:17:ABCD1234EF567890:2017-06-22:::u:::scESC:
uid:u::::2017-06-22::DEADBEEF::gpgmatrix harness <harness@gpgmatrix.invalid>:
sub:u:1024:16:1122334455667788:2017-06-22::::::e:
";

    #[test]
    fn test_parse_signing_key() {
        let key = parse_signing_key(SAMPLE_LISTING).unwrap();
        assert_eq!(key, "ABCD1234EF567890");
    }

    #[test]
    fn test_parse_skips_non_pub_records() {
        // A sub record before the pub record must not win.
        let listing = "sub:u:1024:16:FFFF:2017::::::e:\npub:u:1024:17:KEYID123:2017:::u::\n";
        assert_eq!(parse_signing_key(listing).unwrap(), "KEYID123");
    }

    #[test]
    fn test_parse_missing_pub_record() {
        let err = parse_signing_key("tru::1:1:0:3:1:5\n").unwrap_err();
        assert!(matches!(err, GpgMatrixError::KeyIdParse(_)));
    }

    #[test]
    fn test_parse_empty_key_field() {
        let err = parse_signing_key("pub:u:1024:17::2017:\n").unwrap_err();
        assert!(matches!(err, GpgMatrixError::KeyIdParse(_)));
    }

    #[test]
    fn test_key_parameters_carry_trial_passphrase() {
        assert!(KEY_PARAMETERS.contains("Passphrase: trustno1"));
        assert!(KEY_PARAMETERS.contains("%commit"));
    }

    #[tokio::test]
    async fn test_generate_key_maps_failure() {
        use crate::fakes::RecordingRunner;

        let runner = RecordingRunner::new();
        runner.fail_when("--gen-key");
        let params = tempfile::NamedTempFile::new().unwrap();
        let err = generate_key(
            Path::new("/opt/gpg/bin/gpg"),
            params.path(),
            &EnvMap::new(),
            &runner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GpgMatrixError::Keygen(_)));
    }

    #[tokio::test]
    async fn test_list_keys_returns_stdout() {
        use crate::fakes::RecordingRunner;

        let runner = RecordingRunner::new();
        runner.stdout_when("--list-keys", SAMPLE_LISTING);
        let listing = list_keys(Path::new("/opt/gpg/bin/gpg"), &EnvMap::new(), &runner)
            .await
            .unwrap();
        assert_eq!(parse_signing_key(&listing).unwrap(), "ABCD1234EF567890");
    }
}
