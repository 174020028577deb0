//! Pipeline integration tests over the subprocess and artifact fakes:
//! fetch, extract, and build the whole chain plus a release, end to end.

use gpgmatrix_core::fakes::{RecordingRunner, StaticSource};
use gpgmatrix_core::{build_all, HarnessLayout, ToolVersion, DEPENDENCY_CHAIN};

fn full_link_list() -> Vec<String> {
    vec![
        "https://gnupg.org/ftp/gcrypt/libgpg-error/libgpg-error-1.27.tar.bz2".to_string(),
        "https://gnupg.org/ftp/gcrypt/libgcrypt/libgcrypt-1.7.8.tar.bz2".to_string(),
        "https://gnupg.org/ftp/gcrypt/libassuan/libassuan-2.4.3.tar.bz2".to_string(),
        "https://gnupg.org/ftp/gcrypt/libksba/libksba-1.3.5.tar.bz2".to_string(),
        "https://gnupg.org/ftp/gcrypt/npth/npth-1.5.tar.bz2".to_string(),
    ]
}

/// The fake runner's `tar` does nothing, so pre-create the extracted
/// subdirectories the configure step expects to find.
fn seed_extracted_sources(layout: &HarnessLayout, tool: &ToolVersion) {
    for dep in layout.dependencies() {
        let subdir = dep.subdir_prefixes()[0].clone() + "1.0";
        std::fs::create_dir_all(dep.src_dir.join(subdir)).unwrap();
    }
    std::fs::create_dir_all(tool.src_dir().join(tool.subdir_prefix())).unwrap();
}

#[tokio::test]
async fn builds_chain_in_order_then_release() {
    let root = tempfile::tempdir().unwrap();
    let layout = HarnessLayout::new(root.path().join(".gpg"));
    let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
    seed_extracted_sources(&layout, &tool);

    let source = StaticSource::new(full_link_list());
    let runner = RecordingRunner::new();

    let prefixes = build_all(&layout, &[tool.clone()], &source, &runner)
        .await
        .unwrap();

    for dep in DEPENDENCY_CHAIN {
        assert!(prefixes.contains(dep), "missing prefix for {dep}");
    }

    // Each of the six nodes runs configure, make, make install.
    let configures: Vec<String> = runner
        .rendered_calls()
        .into_iter()
        .filter(|c| c.contains("./configure"))
        .collect();
    assert_eq!(configures.len(), DEPENDENCY_CHAIN.len() + 1);

    // Dependencies configure in chain order, each seeing one more prefix
    // than the one before it.
    for (i, configure) in configures.iter().take(DEPENDENCY_CHAIN.len()).enumerate() {
        let prefix_args = configure.matches("--with-").count();
        assert_eq!(prefix_args, i, "wrong prefix count in: {configure}");
    }

    // The release configure sees the whole chain.
    let release_configure = configures.last().unwrap();
    for dep in DEPENDENCY_CHAIN {
        assert!(release_configure.contains(&format!("--with-{dep}-prefix=")));
    }

    assert!(tool.marker_path().is_file());
}

#[tokio::test]
async fn second_run_performs_no_work() {
    let root = tempfile::tempdir().unwrap();
    let layout = HarnessLayout::new(root.path().join(".gpg"));
    let tool = ToolVersion::lookup(&layout, "1.2.0").unwrap();
    seed_extracted_sources(&layout, &tool);

    let source = StaticSource::new(full_link_list());
    let runner = RecordingRunner::new();
    build_all(&layout, &[tool.clone()], &source, &runner)
        .await
        .unwrap();
    let first_run_calls = runner.calls().len();

    let source2 = StaticSource::new(full_link_list());
    let runner2 = RecordingRunner::new();
    build_all(&layout, &[tool], &source2, &runner2).await.unwrap();

    assert!(first_run_calls > 0);
    assert!(source2.downloaded().is_empty(), "nothing should re-download");
    assert!(runner2.calls().is_empty(), "nothing should rebuild");
}

#[tokio::test]
async fn chain_failure_stops_before_release() {
    let root = tempfile::tempdir().unwrap();
    let layout = HarnessLayout::new(root.path().join(".gpg"));
    let tool = ToolVersion::lookup(&layout, "1.4.21").unwrap();
    seed_extracted_sources(&layout, &tool);

    let source = StaticSource::new(full_link_list());
    let runner = RecordingRunner::new();
    runner.fail_when("libgcrypt");

    build_all(&layout, &[tool.clone()], &source, &runner)
        .await
        .unwrap_err();

    let calls = runner.rendered_calls();
    // libgpg-error built, libgcrypt's configure failed, nothing after ran.
    assert!(calls.iter().any(|c| c.contains("libgpg-error")));
    assert!(!calls.iter().any(|c| c.contains("libassuan")));
    assert!(!tool.marker_path().exists());
}
