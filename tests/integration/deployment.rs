#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use common::write_app_source;
use semver::Version;
use tempfile::tempdir;
use warden::{
    constants::MANIFEST_FILE_NAME,
    deploy::{AppSource, DeployOutcome, PackageDeployer},
    error::DeploymentError,
    paths::InstallPaths,
    version::read_manifest_file,
};

fn files_under(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("failed to read dir") {
            let path = entry.expect("failed to read entry").path();
            if path.is_dir() {
                pending.push(path.clone());
            }
            found.push(
                path.strip_prefix(root)
                    .expect("path outside root")
                    .display()
                    .to_string()
                    .replace('\\', "/"),
            );
        }
    }
    found.sort();
    found
}

#[test]
fn excluded_artifacts_never_reach_the_install_dir() {
    let temp = tempdir().expect("failed to create tempdir");
    let source_root = temp.path().join("source");
    write_app_source(&source_root, "1.0.0");

    let package = source_root.join("demo_server");
    for junk in [
        "__pycache__/app.cpython-312.pyc",
        "tests/test_app.py",
        ".git/HEAD",
        "handlers/__pycache__/x.pyc",
        "legacy.pyc",
        "demo_server.egg-info/PKG-INFO",
    ] {
        let path = package.join(junk);
        fs::create_dir_all(path.parent().expect("no parent")).expect("failed to create dir");
        fs::write(&path, "junk").expect("failed to write junk");
    }

    let paths = InstallPaths::from_home(&temp.path().join("home"));
    let deployer = PackageDeployer::new(
        AppSource::at(&source_root).expect("failed to read source"),
        &paths,
    );
    deployer.deploy(false).expect("deploy failed");

    let deployed = files_under(&paths.deploy_dir);
    for entry in &deployed {
        assert!(!entry.contains("__pycache__"), "{entry} deployed");
        assert!(!entry.ends_with(".pyc"), "{entry} deployed");
        assert!(!entry.contains(".git"), "{entry} deployed");
        assert!(!entry.contains("egg-info"), "{entry} deployed");
        assert!(!entry.split('/').any(|segment| segment == "tests"), "{entry} deployed");
    }
    assert!(deployed.contains(&"demo_server/app.py".to_string()));
    assert!(deployed.contains(&"demo_server/handlers/__init__.py".to_string()));
    assert!(deployed.contains(&"main.py".to_string()));
}

#[test]
fn deploying_the_same_version_twice_is_a_no_op() {
    let temp = tempdir().expect("failed to create tempdir");
    let source_root = temp.path().join("source");
    write_app_source(&source_root, "1.4.2");
    let paths = InstallPaths::from_home(&temp.path().join("home"));
    let deployer = PackageDeployer::new(
        AppSource::at(&source_root).expect("failed to read source"),
        &paths,
    );

    let DeployOutcome::Deployed { manifest, backup } = deployer.deploy(false).expect("deploy")
    else {
        panic!("first deploy should copy files");
    };
    assert_eq!(manifest.version, Version::new(1, 4, 2));
    assert!(backup.is_none());

    fs::write(paths.deploy_dir.join("operator-note.txt"), "keep").expect("write note");
    let second = deployer.deploy(false).expect("second deploy");
    assert_eq!(
        second,
        DeployOutcome::UpToDate {
            version: Version::new(1, 4, 2)
        }
    );
    assert!(paths.deploy_dir.join("operator-note.txt").exists());
    assert!(
        !paths.backup_dir.exists()
            || fs::read_dir(&paths.backup_dir)
                .expect("read backups")
                .next()
                .is_none()
    );

    let forced = deployer.deploy(true).expect("forced deploy");
    assert!(matches!(
        forced,
        DeployOutcome::Deployed {
            backup: Some(_),
            ..
        }
    ));
    assert!(!paths.deploy_dir.join("operator-note.txt").exists());
}

#[test]
fn failed_verification_keeps_previous_version_recoverable() {
    let temp = tempdir().expect("failed to create tempdir");
    let source_root = temp.path().join("source");
    write_app_source(&source_root, "1.0.0");
    let paths = InstallPaths::from_home(&temp.path().join("home"));

    PackageDeployer::new(
        AppSource::at(&source_root).expect("failed to read source"),
        &paths,
    )
    .deploy(false)
    .expect("initial deploy");

    write_app_source(&source_root, "1.1.0");
    fs::remove_file(source_root.join("main.py")).expect("remove entry point");
    let err = PackageDeployer::new(
        AppSource::at(&source_root).expect("failed to read source"),
        &paths,
    )
    .deploy(false)
    .expect_err("deploy without entry point must fail");
    let DeploymentError::VerificationFailed { missing } = err else {
        panic!("expected verification failure");
    };
    assert!(missing.iter().any(|path| path.ends_with("main.py")));

    assert!(
        read_manifest_file(&paths.manifest_file())
            .expect("read manifest")
            .is_none()
    );

    let backups: Vec<_> = fs::read_dir(&paths.backup_dir)
        .expect("backup dir exists")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(backups.len(), 1);
    let backup = &backups[0];
    assert!(backup.join("main.py").is_file());
    let saved = read_manifest_file(&backup.join(MANIFEST_FILE_NAME))
        .expect("read saved manifest")
        .expect("saved manifest present");
    assert_eq!(saved.version, Version::new(1, 0, 0));
}

#[test]
fn upgrade_detection_follows_the_manifest() {
    let temp = tempdir().expect("failed to create tempdir");
    let source_root = temp.path().join("source");
    write_app_source(&source_root, "2.0.0");
    let paths = InstallPaths::from_home(&temp.path().join("home"));
    let deployer = PackageDeployer::new(
        AppSource::at(&source_root).expect("failed to read source"),
        &paths,
    );

    let before = deployer
        .tracker()
        .check(&Version::new(2, 0, 0))
        .expect("check");
    assert!(!before.upgrade_available);

    deployer.deploy(false).expect("deploy");
    let after = deployer
        .tracker()
        .check(&Version::new(2, 1, 0))
        .expect("check");
    assert!(after.upgrade_available);
}
