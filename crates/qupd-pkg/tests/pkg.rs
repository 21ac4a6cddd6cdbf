//! Drives the `qupd-pkg` binary and checks its artifacts with the client library.

use std::path::Path;
use std::process::{Command, Output};

use qupd_core::archive::{KeyLookup, VerificationMode, verify_archives};
use qupd_core::envelope::PackageKeys;
use qupd_core::host::HostBuild;
use qupd_core::io::extract_payload;
use qupd_core::keys;
use qupd_schema::{ReleaseManifest, Sha256Digest};

fn pkg() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_qupd-pkg"));
    for var in ["QUPD_ARCHIVE_PRIVKEY_PEM", "QUPD_ARCHIVE_PRIVKEY_PATH"] {
        cmd.env_remove(var);
    }
    cmd
}

fn run(cmd: &mut Command) -> Output {
    let out = cmd.output().unwrap();
    assert!(
        out.status.success(),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    out
}

fn keygen_update(dir: &Path) -> Output {
    pkg()
        .args(["keygen", "update", "--bits", "1024", "--out"])
        .arg(dir)
        .output()
        .unwrap()
}

#[test]
fn keygen_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    assert!(keygen_update(dir.path()).status.success());
    for name in [
        keys::UPDATE_SIGN_PUBLIC_KEY,
        keys::UPDATE_SIGN_PRIVATE_KEY,
        keys::UPDATE_ENCRYPT_PUBLIC_KEY,
        keys::UPDATE_PRIVATE_KEY,
    ] {
        assert!(dir.path().join(name).is_file(), "{name}");
    }
    let before = std::fs::read(dir.path().join(keys::UPDATE_PRIVATE_KEY)).unwrap();

    assert!(!keygen_update(dir.path()).status.success());
    let after = std::fs::read(dir.path().join(keys::UPDATE_PRIVATE_KEY)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn pack_and_manifest_open_on_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let key_dir = dir.path().join("keys");
    assert!(keygen_update(&key_dir).status.success());

    let app = dir.path().join("app");
    std::fs::create_dir_all(app.join("assets")).unwrap();
    std::fs::write(app.join("index.html"), "<html>3.1.0</html>").unwrap();
    std::fs::write(app.join("assets").join("app.js"), "js").unwrap();

    let hash = Sha256Digest::compute(b"main");
    let package = dir.path().join("out").join("app-3.1.0.qupd");
    run(pkg()
        .arg("pack")
        .arg("--input")
        .arg(&app)
        .args(["--version", "3.1.0", "--required-main-hash", hash.as_str()])
        .arg("--keys")
        .arg(&key_dir)
        .arg("--out")
        .arg(&package));

    let client_keys = PackageKeys::load(&key_dir).unwrap();
    let opened = client_keys.open(&std::fs::read(&package).unwrap()).unwrap();
    assert_eq!(opened.package.product_version, "3.1.0");
    let meta = opened.package.metadata.as_ref().unwrap();
    assert_eq!(meta.required_main_hash(), Some(hash.as_str()));
    assert!(meta.created_at().is_some());

    let extracted = dir.path().join("extracted");
    std::fs::create_dir_all(&extracted).unwrap();
    assert_eq!(extract_payload(&opened.plaintext, &extracted).unwrap(), 2);
    assert!(extracted.join("index.html").is_file());
    assert!(extracted.join("assets").join("app.js").is_file());

    let manifest_path = dir.path().join("latest.yml");
    run(pkg()
        .arg("manifest")
        .arg("--asset")
        .arg(&package)
        .args(["--version", "v3.1"])
        .arg("--out")
        .arg(&manifest_path));
    let manifest =
        ReleaseManifest::parse_and_validate(&std::fs::read_to_string(&manifest_path).unwrap())
            .unwrap();
    assert_eq!(manifest.asset_name, "app-3.1.0.qupd");
    assert_eq!(manifest.semver(), semver::Version::new(3, 1, 0));
    assert_eq!(
        manifest.asset_sha256,
        Sha256Digest::compute_file(&package).unwrap()
    );
}

#[test]
fn pack_without_metadata_is_format_one() {
    let dir = tempfile::tempdir().unwrap();
    assert!(keygen_update(dir.path()).status.success());
    let payload = dir.path().join("payload.tar.gz");
    std::fs::write(&payload, b"not really gzip").unwrap();
    let package = dir.path().join("p.qupd");

    run(pkg()
        .arg("pack")
        .arg("--input")
        .arg(&payload)
        .args(["--version", "1.2.3"])
        .arg("--keys")
        .arg(dir.path())
        .arg("--out")
        .arg(&package));

    let bytes = std::fs::read(&package).unwrap();
    assert_eq!(&bytes[..4], b"QUPD");
    assert_eq!(bytes[4], 1);
}

#[test]
fn sign_archive_needs_key_or_dev_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    let archive = resources.join("app.asar");
    std::fs::create_dir_all(&resources).unwrap();
    std::fs::write(&archive, b"asar bytes").unwrap();
    let security = resources.join("security");

    let refused = pkg()
        .arg("sign-archive")
        .arg("--dev-key-dir")
        .arg(&security)
        .arg(&archive)
        .output()
        .unwrap();
    assert!(!refused.status.success());
    assert!(!security.exists());

    run(pkg()
        .arg("sign-archive")
        .arg("--generate-dev-key")
        .arg("--dev-key-dir")
        .arg(&security)
        .arg("--scan")
        .arg(&resources));
    assert!(archive.with_extension("asar.sig").is_file());

    let lookup = KeyLookup {
        resource_dir: Some(resources.clone()),
        ..KeyLookup::default()
    };
    let report = verify_archives(&lookup, &[archive], VerificationMode::Strict).unwrap();
    assert!(report.is_clean());
}

#[test]
fn main_hash_writes_build_info() {
    let dir = tempfile::tempdir().unwrap();
    let preload = dir.path().join("dist").join("preload");
    std::fs::create_dir_all(&preload).unwrap();
    std::fs::write(preload.join("preload.js"), "bridge").unwrap();
    let resources = dir.path().join("resources");

    let out = run(pkg()
        .arg("main-hash")
        .arg("--project")
        .arg(dir.path())
        .arg("--write")
        .arg(&resources)
        .args(["--version", "4.0.0"]));

    let host = HostBuild::load(&resources).unwrap();
    assert_eq!(host.version, semver::Version::new(4, 0, 0));
    let hash = host.main_hash.unwrap();
    assert!(String::from_utf8_lossy(&out.stdout).starts_with(hash.as_str()));
    assert!(host.build_time.is_some());
}
