//! Drives the `qupd` binary end to end.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

use chrono::{Duration, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use qupd_core::envelope::PackageSealer;
use qupd_core::host::HostBuild;
use qupd_core::integrity::compute_hash_from_roots;
use qupd_core::keys::{self, PemKeyPair};
use qupd_schema::{PackageMetadata, ReleaseManifest, Sha256Digest};
use semver::Version;
use tempfile::TempDir;

fn qupd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_qupd"));
    cmd.arg("--home").arg(home);
    for var in [
        "QUPD_HOME",
        "QUPD_RESOURCE_DIR",
        "QUPD_MANIFEST_URL",
        "QUPD_ASSET_URL",
        "QUPD_VERIFY_STRICT",
        "QUPD_ARCHIVE_PUBKEY_PEM",
        "QUPD_ARCHIVE_PUBKEY_PATH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn rsa_pair() -> &'static PemKeyPair {
    static PAIR: OnceLock<PemKeyPair> = OnceLock::new();
    PAIR.get_or_init(|| PemKeyPair::generate_rsa(1024).unwrap())
}

fn payload() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    let data = b"<html>2.0.0</html>";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "dist/index.html", &data[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// A host resource dir with keys and build info, plus a published release.
struct Release {
    root: TempDir,
}

impl Release {
    fn new(host_main_hash: &str, required_main_hash: Option<&str>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let resources = root.path().join("resources");
        let pair = rsa_pair();

        let security = resources.join("security");
        std::fs::create_dir_all(&security).unwrap();
        std::fs::write(security.join(keys::UPDATE_SIGN_PUBLIC_KEY), &pair.public_pem).unwrap();
        std::fs::write(security.join(keys::UPDATE_PRIVATE_KEY), pair.private_pem.as_bytes())
            .unwrap();

        let mut host = HostBuild::new(Version::new(1, 0, 0));
        host.main_hash = Some(Sha256Digest::new(host_main_hash).unwrap());
        host.build_time = Some(Utc::now() - Duration::days(1));
        host.save(&resources).unwrap();

        let metadata = required_main_hash.map(|hash| {
            PackageMetadata::from_value(serde_json::json!({ "requiredMainHash": hash }))
        });
        let sealer = PackageSealer::from_pem(&pair.public_pem, &pair.private_pem).unwrap();
        let bytes = sealer.seal(&payload(), "2.0.0", metadata).unwrap();

        let release = root.path().join("release");
        std::fs::create_dir_all(&release).unwrap();
        std::fs::write(release.join("app-2.0.0.qupd"), &bytes).unwrap();
        let manifest = ReleaseManifest {
            version: "2.0.0".into(),
            asset_name: "app-2.0.0.qupd".into(),
            asset_size: bytes.len() as u64,
            asset_sha256: Sha256Digest::compute(&bytes),
            required_main_hash: None,
            created_at: Utc::now(),
        };
        std::fs::write(release.join("latest.yml"), manifest.render()).unwrap();

        Self { root }
    }

    fn home(&self) -> PathBuf {
        self.root.path().join("home")
    }

    fn command(&self, sub: &str) -> Command {
        let mut cmd = qupd(&self.home());
        cmd.arg("--resource-dir")
            .arg(self.root.path().join("resources"))
            .arg(sub)
            .arg("--manifest")
            .arg(self.root.path().join("release").join("latest.yml"));
        cmd
    }

    fn package(&self) -> PathBuf {
        self.root.path().join("release").join("app-2.0.0.qupd")
    }
}

const HOST_HASH: &str = "1111111111111111111111111111111111111111111111111111111111111111";
const OTHER_HASH: &str = "2222222222222222222222222222222222222222222222222222222222222222";

#[test]
fn update_installs_then_reports_up_to_date() {
    let release = Release::new(HOST_HASH, Some(HOST_HASH));

    let out = release.command("check").arg("--json").output().unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    let check: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(check["available"], true);
    assert_eq!(check["version"], "2.0.0");

    let out = release.command("update").output().unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains("Installed 2.0.0"));
    assert!(release.home().join("updates/2.0.0/index.html").exists());

    let out = release.command("update").output().unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).contains("Already up to date"));
}

#[test]
fn gate_mismatch_fails_with_code() {
    let release = Release::new(HOST_HASH, Some(OTHER_HASH));

    let out = release.command("update").output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("gate.main-hash-mismatch"), "{}", stderr(&out));
    assert!(!release.home().join("updates/2.0.0").exists());
}

#[test]
fn inspect_shows_header() {
    let release = Release::new(HOST_HASH, Some(HOST_HASH));
    let out = qupd(&release.home())
        .arg("inspect")
        .arg("--json")
        .arg(release.package())
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    let header: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(header["format"], 2);
    assert_eq!(header["version"], "2.0.0");
    assert_eq!(header["ivLen"], 12);
    assert_eq!(header["authTagLen"], 16);
    assert_eq!(header["metadata"]["requiredMainHash"], HOST_HASH);
}

#[test]
fn inspect_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("junk.qupd");
    std::fs::write(&file, b"NOPE").unwrap();
    let out = qupd(dir.path()).arg("inspect").arg(&file).output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("not a valid update package"));
}

#[test]
fn main_hash_matches_library() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("dist").join("main");
    std::fs::create_dir_all(&main).unwrap();
    std::fs::write(main.join("index.js"), "console.log('main')").unwrap();

    let out = qupd(dir.path())
        .arg("main-hash")
        .arg("--project")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", stderr(&out));

    let expected = compute_hash_from_roots(&[main], dir.path()).unwrap().unwrap();
    assert_eq!(stdout(&out).trim(), expected.as_str());
}

#[test]
fn main_hash_without_files_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = qupd(dir.path())
        .arg("main-hash")
        .arg("--project")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn verify_archive_strict_needs_key() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("app.asar");
    std::fs::write(&archive, b"archive").unwrap();

    let advisory = qupd(dir.path()).arg("verify-archive").arg(&archive).output().unwrap();
    assert!(advisory.status.success(), "{}", stderr(&advisory));
    assert!(stderr(&advisory).contains("No archive public key"));

    let strict = qupd(dir.path())
        .arg("verify-archive")
        .arg("--strict")
        .arg(&archive)
        .output()
        .unwrap();
    assert!(!strict.status.success());
}

#[test]
fn status_on_empty_home() {
    let dir = tempfile::tempdir().unwrap();
    let out = qupd(dir.path()).arg("status").output().unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("No updates installed"));
    assert!(text.contains("free"));
}

#[test]
fn completions_mention_binary() {
    let dir = tempfile::tempdir().unwrap();
    let out = qupd(dir.path()).args(["completions", "bash"]).output().unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).contains("qupd"));
}
