//! Main-process integrity hash.
//!
//! A single SHA-256 over every regular file under a set of roots, visited in
//! sorted path order, absorbing each file's path relative to a base directory
//! followed by its bytes. The result identifies the exact main-process build
//! a hot update was produced against.

use std::io;
use std::path::{Component, Path, PathBuf};

use qupd_schema::Sha256Digest;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

/// Recursively list regular files under `root`.
///
/// A missing root yields nothing. Entries that cannot be read are skipped.
/// Symlinks are not followed.
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// `path` relative to `base`, with `/` separators on every platform.
///
/// Paths outside `base` climb with `..`.
pub fn relative_path(base: &Path, path: &Path) -> String {
    let base: Vec<Component<'_>> = base.components().collect();
    let path: Vec<Component<'_>> = path.components().collect();
    let common = base
        .iter()
        .zip(&path)
        .take_while(|(a, b)| a == b)
        .count();

    let ups = base[common..]
        .iter()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|_| "..".to_string());
    let downs = path[common..]
        .iter()
        .map(|c| c.as_os_str().to_string_lossy().into_owned());
    ups.chain(downs).collect::<Vec<_>>().join("/")
}

/// Hash an explicit file list, in the given order.
///
/// Returns `None` for an empty list: no hash is available.
///
/// # Errors
///
/// Returns an I/O error if any listed file cannot be read.
pub fn compute_hash_for_files(
    files: &[PathBuf],
    base_dir: &Path,
) -> io::Result<Option<Sha256Digest>> {
    if files.is_empty() {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(relative_path(base_dir, file).as_bytes());
        let mut reader = std::fs::File::open(file)?;
        io::copy(&mut reader, &mut hasher)?;
    }
    Ok(Some(Sha256Digest::from_bytes(hasher.finalize().into())))
}

/// Hash every file under `roots`.
///
/// Files from all roots are gathered and sorted by path string before
/// hashing, so the result does not depend on enumeration order.
///
/// # Errors
///
/// Returns an I/O error if a discovered file cannot be read.
pub fn compute_hash_from_roots<P: AsRef<Path>>(
    roots: &[P],
    base_dir: &Path,
) -> io::Result<Option<Sha256Digest>> {
    let mut files: Vec<PathBuf> = roots.iter().flat_map(|r| list_files(r.as_ref())).collect();
    files.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    files.dedup();
    debug!(files = files.len(), base = %base_dir.display(), "hashing main-process files");
    compute_hash_for_files(&files, base_dir)
}

/// Pick the main-process roots for a project checkout.
///
/// Built output (`dist/main`, `dist/preload`) is preferred; when none of it
/// exists the source tree (`layer/main/src/main`, `layer/main/src/preload`)
/// is used instead.
pub fn default_roots(project_dir: &Path) -> Vec<PathBuf> {
    let built = [
        project_dir.join("dist").join("main"),
        project_dir.join("dist").join("preload"),
    ];
    if built.iter().any(|p| p.exists()) {
        return built.to_vec();
    }
    let source = project_dir.join("layer").join("main").join("src");
    vec![source.join("main"), source.join("preload")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, data: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn matches_manual_digest() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("main/a.js"), "A");
        write(&dir.path().join("main/sub/b.js"), "BB");

        let mut expected = Sha256::new();
        expected.update(b"main/a.js");
        expected.update(b"A");
        expected.update(b"main/sub/b.js");
        expected.update(b"BB");
        let expected = Sha256Digest::from_bytes(expected.finalize().into());

        let got = compute_hash_from_roots(&[dir.path().join("main")], dir.path()).unwrap();
        assert_eq!(got, Some(expected));
    }

    #[test]
    fn independent_of_creation_and_root_order() {
        let a = tempdir().unwrap();
        write(&a.path().join("main/z.js"), "z");
        write(&a.path().join("preload/p.js"), "p");
        write(&a.path().join("main/a.js"), "a");

        let b = tempdir().unwrap();
        write(&b.path().join("main/a.js"), "a");
        write(&b.path().join("main/z.js"), "z");
        write(&b.path().join("preload/p.js"), "p");

        let ha = compute_hash_from_roots(
            &[a.path().join("main"), a.path().join("preload")],
            a.path(),
        )
        .unwrap();
        let hb = compute_hash_from_roots(
            &[b.path().join("preload"), b.path().join("main")],
            b.path(),
        )
        .unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn sensitive_to_content_and_name() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("main/a.js");
        write(&file, "one");
        let roots = [dir.path().join("main")];
        let first = compute_hash_from_roots(&roots, dir.path()).unwrap();

        write(&file, "two");
        let second = compute_hash_from_roots(&roots, dir.path()).unwrap();
        assert_ne!(first, second);

        fs::rename(&file, dir.path().join("main/b.js")).unwrap();
        let third = compute_hash_from_roots(&roots, dir.path()).unwrap();
        assert_ne!(second, third);
    }

    #[test]
    fn empty_and_missing_roots_have_no_hash() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        let got = compute_hash_from_roots(
            &[dir.path().join("empty"), dir.path().join("missing")],
            dir.path(),
        )
        .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_path(Path::new("/a/b"), Path::new("/a/b/c/d.js")), "c/d.js");
        assert_eq!(relative_path(Path::new("/a/b"), Path::new("/a/x.js")), "../x.js");
    }

    #[test]
    fn default_roots_fall_back_to_source() {
        let dir = tempdir().unwrap();
        assert_eq!(
            default_roots(dir.path())[0],
            dir.path().join("layer/main/src/main")
        );
        fs::create_dir_all(dir.path().join("dist/preload")).unwrap();
        assert_eq!(default_roots(dir.path())[0], dir.path().join("dist/main"));
    }
}
