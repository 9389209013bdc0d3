use crate::error::BmsError;
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn ensure_parent(path: &Path) -> Result<(), BmsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Sibling temp path in the same directory, so a rename onto `path` stays on
/// one filesystem.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "bmsctl".to_string()),
        pid,
        ts
    ))
}

pub fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), BmsError> {
    ensure_parent(path)?;
    let tmp_path = temp_sibling(path);

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Whether the current user can create files in `dir` (or its nearest
/// existing ancestor).
pub fn dir_writable(dir: &Path) -> bool {
    let mut cursor = dir.to_path_buf();
    while !cursor.exists() {
        match cursor.parent() {
            Some(parent) => cursor = parent.to_path_buf(),
            None => return false,
        }
    }
    let probe = cursor.join(format!(".bmsctl-write-probe-{}", std::process::id()));
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Installs `content` at `target` by atomic replace. Directories the operator
/// cannot write (e.g. under `/etc`) go through an elevated `install` into a
/// sibling temp name followed by `mv -f`, so the target is never half-written.
pub fn install_file<R: CommandRunner + ?Sized>(
    runner: &R,
    target: &Path,
    content: &str,
    staging_dir: &Path,
) -> Result<(), BmsError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("/"));
    if dir_writable(parent) {
        return write_atomic_text_file(target, content, Some(0o644));
    }
    let staged = temp_sibling(&staging_dir.join(
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bmsctl".to_string()),
    ));
    write_atomic_text_file(&staged, content, Some(0o644))?;
    let remote_tmp = temp_sibling(target);
    let result = run_checked(
        runner,
        &CommandSpec::new("install")
            .args(["-D", "-m", "0644"])
            .arg(staged.to_string_lossy())
            .arg(remote_tmp.to_string_lossy())
            .elevated(),
    )
    .and_then(|_| {
        run_checked(
            runner,
            &CommandSpec::new("mv")
                .arg("-f")
                .arg(remote_tmp.to_string_lossy())
                .arg(target.to_string_lossy())
                .elevated(),
        )
    });
    let _ = fs::remove_file(&staged);
    result.map(|_| ())
}

/// Deterministic FNV-1a, stable across toolchains.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(unix)]
pub fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::symlink_metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("site.conf");
        fs::write(&path, "old").unwrap();
        write_atomic_text_file(&path, "new", Some(0o644)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn install_file_writes_directly_when_writable() {
        let dir = tempdir().unwrap();
        let runner = crate::runner::testing::MockRunner::default();
        let target = dir.path().join("sites-available").join("BMS.conf");
        install_file(&runner, &target, "server {}\n", dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "server {}\n");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"flask==3.0"), stable_hash(b"flask==3.0"));
        assert_ne!(stable_hash(b"flask==3.0"), stable_hash(b"flask==3.1"));
    }

    #[test]
    fn dir_writable_walks_to_existing_ancestor() {
        let dir = tempdir().unwrap();
        assert!(dir_writable(&dir.path().join("not").join("yet")));
    }
}
