use crate::constants::status::BACKUP_SUFFIX;
use rand::{distributions::Alphanumeric, Rng};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// How a freshly written temp file ends up at the canonical path.
///
/// `Rename` is a single atomic `rename(2)`; `BackupCopy` is used where rename
/// over an existing file is refused (Windows sharing violations, some network
/// filesystems). Both keep the previous canonical content in `<file>.bak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    Rename,
    BackupCopy,
}

pub fn ensure_dir_for_file(path: impl AsRef<Path>) -> io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn temp_sibling_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("temp");
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    parent.join(format!(
        "{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        token
    ))
}

pub fn backup_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// Writes `content` to a uniquely named sibling of `path` and fsyncs it.
pub fn write_temp_file(path: impl AsRef<Path>, content: &[u8], mode: u32) -> io::Result<PathBuf> {
    let path = path.as_ref();
    ensure_dir_for_file(path)?;
    let tmp = temp_sibling_path(path);
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        file.write_all(content)?;
        file.sync_all()
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(tmp)
}

fn snapshot_backup(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {
            fs::copy(path, backup_path(path))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn replace_with_rename(tmp: &Path, path: &Path) -> io::Result<()> {
    // A failed backup copy must not block the primary write.
    let _ = snapshot_backup(path);
    fs::rename(tmp, path)
}

/// Copies `tmp` over `path`, restoring the `.bak` snapshot if the copy fails.
/// The temp file is removed on every path.
pub fn replace_with_backup_copy(tmp: &Path, path: &Path) -> io::Result<()> {
    let backed_up = match snapshot_backup(path) {
        Ok(flag) => flag,
        Err(err) => {
            let _ = fs::remove_file(tmp);
            return Err(err);
        }
    };
    let copied = fs::copy(tmp, path);
    let _ = fs::remove_file(tmp);
    match copied {
        Ok(_) => Ok(()),
        Err(err) => {
            if backed_up {
                let _ = fs::copy(backup_path(path), path);
            }
            Err(err)
        }
    }
}

/// Atomically replaces `path` with `content`.
///
/// Readers of `path` observe either the old or the new content, never a
/// truncated file. Falls back to backup-copy when rename is refused.
pub fn atomic_replace(
    path: impl AsRef<Path>,
    content: &[u8],
    mode: u32,
) -> io::Result<ReplaceStrategy> {
    let path = path.as_ref();
    let tmp = write_temp_file(path, content, mode)?;
    match replace_with_rename(&tmp, path) {
        Ok(()) => Ok(ReplaceStrategy::Rename),
        Err(_) => {
            replace_with_backup_copy(&tmp, path)?;
            Ok(ReplaceStrategy::BackupCopy)
        }
    }
}
