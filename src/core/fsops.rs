//! Filesystem helpers shared by the service model, monitor and reconciler.
//!
//! Everything in this module reports "already absent" through its return
//! value (`Ok(false)` / `Ok(None)` / empty list) and reserves `Err` for every
//! other failure, so callers never match on `NotFound` themselves.

use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use crate::core::errors::{Result, WardenError};

/// Whether a directory entry name is hidden (`.`-prefixed).
///
/// Hidden names are temporaries written by other tools and are ignored by
/// every consumer in this crate.
#[must_use]
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// List the visible entry names of `dir`, sorted.
///
/// A missing directory lists as empty.
pub fn list_visible(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(WardenError::io(dir, err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| WardenError::io(dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_hidden(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Create `dir` and its parents.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| WardenError::io(dir, err))
}

/// Write `content` to `path` through a hidden temporary and a rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    let tmp = parent.join(format!(".{file_name}.tmp"));
    let mut file = fs::File::create(&tmp).map_err(|err| WardenError::io(&tmp, err))?;
    file.write_all(content)
        .and_then(|()| file.sync_all())
        .map_err(|err| WardenError::io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| WardenError::io(path, err))
}

/// Write `content` only when it differs from what is on disk.
///
/// Returns whether the file was (re)written.
pub fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == content => Ok(false),
        Ok(_) => write_atomic(path, content).map(|()| true),
        Err(err) if err.kind() == ErrorKind::NotFound => write_atomic(path, content).map(|()| true),
        Err(err) => Err(WardenError::io(path, err)),
    }
}

/// Set the unix permission bits of `path`.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| WardenError::io(path, err))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Write an executable script if it changed. Returns whether it was written.
pub fn write_script(path: &Path, content: &str) -> Result<bool> {
    let written = write_if_changed(path, content.as_bytes())?;
    set_mode(path, 0o755)?;
    Ok(written)
}

/// Create an empty marker file. Returns `false` if it already existed.
pub fn touch(path: &Path) -> Result<bool> {
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(WardenError::io(path, err)),
    }
}

/// Remove a file or symlink. Returns `false` if it was already gone.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WardenError::io(path, err)),
    }
}

/// Remove a directory tree. Returns `false` if it was already gone.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(WardenError::io(path, err)),
    }
}

/// Read a symlink target, `None` if the link does not exist.
pub fn read_link_if_exists(path: &Path) -> Result<Option<PathBuf>> {
    match fs::read_link(path) {
        Ok(target) => Ok(Some(target)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(WardenError::io(path, err)),
    }
}

/// Create `link` pointing at `target`. Returns `false` if `link` already existed.
pub fn symlink(target: &Path, link: &Path) -> Result<bool> {
    #[cfg(unix)]
    {
        match std::os::unix::fs::symlink(target, link) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(WardenError::io(link, err)),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(WardenError::UnsupportedPlatform {
            details: format!("symlinks are unavailable for {}", link.display()),
        })
    }
}

/// Whether a path exists without following a final symlink.
#[must_use]
pub fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
