//! Thin filesystem wrappers used when assembling sandbox mount trees.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::path::{clean_path, dirname, is_absolute, join_path};

#[cfg(test)]
mod tests;

/// Returns `true` when `path` names an existing filesystem object.
///
/// With `fully_resolve` the final symlink is followed, so a dangling link
/// reports `false`.
#[must_use]
pub fn exists(path: &Path, fully_resolve: bool) -> bool {
    if fully_resolve {
        fs::metadata(path).is_ok()
    } else {
        fs::symlink_metadata(path).is_ok()
    }
}

/// Returns the current working directory.
///
/// # Errors
///
/// Propagates the error from [`std::env::current_dir`].
pub fn get_cwd() -> io::Result<PathBuf> {
    std::env::current_dir()
}

/// Resolves `path` against `base` and cleans the result.
///
/// Absolute inputs ignore `base`.
#[must_use]
pub fn make_absolute(path: &str, base: &str) -> String {
    if is_absolute(path) {
        clean_path(path)
    } else {
        clean_path(&join_path(&[base, path]))
    }
}

/// Reads the target of the symlink at `link`.
///
/// # Errors
///
/// Fails when `link` is not a symlink or cannot be read.
pub fn read_link(link: &Path) -> io::Result<PathBuf> {
    fs::read_link(link)
}

/// Reads the target of `link` and anchors a relative target at the link's
/// parent directory.
///
/// # Errors
///
/// Fails when `link` is not a symlink, cannot be read, or is not UTF-8.
pub fn read_link_absolute(link: &str) -> io::Result<String> {
    let raw = fs::read_link(link)?;
    let target = raw
        .to_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "link target is not UTF-8"))?;
    Ok(make_absolute(target, dirname(link)))
}

/// Creates `path` and all missing parents with `mode`.
///
/// Succeeds when the directory already exists.
///
/// # Errors
///
/// Propagates failures from directory creation.
pub fn create_directory_recursively(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Removes `path` and, for directories, everything beneath it.
///
/// A missing path counts as success.
///
/// # Errors
///
/// Propagates removal failures other than `NotFound`.
pub fn delete_recursively(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies `from` to `to` and applies `mode` to the copy.
///
/// # Errors
///
/// Propagates copy or permission failures.
pub fn copy_file(from: &Path, to: &Path, mode: u32) -> io::Result<()> {
    fs::copy(from, to)?;
    fs::set_permissions(to, fs::Permissions::from_mode(mode))
}

/// Lists the entry names in `dir`, sorted.
///
/// # Errors
///
/// Fails when `dir` cannot be read or an entry name is not UTF-8.
pub fn list_directory_entries(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().into_string().map_err(|raw| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry name is not UTF-8: {raw:?}"),
            )
        })?;
        names.push(name);
    }
    names.sort();
    Ok(names)
}
