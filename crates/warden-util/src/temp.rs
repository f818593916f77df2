//! Uniquely named temporary files and directories that outlive their
//! handles.
//!
//! `prefix` is a path prefix: `/tmp/dump` yields names such as
//! `/tmp/dumpA1b2C3`. A prefix without a directory part lands in the working
//! directory.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::Builder;

use crate::path::split_path;

fn split_prefix(prefix: &str) -> (&Path, &str) {
    match split_path(prefix) {
        ("", name) => (Path::new("."), name),
        (dir, name) => (Path::new(dir), name),
    }
}

/// Creates a uniquely named file and returns its path along with an open
/// handle.
///
/// The file is not removed when the handle is dropped.
///
/// # Errors
///
/// Propagates file creation failures.
pub fn create_named_temp_file(prefix: &str) -> io::Result<(PathBuf, File)> {
    let (parent, name) = split_prefix(prefix);
    let named = Builder::new().prefix(name).tempfile_in(parent)?;
    let (file, path) = named.keep().map_err(|persist| persist.error)?;
    Ok((path, file))
}

/// Like [`create_named_temp_file`] but closes the handle straight away.
///
/// # Errors
///
/// Propagates file creation failures.
pub fn create_named_temp_file_and_close(prefix: &str) -> io::Result<PathBuf> {
    create_named_temp_file(prefix).map(|(path, _file)| path)
}

/// Creates a uniquely named directory and returns its path.
///
/// The directory is not removed automatically.
///
/// # Errors
///
/// Propagates directory creation failures.
pub fn create_temp_dir(prefix: &str) -> io::Result<PathBuf> {
    let (parent, name) = split_prefix(prefix);
    let dir = Builder::new().prefix(name).tempdir_in(parent)?;
    let path = dir.path().to_path_buf();
    // Persist: skip the guard's removal on drop.
    std::mem::forget(dir);
    Ok(path)
}
