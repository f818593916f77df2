//! Locations that test binaries and sandbox tests agree on.
//!
//! Each helper honours an environment override first and falls back to a
//! location derived from the current build.

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Scratch space for tests. `TEST_TMPDIR` wins over the system default.
pub const TEST_TMPDIR_ENV: &str = "TEST_TMPDIR";
/// Root for source-relative lookups.
pub const TEST_SRCDIR_ENV: &str = "TEST_SRCDIR";
/// Directory holding prebuilt test binaries.
pub const TEST_FILES_DIR_ENV: &str = "TEST_FILES_DIR";
/// Directory holding test data files.
pub const TEST_DATA_DIR_ENV: &str = "TEST_DATA_DIR";

fn non_empty_var(name: &str) -> Option<OsString> {
    env::var_os(name).filter(|value| !value.is_empty())
}

/// Returns the directory tests should create scratch files in.
#[must_use]
pub fn temp_dir() -> PathBuf {
    non_empty_var(TEST_TMPDIR_ENV).map_or_else(env::temp_dir, PathBuf::from)
}

/// Resolves `relative` against the source root.
///
/// Without `TEST_SRCDIR` the crate manifest directory of the running test is
/// used, then the working directory.
#[must_use]
pub fn source_path(relative: impl AsRef<Path>) -> PathBuf {
    let root = non_empty_var(TEST_SRCDIR_ENV)
        .or_else(|| non_empty_var("CARGO_MANIFEST_DIR"))
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    root.join(relative)
}

/// Returns the directory holding prebuilt test binaries, when configured.
///
/// Without `TEST_FILES_DIR` callers rely on Cargo's `CARGO_BIN_EXE_*`
/// variables instead.
#[must_use]
pub fn test_files_dir() -> Option<PathBuf> {
    non_empty_var(TEST_FILES_DIR_ENV).map(PathBuf::from)
}

/// Resolves the data file `relative`, defaulting to `testdata/` under the
/// source root.
#[must_use]
pub fn test_data_path(relative: impl AsRef<Path>) -> PathBuf {
    non_empty_var(TEST_DATA_DIR_ENV).map_or_else(
        || source_path("testdata").join(relative.as_ref()),
        |dir| PathBuf::from(dir).join(relative.as_ref()),
    )
}

/// Scratch directory under [`temp_dir`] removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Creates a fresh scratch directory whose name starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn new(prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(temp_dir())?;
        Ok(Self { dir })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Joins `relative` onto the directory path.
    #[must_use]
    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(relative)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn source_path_joins_relative_component() {
        let path = source_path("Cargo.toml");
        assert!(path.ends_with("Cargo.toml"));
    }

    #[rstest]
    fn scratch_dir_is_removed_on_drop() {
        let scratch = ScratchDir::new("scratch").expect("scratch dir");
        let path = scratch.path().to_path_buf();
        std::fs::write(scratch.join("file"), b"x").expect("write");
        assert!(path.is_dir());

        drop(scratch);
        assert!(!path.exists());
    }

    #[rstest]
    fn test_data_path_ends_with_request() {
        let path = test_data_path("sample.bin");
        assert!(path.ends_with("sample.bin"));
    }
}
