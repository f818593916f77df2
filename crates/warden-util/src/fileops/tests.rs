//! Unit tests for filesystem wrappers.

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};

use rstest::rstest;
use tempfile::TempDir;

use super::*;

#[rstest]
fn exists_distinguishes_dangling_links() {
    let dir = TempDir::new().expect("tempdir");
    let link = dir.path().join("dangling");
    symlink(dir.path().join("missing"), &link).expect("symlink");

    assert!(exists(&link, false));
    assert!(!exists(&link, true));
}

#[rstest]
#[case::absolute("/x/../y", "/base", "/y")]
#[case::relative("y/z", "/base", "/base/y/z")]
#[case::climbing("../y", "/base/sub", "/base/y")]
fn make_absolute_resolves_against_base(
    #[case] path: &str,
    #[case] base: &str,
    #[case] expected: &str,
) {
    assert_eq!(make_absolute(path, base), expected);
}

#[rstest]
fn read_link_absolute_anchors_relative_targets() {
    let dir = TempDir::new().expect("tempdir");
    let link = dir.path().join("link");
    symlink("target", &link).expect("symlink");

    let resolved = read_link_absolute(link.to_str().expect("utf8")).expect("read link");
    assert_eq!(resolved, dir.path().join("target").to_str().expect("utf8"));
}

#[rstest]
fn create_and_delete_directory_tree() {
    let dir = TempDir::new().expect("tempdir");
    let nested = dir.path().join("a/b/c");
    create_directory_recursively(&nested, 0o750).expect("create");
    create_directory_recursively(&nested, 0o750).expect("create is idempotent");
    fs::write(nested.join("file"), b"data").expect("write");

    delete_recursively(&dir.path().join("a")).expect("delete");
    assert!(!exists(&dir.path().join("a"), false));
    delete_recursively(&dir.path().join("a")).expect("missing path is fine");
}

#[rstest]
fn copy_file_applies_mode() {
    let dir = TempDir::new().expect("tempdir");
    let from = dir.path().join("from");
    let to = dir.path().join("to");
    fs::write(&from, b"payload").expect("write");

    copy_file(&from, &to, 0o600).expect("copy");

    assert_eq!(fs::read(&to).expect("read"), b"payload");
    let mode = fs::metadata(&to).expect("metadata").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[rstest]
fn list_directory_entries_is_sorted() {
    let dir = TempDir::new().expect("tempdir");
    for name in ["b", "c", "a"] {
        fs::write(dir.path().join(name), b"").expect("write");
    }

    let names = list_directory_entries(dir.path()).expect("list");
    assert_eq!(names, ["a", "b", "c"]);
}
