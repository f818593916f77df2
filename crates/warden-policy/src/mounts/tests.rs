//! Unit tests for mount tree validation.

use std::fs;
use std::os::unix::fs::symlink;

use rstest::{fixture, rstest};
use tempfile::TempDir;
use warden_util::StatusCode;

use super::*;

struct HostFiles {
    dir: TempDir,
}

impl HostFiles {
    fn file(&self, name: &str) -> String {
        let path = self.dir.path().join(name);
        if !path.exists() {
            fs::write(&path, name).expect("write host file");
        }
        path.to_str().expect("utf8 path").to_owned()
    }

    fn link(&self, name: &str, target: &str) -> String {
        let path = self.dir.path().join(name);
        symlink(target, &path).expect("symlink");
        path.to_str().expect("utf8 path").to_owned()
    }

    fn root(&self) -> &str {
        self.dir.path().to_str().expect("utf8 path")
    }
}

#[fixture]
fn host() -> HostFiles {
    HostFiles {
        dir: TempDir::new().expect("tempdir"),
    }
}

#[rstest]
#[case::empty("")]
#[case::relative("relative/path")]
#[case::embedded_nul("/a\0b")]
#[case::root("/")]
#[case::root_after_cleaning("/a/..")]
fn malformed_destinations_are_invalid_arguments(host: HostFiles, #[case] inside: &str) {
    let mut mounts = Mounts::new();
    let error = mounts
        .add_file_at(&host.file("f"), inside, true)
        .expect_err("destination must be rejected");
    assert_eq!(error.code(), StatusCode::InvalidArgument);
    assert!(mounts.is_empty());
}

#[rstest]
fn relative_outside_path_is_rejected() {
    let error = Mounts::new()
        .add_file_at("host/file", "/file", true)
        .expect_err("relative source");
    assert!(matches!(error, MountError::RelativePath { .. }));
}

#[rstest]
fn file_cannot_gain_children(host: HostFiles) {
    let mut mounts = Mounts::new();
    mounts.add_file_at(&host.file("c"), "/c", true).expect("file");

    let error = mounts
        .add_file_at(&host.file("d"), "/c/d", true)
        .expect_err("beneath a file");
    assert_eq!(error.code(), StatusCode::FailedPrecondition);
}

#[rstest]
fn file_cannot_replace_a_parent_of_mounts(host: HostFiles) {
    let mut mounts = Mounts::new();
    mounts.add_file_at(&host.file("d"), "/c/d", true).expect("nested file");

    let error = mounts
        .add_file_at(&host.file("c"), "/c", true)
        .expect_err("over nested mounts");
    assert_eq!(error.code(), StatusCode::FailedPrecondition);
    assert_eq!(mounts.len(), 1);
}

#[rstest]
fn identical_mapping_is_idempotent(host: HostFiles) {
    let mut mounts = Mounts::new();
    let file = host.file("f");
    mounts.add_file_at(&file, "/f", true).expect("first");
    mounts.add_file_at(&file, "//f/./", true).expect("second");
    assert_eq!(mounts.len(), 1);
}

#[rstest]
fn different_mapping_at_same_destination_conflicts(host: HostFiles) {
    let mut mounts = Mounts::new();
    mounts.add_file_at(&host.file("a"), "/x", true).expect("first");

    let error = mounts
        .add_file_at(&host.file("b"), "/x", true)
        .expect_err("second source");
    assert_eq!(error.code(), StatusCode::FailedPrecondition);

    let error = mounts
        .add_file_at(&host.file("a"), "/x", false)
        .expect_err("writability differs");
    assert_eq!(error.code(), StatusCode::FailedPrecondition);
}

#[rstest]
fn symlinks_resolve_before_conflict_detection(host: HostFiles) {
    let mut mounts = Mounts::new();
    let file = host.file("target");
    let link = host.link("alias", &file);

    mounts.add_file_at(&link, "/a", true).expect("through link");
    mounts.add_file_at(&file, "/a", true).expect("direct");

    assert_eq!(
        mounts.get("/a"),
        Some(&MountEntry::File {
            outside: fs::canonicalize(&file).expect("canonical"),
            writable: false,
        })
    );
}

#[rstest]
fn directories_and_tmpfs_may_hold_nested_mounts(host: HostFiles) {
    let mut mounts = Mounts::new();
    mounts.add_directory_at(host.root(), "/data", false).expect("dir");
    mounts.add_file_at(&host.file("f"), "/data/sub/f", true).expect("nested file");
    mounts.add_tmpfs("/tmp", 1 << 20).expect("tmpfs");
    mounts.add_file_at(&host.file("g"), "/tmp/g", true).expect("file in tmpfs");
    assert_eq!(mounts.len(), 4);
}

#[rstest]
fn entries_are_depth_first_with_parents_first(host: HostFiles) {
    let mut mounts = Mounts::new();
    mounts.add_tmpfs("/b", 4096).expect("tmpfs");
    mounts.add_file_at(&host.file("f"), "/a/z", true).expect("file");
    mounts.add_directory_at(host.root(), "/a", true).expect("dir");
    mounts.add_file_at(&host.file("g"), "/b/c", true).expect("nested");

    let order: Vec<String> = mounts.entries().into_iter().map(|(path, _)| path).collect();
    assert_eq!(order, ["/a", "/a/z", "/b", "/b/c"]);
}

#[rstest]
fn missing_outside_paths_are_kept_cleaned() {
    let mut mounts = Mounts::new();
    mounts
        .add_file_at("/nonexistent/./dir//file", "/file", true)
        .expect("missing source is accepted");
    assert_eq!(
        mounts.get("/file"),
        Some(&MountEntry::File {
            outside: PathBuf::from("/nonexistent/dir/file"),
            writable: false,
        })
    );
}

#[rstest]
fn mappings_for_a_dynamic_binary_include_its_interpreter() {
    let exe = fs::read_link("/proc/self/exe").expect("own executable");
    let exe = exe.to_str().expect("utf8 path");
    let info = elf::parse(&fs::read(exe).expect("read self")).expect("parse self");
    let Some(interpreter) = info.interpreter else {
        // Statically linked test binaries need no mappings.
        return;
    };

    let mut mounts = Mounts::new();
    mounts.add_mappings_for_binary(exe, "").expect("mappings");
    assert!(mounts.get(&interpreter).is_some());
    assert!(mounts.len() > 1);
}
