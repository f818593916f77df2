//! Unit tests for lexical path helpers.

use rstest::rstest;

use super::*;

#[rstest]
#[case::absolute("/foo", "bar", "/foo/bar")]
#[case::both_separators("foo/", "/bar", "foo/bar")]
#[case::no_separators("foo", "bar", "foo/bar")]
#[case::empty_first("", "bar", "bar")]
#[case::empty_last("/foo/", "", "/foo/")]
#[case::leading_separator_kept("foo/", "bar", "foo/bar")]
fn join_path_inserts_single_separator(
    #[case] left: &str,
    #[case] right: &str,
    #[case] expected: &str,
) {
    assert_eq!(join_path(&[left, right]), expected);
}

#[rstest]
fn join_path_handles_many_fragments() {
    assert_eq!(join_path(&["/", "a", "", "b/", "/c"]), "/a/b/c");
}

#[rstest]
#[case::nested("/a/b", "/a", "b")]
#[case::top_level("/a", "/", "a")]
#[case::relative("a", "", "a")]
#[case::root("/", "/", "")]
#[case::trailing("a/b/", "a/b", "")]
fn split_path_separates_last_component(
    #[case] input: &str,
    #[case] dir: &str,
    #[case] file: &str,
) {
    assert_eq!(split_path(input), (dir, file));
    assert_eq!(dirname(input), dir);
    assert_eq!(basename(input), file);
}

#[rstest]
#[case::empty("", ".")]
#[case::dot(".", ".")]
#[case::root("/", "/")]
#[case::double_slash("//a//b/", "/a/b")]
#[case::dots("/a/./b/./c", "/a/b/c")]
#[case::parent("/a/b/../c", "/a/c")]
#[case::above_root("/a/b/../../..", "/")]
#[case::relative_parents("../../a/b/../c", "../../a/c")]
#[case::relative_vanishes("a/..", ".")]
#[case::relative_climb("a/../..", "..")]
fn clean_path_normalises(#[case] input: &str, #[case] expected: &str) {
    assert_eq!(clean_path(input), expected);
}

#[rstest]
#[case("/a//b/../c/.")]
#[case("../x/./y/..")]
#[case("///")]
fn clean_path_is_idempotent(#[case] input: &str) {
    let once = clean_path(input);
    assert_eq!(clean_path(&once), once);
}

#[rstest]
#[case::same("/a/b", "/a/b", true)]
#[case::beneath("/a/b/c", "/a/b", true)]
#[case::sibling_prefix("/a/bc", "/a/b", false)]
#[case::root("/anything", "/", true)]
#[case::dotted("/a/b/../c", "/a", true)]
#[case::escaped("/a/../b", "/a", false)]
fn is_within_respects_component_boundaries(
    #[case] path: &str,
    #[case] prefix: &str,
    #[case] expected: bool,
) {
    assert_eq!(is_within(path, prefix), expected);
}
