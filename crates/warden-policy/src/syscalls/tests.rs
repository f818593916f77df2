//! Unit tests for syscall lookup.

use rstest::rstest;

use super::*;

#[rstest]
#[case::write("write", libc::SYS_write)]
#[case::openat("openat", libc::SYS_openat)]
#[case::execveat("execveat", libc::SYS_execveat)]
fn names_and_numbers_agree(#[case] sys_name: &str, #[case] sys: libc::c_long) {
    assert_eq!(number(sys_name), Some(nr(sys)));
    assert_eq!(name(nr(sys)), Some(sys_name));
}

#[rstest]
fn display_renders_name_and_number() {
    let write = nr(libc::SYS_write);
    assert_eq!(SyscallDisplay(write).to_string(), format!("write ({write})"));
    assert_eq!(SyscallDisplay(4000).to_string(), "unknown (4000)");
}

#[rstest]
fn unknown_names_are_absent() {
    assert_eq!(number("not_a_syscall"), None);
}

#[rstest]
fn table_lists_each_number_once() {
    let mut numbers: Vec<u32> = all().map(|(nr, _)| nr).collect();
    let total = numbers.len();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), total);
    assert!(all().all(|(_, name)| !name.starts_with("SYS_")));
}
