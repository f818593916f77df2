//! Purely lexical path manipulation.
//!
//! None of these functions touch the filesystem. They operate on `/`
//! separated strings and never resolve symlinks.

#[cfg(test)]
mod tests;

/// Joins path fragments with exactly one `/` between adjacent non-empty
/// fragments.
///
/// Empty fragments are skipped. A trailing separator on the final fragment is
/// preserved.
#[must_use]
pub fn join_path<S: AsRef<str>>(parts: &[S]) -> String {
    let mut joined = String::new();
    for part in parts.iter().map(AsRef::as_ref).filter(|part| !part.is_empty()) {
        if joined.is_empty() {
            joined.push_str(part);
            continue;
        }
        match (joined.ends_with('/'), part.strip_prefix('/')) {
            (true, Some(rest)) => joined.push_str(rest),
            (false, None) => {
                joined.push('/');
                joined.push_str(part);
            }
            _ => joined.push_str(part),
        }
    }
    joined
}

/// Splits `path` at its final separator.
///
/// | input    | result          |
/// |----------|-----------------|
/// | `/a/b`   | (`/a`, `b`)     |
/// | `/a`     | (`/`, `a`)      |
/// | `a`      | (empty, `a`)    |
/// | `/`      | (`/`, empty)    |
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        None => ("", path),
        Some(0) => path.split_at(1),
        Some(pos) => {
            let (dir, rest) = path.split_at(pos);
            (dir, rest.strip_prefix('/').unwrap_or(rest))
        }
    }
}

/// Returns the final component of `path`.
#[must_use]
pub fn basename(path: &str) -> &str {
    split_path(path).1
}

/// Returns everything before the final component of `path`.
#[must_use]
pub fn dirname(path: &str) -> &str {
    split_path(path).0
}

/// Returns `true` when `path` starts at the root.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Normalises `path` lexically.
///
/// Repeated separators collapse, `.` components vanish, and `..` removes the
/// preceding component. A `..` that would climb above the root of an absolute
/// path is dropped; leading `..` components of a relative path are retained.
/// An input that reduces to nothing yields `.`.
///
/// The operation is idempotent: `clean_path(&clean_path(p)) == clean_path(p)`.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let rooted = is_absolute(path);
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        String::from(".")
    } else {
        joined
    }
}

/// Returns `true` when `path` equals `prefix` or lies beneath it.
///
/// Both inputs are cleaned first, so `/a/b/../c` lies beneath `/a`.
#[must_use]
pub fn is_within(path: &str, prefix: &str) -> bool {
    let inner = clean_path(path);
    let outer = clean_path(prefix);
    if outer == "/" {
        return is_absolute(&inner);
    }
    inner == outer
        || inner
            .strip_prefix(outer.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
