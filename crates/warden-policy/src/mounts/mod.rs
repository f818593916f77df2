//! The filesystem view exposed to a sandboxee.
//!
//! Destinations form a tree keyed by path component. Each node may carry one
//! [`MountEntry`]; files never have descendants, and a destination is claimed
//! at most once. Re-adding an identical mapping is a no-op.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use warden_util::path::{clean_path, is_absolute};

use crate::elf;
use crate::error::MountError;

#[cfg(test)]
mod tests;

const MOUNTS_TARGET: &str = "warden_policy::mounts";

/// What is mounted at a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEntry {
    /// A single host file bound into place.
    File {
        /// Canonical host path.
        outside: PathBuf,
        /// Whether the sandboxee may write to it.
        writable: bool,
    },
    /// A host directory bound recursively.
    Directory {
        /// Canonical host path.
        outside: PathBuf,
        /// Whether the sandboxee may write beneath it.
        writable: bool,
    },
    /// An empty in-memory filesystem.
    Tmpfs {
        /// Size limit in bytes.
        size: u64,
    },
}

impl MountEntry {
    fn describe(&self) -> String {
        match self {
            Self::File { outside, .. } => format!("already mapped to file {}", outside.display()),
            Self::Directory { outside, .. } => {
                format!("already mapped to directory {}", outside.display())
            }
            Self::Tmpfs { size } => format!("already a tmpfs of {size} bytes"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Node {
    entry: Option<MountEntry>,
    children: BTreeMap<String, Node>,
}

/// Mount directives of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mounts {
    root: Node,
}

impl Mounts {
    /// Creates an empty set of mounts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `path` read-only at the same location.
    ///
    /// # Errors
    ///
    /// See [`Mounts::add_file_at`].
    pub fn add_file(&mut self, path: &str) -> Result<(), MountError> {
        self.add_file_at(path, path, true)
    }

    /// Exposes host file `outside` at `inside`.
    ///
    /// # Errors
    ///
    /// Fails with an invalid-argument error for malformed paths and with a
    /// failed-precondition error when `inside` conflicts with an earlier
    /// mount.
    pub fn add_file_at(
        &mut self,
        outside: &str,
        inside: &str,
        is_ro: bool,
    ) -> Result<(), MountError> {
        let resolved = resolve_outside(outside)?;
        self.insert(
            inside,
            MountEntry::File {
                outside: resolved,
                writable: !is_ro,
            },
        )
    }

    /// Exposes directory `path` read-only at the same location.
    ///
    /// # Errors
    ///
    /// See [`Mounts::add_directory_at`].
    pub fn add_directory(&mut self, path: &str) -> Result<(), MountError> {
        self.add_directory_at(path, path, true)
    }

    /// Exposes host directory `outside` recursively at `inside`.
    ///
    /// # Errors
    ///
    /// See [`Mounts::add_file_at`].
    pub fn add_directory_at(
        &mut self,
        outside: &str,
        inside: &str,
        is_ro: bool,
    ) -> Result<(), MountError> {
        let resolved = resolve_outside(outside)?;
        self.insert(
            inside,
            MountEntry::Directory {
                outside: resolved,
                writable: !is_ro,
            },
        )
    }

    /// Places a tmpfs of at most `size` bytes at `inside`.
    ///
    /// # Errors
    ///
    /// See [`Mounts::add_file_at`].
    pub fn add_tmpfs(&mut self, inside: &str, size: u64) -> Result<(), MountError> {
        self.insert(inside, MountEntry::Tmpfs { size })
    }

    /// Maps the program interpreter and every shared library `binary` needs,
    /// read-only, at the paths they are found under.
    ///
    /// `ld_library_path` takes the form of `LD_LIBRARY_PATH` and is searched
    /// before the system directories.
    ///
    /// # Errors
    ///
    /// Fails when the binary or a library cannot be read or parsed, when a
    /// library cannot be found, or when a mapping conflicts.
    pub fn add_mappings_for_binary(
        &mut self,
        binary: &str,
        ld_library_path: &str,
    ) -> Result<(), MountError> {
        for dependency in elf::resolve_dependencies(Path::new(binary), ld_library_path)? {
            let Some(path) = dependency.to_str() else {
                continue;
            };
            debug!(target: MOUNTS_TARGET, binary, dependency = path, "mapping dependency");
            self.add_file(path)?;
        }
        Ok(())
    }

    /// Returns the entry mounted exactly at `inside`.
    #[must_use]
    pub fn get(&self, inside: &str) -> Option<&MountEntry> {
        let cleaned = clean_path(inside);
        let mut node = &self.root;
        for component in cleaned.split('/').filter(|component| !component.is_empty()) {
            node = node.children.get(component)?;
        }
        node.entry.as_ref()
    }

    /// All entries, parents before children, siblings in name order.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, &MountEntry)> {
        let mut entries = Vec::new();
        collect(&self.root, &mut String::new(), &mut entries);
        entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    fn insert(&mut self, inside: &str, entry: MountEntry) -> Result<(), MountError> {
        let path = validate_inside(inside)?;
        let components: Vec<&str> = path
            .split('/')
            .filter(|component| !component.is_empty())
            .collect();
        let Some((leaf, parents)) = components.split_last() else {
            return Err(MountError::RootPath);
        };

        // Check before touching the tree so a failed insert leaves no trace.
        let mut node = Some(&self.root);
        let mut walked = String::new();
        for component in parents {
            walked.push('/');
            walked.push_str(component);
            node = node.and_then(|parent| parent.children.get(*component));
            if let Some(Node {
                entry: Some(MountEntry::File { .. }),
                ..
            }) = node
            {
                return Err(MountError::Conflict {
                    path: path.clone(),
                    reason: format!("{walked} is mapped as a file"),
                });
            }
        }
        if let Some(existing) = node.and_then(|parent| parent.children.get(*leaf)) {
            match &existing.entry {
                Some(current) if *current == entry => return Ok(()),
                Some(current) => {
                    return Err(MountError::Conflict {
                        path: path.clone(),
                        reason: current.describe(),
                    });
                }
                None if matches!(entry, MountEntry::File { .. }) => {
                    return Err(MountError::Conflict {
                        path: path.clone(),
                        reason: String::from("mounts exist beneath it"),
                    });
                }
                None => {}
            }
        }

        let mut slot = &mut self.root;
        for component in &components {
            slot = slot.children.entry((*component).to_owned()).or_default();
        }
        debug!(target: MOUNTS_TARGET, inside = %path, ?entry, "adding mount");
        slot.entry = Some(entry);
        Ok(())
    }
}

fn collect<'a>(node: &'a Node, path: &mut String, out: &mut Vec<(String, &'a MountEntry)>) {
    for (name, child) in &node.children {
        let len = path.len();
        path.push('/');
        path.push_str(name);
        if let Some(entry) = &child.entry {
            out.push((path.clone(), entry));
        }
        collect(child, path, out);
        path.truncate(len);
    }
}

fn validate_path(path: &str) -> Result<String, MountError> {
    if path.is_empty() {
        return Err(MountError::EmptyPath);
    }
    if path.contains('\0') {
        return Err(MountError::EmbeddedNul);
    }
    if !is_absolute(path) {
        return Err(MountError::RelativePath {
            path: path.to_owned(),
        });
    }
    Ok(clean_path(path))
}

fn validate_inside(inside: &str) -> Result<String, MountError> {
    let path = validate_path(inside)?;
    if path == "/" {
        return Err(MountError::RootPath);
    }
    Ok(path)
}

/// Cleans `outside` and follows symlinks when it exists.
fn resolve_outside(outside: &str) -> Result<PathBuf, MountError> {
    let cleaned = validate_path(outside)?;
    Ok(fs::canonicalize(&cleaned).unwrap_or_else(|_| PathBuf::from(cleaned)))
}
