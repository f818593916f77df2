//! Minimal ELF64 reader for discovering runtime dependencies.
//!
//! Only the pieces the dynamic loader consults are decoded: the program
//! interpreter, `DT_NEEDED` entries, and the `DT_RPATH` and `DT_RUNPATH`
//! search paths. Libraries are located the way `ld.so` does it, minus the
//! loader cache.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;
use warden_util::path::{clean_path, dirname};

use crate::error::MountError;


const ELF_TARGET: &str = "warden_policy::elf";

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;
const DYN_LEN: usize = 16;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

#[cfg(target_arch = "x86_64")]
const DEFAULT_LIBRARY_DIRS: &[&str] = &[
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
];

#[cfg(target_arch = "aarch64")]
const DEFAULT_LIBRARY_DIRS: &[&str] = &[
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
];

/// Why a file could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElfParseError {
    /// The file does not start with the ELF magic.
    #[error("missing ELF magic")]
    NotElf,
    /// The file is ELF but not 64-bit little-endian.
    #[error("only 64-bit little-endian ELF is supported")]
    UnsupportedFormat,
    /// A header or table points past the end of the file.
    #[error("{0} lies outside the file")]
    Truncated(&'static str),
    /// The dynamic section has no string table.
    #[error("dynamic section has no string table")]
    MissingStringTable,
    /// A string is not terminated or not UTF-8.
    #[error("malformed string at offset {0}")]
    BadString(usize),
}

/// Loader-relevant facts about one ELF file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    /// Contents of `PT_INTERP`, if present.
    pub interpreter: Option<String>,
    /// `DT_NEEDED` sonames in file order.
    pub needed: Vec<String>,
    /// Directories listed in `DT_RPATH`.
    pub rpath: Vec<String>,
    /// Directories listed in `DT_RUNPATH`.
    pub runpath: Vec<String>,
}

#[derive(Clone, Copy)]
struct Segment {
    kind: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
}

/// Decodes the loader-relevant parts of an ELF64 image.
///
/// # Errors
///
/// Returns [`ElfParseError`] for anything other than a well-formed 64-bit
/// little-endian ELF file.
pub fn parse(data: &[u8]) -> Result<ElfInfo, ElfParseError> {
    if data.get(..4) != Some(ELF_MAGIC.as_slice()) {
        return Err(ElfParseError::NotElf);
    }
    if data.get(4) != Some(&ELFCLASS64) || data.get(5) != Some(&ELFDATA2LSB) {
        return Err(ElfParseError::UnsupportedFormat);
    }
    if data.len() < EHDR_LEN {
        return Err(ElfParseError::Truncated("ELF header"));
    }

    let segments = program_headers(data)?;
    let mut info = ElfInfo::default();

    if let Some(interp) = segments.iter().find(|segment| segment.kind == PT_INTERP) {
        let start = to_usize(interp.offset, "interpreter")?;
        info.interpreter = Some(read_cstr(data, start)?);
    }

    let Some(dynamic) = segments.iter().find(|segment| segment.kind == PT_DYNAMIC) else {
        return Ok(info);
    };
    let entries = dynamic_entries(data, dynamic)?;
    let strtab_vaddr = entries
        .iter()
        .find(|(tag, _)| *tag == DT_STRTAB)
        .map(|(_, value)| *value)
        .ok_or(ElfParseError::MissingStringTable)?;
    let strtab =
        vaddr_to_offset(&segments, strtab_vaddr).ok_or(ElfParseError::MissingStringTable)?;

    for &(tag, value) in &entries {
        let string_at = |at: u64| -> Result<String, ElfParseError> {
            let offset = strtab
                .checked_add(to_usize(at, "string table entry")?)
                .ok_or(ElfParseError::Truncated("string table entry"))?;
            read_cstr(data, offset)
        };
        match tag {
            DT_NEEDED => info.needed.push(string_at(value)?),
            DT_RPATH => {
                let dirs = string_at(value)?;
                info.rpath.extend(split_search_path(&dirs).map(str::to_owned));
            }
            DT_RUNPATH => {
                let dirs = string_at(value)?;
                info.runpath.extend(split_search_path(&dirs).map(str::to_owned));
            }
            _ => {}
        }
    }
    Ok(info)
}

/// Lists the interpreter and every shared library `binary` loads,
/// transitively, as the paths they were found at.
///
/// The interpreter comes first; libraries follow in breadth-first order.
///
/// # Errors
///
/// Fails when a file cannot be read, is not a supported ELF file, or needs a
/// library that is not found on any search path.
pub fn resolve_dependencies(
    binary: &Path,
    ld_library_path: &str,
) -> Result<Vec<PathBuf>, MountError> {
    let root = load(binary)?;
    let mut resolved = Vec::new();
    if let Some(interpreter) = &root.interpreter {
        resolved.push(PathBuf::from(interpreter));
    }

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut seen_paths: HashSet<PathBuf> = resolved.iter().cloned().collect();
    let mut queue = VecDeque::from([(binary.to_path_buf(), root)]);

    while let Some((owner, info)) = queue.pop_front() {
        for library in &info.needed {
            if !seen_names.insert(library.clone()) {
                continue;
            }
            let (path, library_info) = locate(library, &owner, &info, ld_library_path)?;
            trace!(target: ELF_TARGET, library, path = %path.display(), "resolved library");
            if seen_paths.insert(path.clone()) {
                resolved.push(path.clone());
                queue.push_back((path, library_info));
            }
        }
    }
    Ok(resolved)
}

fn load(path: &Path) -> Result<ElfInfo, MountError> {
    let data = fs::read(path).map_err(|source| MountError::Inspect {
        path: path.to_path_buf(),
        source: Arc::new(source),
    })?;
    parse(&data).map_err(|error| MountError::BadElf {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

/// Finds `library` for `owner`, skipping candidates of another ELF class.
fn locate(
    library: &str,
    owner: &Path,
    info: &ElfInfo,
    ld_library_path: &str,
) -> Result<(PathBuf, ElfInfo), MountError> {
    if library.contains('/') {
        let path = PathBuf::from(library);
        let parsed = load(&path)?;
        return Ok((path, parsed));
    }

    let origin = owner
        .to_str()
        .map(dirname)
        .filter(|dir| !dir.is_empty())
        .unwrap_or(".");
    let rpath: &[String] = if info.runpath.is_empty() { &info.rpath } else { &[] };
    let candidates = rpath
        .iter()
        .map(String::as_str)
        .chain(split_search_path(ld_library_path))
        .chain(info.runpath.iter().map(String::as_str))
        .chain(DEFAULT_LIBRARY_DIRS.iter().copied());

    for dir in candidates {
        let expanded = dir.replace("${ORIGIN}", origin).replace("$ORIGIN", origin);
        let path = PathBuf::from(clean_path(&format!("{expanded}/{library}")));
        let Ok(data) = fs::read(&path) else {
            continue;
        };
        match parse(&data) {
            Ok(parsed) => return Ok((path, parsed)),
            Err(error) => {
                trace!(target: ELF_TARGET, path = %path.display(), %error, "skipping candidate");
            }
        }
    }
    Err(MountError::LibraryNotFound {
        library: library.to_owned(),
        needed_by: owner.to_path_buf(),
    })
}

fn split_search_path(value: &str) -> impl Iterator<Item = &str> {
    value.split(':').filter(|dir| !dir.is_empty())
}

fn program_headers(data: &[u8]) -> Result<Vec<Segment>, ElfParseError> {
    let phoff = to_usize(read_u64(data, 0x20)?, "program headers")?;
    let phentsize = usize::from(read_u16(data, 0x36)?);
    let phnum = usize::from(read_u16(data, 0x38)?);
    if phnum > 0 && phentsize < PHDR_LEN {
        return Err(ElfParseError::Truncated("program header entry"));
    }

    (0..phnum)
        .map(|index| {
            let base = index
                .checked_mul(phentsize)
                .and_then(|offset| offset.checked_add(phoff))
                .ok_or(ElfParseError::Truncated("program headers"))?;
            Ok(Segment {
                kind: read_u32(data, base)?,
                offset: read_u64(data, base + 8)?,
                vaddr: read_u64(data, base + 16)?,
                filesz: read_u64(data, base + 32)?,
            })
        })
        .collect()
}

fn dynamic_entries(data: &[u8], dynamic: &Segment) -> Result<Vec<(u64, u64)>, ElfParseError> {
    let start = to_usize(dynamic.offset, "dynamic section")?;
    let len = to_usize(dynamic.filesz, "dynamic section")?;
    let section = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or(ElfParseError::Truncated("dynamic section"))?;
    let mut entries = Vec::new();
    for entry in section.chunks_exact(DYN_LEN) {
        let tag = read_u64(entry, 0)?;
        if tag == DT_NULL {
            break;
        }
        entries.push((tag, read_u64(entry, 8)?));
    }
    Ok(entries)
}

fn vaddr_to_offset(segments: &[Segment], vaddr: u64) -> Option<usize> {
    segments
        .iter()
        .filter(|segment| segment.kind == PT_LOAD)
        .find(|segment| vaddr >= segment.vaddr && vaddr - segment.vaddr < segment.filesz)
        .and_then(|segment| usize::try_from(vaddr - segment.vaddr + segment.offset).ok())
}

fn to_usize(value: u64, what: &'static str) -> Result<usize, ElfParseError> {
    usize::try_from(value).map_err(|_| ElfParseError::Truncated(what))
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ElfParseError> {
    offset
        .checked_add(N)
        .and_then(|end| data.get(offset..end))
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ElfParseError::Truncated("header field"))
}

#[expect(clippy::little_endian_bytes, reason = "only little-endian ELF64 is accepted")]
fn read_u16(data: &[u8], offset: usize) -> Result<u16, ElfParseError> {
    field(data, offset).map(u16::from_le_bytes)
}

#[expect(clippy::little_endian_bytes, reason = "only little-endian ELF64 is accepted")]
fn read_u32(data: &[u8], offset: usize) -> Result<u32, ElfParseError> {
    field(data, offset).map(u32::from_le_bytes)
}

#[expect(clippy::little_endian_bytes, reason = "only little-endian ELF64 is accepted")]
fn read_u64(data: &[u8], offset: usize) -> Result<u64, ElfParseError> {
    field(data, offset).map(u64::from_le_bytes)
}

fn read_cstr(data: &[u8], offset: usize) -> Result<String, ElfParseError> {
    let tail = data.get(offset..).ok_or(ElfParseError::BadString(offset))?;
    let end = tail
        .iter()
        .position(|&byte| byte == 0)
        .ok_or(ElfParseError::BadString(offset))?;
    let (bytes, _) = tail.split_at(end);
    String::from_utf8(bytes.to_vec()).map_err(|_| ElfParseError::BadString(offset))
}
