//! Parser for Source engine `_dir.vpk` directory files.
//!
//! A VPK archive is split into a directory file and zero or more numbered data files:
//! - A header with signature, version, and the size of the directory tree
//! - The tree, grouped by extension, then by directory, then by file name
//! - Per-file entries pointing into a data file (or into the directory file itself)
//! - Optional inline "preload" bytes stored directly in the tree
//!
//! Version 2 headers carry four extra section sizes (file data, MD5 tables, signature)
//! that are not needed for reading and are skipped.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::data::parser_utils::{WResult, bytes, null_terminated_string, u16_le, u32_le};

#[derive(Debug, Error)]
pub enum VpkError {
    #[error("Not a VPK directory file (signature 0x{0:08X})")]
    BadSignature(u32),
    #[error("Unsupported VPK version {0}")]
    UnsupportedVersion(u32),
    #[error("VPK directory file name must end in _dir.vpk: {}", .0.display())]
    NotADirectoryFile(PathBuf),
    #[error("File not found in archive: {0}")]
    FileNotFound(String),
    #[error("I/O error")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// `0x55AA1234` as little-endian u32.
pub const VPK_SIGNATURE: u32 = 0x55AA1234;

/// Archive index meaning "data follows the tree inside the directory file".
pub const DIR_ARCHIVE_INDEX: u16 = 0x7FFF;

const ENTRY_TERMINATOR: u16 = 0xFFFF;

const V1_HEADER_SIZE: usize = 12;
const V2_HEADER_SIZE: usize = 28;

/// Parsed header of a directory file.
#[derive(Debug, Clone, Copy)]
pub struct VpkHeader {
    pub version: u32,
    pub tree_size: u32,
    /// Size of the header in bytes; the tree starts here.
    pub header_size: usize,
}

/// Location of one file's data.
#[derive(Debug, Clone)]
pub struct VpkEntry {
    pub crc32: u32,
    /// Inline bytes stored in the tree. They come before the archive data.
    pub preload: Vec<u8>,
    pub archive_index: u16,
    pub offset: u32,
    pub length: u32,
}

impl VpkEntry {
    /// Total size of the file once preload and archive data are joined.
    pub fn total_len(&self) -> u64 {
        self.preload.len() as u64 + self.length as u64
    }

    pub fn in_directory_file(&self) -> bool {
        self.archive_index == DIR_ARCHIVE_INDEX
    }
}

/// Main struct describing a parsed `_dir.vpk` file.
#[derive(Debug)]
pub struct VpkDirectory {
    pub header: VpkHeader,
    /// Full normalized path → entry.
    pub entries: HashMap<String, VpkEntry>,
}

impl VpkDirectory {
    /// Byte offset in the directory file where embedded file data starts.
    pub fn embedded_data_offset(&self) -> usize {
        self.header.header_size + self.header.tree_size as usize
    }

    pub fn get(&self, path: &str) -> Option<&VpkEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Normalize an archive path: lowercase, `/` separators, no leading or trailing `/`.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_matches('/')
        .to_ascii_lowercase()
}

/// Name of the numbered data file belonging to a directory file.
///
/// `tf2_misc_dir.vpk` with index 3 becomes `tf2_misc_003.vpk`.
pub fn data_file_name(dir_file_name: &str, archive_index: u16) -> Option<String> {
    let stem = dir_file_name.strip_suffix("_dir.vpk")?;
    Some(format!("{stem}_{archive_index:03}.vpk"))
}

fn parse_header(input: &mut &[u8]) -> WResult<(u32, VpkHeader)> {
    let signature = u32_le(input)?;
    let version = u32_le(input)?;
    let tree_size = u32_le(input)?;
    let header_size = if version == 2 {
        // file data, archive MD5, other MD5, signature section sizes
        for _ in 0..4 {
            u32_le(input)?;
        }
        V2_HEADER_SIZE
    } else {
        V1_HEADER_SIZE
    };
    Ok((
        signature,
        VpkHeader {
            version,
            tree_size,
            header_size,
        },
    ))
}

fn parse_entry(input: &mut &[u8]) -> WResult<(VpkEntry, u16)> {
    let crc32 = u32_le(input)?;
    let preload_len = u16_le(input)?;
    let archive_index = u16_le(input)?;
    let offset = u32_le(input)?;
    let length = u32_le(input)?;
    let terminator = u16_le(input)?;
    let preload = bytes(input, preload_len as usize)?.to_vec();
    Ok((
        VpkEntry {
            crc32,
            preload,
            archive_index,
            offset,
            length,
        },
        terminator,
    ))
}

fn join_tree_path(dir: &str, name: &str, ext: &str) -> String {
    let mut path = String::with_capacity(dir.len() + name.len() + ext.len() + 2);
    if dir != " " && !dir.is_empty() {
        path.push_str(dir);
        path.push('/');
    }
    path.push_str(name);
    if ext != " " && !ext.is_empty() {
        path.push('.');
        path.push_str(ext);
    }
    normalize_path(&path)
}

/// Parse a `_dir.vpk` file from raw bytes.
pub fn parse(file_data: &[u8]) -> Result<VpkDirectory, VpkError> {
    let input = &mut &file_data[..];

    let (signature, header) =
        parse_header(input).map_err(|e| VpkError::ParseError(format!("header: {e}")))?;
    if signature != VPK_SIGNATURE {
        return Err(VpkError::BadSignature(signature));
    }
    if header.version != 1 && header.version != 2 {
        return Err(VpkError::UnsupportedVersion(header.version));
    }

    let tree_end = header.header_size + header.tree_size as usize;
    if tree_end > file_data.len() {
        return Err(VpkError::ParseError(format!(
            "tree extends beyond file (need 0x{tree_end:X}, have 0x{:X})",
            file_data.len()
        )));
    }
    let tree = &mut &file_data[header.header_size..tree_end];

    let mut entries = HashMap::new();
    loop {
        let ext = null_terminated_string(tree)
            .map_err(|e| VpkError::ParseError(format!("extension: {e}")))?;
        if ext.is_empty() {
            break;
        }
        loop {
            let dir = null_terminated_string(tree)
                .map_err(|e| VpkError::ParseError(format!("directory under .{ext}: {e}")))?;
            if dir.is_empty() {
                break;
            }
            loop {
                let name = null_terminated_string(tree)
                    .map_err(|e| VpkError::ParseError(format!("file name in {dir}: {e}")))?;
                if name.is_empty() {
                    break;
                }
                let (entry, terminator) = parse_entry(tree).map_err(|e| {
                    VpkError::ParseError(format!("entry {dir}/{name}.{ext}: {e}"))
                })?;
                if terminator != ENTRY_TERMINATOR {
                    return Err(VpkError::ParseError(format!(
                        "entry {dir}/{name}.{ext} has terminator 0x{terminator:04X}"
                    )));
                }
                let path = join_tree_path(&dir, &name, &ext);
                if entries.insert(path.clone(), entry).is_some() {
                    warn!("duplicate archive path {path}");
                }
            }
        }
    }

    Ok(VpkDirectory { header, entries })
}
