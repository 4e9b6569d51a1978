//! VFS abstraction for reading files from Source engine VPK archives.
//!
//! Follows the sans-IO pattern: the VFS is generic over a data source `T` that
//! implements [`Prime`]. The VFS itself never performs I/O; it delegates to the source
//! for raw byte access to the directory file and the numbered data files.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::Range;

use vfs::error::VfsErrorKind;
use vfs::{FileSystem, VfsError, VfsMetadata};

use crate::data::vpk::{self, VpkDirectory, VpkEntry};

/// Trait for providing raw byte access to archive files.
///
/// Implementors must be able to read a byte range from a named file that lives next to
/// the directory file.
pub trait Prime {
    fn prime_file(&self, file_name: &str, range: Range<usize>) -> Result<impl AsRef<[u8]>, VfsError>;
}

/// Entry metadata for any node (file or directory).
#[derive(Debug, Clone)]
pub enum VfsEntryMeta {
    File(VpkEntry),
    Directory {
        /// Names of immediate children.
        children: Vec<String>,
    },
}

/// A virtual filesystem built from a parsed directory file, backed by archive data.
#[derive(Debug)]
pub struct VpkVfs<T> {
    source: T,
    dir_file_name: String,
    embedded_data_offset: usize,
    entries: HashMap<String, VfsEntryMeta>,
}

impl<T> VpkVfs<T> {
    /// Build a VFS from a parsed directory file and a data source.
    ///
    /// `dir_file_name` is the directory file's own name (e.g. `tf2_misc_dir.vpk`), used
    /// both to read embedded data and to derive the names of the numbered data files.
    pub fn new(source: T, dir_file_name: impl Into<String>, directory: VpkDirectory) -> Self {
        let embedded_data_offset = directory.embedded_data_offset();
        let entries = build_vfs_entries(directory);
        Self {
            source,
            dir_file_name: dir_file_name.into(),
            embedded_data_offset,
            entries,
        }
    }

    /// Look up an entry by path.
    pub fn entry_at(&self, path: &str) -> vfs::VfsResult<&VfsEntryMeta> {
        let lookup = vpk::normalize_path(path);
        self.entries
            .get(lookup.as_str())
            .ok_or_else(|| VfsError::from(VfsErrorKind::FileNotFound))
    }
}

impl<T: Prime> VpkVfs<T> {
    /// Read a file's complete contents: preload bytes followed by archive data.
    pub fn read_entry(&self, entry: &VpkEntry) -> vfs::VfsResult<Vec<u8>> {
        let mut data = Vec::with_capacity(entry.total_len() as usize);
        data.extend_from_slice(&entry.preload);
        if entry.length == 0 {
            return Ok(data);
        }

        let (file_name, start) = if entry.in_directory_file() {
            (
                self.dir_file_name.clone(),
                self.embedded_data_offset + entry.offset as usize,
            )
        } else {
            let name = vpk::data_file_name(&self.dir_file_name, entry.archive_index)
                .ok_or_else(|| {
                    VfsError::from(VfsErrorKind::Other(format!(
                        "cannot derive data file name from {}",
                        self.dir_file_name
                    )))
                })?;
            (name, entry.offset as usize)
        };
        let end = start + entry.length as usize;

        let primed = self.source.prime_file(&file_name, start..end)?;
        data.extend_from_slice(primed.as_ref());
        Ok(data)
    }
}

/// Convert the flat path → entry map into a map with directory nodes and their children.
fn build_vfs_entries(directory: VpkDirectory) -> HashMap<String, VfsEntryMeta> {
    let mut entries: HashMap<String, VfsEntryMeta> = directory
        .entries
        .into_iter()
        .map(|(path, entry)| (path, VfsEntryMeta::File(entry)))
        .collect();
    entries.insert(
        String::new(),
        VfsEntryMeta::Directory {
            children: Vec::new(),
        },
    );

    let file_paths: Vec<String> = entries.keys().filter(|p| !p.is_empty()).cloned().collect();
    for path in &file_paths {
        // Walk up the path, registering each component with its parent.
        let mut child = path.as_str();
        while !child.is_empty() {
            let (parent, name) = match child.rfind('/') {
                Some(pos) => (&child[..pos], &child[pos + 1..]),
                None => ("", child),
            };
            let node = entries
                .entry(parent.to_string())
                .or_insert_with(|| VfsEntryMeta::Directory {
                    children: Vec::new(),
                });
            if let VfsEntryMeta::Directory { children } = node {
                children.push(name.to_string());
            }
            child = parent;
        }
    }

    for entry in entries.values_mut() {
        if let VfsEntryMeta::Directory { children } = entry {
            children.sort();
            children.dedup();
        }
    }

    entries
}

/// Archives are never written through the VFS.
fn read_only<R>() -> vfs::VfsResult<R> {
    Err(VfsError::from(VfsErrorKind::NotSupported))
}

impl<T> FileSystem for VpkVfs<T>
where
    T: Prime + Debug + Send + Sync + 'static,
{
    fn read_dir(&self, path: &str) -> vfs::VfsResult<Box<dyn Iterator<Item = String> + Send>> {
        let entry = self.entry_at(path)?;
        match entry {
            // Names only; `VfsPath::read_dir` joins them onto the parent.
            VfsEntryMeta::Directory { children } => Ok(Box::new(children.clone().into_iter())),
            VfsEntryMeta::File(_) => Err(VfsError::from(VfsErrorKind::Other(
                "not a directory".into(),
            ))),
        }
    }

    fn create_dir(&self, _path: &str) -> vfs::VfsResult<()> {
        read_only()
    }

    fn open_file(&self, path: &str) -> vfs::VfsResult<Box<dyn vfs::SeekAndRead + Send>> {
        let entry = self.entry_at(path)?;
        let VfsEntryMeta::File(file_entry) = entry else {
            return Err(VfsError::from(VfsErrorKind::Other("not a file".into())));
        };
        let data = self.read_entry(file_entry)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn create_file(&self, _path: &str) -> vfs::VfsResult<Box<dyn vfs::SeekAndWrite + Send>> {
        read_only()
    }

    fn append_file(&self, _path: &str) -> vfs::VfsResult<Box<dyn vfs::SeekAndWrite + Send>> {
        read_only()
    }

    fn metadata(&self, path: &str) -> vfs::VfsResult<VfsMetadata> {
        let entry = self.entry_at(path)?;
        let meta = match entry {
            VfsEntryMeta::Directory { .. } => VfsMetadata {
                file_type: vfs::VfsFileType::Directory,
                len: 0,
                created: None,
                modified: None,
                accessed: None,
            },
            VfsEntryMeta::File(f) => VfsMetadata {
                file_type: vfs::VfsFileType::File,
                len: f.total_len(),
                created: None,
                modified: None,
                accessed: None,
            },
        };
        Ok(meta)
    }

    fn exists(&self, path: &str) -> vfs::VfsResult<bool> {
        Ok(self.entry_at(path).is_ok())
    }

    fn remove_file(&self, _path: &str) -> vfs::VfsResult<()> {
        read_only()
    }

    fn remove_dir(&self, _path: &str) -> vfs::VfsResult<()> {
        read_only()
    }

    fn set_creation_time(&self, _path: &str, _time: std::time::SystemTime) -> vfs::VfsResult<()> {
        read_only()
    }

    fn set_modification_time(
        &self,
        _path: &str,
        _time: std::time::SystemTime,
    ) -> vfs::VfsResult<()> {
        read_only()
    }

    fn set_access_time(&self, _path: &str, _time: std::time::SystemTime) -> vfs::VfsResult<()> {
        read_only()
    }

    fn copy_file(&self, _src: &str, _dest: &str) -> vfs::VfsResult<()> {
        read_only()
    }

    fn move_file(&self, _src: &str, _dest: &str) -> vfs::VfsResult<()> {
        read_only()
    }

    fn move_dir(&self, _src: &str, _dest: &str) -> vfs::VfsResult<()> {
        read_only()
    }
}
