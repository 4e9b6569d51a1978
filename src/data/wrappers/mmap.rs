//! Archive files served straight from memory maps.
//!
//! A VPK directory file points into numbered chunk files (`<name>_000.vpk`, ...). Each one
//! is mapped the first time an entry inside it is read and stays mapped for the life of
//! the source.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use memmap2::{Mmap, MmapOptions};
use tracing::trace;
use vfs::VfsError;
use vfs::error::VfsErrorKind;

use crate::data::vpk_vfs::Prime;

fn lock_poisoned() -> VfsError {
    VfsError::from(VfsErrorKind::Other("archive map cache lock poisoned".into()))
}

/// Chunk files of one archive, mapped on demand.
#[derive(Debug)]
pub struct MmapArchiveSource {
    archive_dir: PathBuf,
    mapped: RwLock<HashMap<String, Arc<Mmap>>>,
}

impl MmapArchiveSource {
    /// `archive_dir` is the directory holding the `_dir.vpk` file and its chunks.
    pub fn new<P: AsRef<Path>>(archive_dir: P) -> Self {
        Self {
            archive_dir: archive_dir.as_ref().to_owned(),
            mapped: RwLock::new(HashMap::new()),
        }
    }

    fn mapping(&self, file_name: &str) -> Result<Arc<Mmap>, VfsError> {
        if let Some(existing) = self.mapped.read().map_err(|_| lock_poisoned())?.get(file_name) {
            return Ok(Arc::clone(existing));
        }

        let path = self.archive_dir.join(file_name);
        let file = File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => VfsError::from(VfsErrorKind::FileNotFound),
            _ => VfsError::from(VfsErrorKind::IoError(err)),
        })?;
        // SAFETY: archive files are treated as read-only while the game is not patching them.
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|err| VfsError::from(VfsErrorKind::IoError(err)))?;
        trace!("mapped {} ({} bytes)", path.display(), mmap.len());

        let mut mapped = self.mapped.write().map_err(|_| lock_poisoned())?;
        // Another reader may have mapped it in the meantime; keep whichever got there first.
        let entry = mapped.entry(file_name.to_string()).or_insert_with(|| Arc::new(mmap));
        Ok(Arc::clone(entry))
    }
}

/// Bytes of one entry, borrowed from a shared mapping.
#[derive(Clone, Debug)]
pub struct MappedRange {
    mmap: Arc<Mmap>,
    range: Range<usize>,
}

impl AsRef<[u8]> for MappedRange {
    fn as_ref(&self) -> &[u8] {
        &self.mmap[self.range.clone()]
    }
}

impl Prime for MmapArchiveSource {
    fn prime_file(&self, file_name: &str, range: Range<usize>) -> Result<impl AsRef<[u8]>, VfsError> {
        let mmap = self.mapping(file_name)?;
        if range.start > range.end || range.end > mmap.len() {
            return Err(VfsError::from(VfsErrorKind::Other(format!(
                "range {range:?} outside of {file_name} ({} bytes)",
                mmap.len()
            ))));
        }
        Ok(MappedRange { mmap, range })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maps_once_and_checks_bounds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pak01_000.vpk"), b"0123456789").unwrap();
        let source = MmapArchiveSource::new(dir.path());

        let bytes = source.prime_file("pak01_000.vpk", 2..5).unwrap();
        assert_eq!(bytes.as_ref(), b"234");
        let _ = source.prime_file("pak01_000.vpk", 0..1).unwrap();
        assert_eq!(source.mapped.read().unwrap().len(), 1);

        assert!(source.prime_file("pak01_000.vpk", 8..20).is_err());
        assert!(source.prime_file("pak01_001.vpk", 0..1).is_err());
    }
}
