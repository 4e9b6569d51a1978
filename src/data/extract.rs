//! Pulling a weapon's model and material files out of the game archives.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use vfs::VfsPath;
use walkdir::WalkDir;

use crate::data::vpk::{self, VpkError};
use crate::data::vpk_vfs::VpkVfs;
use crate::data::wrappers::mmap::MmapArchiveSource;
use crate::error::{BuildError, BuildResult, IoResultExt};

/// Companion files that must accompany a model binary, by suffix replacing `.mdl`.
///
/// The vertex data file plus one strip file per supported renderer.
pub const MODEL_COMPANIONS: &[&str] = &[".vvd", ".dx80.vtx", ".dx90.vtx", ".sw.vtx"];

/// Collision model, only present for models that have physics.
pub const PHYSICS_COMPANION: &str = ".phy";

/// An opened game archive.
///
/// Opening parses only the directory file; file data is mapped on demand.
#[derive(Debug)]
pub struct GameArchive {
    path: PathBuf,
    root: VfsPath,
}

impl GameArchive {
    /// Open a `_dir.vpk` file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, VpkError> {
        let path = path.as_ref();
        let dir_file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| name.ends_with("_dir.vpk"))
            .ok_or_else(|| VpkError::NotADirectoryFile(path.to_owned()))?
            .to_string();
        let archive_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let file_data = std::fs::read(path)?;
        let directory = vpk::parse(&file_data)?;
        debug!(
            "opened {} (v{}, {} entries)",
            path.display(),
            directory.header.version,
            directory.entries.len()
        );

        let source = MmapArchiveSource::new(archive_dir);
        let root = VfsPath::new(VpkVfs::new(source, dir_file_name, directory));
        Ok(Self {
            path: path.to_owned(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the archive contains `internal_path`. Never reads file data.
    pub fn contains(&self, internal_path: &str) -> bool {
        let normalized = vpk::normalize_path(internal_path);
        self.root
            .join(&normalized)
            .and_then(|p| p.exists())
            .unwrap_or(false)
    }

    /// Read a file's contents.
    pub fn read(&self, internal_path: &str) -> Result<Vec<u8>, VpkError> {
        let normalized = vpk::normalize_path(internal_path);
        let mut file = self
            .root
            .join(&normalized)
            .and_then(|p| p.open_file())
            .map_err(|_| VpkError::FileNotFound(normalized.clone()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Copy one file into `out_dir`, mirroring its archive directory structure.
    pub fn extract_to(&self, internal_path: &str, out_dir: &Path) -> BuildResult<PathBuf> {
        let normalized = vpk::normalize_path(internal_path);
        let data = self.read(&normalized)?;
        let dest = out_dir.join(&normalized);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        std::fs::write(&dest, data).at(&dest)?;
        Ok(dest)
    }
}

/// Test for an internal path without extracting anything.
pub fn path_exists<P: AsRef<Path>>(archive_path: P, internal_path: &str) -> Result<bool, VpkError> {
    Ok(GameArchive::open(archive_path)?.contains(internal_path))
}

/// Return the first candidate present in the archive.
pub fn probe_candidates<'a>(archive: &GameArchive, candidates: &'a [String]) -> Option<&'a str> {
    candidates.iter().map(String::as_str).find(|candidate| {
        let found = archive.contains(candidate);
        debug!("probe {candidate}: {}", if found { "hit" } else { "miss" });
        found
    })
}

/// Extract a model binary and its companion files into `out_dir`.
///
/// The model path must already be known to exist. Missing companions are logged; a
/// missing physics file is expected for many models and only noted at debug level.
pub fn extract_file_set(
    archive: &GameArchive,
    model_internal_path: &str,
    out_dir: &Path,
) -> BuildResult<Vec<PathBuf>> {
    let model_path = vpk::normalize_path(model_internal_path);
    let stem = model_path.strip_suffix(".mdl").ok_or_else(|| {
        BuildError::Extraction(format!("{model_internal_path} is not a .mdl path"))
    })?;

    let mut extracted = vec![archive.extract_to(&model_path, out_dir)?];

    for suffix in MODEL_COMPANIONS {
        let companion = format!("{stem}{suffix}");
        if archive.contains(&companion) {
            extracted.push(archive.extract_to(&companion, out_dir)?);
        } else {
            warn!("companion file {companion} not found in {}", archive.path().display());
        }
    }

    let physics = format!("{stem}{PHYSICS_COMPANION}");
    if archive.contains(&physics) {
        extracted.push(archive.extract_to(&physics, out_dir)?);
    } else {
        debug!("no physics model for {model_path}");
    }

    let expected = out_dir.join(&model_path);
    if !expected.is_file() {
        let file_name = model_path.rsplit('/').next().unwrap_or(&model_path);
        match find_file_recursive(out_dir, file_name) {
            Some(found) => {
                warn!(
                    "model binary not at {}, using {}",
                    expected.display(),
                    found.display()
                );
                extracted[0] = found;
            }
            None => {
                return Err(BuildError::Extraction(format!(
                    "model binary {file_name} missing from {} after extraction",
                    out_dir.display()
                )));
            }
        }
    }

    info!("extracted {} files for {model_path}", extracted.len());
    Ok(extracted)
}

/// Archive locations a material descriptor may live at, given a `$cdmaterials` path.
pub fn material_descriptor_candidates(material_search_path: &str, name: &str) -> Vec<String> {
    let dir = vpk::normalize_path(material_search_path);
    let dir = dir.strip_prefix("materials/").unwrap_or(&dir);
    let relative = if dir.is_empty() || dir == "materials" {
        format!("{name}.vmt")
    } else {
        format!("{dir}/{name}.vmt")
    };
    vec![format!("materials/{relative}"), relative]
}

/// Best-effort extraction of the original material descriptor.
///
/// Returns `None` when the descriptor is absent or unreadable; this is an enrichment,
/// never a reason to fail a build.
pub fn extract_material_descriptor(
    archive: &GameArchive,
    material_search_path: &str,
    name: &str,
    out_dir: &Path,
) -> Option<PathBuf> {
    for candidate in material_descriptor_candidates(material_search_path, name) {
        if !archive.contains(&candidate) {
            continue;
        }
        match archive.read(&candidate) {
            Ok(data) => {
                let dest = out_dir.join(format!("{name}.vmt"));
                let written = std::fs::create_dir_all(out_dir).and_then(|_| std::fs::write(&dest, data));
                match written {
                    Ok(()) => {
                        info!("extracted original material {candidate}");
                        return Some(dest);
                    }
                    Err(e) => warn!("could not write {}: {e}", dest.display()),
                }
            }
            Err(e) => warn!("could not read {candidate}: {e}"),
        }
    }
    None
}

/// Case-insensitive search for a file name below `dir`.
pub(crate) fn find_file_recursive(dir: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.eq_ignore_ascii_case(file_name))
        })
        .map(|entry| entry.into_path())
}
