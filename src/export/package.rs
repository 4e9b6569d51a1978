//! Packing the staging tree into the final archive.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::build::tool::ToolCommand;
use crate::error::{BuildError, BuildResult, IoResultExt};

pub const ARCHIVE_EXTENSION: &str = "vpk";

/// The archiver writes `<dir name>.vpk` next to the directory it packs.
pub fn expected_archive_path(pack_root: &Path) -> Option<PathBuf> {
    let name = pack_root.file_name()?.to_string_lossy();
    let parent = pack_root.parent()?;
    Some(parent.join(format!("{name}.{ARCHIVE_EXTENSION}")))
}

/// Move a file, falling back to copy and delete across filesystems. Overwrites `dest`.
pub(crate) fn move_file(source: &Path, dest: &Path) -> BuildResult<()> {
    if dest.exists() {
        std::fs::remove_file(dest).at(dest)?;
    }
    if std::fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    debug!("rename failed, copying {} to {}", source.display(), dest.display());
    std::fs::copy(source, dest).at(dest)?;
    std::fs::remove_file(source).at(source)
}

/// Pack `pack_root` and move the result to `<export_dir>/<file_name>`.
pub fn pack(
    pack_root: &Path,
    archiver: &Path,
    export_dir: &Path,
    file_name: &str,
    logs_dir: Option<&Path>,
) -> BuildResult<PathBuf> {
    let produced = expected_archive_path(pack_root).ok_or_else(|| {
        BuildError::Validation(format!("cannot pack {}", pack_root.display()))
    })?;
    if produced.exists() {
        std::fs::remove_file(&produced).at(&produced)?;
    }

    let mut command = ToolCommand::new("archiver", archiver).arg("-v").arg(pack_root);
    if let Some(parent) = pack_root.parent() {
        command = command.current_dir(parent);
    }
    let output = command.run(logs_dir)?;
    if !output.success() {
        return Err(BuildError::Packaging(output));
    }
    if !produced.is_file() {
        return Err(BuildError::PackageMissing { path: produced });
    }

    std::fs::create_dir_all(export_dir).at(export_dir)?;
    let dest = export_dir.join(file_name);
    move_file(&produced, &dest)?;
    info!("wrote {}", dest.display());
    Ok(dest)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn archive_named_after_directory() {
        assert_eq!(
            expected_archive_path(Path::new("/tmp/build_1/pack")),
            Some(PathBuf::from("/tmp/build_1/pack.vpk"))
        );
    }

    #[test]
    fn move_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.vpk");
        let dest = dir.path().join("b.vpk");
        std::fs::write(&source, "new").unwrap();
        std::fs::write(&dest, "old").unwrap();
        move_file(&source, &dest).unwrap();
        assert!(!source.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new");
    }

    #[cfg(unix)]
    #[test]
    fn missing_output_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("vpk.sh");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let pack_root = dir.path().join("pack");
        std::fs::create_dir_all(&pack_root).unwrap();

        let err = pack(&pack_root, &tool, &dir.path().join("export"), "out.vpk", None).unwrap_err();
        assert!(matches!(err, BuildError::PackageMissing { .. }));
    }
}
