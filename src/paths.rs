//! Filesystem roots the application resolves its resources against.
//!
//! Every component that needs a bundled tool, a template asset, or persisted user data
//! receives an [`ApplicationPaths`] instead of relying on the process working directory.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ApplicationPaths {
    /// Installation root of the application.
    pub root: PathBuf,
    /// Bundled third-party executables (decompiler, texture tool, archiver).
    pub tools_dir: PathBuf,
    /// Read-only assets shipped with the application (effect companion files).
    pub assets_dir: PathBuf,
    /// Persisted user data (edited material descriptors and their backups).
    pub data_dir: PathBuf,
    /// Parent of the per-build temporary directories.
    pub temp_dir: PathBuf,
    /// Where finished archives are written.
    pub export_dir: PathBuf,
}

impl ApplicationPaths {
    /// Conventional layout below a single installation root.
    pub fn from_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_owned();
        Self {
            tools_dir: root.join("tools"),
            assets_dir: root.join("assets"),
            data_dir: root.join("data"),
            temp_dir: root.join("temp"),
            export_dir: root.join("export"),
            root,
        }
    }

    /// Same layout, but with finished archives written to `export_dir`.
    pub fn with_export_dir<P: AsRef<Path>>(mut self, export_dir: P) -> Self {
        self.export_dir = export_dir.as_ref().to_owned();
        self
    }

    /// User-edited material descriptors, one `<texture>.vmt` per texture name.
    pub fn edited_vmt_dir(&self) -> PathBuf {
        self.data_dir.join("edited_vmts")
    }

    /// Copies of descriptors taken before the user edited them.
    pub fn vmt_backup_dir(&self) -> PathBuf {
        self.data_dir.join("vmt_backups")
    }

    /// Scratch area for original descriptors pulled out of the game archives.
    pub fn extracted_vmt_dir(&self) -> PathBuf {
        self.data_dir.join("extracted_vmts")
    }

    /// Companion files for special-effect builds, one sub-directory per effect.
    pub fn effects_assets_dir(&self) -> PathBuf {
        self.assets_dir.join("effects")
    }

    /// Resolve a tool path from the settings against the tools directory.
    pub fn tool<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            relative.to_owned()
        } else {
            self.tools_dir.join(relative)
        }
    }
}
