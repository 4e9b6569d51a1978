//! Per-build scratch directory tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::BuildTarget;
use crate::error::{BuildResult, IoResultExt};

/// Name of the packaging root. The archiver names its output after it.
pub const PACK_ROOT_NAME: &str = "pack";

/// Stages whose output is copied aside when debug mode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugStage {
    Extracted,
    Decompiled,
    Patched,
    Compiled,
}

impl DebugStage {
    pub const ALL: &[DebugStage] = &[
        Self::Extracted,
        Self::Decompiled,
        Self::Patched,
        Self::Compiled,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Extracted => "1_extracted",
            Self::Decompiled => "2_decompiled",
            Self::Patched => "3_patched",
            Self::Compiled => "4_compiled",
        }
    }
}

static LAST_BUILD_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing millisecond timestamp, unique within this process.
fn monotonic_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let mut last = LAST_BUILD_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_BUILD_MILLIS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Keep a build id a single path component whatever the target name holds.
fn dir_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Scratch directories owned by a single build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_id: String,
    pub root: PathBuf,
    pub extract_dir: PathBuf,
    pub decompile_dir: PathBuf,
    pub compile_dir: PathBuf,
    /// Normalised source image before texture conversion.
    pub texture_dir: PathBuf,
    pub pack_root: PathBuf,
    pub logs_dir: PathBuf,
    /// Present only in debug mode.
    pub debug_dir: Option<PathBuf>,
}

impl BuildContext {
    /// Allocate a uniquely named directory under `base_temp_dir` and create every
    /// subdirectory up front.
    pub fn create(target: &BuildTarget, base_temp_dir: &Path, debug_mode: bool) -> BuildResult<Self> {
        let build_id = format!("build_{}_{}", monotonic_millis(), dir_safe(&target.mode()));
        let root = base_temp_dir.join(&build_id);

        let ctx = Self {
            extract_dir: root.join("extract"),
            decompile_dir: root.join("decompile"),
            compile_dir: root.join("compile"),
            texture_dir: root.join("texture"),
            pack_root: root.join(PACK_ROOT_NAME),
            logs_dir: root.join("logs"),
            debug_dir: debug_mode.then(|| root.join("debug")),
            build_id,
            root,
        };

        for dir in [
            &ctx.extract_dir,
            &ctx.decompile_dir,
            &ctx.compile_dir,
            &ctx.texture_dir,
            &ctx.pack_root,
            &ctx.logs_dir,
        ] {
            std::fs::create_dir_all(dir).at(dir)?;
        }
        if let Some(debug_dir) = &ctx.debug_dir {
            for stage in DebugStage::ALL {
                let dir = debug_dir.join(stage.dir_name());
                std::fs::create_dir_all(&dir).at(&dir)?;
            }
        }

        debug!("created build directory {}", ctx.root.display());
        Ok(ctx)
    }

    pub fn debug_stage_dir(&self, stage: DebugStage) -> Option<PathBuf> {
        self.debug_dir.as_ref().map(|dir| dir.join(stage.dir_name()))
    }

    /// Copy `source` into the stage's snapshot directory. No-op outside debug mode.
    ///
    /// Snapshot failures are logged; they never fail the build.
    pub fn snapshot(&self, stage: DebugStage, source: &Path) {
        let Some(dest) = self.debug_stage_dir(stage) else {
            return;
        };
        match copy_dir_recursive(source, &dest) {
            Ok(count) => debug!("snapshot {}: {count} files", stage.dir_name()),
            Err(e) => warn!("could not snapshot {}: {e}", stage.dir_name()),
        }
    }

    /// Remove the build directory unless it has to be kept.
    ///
    /// Kept when `debug_mode` is set, or when the build failed and `keep_on_error` is set.
    /// Returns whether the directory was kept. Deletion failures are only logged.
    pub fn cleanup(&self, on_error: bool, keep_on_error: bool, debug_mode: bool) -> bool {
        if debug_mode {
            info!("debug mode: keeping {}", self.root.display());
            return true;
        }
        if on_error && keep_on_error {
            info!("keeping {} for inspection", self.root.display());
            return true;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", self.root.display());
            }
        }
        false
    }
}

/// Copy every file under `source` into `dest`, keeping relative paths.
pub(crate) fn copy_dir_recursive(source: &Path, dest: &Path) -> BuildResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_owned).unwrap_or_else(|| source.to_owned());
            crate::error::BuildError::io(path, e.into())
        })?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).at(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            std::fs::copy(entry.path(), &target).at(&target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
