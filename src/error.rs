use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::data::vpk::VpkError;
use crate::models::qc::QcError;
use crate::models::smd::SmdError;

/// Captured result of running one of the external tools.
///
/// Both streams are kept verbatim so that the tool's own diagnostic reaches the user.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub program: String,
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Both streams joined, for pattern checks over the whole diagnostic.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => writeln!(f, "{} exited with code {code}", self.program)?,
            None => writeln!(f, "{} was terminated by a signal", self.program)?,
        }
        if !self.stdout.trim().is_empty() {
            writeln!(f, "--- stdout ---")?;
            writeln!(f, "{}", self.stdout.trim_end())?;
        }
        if !self.stderr.trim().is_empty() {
            writeln!(f, "--- stderr ---")?;
            writeln!(f, "{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Invalid build request: {0}")]
    Validation(String),
    #[error("{what} not found at expected path: {}", .path.display())]
    ToolNotFound { what: &'static str, path: PathBuf },
    #[error("No model found for '{weapon}'. Paths tried:\n  {}", .tried.join("\n  "))]
    ModelNotFound { weapon: String, tried: Vec<String> },
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("Archive error: {0}")]
    Archive(#[from] VpkError),
    #[error("Decompilation failed\n{0}")]
    Decompilation(ToolOutput),
    #[error("Decompiler produced no .qc file in {}", .dir.display())]
    DecompiledQcMissing { dir: PathBuf },
    #[error("Malformed model description: {0}")]
    Patch(#[from] QcError),
    #[error("Geometry replacement failed: {0}")]
    GeometryReplacement(#[from] SmdError),
    #[error("Texture build failed: {0}")]
    TextureBuild(String),
    #[error("Texture compiler failed\n{0}")]
    TextureTool(ToolOutput),
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("Material descriptor error: {0}")]
    Material(String),
    #[error("Model compilation failed\n{0}")]
    Compilation(ToolOutput),
    #[error(
        "Model compiler output path is too long ({}). Choose a shorter file name or move the game installation.\n{output}",
        .path.display()
    )]
    OutputPathTooLong { path: PathBuf, output: ToolOutput },
    #[error("Compiled model artifacts for '{basename}' not found in {}", .dir.display())]
    CompiledArtifactsMissing { basename: String, dir: PathBuf },
    #[error("Packaging failed\n{0}")]
    Packaging(ToolOutput),
    #[error("Archiver finished but {} was not produced", .path.display())]
    PackageMissing { path: PathBuf },
    #[error("A build is already in progress")]
    BuildInProgress,
    #[error("Build cancelled")]
    Cancelled,
    #[error("Failed to run {program}: {err}")]
    Spawn {
        program: String,
        #[source]
        err: std::io::Error,
    },
    #[error("I/O error at {}: {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            err,
        }
    }

    /// True for the kinds that are rejected before anything touches the filesystem.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            BuildError::Validation(_) | BuildError::ToolNotFound { .. } | BuildError::BuildInProgress
        )
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

/// A failed build as presented to the user.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: BuildError,
    /// Set when the temporary build directory was preserved for inspection.
    pub kept_temp_dir: Option<PathBuf>,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(dir) = &self.kept_temp_dir {
            write!(f, "\nTemporary files were kept in {}", dir.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Attach a path to an I/O error.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> BuildResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> BuildResult<T> {
        self.map_err(|err| BuildError::io(path, err))
    }
}
