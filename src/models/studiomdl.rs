//! Running the model decompiler and compiler.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::build::tool::ToolCommand;
use crate::data::extract::find_file_recursive;
use crate::error::{BuildError, BuildResult, IoResultExt, ToolOutput};

/// Longest path the compiler can write on the host filesystem.
pub const MAX_OUTPUT_PATH_LEN: usize = 259;

static PATH_TOO_LONG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)((path|file\s*name)[^\n]{0,40}too long|exceeds[^\n]{0,20}(max_path|maximum path))")
        .unwrap()
});

/// Decompile `model_path` into `out_dir` and return the description file.
///
/// The decompiler usually names it after the model; otherwise any `.qc` under `out_dir`
/// is taken.
pub fn decompile(
    model_path: &Path,
    out_dir: &Path,
    decompiler: &Path,
    logs_dir: Option<&Path>,
) -> BuildResult<PathBuf> {
    let output = ToolCommand::new("decompiler", decompiler)
        .arg("-p")
        .arg(model_path)
        .arg("-o")
        .arg(out_dir)
        .run(logs_dir)?;
    if !output.success() {
        return Err(BuildError::Decompilation(output));
    }

    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let expected = format!("{stem}.qc");
    if let Some(qc) = find_file_recursive(out_dir, &expected) {
        debug!("decompiled description: {}", qc.display());
        return Ok(qc);
    }

    let pattern = format!("{}/**/*.qc", glob::Pattern::escape(&out_dir.to_string_lossy()));
    let options = glob::MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };
    let any_qc = glob::glob_with(&pattern, options)
        .ok()
        .and_then(|mut paths| paths.find_map(Result::ok))
        .filter(|path| path.is_file());
    match any_qc {
        Some(qc) => {
            warn!("expected {expected}, using {}", qc.display());
            Ok(qc)
        }
        None => Err(BuildError::DecompiledQcMissing {
            dir: out_dir.to_owned(),
        }),
    }
}

/// Where a `$modelname` lands: the directory (relative to `models/`) and the basename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOutputPath {
    pub relative_dir: PathBuf,
    pub basename: String,
}

impl ModelOutputPath {
    pub fn parse(model_name: &str) -> Option<Self> {
        let normalized = model_name.replace('\\', "/");
        let normalized = normalized.trim_matches('/');
        let normalized = normalized
            .strip_prefix("models/")
            .unwrap_or(normalized);
        let (dir, file) = normalized.rsplit_once('/').unwrap_or(("", normalized));
        let basename = file.strip_suffix(".mdl").unwrap_or(file);
        if basename.is_empty() {
            return None;
        }
        Some(Self {
            relative_dir: dir.split('/').filter(|part| !part.is_empty()).collect(),
            basename: basename.to_string(),
        })
    }

    /// Directory the compiler writes into under `game_dir`.
    pub fn source_dir(&self, game_dir: &Path) -> PathBuf {
        game_dir.join("models").join(&self.relative_dir)
    }

    pub fn model_file(&self, game_dir: &Path) -> PathBuf {
        self.source_dir(game_dir).join(format!("{}.mdl", self.basename))
    }
}

fn path_too_long(output: &ToolOutput, model_file: &Path) -> bool {
    PATH_TOO_LONG.is_match(&output.combined())
        || model_file.as_os_str().len() > MAX_OUTPUT_PATH_LEN
}

/// Compile `qc_path` and copy its artifacts into `<compile_dir>/models/...`.
///
/// `game` is either the mod directory (`-game`) or a `gameinfo.txt` (`-gameinfo`). The
/// compiler writes into the game's own tree at the `$modelname` location; only files
/// named `<basename>.*` are collected from there.
pub fn compile(
    qc_path: &Path,
    compile_dir: &Path,
    compiler: &Path,
    game: &Path,
    model_name: &str,
    logs_dir: Option<&Path>,
) -> BuildResult<Vec<PathBuf>> {
    let output_path = ModelOutputPath::parse(model_name).ok_or_else(|| {
        BuildError::Patch(crate::models::qc::QcError::MissingDirective("$modelname"))
    })?;
    let (game_flag, game_dir) = if game.is_dir() {
        ("-game", game.to_owned())
    } else {
        (
            "-gameinfo",
            game.parent().map(Path::to_owned).unwrap_or_default(),
        )
    };

    let mut command = ToolCommand::new("compiler", compiler)
        .arg(game_flag)
        .arg(game)
        .args(["-nop4", "-nopack"])
        .arg(qc_path);
    if let Some(dir) = qc_path.parent() {
        command = command.current_dir(dir);
    }
    let output = command.run(logs_dir)?;

    let model_file = output_path.model_file(&game_dir);
    if !output.success() {
        if path_too_long(&output, &model_file) {
            return Err(BuildError::OutputPathTooLong {
                path: model_file,
                output,
            });
        }
        return Err(BuildError::Compilation(output));
    }

    match collect_artifacts(&output_path, &game_dir, compile_dir) {
        Err(BuildError::CompiledArtifactsMissing { .. }) if path_too_long(&output, &model_file) => {
            Err(BuildError::OutputPathTooLong {
                path: model_file,
                output,
            })
        }
        other => other,
    }
}

/// Copy `<basename>.*` from the compiler's output directory into `compile_dir`.
///
/// Other models compiled into the same folder, including variants such as
/// `<basename>_xmas.mdl`, are left behind.
pub fn collect_artifacts(
    output_path: &ModelOutputPath,
    game_dir: &Path,
    compile_dir: &Path,
) -> BuildResult<Vec<PathBuf>> {
    let source_dir = output_path.source_dir(game_dir);
    let prefix = format!("{}.", output_path.basename.to_ascii_lowercase());
    let dest_dir = compile_dir.join("models").join(&output_path.relative_dir);

    let mut collected = Vec::new();
    if source_dir.is_dir() {
        for entry in std::fs::read_dir(&source_dir).at(&source_dir)? {
            let entry = entry.at(&source_dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.to_ascii_lowercase().starts_with(&prefix) || !entry.path().is_file() {
                continue;
            }
            std::fs::create_dir_all(&dest_dir).at(&dest_dir)?;
            let dest = dest_dir.join(&name);
            std::fs::copy(entry.path(), &dest).at(&dest)?;
            collected.push(dest);
        }
    }

    if collected.is_empty() {
        return Err(BuildError::CompiledArtifactsMissing {
            basename: output_path.basename.clone(),
            dir: source_dir,
        });
    }
    collected.sort();
    info!("collected {} compiled files for {}", collected.len(), output_path.basename);
    Ok(collected)
}
