//! The build pipeline: image in, installable archive out.
//!
//! A weapon build walks
//! `Validating -> Extracting -> Decompiling -> [GeometryReplacing] -> Patching ->
//! TextureBuilding -> MaterialBuilding -> Compiling -> Collecting -> Packaging -> Cleanup`.
//! A special-effect build skips the model work and goes straight from validation to
//! `TextureOnly` and then packaging.
//!
//! Everything between validation and packaging writes only inside the build's
//! [`BuildContext`]. Validation and tool resolution never touch the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bon::Builder;
use tracing::{debug, error, info, warn};

use crate::build::context::{BuildContext, DebugStage, copy_dir_recursive};
use crate::build::resolver::{self, ResolvedGame};
use crate::catalog::{BuildTarget, PlayerClass, SpecialEffect, candidate_model_paths, is_valid_weapon_key};
use crate::data::extract::{GameArchive, extract_file_set, probe_candidates};
use crate::error::{BuildError, BuildFailure, BuildResult, IoResultExt};
use crate::export::package;
use crate::export::texture::{TextureFlag, TextureFormat, TextureOptions, build_texture, resize_and_export};
use crate::export::vmt::{
    MaterialSource, VmtCache, build_from_cdmaterials, derive_texture_reference_path,
    effect_material_search_path, produce_descriptor,
};
use crate::models::qc::{self, QcDocument, QcError};
use crate::models::smd::{find_reference_geometry, merge_geometry, write_uv_preview};
use crate::models::studiomdl;
use crate::paths::ApplicationPaths;
use crate::settings::PipelineSettings;

/// Pipeline states, in the order a weapon build visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Validating,
    TextureOnly,
    Extracting,
    Decompiling,
    GeometryReplacing,
    Patching,
    TextureBuilding,
    MaterialBuilding,
    Compiling,
    Collecting,
    Packaging,
    Cleanup,
    Done,
}

impl Stage {
    /// Progress shown when the stage starts. Never decreases along either path.
    pub fn percent(self) -> u8 {
        match self {
            Stage::Validating => 0,
            Stage::TextureOnly => 20,
            Stage::Extracting => 10,
            Stage::Decompiling => 20,
            Stage::GeometryReplacing => 30,
            Stage::Patching => 40,
            Stage::TextureBuilding => 50,
            Stage::MaterialBuilding => 60,
            Stage::Compiling => 70,
            Stage::Collecting => 80,
            Stage::Packaging => 90,
            Stage::Cleanup => 95,
            Stage::Done => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "Validating",
            Stage::TextureOnly => "Building texture",
            Stage::Extracting => "Extracting model",
            Stage::Decompiling => "Decompiling model",
            Stage::GeometryReplacing => "Replacing geometry",
            Stage::Patching => "Patching model description",
            Stage::TextureBuilding => "Building texture",
            Stage::MaterialBuilding => "Building material",
            Stage::Compiling => "Compiling model",
            Stage::Collecting => "Collecting compiled files",
            Stage::Packaging => "Packaging",
            Stage::Cleanup => "Cleaning up",
            Stage::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Receives progress while a build runs.
pub trait ProgressSink {
    fn stage(&self, stage: Stage);

    fn log(&self, _message: &str) {}
}

/// Progress reported through `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn stage(&self, stage: Stage) {
        info!("[{:>3}%] {stage}", stage.percent());
    }

    fn log(&self, message: &str) {
        info!("{message}");
    }
}

/// Asks someone for a replacement geometry file mid-build.
///
/// Returning `None` means no replacement; the build continues with the original mesh.
pub trait GeometryPrompt {
    fn request_geometry(&self, weapon_key: &str) -> Option<PathBuf>;
}

/// Everything a single build needs from its caller.
#[derive(Debug, Clone, Builder)]
pub struct BuildRequest {
    /// Source image in any format the image decoder understands.
    #[builder(into)]
    pub image: PathBuf,
    pub target: BuildTarget,
    #[builder(default = (512, 512))]
    pub resolution: (u32, u32),
    #[builder(default = TextureFormat::Dxt5)]
    pub format: TextureFormat,
    #[builder(default)]
    pub flags: Vec<TextureFlag>,
    #[builder(default)]
    pub options: TextureOptions,
    /// Name of the archive written to the export directory. Must end in `.vpk`.
    #[builder(into)]
    pub file_name: String,
    /// Game installation root. Required for weapon builds.
    #[builder(into)]
    pub game_root: Option<PathBuf>,
    #[builder(default)]
    pub keep_temp_on_error: bool,
    /// Keep the whole build directory and write per-stage snapshots.
    #[builder(default)]
    pub debug_mode: bool,
    #[builder(default)]
    pub geometry_replacement: bool,
    /// Replacement chosen up front. When unset and replacement is enabled, the prompt is asked.
    #[builder(into)]
    pub replacement_geometry: Option<PathBuf>,
    #[builder(default)]
    pub uv_preview: bool,
    /// Use the minimal lit descriptor instead of the full weapon template as the fallback.
    #[builder(default)]
    pub minimal_material: bool,
}

/// A finished build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub archive: PathBuf,
    pub texture_name: String,
    /// In-archive model path the build was based on. `None` for special effects.
    pub model_path: Option<String>,
    pub material_source: MaterialSource,
    pub uv_preview: Option<PathBuf>,
    /// Whether an edited descriptor was used and removed from the cache.
    pub consumed_edited: bool,
    pub kept_temp_dir: Option<PathBuf>,
}

/// Reject a request before anything touches the filesystem.
pub fn validate(request: &BuildRequest) -> BuildResult<()> {
    if !request.image.is_file() {
        return Err(BuildError::Validation(format!(
            "image {} does not exist",
            request.image.display()
        )));
    }
    let (width, height) = request.resolution;
    if width == 0 || height == 0 {
        return Err(BuildError::Validation(format!(
            "texture size must be positive, got {width}x{height}"
        )));
    }

    let file_name = request.file_name.as_str();
    let extension = format!(".{}", package::ARCHIVE_EXTENSION);
    let stem_len = file_name.len().saturating_sub(extension.len());
    if !file_name.to_ascii_lowercase().ends_with(&extension) || stem_len == 0 {
        return Err(BuildError::Validation(format!(
            "output file name '{file_name}' must end in {extension}"
        )));
    }
    if file_name.contains(['/', '\\']) {
        return Err(BuildError::Validation(format!(
            "output file name '{file_name}' must not contain a directory"
        )));
    }

    if let BuildTarget::Weapon { weapon_key, .. } = &request.target {
        if !is_valid_weapon_key(weapon_key) {
            return Err(BuildError::Validation(format!(
                "weapon key '{weapon_key}' may only contain letters, digits and '_'"
            )));
        }
        if request.game_root.is_none() {
            return Err(BuildError::Validation(
                "a game installation directory is required for weapon builds".to_string(),
            ));
        }
    }
    Ok(())
}

/// Tools and game files resolved during preflight.
#[derive(Debug, Clone)]
struct Preflight {
    texture_tool: PathBuf,
    archiver: PathBuf,
    weapon: Option<WeaponPreflight>,
}

#[derive(Debug, Clone)]
struct WeaponPreflight {
    decompiler: PathBuf,
    game: ResolvedGame,
    secondary_archive: Option<PathBuf>,
}

/// Runs builds against one application layout.
#[derive(Debug, Clone)]
pub struct Pipeline {
    paths: ApplicationPaths,
    settings: PipelineSettings,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(paths: ApplicationPaths, settings: PipelineSettings) -> Self {
        Self {
            paths,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Setting the token stops the build at the next stage boundary.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn paths(&self) -> &ApplicationPaths {
        &self.paths
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn preflight(&self, request: &BuildRequest) -> BuildResult<Preflight> {
        let (texture_tool, archiver) = resolver::resolve_texture_tools(&self.paths, &self.settings.tools)?;
        let weapon = match (&request.target, &request.game_root) {
            (BuildTarget::SpecialEffect(_), _) => None,
            (BuildTarget::Weapon { .. }, Some(game_root)) => Some(WeaponPreflight {
                decompiler: resolver::check_decompiler_available(&self.paths, &self.settings.tools)?,
                game: resolver::resolve(game_root, &self.settings.game)?,
                secondary_archive: resolver::resolve_secondary_archive(game_root, &self.settings.game),
            }),
            (BuildTarget::Weapon { .. }, None) => {
                return Err(BuildError::Validation(
                    "a game installation directory is required for weapon builds".to_string(),
                ));
            }
        };
        Ok(Preflight {
            texture_tool,
            archiver,
            weapon,
        })
    }

    /// Run one build to completion on the calling thread.
    pub fn run(
        &self,
        request: &BuildRequest,
        progress: &dyn ProgressSink,
        prompt: Option<&dyn GeometryPrompt>,
    ) -> Result<BuildOutcome, BuildFailure> {
        let preflight_failure = |error: BuildError| BuildFailure {
            error,
            kept_temp_dir: None,
        };

        progress.stage(Stage::Validating);
        validate(request).map_err(preflight_failure)?;
        let tools = self.preflight(request).map_err(preflight_failure)?;
        self.check_cancelled().map_err(preflight_failure)?;

        let ctx = BuildContext::create(&request.target, &self.paths.temp_dir, request.debug_mode)
            .map_err(preflight_failure)?;
        info!("build {} started for {}", ctx.build_id, request.target);

        let cache = VmtCache::new(&self.paths);
        let run = BuildRun {
            pipeline: self,
            request,
            tools: &tools,
            ctx: &ctx,
            cache: &cache,
            progress,
            prompt,
        };

        let result = run.execute();
        // Extracted originals are per-build scratch, whatever the outcome.
        let swept = cache.clear_extracted();
        debug!("cleared {swept} extracted descriptors");

        match result {
            Ok(mut outcome) => {
                progress.stage(Stage::Cleanup);
                if outcome.material_source == MaterialSource::Edited {
                    match cache.consume(&outcome.texture_name) {
                        Ok(consumed) => outcome.consumed_edited = consumed,
                        Err(e) => warn!("could not remove used edited descriptor: {e}"),
                    }
                }
                let kept = ctx.cleanup(false, request.keep_temp_on_error, request.debug_mode);
                outcome.kept_temp_dir = kept.then(|| ctx.root.clone());
                progress.stage(Stage::Done);
                info!("build {} finished: {}", ctx.build_id, outcome.archive.display());
                Ok(outcome)
            }
            Err(error) => {
                if matches!(error, BuildError::Cancelled) {
                    info!("build {} cancelled", ctx.build_id);
                } else {
                    error!("build {} failed: {error}", ctx.build_id);
                }
                let kept = ctx.cleanup(true, request.keep_temp_on_error, request.debug_mode);
                Err(BuildFailure {
                    error,
                    kept_temp_dir: kept.then(|| ctx.root.clone()),
                })
            }
        }
    }

    fn check_cancelled(&self) -> BuildResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Borrowed state for the duration of one build.
struct BuildRun<'a> {
    pipeline: &'a Pipeline,
    request: &'a BuildRequest,
    tools: &'a Preflight,
    ctx: &'a BuildContext,
    cache: &'a VmtCache,
    progress: &'a dyn ProgressSink,
    prompt: Option<&'a dyn GeometryPrompt>,
}

/// What the target-specific stages leave for packaging.
struct Staged {
    texture_name: String,
    model_path: Option<String>,
    material_source: MaterialSource,
    uv_preview: Option<PathBuf>,
}

impl BuildRun<'_> {
    fn enter(&self, stage: Stage) -> BuildResult<()> {
        self.pipeline.check_cancelled()?;
        self.progress.stage(stage);
        Ok(())
    }

    fn logs(&self) -> Option<&Path> {
        Some(&self.ctx.logs_dir)
    }

    fn execute(&self) -> BuildResult<BuildOutcome> {
        let staged = match &self.request.target {
            BuildTarget::SpecialEffect(effect) => self.stage_special_effect(*effect)?,
            BuildTarget::Weapon { class, weapon_key } => self.stage_weapon(*class, weapon_key)?,
        };

        self.enter(Stage::Packaging)?;
        let archive = package::pack(
            &self.ctx.pack_root,
            &self.tools.archiver,
            &self.pipeline.paths.export_dir,
            &self.request.file_name,
            self.logs(),
        )?;

        Ok(BuildOutcome {
            archive,
            texture_name: staged.texture_name,
            model_path: staged.model_path,
            material_source: staged.material_source,
            uv_preview: staged.uv_preview,
            consumed_edited: false,
            kept_temp_dir: None,
        })
    }

    /// Resize the source image and convert it into `<pack>/materials/<reference dir>/`.
    fn build_texture_for(&self, texture_reference: &str, texture_name: &str) -> BuildResult<PathBuf> {
        let png = self.ctx.texture_dir.join(format!("{texture_name}.png"));
        resize_and_export(&self.request.image, &png, self.request.resolution)?;

        let vtf_path = self.material_file(texture_reference, "vtf");
        let out_dir = vtf_path.parent().unwrap_or(&self.ctx.pack_root);
        build_texture(
            &png,
            out_dir,
            self.request.format,
            &self.request.flags,
            &self.request.options,
            &self.tools.texture_tool,
            self.logs(),
        )
    }

    fn material_file(&self, texture_reference: &str, extension: &str) -> PathBuf {
        self.ctx
            .pack_root
            .join("materials")
            .join(format!("{texture_reference}.{extension}"))
    }

    fn stage_special_effect(&self, effect: SpecialEffect) -> BuildResult<Staged> {
        self.enter(Stage::TextureOnly)?;
        let texture_name = effect.texture_name();
        let search_path = effect_material_search_path(effect);
        let reference = derive_texture_reference_path(&search_path, texture_name);

        self.build_texture_for(&reference, texture_name)?;
        let material_source = produce_descriptor(
            &self.material_file(&reference, "vmt"),
            self.cache,
            None,
            &self.request.target,
            &search_path,
            texture_name,
        )?;

        let assets = self.pipeline.paths.effects_assets_dir().join(effect.name());
        for companion in effect.companions() {
            let source = assets.join(companion);
            if !source.is_file() {
                debug!("no {companion} for {}", effect.name());
                continue;
            }
            let dest = self.ctx.pack_root.join(companion);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            std::fs::copy(&source, &dest).at(&dest)?;
            debug!("copied effect companion {companion}");
        }

        Ok(Staged {
            texture_name: texture_name.to_string(),
            model_path: None,
            material_source,
            uv_preview: None,
        })
    }

    fn stage_weapon(&self, class: PlayerClass, weapon_key: &str) -> BuildResult<Staged> {
        let weapon = self.tools.weapon.as_ref().ok_or_else(|| {
            BuildError::Validation("a game installation directory is required for weapon builds".to_string())
        })?;
        let settings = &self.pipeline.settings;

        // Probe every candidate before extracting anything.
        self.enter(Stage::Extracting)?;
        let primary = GameArchive::open(&weapon.game.primary_archive)?;
        let candidates = candidate_model_paths(class, weapon_key);
        let model_path = probe_candidates(&primary, &candidates)
            .ok_or_else(|| BuildError::ModelNotFound {
                weapon: weapon_key.to_string(),
                tried: candidates.clone(),
            })?
            .to_string();
        info!("using model {model_path}");
        self.progress.log(&format!("Found model {model_path}"));

        let extracted = extract_file_set(&primary, &model_path, &self.ctx.extract_dir)?;
        let model_file = extracted
            .first()
            .cloned()
            .ok_or_else(|| BuildError::Extraction(format!("nothing extracted for {model_path}")))?;
        self.ctx.snapshot(DebugStage::Extracted, &self.ctx.extract_dir);

        self.enter(Stage::Decompiling)?;
        let qc_path = studiomdl::decompile(&model_file, &self.ctx.decompile_dir, &weapon.decompiler, self.logs())?;
        self.ctx.snapshot(DebugStage::Decompiled, &self.ctx.decompile_dir);

        let model_stem = model_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| weapon_key.to_string());

        if self.request.geometry_replacement {
            self.enter(Stage::GeometryReplacing)?;
            self.replace_geometry(weapon_key, &model_stem);
        }

        self.enter(Stage::Patching)?;
        let document = QcDocument::load(&qc_path)?;
        let texture_name = document
            .canonical_texture_name(&settings.cosmetic_suffixes)
            .ok_or(QcError::MissingDirective("$texturegroup"))?
            .to_string();
        // Only empty `$cdmaterials` is accepted; patching rejects a model with none at all.
        let original_search_path = document.material_search_path().unwrap_or_default().to_string();
        let model_name = document
            .output_model_path()
            .ok_or(QcError::MissingDirective("$modelname"))?
            .to_string();

        let removed = qc::remove_lod_files(&self.ctx.decompile_dir)?;
        let summary = qc::patch_description(&qc_path, &settings.cdmaterials_prefix)?;
        self.progress.log(&format!(
            "Removed {} LOD blocks and {} LOD files, prefixed {} material paths",
            summary.lod_blocks_removed,
            removed.len(),
            summary.material_paths_rewritten
        ));
        let patched_search_path = qc::extract_material_search_path(&qc_path)?.unwrap_or_default();
        self.ctx.snapshot(DebugStage::Patched, &self.ctx.decompile_dir);

        let uv_preview = if self.request.uv_preview {
            self.write_uv_preview(&model_stem, weapon_key, &texture_name)
        } else {
            None
        };

        self.enter(Stage::TextureBuilding)?;
        let reference = derive_texture_reference_path(&patched_search_path, &texture_name);
        self.build_texture_for(&reference, &texture_name)?;

        self.enter(Stage::MaterialBuilding)?;
        let secondary = weapon
            .secondary_archive
            .as_ref()
            .and_then(|path| match GameArchive::open(path) {
                Ok(archive) => Some(archive),
                Err(e) => {
                    warn!("could not open {}: {e}", path.display());
                    None
                }
            });
        let mut archives = vec![&primary];
        archives.extend(secondary.as_ref());
        let original = self
            .cache
            .export_original(&archives, &original_search_path, &[texture_name.as_str(), weapon_key]);
        match &original {
            Some(path) => debug!("original descriptor: {}", path.display()),
            None => debug!("no original descriptor for {texture_name}"),
        }

        let vmt_path = self.material_file(&reference, "vmt");
        let material_source = if self.request.minimal_material
            && original.is_none()
            && self.cache.edited(&texture_name).is_none()
        {
            build_from_cdmaterials(&vmt_path, &patched_search_path, &texture_name)?;
            MaterialSource::Template
        } else {
            produce_descriptor(
                &vmt_path,
                self.cache,
                original.as_deref(),
                &self.request.target,
                &patched_search_path,
                &texture_name,
            )?
        };

        self.enter(Stage::Compiling)?;
        let compiled = studiomdl::compile(
            &qc_path,
            &self.ctx.compile_dir,
            &weapon.game.compiler,
            &weapon.game.game_dir,
            &model_name,
            self.logs(),
        )?;
        debug!("compiled {} files", compiled.len());

        self.enter(Stage::Collecting)?;
        let copied = copy_dir_recursive(&self.ctx.compile_dir, &self.ctx.pack_root)?;
        debug!("staged {copied} compiled files");
        self.ctx.snapshot(DebugStage::Compiled, &self.ctx.compile_dir);

        Ok(Staged {
            texture_name,
            model_path: Some(model_path),
            material_source,
            uv_preview,
        })
    }

    /// Merge user geometry into the decompiled reference mesh. Failures leave the original.
    fn replace_geometry(&self, weapon_key: &str, model_stem: &str) {
        let user = self.request.replacement_geometry.clone().or_else(|| {
            self.progress.log("Waiting for replacement geometry");
            self.prompt.and_then(|prompt| prompt.request_geometry(weapon_key))
        });
        let Some(user) = user else {
            info!("no replacement geometry selected");
            return;
        };

        let reference = find_reference_geometry(&self.ctx.decompile_dir, model_stem)
            .or_else(|| find_reference_geometry(&self.ctx.decompile_dir, weapon_key));
        let Some(reference) = reference else {
            warn!("no reference geometry for {model_stem}, skipping replacement");
            self.progress.log("Geometry replacement skipped: reference mesh not found");
            return;
        };

        match merge_geometry(&user, &reference, &reference) {
            Ok(()) => {
                info!("replaced geometry in {}", reference.display());
                self.progress.log("Geometry replaced");
            }
            Err(e) => {
                let error = BuildError::GeometryReplacement(e);
                warn!("{error}; keeping the original geometry");
                self.progress.log(&format!("{error}; keeping the original geometry"));
            }
        }
    }

    fn write_uv_preview(&self, model_stem: &str, weapon_key: &str, texture_name: &str) -> Option<PathBuf> {
        let reference = find_reference_geometry(&self.ctx.decompile_dir, model_stem)
            .or_else(|| find_reference_geometry(&self.ctx.decompile_dir, weapon_key))?;
        let export_dir = &self.pipeline.paths.export_dir;
        if let Err(e) = std::fs::create_dir_all(export_dir) {
            warn!("could not create {}: {e}", export_dir.display());
            return None;
        }
        let output = export_dir.join(format!("{texture_name}_uv.png"));
        let (width, height) = self.request.resolution;
        match write_uv_preview(&reference, &output, width, height) {
            Ok(()) => Some(output),
            Err(e) => {
                warn!("could not write UV preview: {e}");
                None
            }
        }
    }
}
