use std::path::{Path, PathBuf};
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rootcause::prelude::*;
use tracing_subscriber::EnvFilter;

use tf2skin::build::batch::{BatchOptions, BatchStatus, run_batch};
use tf2skin::build::pipeline::{BuildRequest, Pipeline};
use tf2skin::build::service::{BuildEvent, BuildService};
use tf2skin::catalog::{BuildTarget, PlayerClass, candidate_model_paths, find_weapon, weapons_for};
use tf2skin::data::extract::GameArchive;
use tf2skin::export::texture::{NormalMapOptions, TextureFlag, TextureFormat, TextureOptions};
use tf2skin::export::vmt::VmtCache;
use tf2skin::paths::ApplicationPaths;
use tf2skin::settings::PipelineSettings;

/// Build weapon skins and effect textures as installable VPK archives
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application root containing tools/, assets/ and data/. Defaults to the
    /// directory of this executable.
    #[clap(long, global = true)]
    root: Option<PathBuf>,

    /// Settings file. Defaults to <root>/settings.json
    #[clap(long, global = true)]
    settings: Option<PathBuf>,

    /// Where finished archives are written. Defaults to <root>/export
    #[clap(long, global = true)]
    export_dir: Option<PathBuf>,

    /// Debug logging
    #[clap(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build one skin or effect archive
    Build {
        /// Source image
        image: PathBuf,

        /// Weapon mode (`<class>_<weapon key>`) or effect name (`critHIT`, `minicritHIT`)
        #[clap(short, long)]
        target: String,

        /// Game installation root
        #[clap(short, long)]
        game: Option<PathBuf>,

        /// Output archive name
        #[clap(short, long)]
        output: String,

        /// Texture size as WIDTHxHEIGHT
        #[clap(long, default_value = "512x512", value_parser = parse_size)]
        size: (u32, u32),

        #[clap(long, default_value = "DXT5")]
        format: TextureFormat,

        /// Texture flag, may be repeated
        #[clap(long = "flag")]
        flags: Vec<TextureFlag>,

        #[clap(long)]
        no_mipmaps: bool,

        #[clap(long)]
        no_thumbnail: bool,

        #[clap(long)]
        no_reflectivity: bool,

        /// Gamma correction value
        #[clap(long)]
        gamma: Option<f32>,

        /// Generate a normal map with default kernel settings
        #[clap(long)]
        normal_map: bool,

        /// Geometry merged into the weapon's reference mesh
        #[clap(long)]
        geometry: Option<PathBuf>,

        /// Write <texture>_uv.png next to the archive
        #[clap(long)]
        uv_preview: bool,

        /// Fall back to the minimal material instead of the full weapon template
        #[clap(long)]
        minimal_material: bool,

        /// Keep the build directory when the build fails
        #[clap(long)]
        keep_temp: bool,

        /// Keep the build directory and write per-stage snapshots
        #[clap(long)]
        debug: bool,
    },
    /// Build every weapon of a class and write a CSV report
    BatchTest {
        class: PlayerClass,

        image: PathBuf,

        #[clap(short, long)]
        game: PathBuf,

        #[clap(long)]
        geometry: Option<PathBuf>,

        /// Report path. Defaults to <export dir>/batch_<class>.csv
        #[clap(long)]
        report: Option<PathBuf>,

        #[clap(long)]
        keep_temp: bool,
    },
    /// List the weapon catalog
    Weapons { class: Option<PlayerClass> },
    /// Show which archive location a weapon model resolves to
    Probe {
        class: PlayerClass,

        weapon: String,

        #[clap(short, long)]
        game: PathBuf,
    },
    /// Manage edited material descriptors
    Materials {
        #[command(subcommand)]
        action: MaterialAction,
    },
}

#[derive(Subcommand, Debug)]
enum MaterialAction {
    /// List textures with a pending edited descriptor
    List,
    /// Save an edited descriptor for the next build of this texture
    Store { texture: String, file: PathBuf },
    /// Pull a texture's original descriptor out of the game archives
    Export {
        texture: String,

        /// `$cdmaterials` directory of the model
        search_path: String,

        #[clap(short, long)]
        game: PathBuf,
    },
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid dimension '{v}': {e}"))
    };
    Ok((parse(w)?, parse(h)?))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_root() -> Result<PathBuf, Report> {
    let exe = std::env::current_exe().context_with(|| "Failed to locate the executable".to_string())?;
    exe.parent()
        .map(Path::to_owned)
        .ok_or_else(|| rootcause::report!("Executable has no parent directory: {}", exe.display()))
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn main() -> Result<(), Report> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let root = match args.root {
        Some(root) => root,
        None => default_root()?,
    };
    let settings_path = args.settings.unwrap_or_else(|| root.join("settings.json"));
    let settings = PipelineSettings::load(&settings_path)
        .context_with(|| format!("Failed to load settings from {}", settings_path.display()))?;
    let mut paths = ApplicationPaths::from_root(&root);
    if let Some(export_dir) = args.export_dir {
        paths = paths.with_export_dir(export_dir);
    }

    match args.command {
        Command::Build {
            image,
            target,
            game,
            output,
            size,
            format,
            flags,
            no_mipmaps,
            no_thumbnail,
            no_reflectivity,
            gamma,
            normal_map,
            geometry,
            uv_preview,
            minimal_material,
            keep_temp,
            debug,
        } => {
            let Some(target) = BuildTarget::from_mode(&target) else {
                bail!("Unknown build target '{target}'");
            };
            let options = TextureOptions::builder()
                .no_mipmaps(no_mipmaps)
                .no_thumbnail(no_thumbnail)
                .no_reflectivity(no_reflectivity)
                .maybe_gamma_correction(gamma)
                .maybe_normal_map(normal_map.then(NormalMapOptions::default))
                .build();
            let request = BuildRequest::builder()
                .image(image)
                .target(target)
                .resolution(size)
                .format(format)
                .flags(flags)
                .options(options)
                .file_name(output)
                .maybe_game_root(game)
                .keep_temp_on_error(keep_temp)
                .debug_mode(debug)
                .geometry_replacement(geometry.is_some())
                .maybe_replacement_geometry(geometry)
                .uv_preview(uv_preview)
                .minimal_material(minimal_material)
                .build();
            run_build(paths, settings, request)
        }
        Command::BatchTest {
            class,
            image,
            game,
            geometry,
            report,
            keep_temp,
        } => {
            let report_path = report.unwrap_or_else(|| paths.export_dir.join(format!("batch_{class}.csv")));
            let options = BatchOptions::builder()
                .class(class)
                .image(image)
                .game_root(game)
                .maybe_replacement_geometry(geometry)
                .keep_temp_on_error(keep_temp)
                .build();
            let pipeline = Pipeline::new(paths, settings);

            let pb = progress_bar(weapons_for(class).count() as u64);
            let report = run_batch(&pipeline, &options, |record, _| {
                let status = match record.status {
                    BatchStatus::Passed => "ok",
                    BatchStatus::Failed => "FAILED",
                };
                pb.println(format!("{:02} {:<32} {status}", record.ordinal, record.weapon));
                pb.inc(1);
            })?;
            pb.finish_and_clear();

            if let Some(parent) = report_path.parent() {
                std::fs::create_dir_all(parent)
                    .context_with(|| format!("Failed to create {}", parent.display()))?;
            }
            report.write_csv(&report_path)?;
            println!(
                "{} passed, {} failed. Report: {}",
                report.passed(),
                report.failed(),
                report_path.display()
            );
            if report.failed() > 0 {
                bail!("{} of {} weapons failed", report.failed(), report.records.len());
            }
            Ok(())
        }
        Command::Weapons { class } => {
            let classes = match class {
                Some(class) => vec![class],
                None => PlayerClass::ALL.to_vec(),
            };
            for class in classes {
                println!("{class}");
                for (slot, entries) in &weapons_for(class).chunk_by(|(slot, _)| *slot) {
                    let names = entries
                        .map(|(_, weapon)| format!("{} ({})", weapon.key, weapon.display_name("en")))
                        .join(", ");
                    println!("  {slot}: {names}");
                }
            }
            Ok(())
        }
        Command::Probe { class, weapon, game } => {
            if find_weapon(class, &weapon).is_none() {
                println!("note: {weapon} is not in the {class} catalog");
            }
            let archive_path = game.join(&settings.game.primary_archive);
            let archive = GameArchive::open(&archive_path)
                .context_with(|| format!("Failed to open {}", archive_path.display()))?;
            let mut resolved = None;
            for candidate in candidate_model_paths(class, &weapon) {
                let found = archive.contains(&candidate);
                println!("{} {candidate}", if found { "hit " } else { "miss" });
                if found && resolved.is_none() {
                    resolved = Some(candidate);
                }
            }
            match resolved {
                Some(path) => {
                    println!("resolves to {path}");
                    Ok(())
                }
                None => bail!("No model found for {weapon}"),
            }
        }
        Command::Materials { action } => run_materials(&paths, &settings, action),
    }
}

fn run_build(paths: ApplicationPaths, settings: PipelineSettings, request: BuildRequest) -> Result<(), Report> {
    let service = BuildService::new(Pipeline::new(paths, settings));
    let (events, rx) = mpsc::channel();
    let handle = service.start(request, events)?;

    let pb = progress_bar(100);
    let mut finished = None;
    for event in rx {
        match event {
            BuildEvent::Stage { stage, percent } => {
                pb.set_position(u64::from(percent));
                pb.set_message(stage.to_string());
            }
            BuildEvent::Log(line) => pb.println(line),
            BuildEvent::GeometryRequested { weapon_key, reply } => {
                pb.println(format!("no replacement geometry given for {weapon_key}"));
                reply.send(None);
            }
            BuildEvent::Finished(result) => finished = Some(result),
        }
    }
    if !handle.join() {
        bail!("Build worker panicked");
    }

    match finished {
        Some(Ok(outcome)) => {
            pb.finish_and_clear();
            println!("Wrote {}", outcome.archive.display());
            if let Some(preview) = outcome.uv_preview {
                println!("UV layout: {}", preview.display());
            }
            if let Some(kept) = outcome.kept_temp_dir {
                println!("Build files kept in {}", kept.display());
            }
            Ok(())
        }
        Some(Err(failure)) => {
            pb.abandon();
            bail!("{failure}")
        }
        None => bail!("Build was cancelled"),
    }
}

fn run_materials(paths: &ApplicationPaths, settings: &PipelineSettings, action: MaterialAction) -> Result<(), Report> {
    let cache = VmtCache::new(paths);
    match action {
        MaterialAction::List => {
            for name in cache.list()? {
                println!("{name}");
            }
        }
        MaterialAction::Store { texture, file } => {
            let contents = std::fs::read_to_string(&file)
                .context_with(|| format!("Failed to read {}", file.display()))?;
            if let Some(previous) = cache.edited(&texture) {
                let backup = cache.backup(&texture, &previous)?;
                println!("Previous edit backed up to {}", backup.display());
            }
            let stored = cache.store_edited(&texture, &contents)?;
            println!("Stored {}", stored.display());
        }
        MaterialAction::Export {
            texture,
            search_path,
            game,
        } => {
            let primary_path = game.join(&settings.game.primary_archive);
            let primary = GameArchive::open(&primary_path)
                .context_with(|| format!("Failed to open {}", primary_path.display()))?;
            let secondary = GameArchive::open(game.join(&settings.game.secondary_archive)).ok();
            let mut archives = vec![&primary];
            archives.extend(secondary.as_ref());
            match cache.export_original(&archives, &search_path, &[texture.as_str()]) {
                Some(path) => println!("{}", path.display()),
                None => bail!("No descriptor for {texture} under {search_path}"),
            }
        }
    }
    Ok(())
}
