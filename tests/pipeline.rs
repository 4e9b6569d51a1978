//! End-to-end builds against a synthetic game archive and shell stand-ins for the tools.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};

use tf2skin::build::pipeline::{BuildRequest, Pipeline, Stage, TracingProgress};
use tf2skin::build::service::{BuildEvent, BuildService};
use tf2skin::catalog::{BuildTarget, PlayerClass, SpecialEffect};
use tf2skin::error::BuildError;
use tf2skin::export::vmt::{MaterialSource, VmtCache};
use tf2skin::paths::ApplicationPaths;
use tf2skin::settings::PipelineSettings;

// Writing a script while another thread forks can make exec fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const DECOMPILER: &str = r#"#!/bin/sh
out="$4"
mkdir -p "$out"
touch "$(dirname "$0")/decompiler_ran"
cat > "$out/c_test.qc" <<'QC'
$modelname "weapons/c_models/c_test/c_test.mdl"
$cdmaterials "models/weapons/c_items/"
$cdmaterials ""
$body "body" "c_test_reference.smd"
$texturegroup "skinfamilies"
{
	{ "c_test" }
	{ "c_test_gold" }
}
$lod 1
{
	replacemodel "c_test_reference.smd" "c_test_lod1.smd"
}
QC
cat > "$out/c_test_reference.smd" <<'SMD'
version 1
nodes
  0 "root" -1
end
skeleton
time 0
  0 0 0 0 0 0 0
end
triangles
c_test
  0 0 0 0 0 0 1 0 0
  0 1 0 0 0 0 1 1 0
  0 0 1 0 0 0 1 0 1
end
SMD
echo lod > "$out/c_test_lod1.smd"
"#;

const COMPILER: &str = r#"#!/bin/sh
game="$2"
for last; do qc="$last"; done
out="$game/models/weapons/c_models/c_test"
mkdir -p "$out"
for ext in mdl vvd dx80.vtx dx90.vtx sw.vtx phy; do echo compiled > "$out/c_test.$ext"; done
echo variant > "$out/c_test_xmas.mdl"
cp "$qc" "$game/last_compiled.qc"
"#;

const FAILING_COMPILER: &str = "#!/bin/sh\necho 'boom: bad description' >&2\nexit 1\n";

const TEXTURE_TOOL: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -file) file="$2"; shift 2;;
    -output) out="$2"; shift 2;;
    *) shift;;
  esac
done
name=$(basename "$file" .png)
mkdir -p "$out"
echo vtf > "$out/$name.vtf"
"#;

// Lists the packed files instead of building a real archive.
const ARCHIVER: &str = r#"#!/bin/sh
dir="$2"
(cd "$dir" && find . -type f | sort) > "$dir.vpk"
"#;

const MODEL_FILES: &[&str] = &[".mdl", ".vvd", ".dx80.vtx", ".dx90.vtx", ".sw.vtx"];

const ORIGINAL_VMT: &str = "\"VertexLitGeneric\"\n{\n\t\"$basetexture\" \"models/weapons/c_items/c_test\"\n\t\"$phong\" \"1\"\n}\n";

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A v1 directory file with every entry embedded after the tree.
fn write_vpk(path: &Path, files: &[(&str, &str)]) {
    let mut tree = Vec::new();
    let mut data = Vec::new();
    for &(internal, contents) in files {
        let (dir, file) = internal.rsplit_once('/').unwrap_or((" ", internal));
        let (name, ext) = file.rsplit_once('.').unwrap_or((file, " "));
        for part in [ext, dir, name] {
            tree.extend_from_slice(part.as_bytes());
            tree.push(0);
        }
        tree.extend_from_slice(&0u32.to_le_bytes());
        tree.extend_from_slice(&0u16.to_le_bytes());
        tree.extend_from_slice(&0x7FFFu16.to_le_bytes());
        tree.extend_from_slice(&(data.len() as u32).to_le_bytes());
        tree.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        tree.extend_from_slice(&0xFFFFu16.to_le_bytes());
        tree.extend_from_slice(&[0, 0]);
        data.extend_from_slice(contents.as_bytes());
    }
    tree.push(0);

    let mut out = Vec::new();
    out.extend_from_slice(&0x55AA1234u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(tree.len() as u32).to_le_bytes());
    out.extend_from_slice(&tree);
    out.extend_from_slice(&data);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, out).unwrap();
}

fn model_entries(stem: &str) -> Vec<(String, String)> {
    MODEL_FILES
        .iter()
        .map(|suffix| (format!("{stem}{suffix}"), format!("original{suffix}")))
        .collect()
}

struct Fixture {
    _dir: tempfile::TempDir,
    paths: ApplicationPaths,
    game: PathBuf,
    image: PathBuf,
}

impl Fixture {
    fn new(compiler: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        let game = dir.path().join("game");
        let paths = ApplicationPaths::from_root(&root);

        write_script(&paths.tool("Crowbar/CrowbarCommandLineDecomp.exe"), DECOMPILER);
        write_script(&paths.tool("VTFCmd/VTFCmd.exe"), TEXTURE_TOOL);
        write_script(&paths.tool("vpk/vpk.exe"), ARCHIVER);
        write_script(&game.join("bin/studiomdl.exe"), compiler);
        std::fs::create_dir_all(game.join("tf")).unwrap();

        let image = dir.path().join("skin.png");
        image::RgbaImage::from_pixel(40, 20, image::Rgba([255, 0, 0, 255]))
            .save(&image)
            .unwrap();

        Self {
            _dir: dir,
            paths,
            game,
            image,
        }
    }

    fn primary_archive(&self, files: &[(&str, &str)]) {
        write_vpk(&self.game.join("tf/tf2_misc_dir.vpk"), files);
    }

    fn secondary_archive(&self, files: &[(&str, &str)]) {
        write_vpk(&self.game.join("tf/tf2_textures_dir.vpk"), files);
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.paths.clone(), PipelineSettings::default())
    }

    fn weapon_request(&self, key: &str) -> BuildRequest {
        BuildRequest::builder()
            .image(&self.image)
            .target(BuildTarget::weapon(PlayerClass::Scout, key))
            .resolution((64, 32))
            .file_name("skin.vpk")
            .game_root(&self.game)
            .build()
    }

    fn effect_request(&self, effect: SpecialEffect) -> BuildRequest {
        BuildRequest::builder()
            .image(&self.image)
            .target(BuildTarget::SpecialEffect(effect))
            .resolution((32, 32))
            .file_name("effect.vpk")
            .build()
    }

    fn temp_entries(&self) -> usize {
        std::fs::read_dir(&self.paths.temp_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn decompiler_ran(&self) -> bool {
        self.paths.tool("Crowbar/decompiler_ran").exists()
    }
}

fn packed_files(archive: &Path) -> Vec<String> {
    std::fs::read_to_string(archive)
        .unwrap()
        .lines()
        .map(|line| line.trim_start_matches("./").to_string())
        .collect()
}

#[test]
fn special_effect_build_packs_texture_material_and_companions() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let companion = fixture.paths.effects_assets_dir().join("critHIT/particles/crit.pcf");
    std::fs::create_dir_all(companion.parent().unwrap()).unwrap();
    std::fs::write(&companion, "pcf").unwrap();

    let outcome = fixture
        .pipeline()
        .run(&fixture.effect_request(SpecialEffect::CritHit), &TracingProgress, None)
        .unwrap();

    assert_eq!(outcome.archive, fixture.paths.export_dir.join("effect.vpk"));
    assert_eq!(outcome.material_source, MaterialSource::Template);
    assert!(outcome.model_path.is_none());
    let packed = packed_files(&outcome.archive);
    assert!(packed.contains(&"materials/effects/crit.vtf".to_string()), "{packed:?}");
    assert!(packed.contains(&"materials/effects/crit.vmt".to_string()), "{packed:?}");
    assert!(packed.contains(&"particles/crit.pcf".to_string()), "{packed:?}");
    assert!(!fixture.decompiler_ran());
    assert_eq!(fixture.temp_entries(), 0);
}

#[test]
fn weapon_build_end_to_end() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let model = "models/weapons/c_models/c_test/c_test";
    let entries = model_entries(model);
    let files: Vec<(&str, &str)> = entries.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    fixture.primary_archive(&files);
    fixture.secondary_archive(&[("materials/models/weapons/c_items/c_test.vmt", ORIGINAL_VMT)]);

    let mut request = fixture.weapon_request("c_test");
    request.uv_preview = true;
    let outcome = fixture.pipeline().run(&request, &TracingProgress, None).unwrap();

    assert_eq!(outcome.texture_name, "c_test");
    assert_eq!(outcome.model_path.as_deref(), Some("models/weapons/c_models/c_test/c_test.mdl"));
    assert_eq!(outcome.material_source, MaterialSource::Extracted);

    let packed = packed_files(&outcome.archive);
    for suffix in MODEL_FILES.iter().chain([&".phy"]) {
        let expected = format!("models/weapons/c_models/c_test/c_test{suffix}");
        assert!(packed.contains(&expected), "missing {expected} in {packed:?}");
    }
    assert!(!packed.iter().any(|p| p.ends_with("c_test_xmas.mdl")), "{packed:?}");
    assert!(packed.contains(&"materials/tf2skin/models/weapons/c_items/c_test.vtf".to_string()));
    assert!(packed.contains(&"materials/tf2skin/models/weapons/c_items/c_test.vmt".to_string()));

    let compiled_qc = std::fs::read_to_string(fixture.game.join("tf/last_compiled.qc")).unwrap();
    assert!(compiled_qc.contains("$cdmaterials \"tf2skin\\models/weapons/c_items/\""), "{compiled_qc}");
    assert_eq!(compiled_qc.matches("$cdmaterials \"\"").count(), 1);
    assert!(!compiled_qc.contains("$lod"));

    let preview = outcome.uv_preview.expect("uv preview");
    let decoded = image::open(&preview).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 32));

    assert_eq!(fixture.temp_entries(), 0);
    let extracted = std::fs::read_dir(fixture.paths.extracted_vmt_dir()).unwrap().count();
    assert_eq!(extracted, 0);
}

#[test]
fn per_class_item_path_is_found_last() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let entries = model_entries("models/player/items/scout/c_test");
    let files: Vec<(&str, &str)> = entries.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    fixture.primary_archive(&files);

    let outcome = fixture
        .pipeline()
        .run(&fixture.weapon_request("c_test"), &TracingProgress, None)
        .unwrap();
    assert_eq!(outcome.model_path.as_deref(), Some("models/player/items/scout/c_test.mdl"));
    assert_eq!(outcome.material_source, MaterialSource::Template);
}

#[test]
fn missing_model_lists_every_path_and_extracts_nothing() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    fixture.primary_archive(&[("models/weapons/c_models/c_other/c_other.mdl", "x")]);

    let failure = fixture
        .pipeline()
        .run(&fixture.weapon_request("c_missing"), &TracingProgress, None)
        .unwrap_err();
    let BuildError::ModelNotFound { tried, .. } = &failure.error else {
        panic!("unexpected error: {}", failure.error);
    };
    assert_eq!(tried.len(), 8);
    assert!(failure.error.to_string().contains("models/player/items/scout/c_missing.mdl"));
    assert!(failure.kept_temp_dir.is_none());
    assert!(!fixture.decompiler_ran());
    assert_eq!(fixture.temp_entries(), 0);
}

#[test]
fn compiler_failure_keeps_output_and_temp_dir_when_asked() {
    let _serial = serial();
    let fixture = Fixture::new(FAILING_COMPILER);
    let entries = model_entries("models/weapons/c_models/c_test/c_test");
    let mut files: Vec<(&str, &str)> = entries.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    files.push(("materials/models/weapons/c_items/c_test.vmt", ORIGINAL_VMT));
    fixture.primary_archive(&files);

    let mut request = fixture.weapon_request("c_test");
    request.keep_temp_on_error = true;
    let failure = fixture.pipeline().run(&request, &TracingProgress, None).unwrap_err();

    assert!(matches!(failure.error, BuildError::Compilation(_)));
    assert!(failure.to_string().contains("boom: bad description"));
    let kept = failure.kept_temp_dir.clone().expect("temp dir kept");
    assert!(kept.join("logs/compiler.log").is_file());
    assert!(failure.to_string().contains(&kept.display().to_string()));
    assert!(!fixture.paths.export_dir.join("skin.vpk").exists());

    // The original descriptor was pulled out before compiling and is swept on failure too.
    let staged_vmt = kept.join("pack/materials/tf2skin/models/weapons/c_items/c_test.vmt");
    assert!(std::fs::read_to_string(&staged_vmt).unwrap().contains("$phong"));
    let extracted = fixture.paths.extracted_vmt_dir();
    assert!(!extracted.exists() || std::fs::read_dir(&extracted).unwrap().next().is_none());
}

#[test]
fn edited_descriptor_wins_and_is_consumed() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let entries = model_entries("models/weapons/c_models/c_test/c_test");
    let mut files: Vec<(&str, &str)> = entries.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    files.push(("materials/models/weapons/c_items/c_test.vmt", ORIGINAL_VMT));
    fixture.primary_archive(&files);

    let cache = VmtCache::new(&fixture.paths);
    cache
        .store_edited("c_test", "\"VertexLitGeneric\"\n{\n\t\"$basetexture\" \"old\"\n\t\"$edited\" \"1\"\n}\n")
        .unwrap();

    let mut request = fixture.weapon_request("c_test");
    request.debug_mode = true;
    let outcome = fixture.pipeline().run(&request, &TracingProgress, None).unwrap();

    assert_eq!(outcome.material_source, MaterialSource::Edited);
    assert!(outcome.consumed_edited);
    assert!(cache.edited("c_test").is_none());

    let kept = outcome.kept_temp_dir.expect("debug mode keeps the build");
    let vmt = std::fs::read_to_string(kept.join("pack/materials/tf2skin/models/weapons/c_items/c_test.vmt")).unwrap();
    assert!(vmt.contains("$edited"));
    assert!(vmt.contains("tf2skin/models/weapons/c_items/c_test"));
    for stage in ["1_extracted", "2_decompiled", "3_patched", "4_compiled"] {
        assert!(kept.join("debug").join(stage).read_dir().unwrap().next().is_some(), "{stage}");
    }
    assert!(!kept.join("debug/3_patched/c_test_lod1.smd").exists());
}

#[test]
fn replacement_geometry_is_merged_and_bad_geometry_is_ignored() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let entries = model_entries("models/weapons/c_models/c_test/c_test");
    let files: Vec<(&str, &str)> = entries.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    fixture.primary_archive(&files);

    let replacement = fixture.image.with_file_name("new.smd");
    std::fs::write(
        &replacement,
        "version 1\nnodes\n  0 \"root\" -1\nend\nskeleton\ntime 0\n  0 0 0 0 0 0 0\nend\ntriangles\nmy_material\n  0 9.5 0 0 0 0 1 0 0\n  0 9.5 1 0 0 0 1 1 0\n  0 9.5 0 1 0 0 1 0 1\nend\n",
    )
    .unwrap();

    let mut request = fixture.weapon_request("c_test");
    request.debug_mode = true;
    request.geometry_replacement = true;
    request.replacement_geometry = Some(replacement);
    let outcome = fixture.pipeline().run(&request, &TracingProgress, None).unwrap();
    let kept = outcome.kept_temp_dir.unwrap();
    let merged = std::fs::read_to_string(kept.join("debug/3_patched/c_test_reference.smd")).unwrap();
    assert!(merged.contains("9.5"));
    assert!(merged.contains("c_test"));
    assert!(!merged.contains("my_material"));

    let empty = fixture.image.with_file_name("empty.smd");
    std::fs::write(&empty, "version 1\ntriangles\nend\n").unwrap();
    let mut request = fixture.weapon_request("c_test");
    request.geometry_replacement = true;
    request.replacement_geometry = Some(empty);
    assert!(fixture.pipeline().run(&request, &TracingProgress, None).is_ok());
}

#[test]
fn service_reports_increasing_progress_then_result() {
    let _serial = serial();
    let fixture = Fixture::new(COMPILER);
    let service = BuildService::new(fixture.pipeline());
    let (events, rx) = mpsc::channel();

    let handle = service
        .start(fixture.effect_request(SpecialEffect::MiniCritHit), events)
        .unwrap();

    let mut percents = Vec::new();
    let mut finished = None;
    for event in rx {
        match event {
            BuildEvent::Stage { stage, percent } => {
                assert_eq!(stage.percent(), percent);
                percents.push(percent);
            }
            BuildEvent::Finished(result) => finished = Some(result),
            _ => {}
        }
    }
    assert!(handle.join());

    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]), "{percents:?}");
    assert_eq!(percents.last(), Some(&Stage::Done.percent()));
    let outcome = finished.expect("finished event").unwrap();
    assert!(packed_files(&outcome.archive).contains(&"materials/effects/minicrit.vtf".to_string()));
    assert!(!service.is_running());
}
