//! Material descriptors (`.vmt`): templates, texture path rewriting and the cache of
//! user-edited descriptors.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::catalog::{BuildTarget, SpecialEffect};
use crate::data::extract::{GameArchive, extract_material_descriptor};
use crate::error::{BuildError, BuildResult, IoResultExt};
use crate::paths::ApplicationPaths;

static BASETEXTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?im)^([ \t]*"?\$basetexture"?[ \t]+)("[^"\r\n]*"|[^\s]+)"#).unwrap()
});

/// Texture path as referenced from a descriptor: `$cdmaterials` directory plus name.
///
/// Slashes become `/` and a leading `materials/` segment is dropped.
pub fn derive_texture_reference_path(material_search_path: &str, texture_name: &str) -> String {
    let normalized = material_search_path.replace('\\', "/");
    let trimmed = normalized.trim_matches('/');
    let dir = match trimmed.split_once('/') {
        Some((first, rest)) if first.eq_ignore_ascii_case("materials") => rest,
        None if trimmed.eq_ignore_ascii_case("materials") => "",
        _ => trimmed,
    };
    if dir.is_empty() {
        texture_name.to_string()
    } else {
        format!("{dir}/{texture_name}")
    }
}

fn effect_template(texture_reference: &str) -> String {
    format!(
        r#""UnlitGeneric"
{{
	"$basetexture" "{texture_reference}"
	"$additive" "1"
	"$translucent" "1"
	"$vertexcolor" "1"
	"$vertexalpha" "1"
	"$nocull" "1"
}}
"#
    )
}

fn weapon_template(texture_reference: &str) -> String {
    format!(
        r#""VertexLitGeneric"
{{
	"$basetexture" "{texture_reference}"
	"$phong" "1"
	"$phongexponent" "25"
	"$phongboost" "5"
	"$lightwarptexture" "models/lighting/Weapon_LightWarp"
	"$phongfresnelranges" "[.25 .5 1]"
	"$basemapalphaphongmask" "1"

	"$rimlight" "1"
	"$rimlightexponent" "4"
	"$rimlightboost" "2"

	"$glowcolor" "1"

	"$cloakPassEnabled" "1"

	"$sheenPassEnabled" "1"
	"$sheenmap" "cubemaps/cubemap_sheen001"
	"$sheenmapmask" "Effects/AnimatedSheen/animatedsheen0"
	"$sheenmaptint" "[ 1 1 1 ]"
	"$sheenmapmaskframe" "0"
	"$sheenindex" "0"

	"$yellow" "0"

	"Proxies"
	{{
		"AnimatedWeaponSheen"
		{{
			"animatedtexturevar" "$sheenmapmask"
			"animatedtextureframenumvar" "$sheenmapmaskframe"
			"animatedtextureframerate" "40"
		}}
		"invis"
		{{
		}}
		"ModelGlowColor"
		{{
			"resultVar" "$glowcolor"
		}}
		"Equals"
		{{
			"srcVar1" "$glowcolor"
			"resultVar" "$selfillumtint"
		}}
		"Equals"
		{{
			"srcVar1" "$glowcolor"
			"resultVar" "$color2"
		}}
		"YellowLevel"
		{{
			"resultVar" "$yellow"
		}}
		"Multiply"
		{{
			"srcVar1" "$color2"
			"srcVar2" "$yellow"
			"resultVar" "$color2"
		}}
	}}
}}
"#
    )
}

fn minimal_template(texture_reference: &str) -> String {
    format!(
        r#""VertexLitGeneric"
{{
	"$basetexture" "{texture_reference}"
	"$phong" "1"
	"$phongexponent" "25"
	"$phongboost" "1"
	"$lightwarptexture" "models/lighting/Weapon_LightWarp"
	"$phongfresnelranges" "[.25 .5 1]"
}}
"#
    )
}

fn write_descriptor(output: &Path, contents: &str) -> BuildResult<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    std::fs::write(output, contents).at(output)
}

/// Write a fresh descriptor for `target` referencing `texture_reference`.
///
/// Special effects get an unlit additive material; weapons get the full lit
/// material with phong, rim light, sheen, cloak and their proxies.
pub fn build_from_template(output: &Path, target: &BuildTarget, texture_reference: &str) -> BuildResult<()> {
    let contents = match target {
        BuildTarget::SpecialEffect(_) => effect_template(texture_reference),
        BuildTarget::Weapon { .. } => weapon_template(texture_reference),
    };
    write_descriptor(output, &contents)
}

/// Write a minimal lit descriptor whose texture path follows `material_search_path`.
pub fn build_from_cdmaterials(output: &Path, material_search_path: &str, texture_name: &str) -> BuildResult<()> {
    let reference = derive_texture_reference_path(material_search_path, texture_name);
    write_descriptor(output, &minimal_template(&reference))
}

/// Point an existing descriptor's `$basetexture` at the patched texture location.
///
/// The directive is matched case-insensitively, quoted or not. If the descriptor has none,
/// one is inserted right after the opening brace of the shader block.
pub fn rewrite_texture_reference(
    descriptor: &Path,
    material_search_path: &str,
    texture_name: &str,
) -> BuildResult<()> {
    let reference = derive_texture_reference_path(material_search_path, texture_name);
    let text = std::fs::read_to_string(descriptor).at(descriptor)?;
    let rewritten = rewrite_texture_reference_text(&text, &reference).ok_or_else(|| {
        BuildError::Material(format!("{} has no shader block", descriptor.display()))
    })?;
    std::fs::write(descriptor, rewritten).at(descriptor)
}

fn rewrite_texture_reference_text(text: &str, reference: &str) -> Option<String> {
    if BASETEXTURE.is_match(text) {
        let rewritten = BASETEXTURE.replace(text, |caps: &regex::Captures<'_>| {
            format!("{}\"{reference}\"", &caps[1])
        });
        return Some(rewritten.into_owned());
    }
    let brace = text.find('{')?;
    let mut out = String::with_capacity(text.len() + reference.len() + 24);
    out.push_str(&text[..=brace]);
    out.push_str(&format!("\n\t\"$basetexture\" \"{reference}\""));
    out.push_str(&text[brace + 1..]);
    Some(out)
}

/// Where the final descriptor of a build came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialSource {
    Edited,
    Extracted,
    Template,
}

fn cache_name(texture_name: &str) -> BuildResult<&str> {
    let single_component = !texture_name.is_empty()
        && !texture_name.starts_with('.')
        && !texture_name.contains(['/', '\\', ':', '\0']);
    if single_component {
        Ok(texture_name)
    } else {
        Err(BuildError::Validation(format!(
            "'{texture_name}' is not a usable texture name"
        )))
    }
}

/// User-edited descriptors kept between builds, keyed by texture name.
#[derive(Debug, Clone)]
pub struct VmtCache {
    edited_dir: PathBuf,
    backup_dir: PathBuf,
    extracted_dir: PathBuf,
}

impl VmtCache {
    pub fn new(paths: &ApplicationPaths) -> Self {
        Self {
            edited_dir: paths.edited_vmt_dir(),
            backup_dir: paths.vmt_backup_dir(),
            extracted_dir: paths.extracted_vmt_dir(),
        }
    }

    /// Cache file for `texture_name`. Names that could leave the cache directory are rejected.
    pub fn edited_path(&self, texture_name: &str) -> BuildResult<PathBuf> {
        Ok(self.edited_dir.join(format!("{}.vmt", cache_name(texture_name)?)))
    }

    pub fn edited(&self, texture_name: &str) -> Option<PathBuf> {
        let path = self.edited_path(texture_name).ok()?;
        path.is_file().then_some(path)
    }

    /// Save an edited descriptor. Readers never see a partially written file.
    pub fn store_edited(&self, texture_name: &str, contents: &str) -> BuildResult<PathBuf> {
        let path = self.edited_path(texture_name)?;
        std::fs::create_dir_all(&self.edited_dir).at(&self.edited_dir)?;
        let staging = self.edited_dir.join(format!(".{texture_name}.vmt.tmp"));
        std::fs::write(&staging, contents).at(&staging)?;
        std::fs::rename(&staging, &path).at(&path)?;
        debug!("stored edited descriptor {}", path.display());
        Ok(path)
    }

    /// Copy `source` into the backup directory under a timestamped name.
    pub fn backup(&self, texture_name: &str, source: &Path) -> BuildResult<PathBuf> {
        let texture_name = cache_name(texture_name)?;
        std::fs::create_dir_all(&self.backup_dir).at(&self.backup_dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let dest = self.backup_dir.join(format!("{texture_name}_{stamp}.vmt"));
        std::fs::copy(source, &dest).at(&dest)?;
        Ok(dest)
    }

    /// Delete the edited descriptor after a build used it. Returns whether one existed.
    pub fn consume(&self, texture_name: &str) -> BuildResult<bool> {
        let path = self.edited_path(texture_name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("consumed edited descriptor {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BuildError::io(path, e)),
        }
    }

    /// Texture names with a pending edited descriptor, sorted.
    pub fn list(&self) -> BuildResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.edited_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BuildError::io(&self.edited_dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.at(&self.edited_dir)?.path();
            if path.extension().is_some_and(|ext| ext == "vmt") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if !stem.starts_with('.') {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn extracted_dir(&self) -> &Path {
        &self.extracted_dir
    }

    /// Pull the original descriptor out of the archives into the scratch directory.
    ///
    /// Each name is tried in every archive, in order. The file is saved as
    /// `<first name>.vmt` so an editor can seed from it.
    pub fn export_original(
        &self,
        archives: &[&GameArchive],
        material_search_path: &str,
        names: &[&str],
    ) -> Option<PathBuf> {
        let canonical = names.first()?;
        for name in names {
            for archive in archives {
                if let Some(found) =
                    extract_material_descriptor(archive, material_search_path, name, &self.extracted_dir)
                {
                    if name == canonical {
                        return Some(found);
                    }
                    let dest = self.extracted_dir.join(format!("{canonical}.vmt"));
                    return match std::fs::rename(&found, &dest) {
                        Ok(()) => Some(dest),
                        Err(e) => {
                            warn!("could not rename {}: {e}", found.display());
                            Some(found)
                        }
                    };
                }
            }
        }
        None
    }

    /// Empty the scratch directory of extracted originals.
    pub fn clear_extracted(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.extracted_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove {}: {e}", path.display()),
            }
        }
        removed
    }
}

/// Produce the build's descriptor at `output`.
///
/// An edited descriptor wins over an extracted original, which wins over a template.
/// Copied descriptors get their texture path rewritten; templates are generated with it.
pub fn produce_descriptor(
    output: &Path,
    cache: &VmtCache,
    extracted: Option<&Path>,
    target: &BuildTarget,
    material_search_path: &str,
    texture_name: &str,
) -> BuildResult<MaterialSource> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }

    let (source, copied_from) = match (cache.edited(texture_name), extracted) {
        (Some(edited), _) => (MaterialSource::Edited, Some(edited)),
        (None, Some(original)) if original.is_file() => (MaterialSource::Extracted, Some(original.to_owned())),
        _ => (MaterialSource::Template, None),
    };

    match copied_from {
        Some(from) => {
            std::fs::copy(&from, output).at(output)?;
            rewrite_texture_reference(output, material_search_path, texture_name)?;
        }
        None => {
            let reference = derive_texture_reference_path(material_search_path, texture_name);
            build_from_template(output, target, &reference)?;
        }
    }
    info!("material descriptor from {source:?}: {}", output.display());
    Ok(source)
}

/// Material search path used for special effects.
pub fn effect_material_search_path(effect: SpecialEffect) -> String {
    format!("materials/{}/", effect.material_dir())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::PlayerClass;

    #[test]
    fn texture_reference_paths() {
        assert_eq!(
            derive_texture_reference_path("tf2skin\\models\\weapons\\c_items\\", "c_foo"),
            "tf2skin/models/weapons/c_items/c_foo"
        );
        assert_eq!(
            derive_texture_reference_path("Materials/effects/", "crit"),
            "effects/crit"
        );
        assert_eq!(derive_texture_reference_path("", "x"), "x");
        assert_eq!(derive_texture_reference_path("materials", "x"), "x");
    }

    #[test]
    fn rewrites_existing_directive_case_insensitively() {
        let text = "\"VertexLitGeneric\"\n{\n\t\"$BaseTexture\" \"models/weapons/c_items/c_foo\"\n\t\"$phong\" \"1\"\n}\n";
        let out = rewrite_texture_reference_text(text, "tf2skin/models/c_foo").unwrap();
        assert_eq!(
            out,
            "\"VertexLitGeneric\"\n{\n\t\"$BaseTexture\" \"tf2skin/models/c_foo\"\n\t\"$phong\" \"1\"\n}\n"
        );

        let bare = "VertexLitGeneric\n{\n  $basetexture models/old\n}\n";
        let out = rewrite_texture_reference_text(bare, "new/path").unwrap();
        assert!(out.contains("$basetexture \"new/path\""));
    }

    #[test]
    fn inserts_missing_directive_after_brace() {
        let text = "\"VertexLitGeneric\"\n{\n\t\"$phong\" \"1\"\n}\n";
        let out = rewrite_texture_reference_text(text, "a/b").unwrap();
        assert_eq!(
            out,
            "\"VertexLitGeneric\"\n{\n\t\"$basetexture\" \"a/b\"\n\t\"$phong\" \"1\"\n}\n"
        );
        assert!(rewrite_texture_reference_text("garbage", "a/b").is_none());
    }

    #[test]
    fn templates_differ_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let effect = dir.path().join("crit.vmt");
        build_from_template(&effect, &BuildTarget::SpecialEffect(SpecialEffect::CritHit), "effects/crit").unwrap();
        let text = std::fs::read_to_string(&effect).unwrap();
        assert!(text.starts_with("\"UnlitGeneric\""));
        assert!(text.contains("\"$additive\" \"1\""));

        let weapon = dir.path().join("c_foo.vmt");
        build_from_template(&weapon, &BuildTarget::weapon(PlayerClass::Scout, "c_foo"), "a/c_foo").unwrap();
        let text = std::fs::read_to_string(&weapon).unwrap();
        assert!(text.contains("\"$basetexture\" \"a/c_foo\""));
        assert!(text.contains("\"Proxies\""));
        assert!(text.contains("\"$rimlight\" \"1\""));

        let minimal = dir.path().join("min.vmt");
        build_from_cdmaterials(&minimal, "tf2skin\\models\\", "c_foo").unwrap();
        let text = std::fs::read_to_string(&minimal).unwrap();
        assert!(text.contains("\"$basetexture\" \"tf2skin/models/c_foo\""));
        assert!(!text.contains("Proxies"));
    }

    #[test]
    fn edited_beats_extracted_beats_template() {
        let root = tempfile::tempdir().unwrap();
        let paths = ApplicationPaths::from_root(root.path());
        let cache = VmtCache::new(&paths);
        let target = BuildTarget::weapon(PlayerClass::Soldier, "c_foo");
        let out = root.path().join("pack/materials/c_foo.vmt");

        let extracted = root.path().join("original.vmt");
        std::fs::write(&extracted, "\"VertexLitGeneric\"\n{\n\t\"$basetexture\" \"old\"\n\t\"$original\" \"1\"\n}\n").unwrap();

        assert_eq!(
            produce_descriptor(&out, &cache, None, &target, "tf2skin\\m\\", "c_foo").unwrap(),
            MaterialSource::Template
        );
        assert_eq!(
            produce_descriptor(&out, &cache, Some(&extracted), &target, "tf2skin\\m\\", "c_foo").unwrap(),
            MaterialSource::Extracted
        );
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("\"$original\" \"1\""));
        assert!(text.contains("\"$basetexture\" \"tf2skin/m/c_foo\""));

        cache
            .store_edited("c_foo", "\"VertexLitGeneric\"\n{\n\t\"$edited\" \"1\"\n}\n")
            .unwrap();
        assert_eq!(cache.list().unwrap(), vec!["c_foo".to_string()]);
        assert_eq!(
            produce_descriptor(&out, &cache, Some(&extracted), &target, "tf2skin\\m\\", "c_foo").unwrap(),
            MaterialSource::Edited
        );
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("\"$edited\" \"1\""));
        assert!(text.contains("\"$basetexture\" \"tf2skin/m/c_foo\""));

        let backup = cache.backup("c_foo", &cache.edited_path("c_foo").unwrap()).unwrap();
        assert!(backup.starts_with(paths.vmt_backup_dir()));
        assert!(cache.consume("c_foo").unwrap());
        assert!(!cache.consume("c_foo").unwrap());
        assert!(cache.list().unwrap().is_empty());
    }

    #[test]
    fn cache_names_stay_inside_the_cache() {
        let root = tempfile::tempdir().unwrap();
        let paths = ApplicationPaths::from_root(root.path());
        let cache = VmtCache::new(&paths);
        let source = root.path().join("edit.vmt");
        std::fs::write(&source, "x").unwrap();

        for name in ["../x", "..", "a/b", "a\\b", "", ".hidden", "C:evil"] {
            assert!(matches!(cache.store_edited(name, "x"), Err(BuildError::Validation(_))), "{name:?}");
            assert!(cache.backup(name, &source).is_err(), "{name:?}");
            assert!(cache.consume(name).is_err(), "{name:?}");
            assert!(cache.edited(name).is_none(), "{name:?}");
        }
        assert!(!root.path().join("data/x.vmt").exists());
        assert!(!paths.edited_vmt_dir().exists());

        let stored = cache.store_edited("c_foo_gold", "x").unwrap();
        assert_eq!(stored.parent(), Some(paths.edited_vmt_dir().as_path()));
    }

    #[test]
    fn clearing_extracted_scratch() {
        let root = tempfile::tempdir().unwrap();
        let cache = VmtCache::new(&ApplicationPaths::from_root(root.path()));
        assert_eq!(cache.clear_extracted(), 0);
        std::fs::create_dir_all(cache.extracted_dir()).unwrap();
        std::fs::write(cache.extracted_dir().join("a.vmt"), "x").unwrap();
        assert_eq!(cache.clear_extracted(), 1);
        assert!(cache.extracted_dir().is_dir());
    }
}
