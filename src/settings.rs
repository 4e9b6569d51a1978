//! Pipeline configuration.
//!
//! Everything here is data that could reasonably change between game updates or tool
//! releases: where the tools live, which archives to open, and the list of cosmetic
//! texture suffixes. It is stored as JSON next to the application.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {}: {err}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Error serializing or deserializing json: {err}")]
    SerdeJson {
        #[from]
        err: serde_json::Error,
    },
}

/// Bundled tools, relative to the application tools directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLayout {
    pub decompiler: PathBuf,
    pub texture_tool: PathBuf,
    pub archiver: PathBuf,
}

impl Default for ToolLayout {
    fn default() -> Self {
        Self {
            decompiler: PathBuf::from("Crowbar/CrowbarCommandLineDecomp.exe"),
            texture_tool: PathBuf::from("VTFCmd/VTFCmd.exe"),
            archiver: PathBuf::from("vpk/vpk.exe"),
        }
    }
}

/// Files inside the game installation, relative to its root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameLayout {
    pub compiler: PathBuf,
    pub primary_archive: PathBuf,
    pub secondary_archive: PathBuf,
    pub game_subdir: PathBuf,
}

impl Default for GameLayout {
    fn default() -> Self {
        Self {
            compiler: PathBuf::from("bin/studiomdl.exe"),
            primary_archive: PathBuf::from("tf/tf2_misc_dir.vpk"),
            secondary_archive: PathBuf::from("tf/tf2_textures_dir.vpk"),
            game_subdir: PathBuf::from("tf"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub tools: ToolLayout,
    pub game: GameLayout,
    /// Sub-path prepended to every non-empty `$cdmaterials` directive.
    pub cdmaterials_prefix: String,
    /// Texture group entries ending in one of these are cosmetic variants.
    pub cosmetic_suffixes: Vec<String>,
    pub geometry_prompt_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tools: ToolLayout::default(),
            game: GameLayout::default(),
            cdmaterials_prefix: "tf2skin\\".to_string(),
            cosmetic_suffixes: [
                "_gold",
                "_golden",
                "_xmas",
                "_festive",
                "_festivizer",
                "_holiday",
                "_halloween",
                "_australium",
                "_botkiller",
                "_blue",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            geometry_prompt_timeout_secs: 300,
        }
    }
}

impl PipelineSettings {
    /// Load settings from `path`, falling back to defaults if the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(SettingsError::Read {
                    path: path.to_owned(),
                    err,
                });
            }
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn geometry_prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.geometry_prompt_timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PipelineSettings::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.cdmaterials_prefix, "tf2skin\\");
        assert!(settings.cosmetic_suffixes.iter().any(|s| s == "_xmas"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "cosmetic_suffixes": ["_spooky"], "tools": { "archiver": "bin/vpk" } }"#,
        )
        .unwrap();
        let settings = PipelineSettings::load(&path).unwrap();
        assert_eq!(settings.cosmetic_suffixes, vec!["_spooky".to_string()]);
        assert_eq!(settings.tools.archiver, PathBuf::from("bin/vpk"));
        assert_eq!(
            settings.tools.texture_tool,
            PathBuf::from("VTFCmd/VTFCmd.exe")
        );
        assert_eq!(settings.geometry_prompt_timeout_secs, 300);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineSettings::load(&path),
            Err(SettingsError::SerdeJson { .. })
        ));
    }
}
