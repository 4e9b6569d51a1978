//! Locating the external tools and game archives a build needs.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BuildError, BuildResult};
use crate::paths::ApplicationPaths;
use crate::settings::{GameLayout, ToolLayout};

/// Files inside the game installation that a weapon build depends on.
#[derive(Debug, Clone)]
pub struct ResolvedGame {
    pub compiler: PathBuf,
    pub primary_archive: PathBuf,
    /// The mod directory passed to the compiler (`-game`).
    pub game_dir: PathBuf,
}

fn require(what: &'static str, path: PathBuf) -> BuildResult<PathBuf> {
    if path.exists() {
        debug!("{what}: {}", path.display());
        Ok(path)
    } else {
        Err(BuildError::ToolNotFound { what, path })
    }
}

/// Resolve the compiler, primary archive and mod directory under `game_root`.
pub fn resolve(game_root: &Path, layout: &GameLayout) -> BuildResult<ResolvedGame> {
    if !game_root.is_dir() {
        return Err(BuildError::ToolNotFound {
            what: "Game installation",
            path: game_root.to_owned(),
        });
    }
    Ok(ResolvedGame {
        compiler: require("Model compiler", game_root.join(&layout.compiler))?,
        primary_archive: require("Game archive", game_root.join(&layout.primary_archive))?,
        game_dir: require("Game directory", game_root.join(&layout.game_subdir))?,
    })
}

/// The secondary archive holds richer original materials but is optional.
pub fn resolve_secondary_archive(game_root: &Path, layout: &GameLayout) -> Option<PathBuf> {
    let path = game_root.join(&layout.secondary_archive);
    path.is_file().then_some(path)
}

pub fn check_decompiler_available(paths: &ApplicationPaths, layout: &ToolLayout) -> BuildResult<PathBuf> {
    require("Model decompiler", paths.tool(&layout.decompiler))
}

/// Tools needed by every build, weapon or special effect.
pub fn resolve_texture_tools(paths: &ApplicationPaths, layout: &ToolLayout) -> BuildResult<(PathBuf, PathBuf)> {
    Ok((
        require("Texture compiler", paths.tool(&layout.texture_tool))?,
        require("Archiver", paths.tool(&layout.archiver))?,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn names_the_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let layout = GameLayout::default();
        touch(&temp.path().join("bin/studiomdl.exe"));

        let err = resolve(temp.path(), &layout).unwrap_err();
        match err {
            BuildError::ToolNotFound { path, .. } => {
                assert_eq!(path, temp.path().join("tf/tf2_misc_dir.vpk"));
            }
            other => panic!("unexpected {other:?}"),
        }

        touch(&temp.path().join("tf/tf2_misc_dir.vpk"));
        let game = resolve(temp.path(), &layout).unwrap();
        assert_eq!(game.game_dir, temp.path().join("tf"));
        assert_eq!(resolve_secondary_archive(temp.path(), &layout), None);
    }

    #[test]
    fn missing_game_root() {
        let err = resolve(Path::new("/definitely/not/here"), &GameLayout::default()).unwrap_err();
        assert!(err.is_preflight());
        assert!(err.to_string().contains("/definitely/not/here"));
    }

    #[test]
    fn decompiler_lookup_uses_tools_dir() {
        let temp = tempfile::tempdir().unwrap();
        let paths = ApplicationPaths::from_root(temp.path());
        let layout = ToolLayout::default();
        assert!(check_decompiler_available(&paths, &layout).is_err());
        touch(&paths.tool(&layout.decompiler));
        assert_eq!(
            check_decompiler_available(&paths, &layout).unwrap(),
            temp.path().join("tools/Crowbar/CrowbarCommandLineDecomp.exe")
        );
    }
}
