/// Build orchestration: scratch directories, tool resolution, the pipeline and its workers
pub mod build;
/// Weapons and special effects that can be skinned
pub mod catalog;
/// Reading the game's VPK archives
pub mod data;
/// Error definitions
pub mod error;
/// Textures, material descriptors and the final archive
pub mod export;
/// Model description and geometry files
pub mod models;
/// Application directory layout
pub mod paths;
/// Pipeline configuration
pub mod settings;

pub use vfs;
