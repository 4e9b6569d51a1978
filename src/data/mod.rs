/// Pulling model and material files out of the game archives
pub mod extract;
/// Shared low-level parsing helpers
pub mod parser_utils;
/// Parser for VPK directory files
pub mod vpk;
/// `vfs::FileSystem` view over a parsed VPK archive
pub mod vpk_vfs;
/// Data sources backing the archive VFS
pub mod wrappers;
