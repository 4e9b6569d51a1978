/// Running whole classes of weapons and reporting per-weapon results
pub mod batch;
/// Per-build scratch directories and debug snapshots
pub mod context;
/// The build pipeline itself
pub mod pipeline;
/// Locating bundled tools and the game installation
pub mod resolver;
/// Background builds with progress events and single-flight admission
pub mod service;
/// External process invocation with captured output
pub mod tool;
