/// Model description (`.qc`) parsing and patching
pub mod qc;
/// Text geometry (`.smd`) parsing, merging and UV previews
pub mod smd;
/// Driving the model decompiler and compiler
pub mod studiomdl;
