/// Packing the staging tree into the final archive
pub mod package;
/// Image normalisation and texture conversion
pub mod texture;
/// Material descriptor (`.vmt`) generation and the edited-descriptor cache
pub mod vmt;
