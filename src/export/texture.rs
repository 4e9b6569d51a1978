//! Source image normalisation and conversion to the engine's texture format.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bon::Builder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::build::tool::ToolCommand;
use crate::error::{BuildError, BuildResult, IoResultExt};

/// Pixel formats the texture compiler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TextureFormat {
    Rgba8888,
    Bgra8888,
    Rgb888,
    Bgr888,
    Rgb565,
    I8,
    Ia88,
    A8,
    Dxt1,
    Dxt3,
    Dxt5,
}

impl TextureFormat {
    pub const ALL: &[TextureFormat] = &[
        Self::Rgba8888,
        Self::Bgra8888,
        Self::Rgb888,
        Self::Bgr888,
        Self::Rgb565,
        Self::I8,
        Self::Ia88,
        Self::A8,
        Self::Dxt1,
        Self::Dxt3,
        Self::Dxt5,
    ];

    /// Spelling expected by `-format`.
    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Rgba8888 => "RGBA8888",
            Self::Bgra8888 => "BGRA8888",
            Self::Rgb888 => "RGB888",
            Self::Bgr888 => "BGR888",
            Self::Rgb565 => "RGB565",
            Self::I8 => "I8",
            Self::Ia88 => "IA88",
            Self::A8 => "A8",
            Self::Dxt1 => "DXT1",
            Self::Dxt3 => "DXT3",
            Self::Dxt5 => "DXT5",
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_name())
    }
}

impl FromStr for TextureFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|format| format.tool_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unsupported texture format '{s}'"))
    }
}

/// Texture flags, mapped to the compiler's `-flag` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFlag {
    ClampS,
    ClampT,
    NoMipmap,
    NoLod,
    PointSample,
    Trilinear,
    Anisotropic,
    Srgb,
    NoCompress,
    SingleCopy,
    Normal,
    HintDxt5,
    MinMip,
}

impl TextureFlag {
    pub const ALL: &[TextureFlag] = &[
        Self::ClampS,
        Self::ClampT,
        Self::NoMipmap,
        Self::NoLod,
        Self::PointSample,
        Self::Trilinear,
        Self::Anisotropic,
        Self::Srgb,
        Self::NoCompress,
        Self::SingleCopy,
        Self::Normal,
        Self::HintDxt5,
        Self::MinMip,
    ];

    /// Name used in settings and on the command line of this application.
    pub fn name(self) -> &'static str {
        match self {
            Self::ClampS => "clamp_s",
            Self::ClampT => "clamp_t",
            Self::NoMipmap => "no_mipmap",
            Self::NoLod => "no_lod",
            Self::PointSample => "point_sample",
            Self::Trilinear => "trilinear",
            Self::Anisotropic => "anisotropic",
            Self::Srgb => "srgb",
            Self::NoCompress => "no_compress",
            Self::SingleCopy => "single_copy",
            Self::Normal => "normal",
            Self::HintDxt5 => "hint_dxt5",
            Self::MinMip => "min_mip",
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Self::ClampS => "CLAMPS",
            Self::ClampT => "CLAMPT",
            Self::NoMipmap => "NOMIP",
            Self::NoLod => "NOLOD",
            Self::PointSample => "POINTSAMPLE",
            Self::Trilinear => "TRILINEAR",
            Self::Anisotropic => "ANISOTROPIC",
            Self::Srgb => "SRGB",
            Self::NoCompress => "NOCOMPRESS",
            Self::SingleCopy => "SINGLECOPY",
            Self::Normal => "NORMAL",
            Self::HintDxt5 => "HINT_DXT5",
            Self::MinMip => "MINMIP",
        }
    }
}

impl FromStr for TextureFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|flag| {
                flag.name().eq_ignore_ascii_case(&wanted) || flag.tool_name().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| format!("unknown texture flag '{s}'"))
    }
}

/// Normal map generation from the image's height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalMapOptions {
    /// Kernel name, e.g. `3x3` or `sobel`.
    pub kernel: String,
    pub height: u32,
    pub scale: f32,
    pub wrap: bool,
}

impl Default for NormalMapOptions {
    fn default() -> Self {
        Self {
            kernel: "3x3".to_string(),
            height: 4,
            scale: 2.0,
            wrap: false,
        }
    }
}

/// Extra compiler switches beyond format and flags.
#[derive(Debug, Clone, Default, PartialEq, Builder)]
pub struct TextureOptions {
    #[builder(default)]
    pub no_mipmaps: bool,
    #[builder(default)]
    pub no_thumbnail: bool,
    #[builder(default)]
    pub no_reflectivity: bool,
    /// Enables gamma correction with this value.
    pub gamma_correction: Option<f32>,
    pub normal_map: Option<NormalMapOptions>,
}

impl TextureOptions {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.no_mipmaps {
            args.push("-nomipmaps".to_string());
        }
        if self.no_thumbnail {
            args.push("-nothumbnail".to_string());
        }
        if self.no_reflectivity {
            args.push("-noreflectivity".to_string());
        }
        if let Some(gamma) = self.gamma_correction {
            args.push("-gamma".to_string());
            args.push("-gcorrection".to_string());
            args.push(gamma.to_string());
        }
        if let Some(normal) = &self.normal_map {
            args.extend([
                "-normal".to_string(),
                "-nkernel".to_string(),
                normal.kernel.clone(),
                "-nheight".to_string(),
                normal.height.to_string(),
                "-nscale".to_string(),
                normal.scale.to_string(),
            ]);
            if normal.wrap {
                args.push("-nwrap".to_string());
            }
        }
        args
    }
}

/// Load any supported image, force RGBA, resize to exactly `width`x`height` and save as PNG.
///
/// The aspect ratio is not preserved.
pub fn resize_and_export(input: &Path, output_png: &Path, (width, height): (u32, u32)) -> BuildResult<()> {
    if width == 0 || height == 0 {
        return Err(BuildError::Validation(format!(
            "texture size must be positive, got {width}x{height}"
        )));
    }
    let source = image::open(input)?.to_rgba8();
    debug!(
        "resizing {} from {}x{} to {width}x{height}",
        input.display(),
        source.width(),
        source.height()
    );
    let resized = if source.dimensions() == (width, height) {
        source
    } else {
        image::imageops::resize(&source, width, height, FilterType::Lanczos3)
    };

    if let Some(parent) = output_png.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    let file = File::create(output_png).at(output_png)?;
    PngEncoder::new(BufWriter::new(file)).write_image(
        resized.as_raw(),
        resized.width(),
        resized.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(())
}

/// Convert `png` to a `.vtf` in `out_dir` and return its path.
pub fn build_texture(
    png: &Path,
    out_dir: &Path,
    format: TextureFormat,
    flags: &[TextureFlag],
    options: &TextureOptions,
    texture_tool: &Path,
    logs_dir: Option<&Path>,
) -> BuildResult<PathBuf> {
    std::fs::create_dir_all(out_dir).at(out_dir)?;

    let mut command = ToolCommand::new("texture", texture_tool)
        .arg("-file")
        .arg(png)
        .arg("-output")
        .arg(out_dir)
        .arg("-format")
        .arg(format.tool_name());
    for flag in flags {
        command = command.arg("-flag").arg(flag.tool_name());
    }
    let output = command.args(options.to_args()).run(logs_dir)?;
    if !output.success() {
        return Err(BuildError::TextureTool(output));
    }

    let stem = png
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let vtf = out_dir.join(format!("{stem}.vtf"));
    if !vtf.is_file() {
        return Err(BuildError::TextureBuild(format!(
            "texture compiler reported success but {} is missing",
            vtf.display()
        )));
    }
    info!("built texture {}", vtf.display());
    Ok(vtf)
}
