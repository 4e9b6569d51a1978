//! Studio model data (`.smd`) geometry files.
//!
//! Format overview:
//! ```text
//! version 1
//! nodes
//!   0 "root" -1
//! end
//! skeleton
//!   time 0
//!   0 0 0 0 0 0 0
//! end
//! triangles
//! c_foo
//!   0  x y z  nx ny nz  u v  [links...]    (three vertex lines per triangle)
//! end
//! ```
//!
//! Triangles are grouped by material in order of first appearance.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::data::extract::find_file_recursive;

#[derive(Debug, Error)]
pub enum SmdError {
    #[error("could not access {}: {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("{} has no triangles", .0.display())]
    NoTriangles(PathBuf),
    #[error("triangle at line {line} is incomplete")]
    TruncatedTriangle { line: usize },
    #[error("section `{section}` starting at line {line} is not closed with `end`")]
    UnterminatedSection { section: String, line: usize },
    #[error("failed to write preview: {0}")]
    Image(#[from] image::ImageError),
}

/// Triangles that share a material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriangleGroup {
    pub material: String,
    /// Vertex lines, three per triangle.
    pub vertices: Vec<String>,
}

impl TriangleGroup {
    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmdFile {
    pub version: Option<String>,
    pub nodes: Vec<String>,
    pub skeleton: Vec<String>,
    pub groups: Vec<TriangleGroup>,
}

fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("//")
}

impl SmdFile {
    pub fn parse(text: &str) -> Result<Self, SmdError> {
        let mut smd = SmdFile::default();
        let mut lines = text.lines().enumerate().map(|(i, line)| (i + 1, line));

        while let Some((line_number, line)) = lines.next() {
            if is_skippable(line) {
                continue;
            }
            let keyword = line.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();
            match keyword.as_str() {
                "version" => smd.version = Some(line.trim().to_string()),
                "nodes" | "skeleton" | "vertexanimation" => {
                    let mut section = Vec::new();
                    loop {
                        let Some((_, line)) = lines.next() else {
                            return Err(SmdError::UnterminatedSection {
                                section: keyword.clone(),
                                line: line_number,
                            });
                        };
                        if line.trim().eq_ignore_ascii_case("end") {
                            break;
                        }
                        if !is_skippable(line) {
                            section.push(line.to_string());
                        }
                    }
                    match keyword.as_str() {
                        "nodes" => smd.nodes = section,
                        "skeleton" => smd.skeleton = section,
                        _ => debug!("ignoring vertexanimation section"),
                    }
                }
                "triangles" => loop {
                    let Some((material_line, material)) = lines.next() else {
                        return Err(SmdError::UnterminatedSection {
                            section: keyword.clone(),
                            line: line_number,
                        });
                    };
                    if is_skippable(material) {
                        continue;
                    }
                    let material = material.trim();
                    if material.eq_ignore_ascii_case("end") {
                        break;
                    }
                    let mut vertices = Vec::with_capacity(3);
                    while vertices.len() < 3 {
                        match lines.next() {
                            Some((_, vertex)) if is_skippable(vertex) => continue,
                            Some((_, vertex)) if !vertex.trim().eq_ignore_ascii_case("end") => {
                                vertices.push(vertex.to_string())
                            }
                            _ => return Err(SmdError::TruncatedTriangle { line: material_line }),
                        }
                    }
                    smd.push_triangle(material, vertices);
                },
                _ => debug!("skipping unknown smd line {line_number}: {line}"),
            }
        }
        Ok(smd)
    }

    pub fn load(path: &Path) -> Result<Self, SmdError> {
        let text = std::fs::read_to_string(path).map_err(|err| SmdError::Io {
            path: path.to_owned(),
            err,
        })?;
        Self::parse(&text)
    }

    fn push_triangle(&mut self, material: &str, vertices: Vec<String>) {
        match self.groups.iter_mut().find(|g| g.material == material) {
            Some(group) => group.vertices.extend(vertices),
            None => self.groups.push(TriangleGroup {
                material: material.to_string(),
                vertices,
            }),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.groups.iter().map(TriangleGroup::triangle_count).sum()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(self.version.as_deref().unwrap_or("version 1"));
        out.push('\n');
        for (name, section) in [("nodes", &self.nodes), ("skeleton", &self.skeleton)] {
            out.push_str(name);
            out.push('\n');
            for line in section {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("end\n");
        }
        out.push_str("triangles\n");
        for group in &self.groups {
            for triangle in group.vertices.chunks(3) {
                out.push_str(&group.material);
                out.push('\n');
                for vertex in triangle {
                    out.push_str(vertex);
                    out.push('\n');
                }
            }
        }
        out.push_str("end\n");
        out
    }

    /// Texture coordinates of each triangle's vertices.
    pub fn uv_triangles(&self) -> impl Iterator<Item = [(f32, f32); 3]> + '_ {
        self.groups
            .iter()
            .flat_map(|group| group.vertices.chunks_exact(3))
            .filter_map(|triangle| {
                let uvs: Vec<(f32, f32)> = triangle.iter().filter_map(|v| vertex_uv(v)).collect();
                uvs.try_into().ok()
            })
    }
}

/// `u v` are the eighth and ninth fields of a vertex line.
fn vertex_uv(vertex: &str) -> Option<(f32, f32)> {
    let mut fields = vertex.split_whitespace().skip(7);
    let u = fields.next()?.parse().ok()?;
    let v = fields.next()?.parse().ok()?;
    Some((u, v))
}

/// Combine replacement triangles with the original skeleton and material names.
///
/// The replacement's groups are relabelled positionally with the original's material
/// names; surplus groups reuse the original's last name.
pub fn merge(original: &SmdFile, replacement: &SmdFile) -> SmdFile {
    let pick = |ours: &[String], theirs: &[String], what: &str| {
        if ours.is_empty() && !theirs.is_empty() {
            warn!("original geometry has no {what}, using the replacement's");
            theirs.to_vec()
        } else {
            ours.to_vec()
        }
    };

    let materials: Vec<&str> = original.groups.iter().map(|g| g.material.as_str()).collect();
    let groups = replacement
        .groups
        .iter()
        .enumerate()
        .map(|(i, group)| TriangleGroup {
            material: materials
                .get(i)
                .or(materials.last())
                .map(|m| m.to_string())
                .unwrap_or_else(|| group.material.clone()),
            vertices: group.vertices.clone(),
        })
        .collect();

    SmdFile {
        version: original.version.clone().or_else(|| replacement.version.clone()),
        nodes: pick(&original.nodes, &replacement.nodes, "nodes"),
        skeleton: pick(&original.skeleton, &replacement.skeleton, "skeleton"),
        groups,
    }
}

/// Merge the file at `user_path` into the geometry of `original_path`, writing `output_path`.
pub fn merge_geometry(user_path: &Path, original_path: &Path, output_path: &Path) -> Result<(), SmdError> {
    let load_populated = |path: &Path| -> Result<SmdFile, SmdError> {
        let smd = SmdFile::load(path)?;
        if smd.groups.is_empty() {
            return Err(SmdError::NoTriangles(path.to_owned()));
        }
        Ok(smd)
    };
    let original = load_populated(original_path)?;
    let replacement = load_populated(user_path)?;

    let merged = merge(&original, &replacement);
    std::fs::write(output_path, merged.to_text()).map_err(|err| SmdError::Io {
        path: output_path.to_owned(),
        err,
    })?;
    info!(
        "merged {} replacement triangles in {} groups into {}",
        merged.triangle_count(),
        merged.groups.len(),
        output_path.display()
    );
    Ok(())
}

const NON_REFERENCE_MARKERS: &[&str] = &["phy", "physics", "anim", "idle", "ragdoll", "_lod"];

/// Locate the decompiled reference mesh for `weapon_key`.
///
/// Tries `<key>_reference.smd` and `<key>.smd`, then any file naming both "reference" and
/// the key, then any geometry naming the key that is not physics or animation data.
pub fn find_reference_geometry(decompile_dir: &Path, weapon_key: &str) -> Option<PathBuf> {
    for name in [format!("{weapon_key}_reference.smd"), format!("{weapon_key}.smd")] {
        if let Some(found) = find_file_recursive(decompile_dir, &name) {
            return Some(found);
        }
    }

    let key = weapon_key.to_ascii_lowercase();
    let smd_files: Vec<(String, PathBuf)> = WalkDir::new(decompile_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_ascii_lowercase();
            name.ends_with(".smd").then(|| (name, entry.into_path()))
        })
        .sorted()
        .collect();

    smd_files
        .iter()
        .find(|(name, _)| name.contains("reference") && name.contains(&key))
        .or_else(|| {
            smd_files.iter().find(|(name, _)| {
                name.contains(&key) && !NON_REFERENCE_MARKERS.iter().any(|m| name.contains(m))
            })
        })
        .map(|(_, path)| path.clone())
}

fn draw_line(image: &mut RgbaImage, from: (i64, i64), to: (i64, i64), color: Rgba<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
            image.put_pixel(x as u32, y as u32, color);
        }
        if (x, y) == to {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Rasterise triangle edges in texture space: white lines on a transparent background.
pub fn render_uv_layout(smd: &SmdFile, width: u32, height: u32) -> RgbaImage {
    let mut image = RgbaImage::new(width, height);
    let white = Rgba([255, 255, 255, 255]);
    let to_pixel = |(u, v): (f32, f32)| {
        let x = (u.clamp(0.0, 1.0) * (width.saturating_sub(1)) as f32).round() as i64;
        let y = ((1.0 - v.clamp(0.0, 1.0)) * (height.saturating_sub(1)) as f32).round() as i64;
        (x, y)
    };
    for triangle in smd.uv_triangles() {
        let points = triangle.map(&to_pixel);
        for i in 0..3 {
            draw_line(&mut image, points[i], points[(i + 1) % 3], white);
        }
    }
    image
}

/// Write the UV layout of `smd_path` as a PNG.
pub fn write_uv_preview(smd_path: &Path, output_path: &Path, width: u32, height: u32) -> Result<(), SmdError> {
    let smd = SmdFile::load(smd_path)?;
    let image = render_uv_layout(&smd, width, height);
    let file = File::create(output_path).map_err(|err| SmdError::Io {
        path: output_path.to_owned(),
        err,
    })?;
    PngEncoder::new(BufWriter::new(file)).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgba8,
    )?;
    debug!("wrote UV preview {}", output_path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn smd_with_groups(materials: &[&str], offset: u32) -> String {
        let mut text = String::from("version 1\nnodes\n  0 \"root\" -1\nend\nskeleton\ntime 0\n  0 0 0 0 0 0 0\nend\ntriangles\n");
        for (i, material) in materials.iter().enumerate() {
            let n = i as u32 + offset;
            text.push_str(&format!("{material}\n"));
            text.push_str(&format!("0 {n} 0 0 0 0 1 0 0\n0 {n} 1 0 0 0 1 1 0\n0 {n} 0 1 0 0 1 0 1\n"));
        }
        text.push_str("end\n");
        text
    }

    #[test]
    fn groups_triangles_by_material() {
        let text = "version 1\nnodes\n0 \"root\" -1\nend\nskeleton\ntime 0\n0 0 0 0 0 0 0\nend\ntriangles\na\n0 0 0 0 0 0 1 0 0\n0 1 0 0 0 0 1 1 0\n0 0 1 0 0 0 1 0 1\nb\n0 0 0 0 0 0 1 0 0\n0 1 0 0 0 0 1 1 0\n0 0 1 0 0 0 1 0 1\na\n0 0 0 0 0 0 1 0 0\n0 1 0 0 0 0 1 1 0\n0 0 1 0 0 0 1 0 1\nend\n";
        let smd = SmdFile::parse(text).unwrap();
        assert_eq!(smd.version.as_deref(), Some("version 1"));
        assert_eq!(smd.nodes, vec!["0 \"root\" -1"]);
        assert_eq!(smd.groups.len(), 2);
        assert_eq!(smd.groups[0].material, "a");
        assert_eq!(smd.groups[0].triangle_count(), 2);
        assert_eq!(smd.triangle_count(), 3);

        let reparsed = SmdFile::parse(&smd.to_text()).unwrap();
        assert_eq!(reparsed, smd);
    }

    #[test]
    fn surplus_groups_reuse_last_original_material() {
        let original = SmdFile::parse(&smd_with_groups(&["skin_a", "skin_b"], 0)).unwrap();
        let user = SmdFile::parse(&smd_with_groups(&["x", "y", "z"], 10)).unwrap();
        let merged = merge(&original, &user);
        let materials: Vec<&str> = merged.groups.iter().map(|g| g.material.as_str()).collect();
        assert_eq!(materials, vec!["skin_a", "skin_b", "skin_b"]);
        assert_eq!(merged.groups[2].vertices, user.groups[2].vertices);
        assert_eq!(merged.nodes, original.nodes);
        assert_eq!(merged.skeleton, original.skeleton);
    }

    #[test]
    fn merge_geometry_rejects_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("orig.smd");
        let user = dir.path().join("user.smd");
        std::fs::write(&original, smd_with_groups(&["skin"], 0)).unwrap();
        std::fs::write(&user, "version 1\nnodes\nend\nskeleton\nend\ntriangles\nend\n").unwrap();
        let out = dir.path().join("out.smd");
        assert!(matches!(
            merge_geometry(&user, &original, &out),
            Err(SmdError::NoTriangles(_))
        ));

        std::fs::write(&user, smd_with_groups(&["a", "b"], 5)).unwrap();
        merge_geometry(&user, &original, &out).unwrap();
        let merged = SmdFile::load(&out).unwrap();
        assert!(merged.groups.iter().all(|g| g.material == "skin"));
    }

    #[test]
    fn truncated_triangle_is_an_error() {
        let err = SmdFile::parse("triangles\nmat\n0 0 0 0 0 0 1 0 0\nend\n").unwrap_err();
        assert!(matches!(err, SmdError::TruncatedTriangle { line: 2 }));
    }

    #[test]
    fn finds_reference_geometry() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c_foo_physics.smd", "c_foo_anims.smd", "c_foo_model.smd"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        assert_eq!(
            find_reference_geometry(dir.path(), "c_foo"),
            Some(dir.path().join("c_foo_model.smd"))
        );
        std::fs::write(dir.path().join("c_foo_ReferenceMesh.smd"), "").unwrap();
        assert_eq!(
            find_reference_geometry(dir.path(), "c_foo"),
            Some(dir.path().join("c_foo_ReferenceMesh.smd"))
        );
        std::fs::write(dir.path().join("c_foo_reference.smd"), "").unwrap();
        assert_eq!(
            find_reference_geometry(dir.path(), "c_foo"),
            Some(dir.path().join("c_foo_reference.smd"))
        );
        assert_eq!(find_reference_geometry(dir.path(), "c_bar"), None);
    }

    #[test]
    fn uv_layout_draws_edges() {
        let smd = SmdFile::parse(&smd_with_groups(&["skin"], 0)).unwrap();
        let image = render_uv_layout(&smd, 16, 16);
        // (u, v) = (0, 0) maps to the bottom-left corner.
        assert_eq!(image.get_pixel(0, 15).0, [255, 255, 255, 255]);
        assert_eq!(image.get_pixel(15, 15).0, [255, 255, 255, 255]);
        assert_eq!(image.get_pixel(15, 0).0[3], 0);
    }
}
