//! Model description (`.qc`) files as produced by the decompiler.
//!
//! The file is parsed into an ordered list of nodes: `$directives`, each owning the
//! brace block that follows it (if any), and verbatim text in between. Patching works
//! on that list, so nested braces inside a block never need re-scanning.
//!
//! ```text
//! $modelname "weapons\c_models\c_foo\c_foo.mdl"
//! $cdmaterials "models\weapons\c_items\"
//! $texturegroup "skinfamilies"
//! {
//!     { "c_foo"      }
//!     { "c_foo_gold" }
//! }
//! $lod 1
//! {
//!     replacemodel "c_foo_reference" "c_foo_lod1"
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum QcError {
    #[error("could not access {}: {err}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("unbalanced braces in block starting at line {line}")]
    UnbalancedBraces { line: usize },
    #[error("no {0} directive found")]
    MissingDirective(&'static str),
}

pub const CDMATERIALS: &str = "cdmaterials";
pub const MODELNAME: &str = "modelname";
pub const TEXTUREGROUP: &str = "texturegroup";
/// Directives that introduce a level-of-detail block.
pub const LOD_MARKERS: &[&str] = &["lod", "shadowlod"];

static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]*)""#).unwrap());
static LOD_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)_lod\d+\.(smd|dmx)$").unwrap());

/// A `$directive` line plus the brace block that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcDirective {
    /// Lowercase name without the `$`.
    pub name: String,
    /// Source lines: the header first, then the block (if any) through its closing brace.
    pub lines: Vec<String>,
    /// 1-based line number of the header in the parsed text.
    pub line_number: usize,
}

impl QcDirective {
    pub fn header(&self) -> &str {
        &self.lines[0]
    }

    pub fn has_block(&self) -> bool {
        self.lines.len() > 1 || self.header().contains('{')
    }

    /// First argument of the header: a quoted string, or a bare token.
    pub fn argument(&self) -> Option<&str> {
        let header = self.header().trim_start();
        let after_name = header
            .strip_prefix('$')?
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_')
            .trim_start();
        if let Some(quoted) = after_name.strip_prefix('"') {
            return quoted.split_once('"').map(|(value, _)| value);
        }
        let token = after_name
            .split(|c: char| c.is_whitespace() || c == '{')
            .next()
            .unwrap_or_default();
        (!token.is_empty() && !token.starts_with("//")).then_some(token)
    }

    /// Every quoted string inside the block body, in order. The header is excluded.
    pub fn body_strings(&self) -> Vec<&str> {
        let header_has_brace = self.header().contains('{');
        let body: Vec<&str> = if header_has_brace {
            let header = self.header();
            let after_brace = header.find('{').map(|i| &header[i..]).unwrap_or_default();
            std::iter::once(after_brace)
                .chain(self.lines[1..].iter().map(String::as_str))
                .collect()
        } else {
            self.lines[1..].iter().map(String::as_str).collect()
        };
        body.into_iter()
            .flat_map(|line| QUOTED.captures_iter(line))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QcNode {
    Directive(QcDirective),
    /// Comments, blank lines and anything else, kept verbatim.
    Text(String),
}

impl QcNode {
    fn is_blank(&self) -> bool {
        matches!(self, QcNode::Text(line) if line.trim().is_empty())
    }

    fn directive(&self, name: &str) -> Option<&QcDirective> {
        match self {
            QcNode::Directive(d) if d.name == name => Some(d),
            _ => None,
        }
    }
}

/// Counts `{` and `}` outside of quoted strings and `//` comments.
fn brace_delta(line: &str) -> (usize, usize) {
    let (mut opens, mut closes) = (0, 0);
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '/' if !in_quotes && chars.peek() == Some(&'/') => break,
            '{' if !in_quotes => opens += 1,
            '}' if !in_quotes => closes += 1,
            _ => {}
        }
    }
    (opens, closes)
}

fn directive_name(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix('$')?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then(|| name.to_ascii_lowercase())
}

/// A parsed model description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcDocument {
    pub nodes: Vec<QcNode>,
    crlf: bool,
}

impl QcDocument {
    pub fn parse(text: &str) -> Result<Self, QcError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut nodes = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            let Some(name) = directive_name(line) else {
                nodes.push(QcNode::Text(line.to_string()));
                i += 1;
                continue;
            };

            let line_number = i + 1;
            let mut block = vec![line.to_string()];
            let (opens, closes) = brace_delta(line);
            let mut depth = opens as isize - closes as isize;
            i += 1;

            // The opening brace may sit alone on the next line.
            if opens == 0 && lines.get(i).is_some_and(|next| next.trim_start().starts_with('{')) {
                let (o, c) = brace_delta(lines[i]);
                depth = o as isize - c as isize;
                block.push(lines[i].to_string());
                i += 1;
            }

            while depth > 0 {
                let Some(next) = lines.get(i) else {
                    return Err(QcError::UnbalancedBraces { line: line_number });
                };
                let (o, c) = brace_delta(next);
                depth += o as isize - c as isize;
                block.push(next.to_string());
                i += 1;
            }

            nodes.push(QcNode::Directive(QcDirective {
                name,
                lines: block,
                line_number,
            }));
        }

        Ok(Self {
            nodes,
            crlf: text.contains("\r\n"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, QcError> {
        let text = std::fs::read_to_string(path).map_err(|err| QcError::Io {
            path: path.to_owned(),
            err,
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), QcError> {
        std::fs::write(path, self.to_string()).map_err(|err| QcError::Io {
            path: path.to_owned(),
            err,
        })
    }

    pub fn directives<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a QcDirective> + 'a {
        self.nodes.iter().filter_map(move |node| node.directive(name))
    }

    /// First `$cdmaterials` with a non-empty path.
    pub fn material_search_path(&self) -> Option<&str> {
        self.directives(CDMATERIALS)
            .filter_map(QcDirective::argument)
            .find(|path| !path.trim().is_empty())
    }

    /// Argument of `$modelname`: where the compiler writes its output.
    pub fn output_model_path(&self) -> Option<&str> {
        self.directives(MODELNAME).find_map(QcDirective::argument)
    }

    /// The skin name without a cosmetic suffix, or the first skin if every name has one.
    pub fn canonical_texture_name<S: AsRef<str>>(&self, cosmetic_suffixes: &[S]) -> Option<&str> {
        let group = self.directives(TEXTUREGROUP).find(|d| d.has_block())?;
        let names = group.body_strings();
        let is_cosmetic = |name: &str| {
            let lower = name.to_ascii_lowercase();
            cosmetic_suffixes
                .iter()
                .any(|suffix| lower.ends_with(&suffix.as_ref().to_ascii_lowercase()))
        };
        names
            .iter()
            .copied()
            .find(|name| !is_cosmetic(name))
            .or_else(|| names.first().copied())
    }

    /// Remove every LOD block and a single blank line following each.
    pub fn remove_lod_blocks(&mut self) -> usize {
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.nodes.len());
        let mut skip_blank = false;
        for node in self.nodes.drain(..) {
            if skip_blank {
                skip_blank = false;
                if node.is_blank() {
                    continue;
                }
            }
            if let QcNode::Directive(d) = &node {
                if LOD_MARKERS.contains(&d.name.as_str()) {
                    debug!("removing ${} block at line {}", d.name, d.line_number);
                    removed += 1;
                    skip_blank = true;
                    continue;
                }
            }
            kept.push(node);
        }
        self.nodes = kept;
        removed
    }

    /// Prefix every non-empty `$cdmaterials` path and leave exactly one empty directive.
    ///
    /// The empty directive goes right after the last non-empty one. If there are only
    /// empty directives, the first of them is kept in place. Returns the number of
    /// non-empty directives.
    pub fn patch_material_search_paths(&mut self, prefix: &str) -> Result<usize, QcError> {
        let is_empty_cd = |node: &QcNode| {
            node.directive(CDMATERIALS)
                .is_some_and(|d| d.argument().is_none_or(|arg| arg.trim().is_empty()))
        };
        let is_filled_cd = |node: &QcNode| node.directive(CDMATERIALS).is_some() && !is_empty_cd(node);

        let filled = self.nodes.iter().filter(|n| is_filled_cd(n)).count();
        let last_filled = self.nodes.iter().rposition(is_filled_cd);
        let first_empty = self.nodes.iter().position(is_empty_cd);
        if last_filled.is_none() && first_empty.is_none() {
            return Err(QcError::MissingDirective("$cdmaterials"));
        }

        let mut patched = Vec::with_capacity(self.nodes.len() + 1);
        for (index, node) in self.nodes.drain(..).enumerate() {
            if is_empty_cd(&node) {
                if last_filled.is_none() && Some(index) == first_empty {
                    patched.push(node);
                }
                continue;
            }
            match node {
                QcNode::Directive(mut d) if d.name == CDMATERIALS => {
                    let path = d.argument().unwrap_or_default().to_string();
                    let indent: String = d.header().chars().take_while(|c| c.is_whitespace()).collect();
                    let keyword = d.header().trim_start().split_whitespace().next().unwrap_or("$cdmaterials").to_string();
                    d.lines[0] = format!("{indent}{keyword} \"{}\"", with_prefix(prefix, &path));
                    let empty = QcDirective {
                        name: CDMATERIALS.to_string(),
                        lines: vec![format!("{indent}{keyword} \"\"")],
                        line_number: d.line_number,
                    };
                    patched.push(QcNode::Directive(d));
                    if Some(index) == last_filled {
                        patched.push(QcNode::Directive(empty));
                    }
                }
                other => patched.push(other),
            }
        }
        self.nodes = patched;
        Ok(filled)
    }
}

impl fmt::Display for QcDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let newline = if self.crlf { "\r\n" } else { "\n" };
        for node in &self.nodes {
            match node {
                QcNode::Text(line) => write!(f, "{line}{newline}")?,
                QcNode::Directive(d) => {
                    for line in &d.lines {
                        write!(f, "{line}{newline}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Prepend `prefix` unless `path` already starts with it (ignoring case and slash style).
pub fn with_prefix(prefix: &str, path: &str) -> String {
    let normalize = |s: &str| s.replace('/', "\\").to_ascii_lowercase();
    if normalize(path).starts_with(&normalize(prefix)) {
        path.to_string()
    } else {
        format!("{prefix}{path}")
    }
}

pub fn extract_material_search_path(qc_path: &Path) -> Result<Option<String>, QcError> {
    Ok(QcDocument::load(qc_path)?.material_search_path().map(str::to_string))
}

pub fn extract_output_model_path(qc_path: &Path) -> Result<Option<String>, QcError> {
    Ok(QcDocument::load(qc_path)?.output_model_path().map(str::to_string))
}

pub fn extract_canonical_texture_name<S: AsRef<str>>(
    qc_path: &Path,
    cosmetic_suffixes: &[S],
) -> Result<Option<String>, QcError> {
    Ok(QcDocument::load(qc_path)?
        .canonical_texture_name(cosmetic_suffixes)
        .map(str::to_string))
}

/// What [`patch_description`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSummary {
    pub lod_blocks_removed: usize,
    pub material_paths_rewritten: usize,
}

/// Strip LOD blocks and prefix the material search paths, rewriting the file in place.
pub fn patch_description(qc_path: &Path, prefix: &str) -> Result<PatchSummary, QcError> {
    let mut doc = QcDocument::load(qc_path)?;
    let lod_blocks_removed = doc.remove_lod_blocks();
    let material_paths_rewritten = doc.patch_material_search_paths(prefix)?;
    doc.save(qc_path)?;
    info!(
        "patched {}: {lod_blocks_removed} LOD blocks removed, {material_paths_rewritten} material paths prefixed",
        qc_path.display()
    );
    Ok(PatchSummary {
        lod_blocks_removed,
        material_paths_rewritten,
    })
}

/// Delete the per-LOD geometry files the decompiler writes next to the description.
pub fn remove_lod_files(decompile_dir: &Path) -> Result<Vec<PathBuf>, QcError> {
    let lod_files: Vec<PathBuf> = WalkDir::new(decompile_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| LOD_FILE.is_match(name))
        })
        .map(|entry| entry.into_path())
        .collect();
    for path in &lod_files {
        std::fs::remove_file(path).map_err(|err| QcError::Io {
            path: path.clone(),
            err,
        })?;
        debug!("removed {}", path.display());
    }
    Ok(lod_files)
}

#[cfg(test)]
mod test {
    use super::*;

    const SUFFIXES: &[&str] = &["_gold", "_xmas", "_festive"];

    fn cdmaterials_lines(doc: &QcDocument) -> Vec<String> {
        doc.directives(CDMATERIALS).map(|d| d.header().trim().to_string()).collect()
    }

    fn patched(text: &str) -> QcDocument {
        let mut doc = QcDocument::parse(text).unwrap();
        doc.patch_material_search_paths("tf2skin\\").unwrap();
        doc
    }

    #[test]
    fn single_material_path_gets_prefix_and_trailing_empty() {
        let doc = patched("$modelname \"a.mdl\"\n$cdmaterials \"models\\weapons\\\"\n$cdmaterials \"\"\n$surfaceprop metal\n");
        assert_eq!(
            cdmaterials_lines(&doc),
            vec!["$cdmaterials \"tf2skin\\models\\weapons\\\"", "$cdmaterials \"\""]
        );
        assert!(doc.to_string().ends_with("$cdmaterials \"\"\n$surfaceprop metal\n"));
    }

    #[test]
    fn three_material_paths_leave_one_empty_last() {
        let text = "$cdmaterials \"\"\n$cdmaterials \"a\\\"\n$cdmaterials \"\"\n$cdmaterials \"b\\\"\n$body x \"x.smd\"\n$cdmaterials \"c\\\"\n$sequence idle \"x.smd\"\n";
        let doc = patched(text);
        assert_eq!(
            cdmaterials_lines(&doc),
            vec![
                "$cdmaterials \"tf2skin\\a\\\"",
                "$cdmaterials \"tf2skin\\b\\\"",
                "$cdmaterials \"tf2skin\\c\\\"",
                "$cdmaterials \"\"",
            ]
        );
        // The empty directive directly follows the last rewritten one.
        let rendered = doc.to_string();
        assert!(rendered.contains("$cdmaterials \"tf2skin\\c\\\"\n$cdmaterials \"\"\n$sequence"));
    }

    #[test]
    fn only_empty_material_paths_keep_one() {
        let doc = patched("$cdmaterials \"\"\n$modelname \"a.mdl\"\n$cdmaterials \"\"\n");
        assert_eq!(cdmaterials_lines(&doc), vec!["$cdmaterials \"\""]);
        assert!(doc.to_string().starts_with("$cdmaterials \"\"\n$modelname"));
    }

    #[test]
    fn missing_material_path_is_an_error() {
        let mut doc = QcDocument::parse("$modelname \"a.mdl\"\n").unwrap();
        assert!(matches!(
            doc.patch_material_search_paths("tf2skin\\"),
            Err(QcError::MissingDirective(_))
        ));
    }

    #[test]
    fn prefix_is_not_doubled() {
        let once = patched("$cdmaterials \"models\\weapons\\\"\n");
        let twice = patched(&once.to_string());
        assert_eq!(once, twice);
        assert_eq!(
            with_prefix("tf2skin\\", "TF2SKIN/models/"),
            "TF2SKIN/models/".to_string()
        );
    }

    #[test]
    fn lod_blocks_are_removed_with_nested_braces() {
        let text = "\
$modelname \"a.mdl\"
$lod 1
{
\treplacemodel \"a_ref\" \"a_lod1\"
}

$body body \"a_ref.smd\"
$lod 2 {
\treplacemodel \"a_ref\" \"a_lod2\"
\t{ nested { deeper } }
}
$shadowlod
{
\treplacemodel \"a_ref\" \"a_lod3\"
}
$sequence idle \"idle.smd\" {
\tfps 30
}
";
        let mut doc = QcDocument::parse(text).unwrap();
        assert_eq!(doc.remove_lod_blocks(), 3);
        let rendered = doc.to_string();
        assert!(!rendered.contains("lod"));
        assert_eq!(
            rendered,
            "$modelname \"a.mdl\"\n$body body \"a_ref.smd\"\n$sequence idle \"idle.smd\" {\n\tfps 30\n}\n"
        );
    }

    #[test]
    fn unclosed_block_is_reported() {
        let err = QcDocument::parse("$lod 1\n{\n replacemodel a b\n").unwrap_err();
        assert!(matches!(err, QcError::UnbalancedBraces { line: 1 }));
    }

    #[test]
    fn canonical_texture_name_skips_cosmetic_variants() {
        let doc = QcDocument::parse(
            "$texturegroup \"skinfamilies\"\n{\n\t{ \"c_foo\" }\n\t{ \"c_foo_gold\" }\n\t{ \"c_foo_xmas\" }\n}\n",
        )
        .unwrap();
        assert_eq!(doc.canonical_texture_name(SUFFIXES), Some("c_foo"));

        let doc = QcDocument::parse(
            "$texturegroup \"skinfamilies\"\n{\n\t{ \"c_foo_xmas\" }\n\t{ \"c_foo\" }\n}\n",
        )
        .unwrap();
        assert_eq!(doc.canonical_texture_name(SUFFIXES), Some("c_foo"));

        let doc =
            QcDocument::parse("$texturegroup \"skinfamilies\"\n{\n\t{ \"c_foo_gold\" }\n}\n").unwrap();
        assert_eq!(doc.canonical_texture_name(SUFFIXES), Some("c_foo_gold"));
    }

    #[test]
    fn reads_model_and_material_paths() {
        let doc = QcDocument::parse(
            "// decompiled\n$ModelName \"weapons\\c_models\\c_foo\\c_foo.mdl\"\n$cdmaterials \"\"\n$cdmaterials \"models\\weapons\\c_items\\\"\n",
        )
        .unwrap();
        assert_eq!(
            doc.output_model_path(),
            Some("weapons\\c_models\\c_foo\\c_foo.mdl")
        );
        assert_eq!(doc.material_search_path(), Some("models\\weapons\\c_items\\"));
    }

    #[test]
    fn patch_file_in_place_and_remove_lod_files() {
        let dir = tempfile::tempdir().unwrap();
        let qc = dir.path().join("c_foo.qc");
        std::fs::write(
            &qc,
            "$modelname \"c_foo.mdl\"\r\n$cdmaterials \"models\\\"\r\n$lod 1\r\n{\r\n}\r\n",
        )
        .unwrap();
        for name in ["c_foo_reference.smd", "c_foo_lod1.smd", "c_foo_LOD2.smd", "c_foo_physics.smd"] {
            std::fs::write(dir.path().join(name), "version 1\n").unwrap();
        }

        let summary = patch_description(&qc, "tf2skin\\").unwrap();
        assert_eq!(summary.lod_blocks_removed, 1);
        assert_eq!(summary.material_paths_rewritten, 1);
        assert_eq!(
            std::fs::read_to_string(&qc).unwrap(),
            "$modelname \"c_foo.mdl\"\r\n$cdmaterials \"tf2skin\\models\\\"\r\n$cdmaterials \"\"\r\n"
        );

        let removed = remove_lod_files(dir.path()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("c_foo_reference.smd").exists());
        assert!(dir.path().join("c_foo_physics.smd").exists());
    }

    #[test]
    fn extracts_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let qc = dir.path().join("c_foo.qc");
        std::fs::write(
            &qc,
            "$modelname \"weapons\\c_foo.mdl\"\n$cdmaterials \"\"\n$cdmaterials \"models\\\"\n$texturegroup \"skinfamilies\"\n{\n\t{ \"c_foo_xmas\" }\n\t{ \"c_foo\" }\n}\n",
        )
        .unwrap();

        assert_eq!(extract_material_search_path(&qc).unwrap().as_deref(), Some("models\\"));
        assert_eq!(extract_output_model_path(&qc).unwrap().as_deref(), Some("weapons\\c_foo.mdl"));
        assert_eq!(
            extract_canonical_texture_name(&qc, SUFFIXES).unwrap().as_deref(),
            Some("c_foo")
        );
        assert!(extract_output_model_path(&dir.path().join("missing.qc")).is_err());
    }
}
