//! Dependency manifest parsing.
//!
//! A manifest holds one package constraint per line:
//! `name[extra,...] (op version, ...) ; marker`. Comments and blank lines
//! are skipped; option lines (`-r base.txt`, `--index-url ...`) are kept
//! verbatim but not treated as packages. Lines that fit neither shape are
//! kept as unrecognized rather than rejected, since the installer owns the
//! format.
//!
//! Cache keys always use the raw bytes; the parsed form feeds diagnostics
//! and the linter.

use std::fmt;
use std::path::Path;

use strata_core::error::{Result, StrataError};

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    /// `===`
    Arbitrary,
    /// `==`
    Eq,
    /// `~=`
    Compatible,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
}

impl ConstraintOp {
    /// Longest operators first so `===` never parses as `==`.
    const ALL: [(&'static str, ConstraintOp); 8] = [
        ("===", ConstraintOp::Arbitrary),
        ("==", ConstraintOp::Eq),
        ("~=", ConstraintOp::Compatible),
        ("!=", ConstraintOp::Ne),
        (">=", ConstraintOp::Ge),
        ("<=", ConstraintOp::Le),
        (">", ConstraintOp::Gt),
        ("<", ConstraintOp::Lt),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintOp::Arbitrary => "===",
            ConstraintOp::Eq => "==",
            ConstraintOp::Compatible => "~=",
            ConstraintOp::Ne => "!=",
            ConstraintOp::Ge => ">=",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Lt => "<",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: String,
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// One declared package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub constraints: Vec<VersionConstraint>,
    /// Environment marker after `;`, unparsed
    pub marker: Option<String>,
    /// 1-based line in the manifest
    pub line: usize,
}

impl Requirement {
    /// Whether the requirement names exactly one version.
    pub fn is_pinned(&self) -> bool {
        self.constraints.iter().any(|c| {
            matches!(c.op, ConstraintOp::Eq | ConstraintOp::Arbitrary) && !c.version.contains('*')
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", constraints.join(","))
    }
}

/// A parsed dependency manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    raw: Vec<u8>,
    pub requirements: Vec<Requirement>,
    /// Installer option lines, verbatim
    pub options: Vec<String>,
    /// (line, text) of lines that are neither packages nor options
    pub unrecognized: Vec<(usize, String)>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            StrataError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::from_bytes(raw))
    }

    pub fn from_bytes(raw: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&raw).into_owned();
        let mut manifest = Manifest {
            raw,
            ..Default::default()
        };

        for (idx, line) in text.lines().enumerate() {
            let line_num = idx + 1;
            let content = strip_comment(line).trim();
            if content.is_empty() {
                continue;
            }
            if content.starts_with('-') {
                manifest.options.push(content.to_string());
                continue;
            }
            match parse_requirement(content, line_num) {
                Some(req) => manifest.requirements.push(req),
                None => manifest
                    .unrecognized
                    .push((line_num, content.to_string())),
            }
        }

        manifest
    }

    /// Raw manifest bytes, as hashed into cache keys.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Requirements that do not pin a single version.
    pub fn floating(&self) -> Vec<&Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned()).collect()
    }

    /// First requirement whose name appears in `text`, case-insensitively.
    pub fn find_mentioned(&self, text: &str) -> Option<&Requirement> {
        let haystack = text.to_lowercase();
        self.requirements
            .iter()
            .find(|r| haystack.contains(&r.name.to_lowercase()))
    }
}

/// `#` starts a comment at line start or after whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn parse_requirement(content: &str, line: usize) -> Option<Requirement> {
    let (spec, marker) = match content.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
        None => (content, None),
    };

    let name_end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    let name = &spec[..name_end];
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return None;
    }

    let mut rest = spec[name_end..].trim_start();
    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']')?;
        extras = after[..close]
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        rest = after[close + 1..].trim_start();
    }

    let rest = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(rest)
        .trim();

    let mut constraints = Vec::new();
    if !rest.is_empty() {
        for part in rest.split(',') {
            constraints.push(parse_constraint(part.trim())?);
        }
    }

    Some(Requirement {
        name: name.to_string(),
        extras,
        constraints,
        marker: marker.filter(|m| !m.is_empty()),
        line,
    })
}

fn parse_constraint(part: &str) -> Option<VersionConstraint> {
    let (token, op) = ConstraintOp::ALL
        .iter()
        .find(|(token, _)| part.starts_with(token))?;
    let version = part[token.len()..].trim();
    if version.is_empty() || version.contains(char::is_whitespace) {
        return None;
    }
    Some(VersionConstraint {
        op: *op,
        version: version.to_string(),
    })
}
