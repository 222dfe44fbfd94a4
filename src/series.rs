// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Series manifest representation.
//!
//! The __series manifest__ is the ordered, dependency-structured listing of
//! patch identifiers that governs application order. It lives in a plain text
//! file named "series" at the top-level of the patch store, one identifier per
//! line, where indentation encodes nesting:
//!
//! ```text
//! A
//!   B
//!   C
//!     D
//! E
//! ```
//!
//! Here `A` and `E` are independent roots, `B` and `C` depend on `A`, and `D`
//! depends on `C`. Application order is the pre-order traversal of this
//! forest: A, B, C, D, E. A patch is never applied before the patches it is
//! nested under.
//!
//! # Grammar
//!
//! Indentation is always a multiple of two spaces, and a line may be nested at
//! most one level below the line before it. Tabs are rejected. Blank lines are
//! skipped. Anything else is a parse error that names the offending line, and
//! no partial manifest is ever produced from a malformed file.
//!
//! Because the structure is a tree of owned nodes rather than references,
//! cycles are impossible by construction. The only structural hazard left by
//! hand-editing is a duplicated identifier, which both parsing and
//! [`SeriesManifest::validate`] reject.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Number of spaces per nesting level in the series file.
pub const INDENT_UNIT: usize = 2;

/// Unique, filesystem-safe identifier of one patch.
///
/// Identifiers double as store-relative paths of the backing patch files, so
/// only path-safe characters are accepted and path traversal is rejected.
/// Once assigned by the capture pipeline an identifier never changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PatchId(String);

impl PatchId {
    /// Construct a validated patch identifier.
    ///
    /// # Errors
    ///
    /// - Return [`SeriesError::InvalidIdentifier`] if the name is empty,
    ///   contains non-path-safe characters, starts with '/', or contains a
    ///   ".." segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/');

        if name.is_empty()
            || name.starts_with('/')
            || !name.chars().all(safe)
            || name.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(SeriesError::InvalidIdentifier { ident: name });
        }

        Ok(Self(name))
    }

    /// Treat identifier as string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PatchId {
    type Error = SeriesError;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<PatchId> for String {
    fn from(id: PatchId) -> Self {
        id.0
    }
}

impl AsRef<str> for PatchId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for PatchId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

/// One node of the series forest: an identifier plus its dependents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    pub id: PatchId,
    pub children: Vec<PatchEntry>,
}

impl PatchEntry {
    /// Construct a leaf entry.
    pub fn new(id: PatchId) -> Self {
        Self {
            id,
            children: Vec::new(),
        }
    }
}

/// Ordered forest of patch entries.
///
/// # Invariant
///
/// - Every identifier appears exactly once.
/// - Pre-order traversal is the total application order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeriesManifest {
    roots: Vec<PatchEntry>,
}

impl SeriesManifest {
    /// Construct an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-level entries of the forest.
    pub fn roots(&self) -> &[PatchEntry] {
        &self.roots
    }

    /// Identifiers in application order (pre-order traversal).
    pub fn traversal(&self) -> Vec<&PatchId> {
        fn walk<'a>(nodes: &'a [PatchEntry], out: &mut Vec<&'a PatchId>) {
            for node in nodes {
                out.push(&node.id);
                walk(&node.children, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.roots, &mut out);
        out
    }

    /// Total number of entries in the forest.
    pub fn len(&self) -> usize {
        self.traversal().len()
    }

    /// Check whether the manifest holds no entries.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Check whether an identifier is present anywhere in the forest.
    pub fn contains(&self, id: &PatchId) -> bool {
        self.traversal().into_iter().any(|entry| entry == id)
    }

    /// Insert a new entry as the sibling immediately following `anchor`.
    ///
    /// With no anchor the entry becomes the first root, so patches captured
    /// against an unpatched upstream are applied first.
    ///
    /// # Errors
    ///
    /// - Return [`SeriesError::AlreadyInSeries`] if the identifier exists.
    /// - Return [`SeriesError::UnknownAnchor`] if the anchor does not.
    pub fn insert_after(&mut self, anchor: Option<&PatchId>, id: PatchId) -> Result<()> {
        if self.contains(&id) {
            return Err(SeriesError::AlreadyInSeries {
                ident: id.as_str().into(),
            });
        }

        let Some(anchor) = anchor else {
            self.roots.insert(0, PatchEntry::new(id));
            return Ok(());
        };

        fn insert_in(
            nodes: &mut Vec<PatchEntry>,
            anchor: &PatchId,
            entry: &mut Option<PatchEntry>,
        ) -> bool {
            for idx in 0..nodes.len() {
                if nodes[idx].id == *anchor {
                    if let Some(entry) = entry.take() {
                        nodes.insert(idx + 1, entry);
                    }
                    return true;
                }
                if insert_in(&mut nodes[idx].children, anchor, entry) {
                    return true;
                }
            }
            false
        }

        let mut entry = Some(PatchEntry::new(id.clone()));
        if insert_in(&mut self.roots, anchor, &mut entry) {
            Ok(())
        } else {
            Err(SeriesError::UnknownAnchor {
                ident: anchor.as_str().into(),
            })
        }
    }

    /// Remove an entry from the forest.
    ///
    /// Children of the removed entry are spliced into its position so their
    /// relative order, and their ancestry above the removed node, survive.
    /// Returns false if the identifier was not present.
    pub fn remove(&mut self, id: &PatchId) -> bool {
        fn remove_in(nodes: &mut Vec<PatchEntry>, id: &PatchId) -> bool {
            for idx in 0..nodes.len() {
                if nodes[idx].id == *id {
                    let node = nodes.remove(idx);
                    for (offset, child) in node.children.into_iter().enumerate() {
                        nodes.insert(idx + offset, child);
                    }
                    return true;
                }
                if remove_in(&mut nodes[idx].children, id) {
                    return true;
                }
            }
            false
        }

        remove_in(&mut self.roots, id)
    }

    /// Report structural violations of a hand-constructed manifest.
    ///
    /// Parsing already rejects these, but manifests can also be assembled
    /// programmatically, so the same invariants are re-checkable here.
    pub fn validate(&self) -> Vec<Violation> {
        let mut seen = HashSet::new();
        let mut violations = Vec::new();

        for id in self.traversal() {
            if !seen.insert(id.clone()) {
                violations.push(Violation::Duplicate(id.clone()));
            }
        }

        violations
    }
}

impl FromStr for SeriesManifest {
    type Err = SeriesError;

    fn from_str(text: &str) -> Result<Self> {
        fn children_at<'a>(
            roots: &'a mut Vec<PatchEntry>,
            path: &[usize],
        ) -> &'a mut Vec<PatchEntry> {
            let mut list = roots;
            for &idx in path {
                list = &mut list[idx].children;
            }
            list
        }

        let mut roots: Vec<PatchEntry> = Vec::new();
        let mut cursor: Vec<usize> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }

            if raw.starts_with(|c: char| c.is_whitespace() && c != ' ') || raw.contains('\t') {
                return Err(SeriesError::TabIndentation { line });
            }

            let indent = raw.len() - raw.trim_start_matches(' ').len();
            if indent % INDENT_UNIT != 0 {
                return Err(SeriesError::BadIndentation { line, indent });
            }

            let depth = indent / INDENT_UNIT;
            if depth > cursor.len() {
                return Err(SeriesError::IndentationJump { line });
            }

            let ident = raw.trim();
            if !seen.insert(ident.to_owned()) {
                return Err(SeriesError::DuplicateIdentifier {
                    line,
                    ident: ident.to_owned(),
                });
            }

            let id = PatchId::new(ident).map_err(|_| SeriesError::MalformedIdentifier {
                line,
                ident: ident.to_owned(),
            })?;

            let list = children_at(&mut roots, &cursor[..depth]);
            list.push(PatchEntry::new(id));
            let new_idx = list.len() - 1;
            cursor.truncate(depth);
            cursor.push(new_idx);
        }

        Ok(Self { roots })
    }
}

impl Display for SeriesManifest {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fn write_nodes(
            nodes: &[PatchEntry],
            depth: usize,
            fmt: &mut Formatter<'_>,
        ) -> FmtResult {
            for node in nodes {
                writeln!(fmt, "{:indent$}{}", "", node.id, indent = depth * INDENT_UNIT)?;
                write_nodes(&node.children, depth + 1, fmt)?;
            }
            Ok(())
        }

        write_nodes(&self.roots, 0, fmt)
    }
}

/// Structural invariant broken by a programmatically built manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// Identifier appears more than once in the forest.
    Duplicate(PatchId),
}

impl Display for Violation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Duplicate(id) => write!(fmt, "duplicate identifier {id:?}"),
        }
    }
}

/// Series manifest error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SeriesError {
    /// Identifier is empty or not filesystem-safe.
    #[error("identifier {ident:?} is empty or not filesystem-safe")]
    InvalidIdentifier { ident: String },

    /// Series file line holds an unusable identifier.
    #[error("line {line}: identifier {ident:?} is not filesystem-safe")]
    MalformedIdentifier { line: usize, ident: String },

    /// Series file line is indented with tabs.
    #[error("line {line}: series file must be indented with spaces, not tabs")]
    TabIndentation { line: usize },

    /// Series file line indentation is not a multiple of the unit.
    #[error("line {line}: indentation of {indent} is not a multiple of {INDENT_UNIT} spaces")]
    BadIndentation { line: usize, indent: usize },

    /// Series file line is nested more than one level below its parent.
    #[error("line {line}: entry is nested more than one level below its parent")]
    IndentationJump { line: usize },

    /// Series file names the same identifier twice.
    #[error("line {line}: duplicate identifier {ident:?}")]
    DuplicateIdentifier { line: usize, ident: String },

    /// Entry insertion would duplicate an identifier.
    #[error("identifier {ident:?} already exists in the series")]
    AlreadyInSeries { ident: String },

    /// Insertion anchor does not exist in the series.
    #[error("anchor {ident:?} is not in the series")]
    UnknownAnchor { ident: String },
}

/// Friendly result alias :3
pub type Result<T, E = SeriesError> = std::result::Result<T, E>;
