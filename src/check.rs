// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Store consistency checking.
//!
//! The patch store is plain files under version control, so it is routinely
//! hand-edited and drift between the series manifest and the file set is an
//! expected condition, not a corruption. The check itself never mutates
//! anything; running it twice yields the same report.

use crate::{
    series::{SeriesManifest, Violation},
    store::{PatchStore, Result, StoreDiff},
};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Outcome of one consistency check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Manifest entries with no backing patch file. Fatal: application of the
    /// series would fail partway through.
    pub missing: Vec<crate::series::PatchId>,

    /// Patch files no manifest entry references. Advisory: nothing will break,
    /// the files are just dead weight.
    pub orphaned: Vec<String>,

    /// Structural problems with the manifest itself.
    pub violations: Vec<Violation>,
}

impl Report {
    /// Check whether the report describes a store that cannot be applied.
    pub fn is_fatal(&self) -> bool {
        !self.missing.is_empty() || !self.violations.is_empty()
    }

    /// Check whether the store is fully consistent.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.violations.is_empty()
    }
}

impl Display for Report {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if self.is_clean() {
            return writeln!(fmt, "patch store is consistent");
        }

        for violation in &self.violations {
            writeln!(fmt, "invalid: {violation}")?;
        }
        for id in &self.missing {
            writeln!(fmt, "missing: {id} is in the series but has no patch file")?;
        }
        for file in &self.orphaned {
            writeln!(fmt, "orphaned: {file} exists but is not in the series")?;
        }

        Ok(())
    }
}

/// Cross-check a manifest against the store's on-disk file set.
///
/// # Errors
///
/// Only infrastructure failures (unreadable store) surface as errors;
/// inconsistency is data, reported through [`Report`].
pub fn check(manifest: &SeriesManifest, store: &PatchStore) -> Result<Report> {
    let StoreDiff { missing, orphaned } = store.diff_against_manifest(manifest)?;

    Ok(Report {
        missing,
        orphaned,
        violations: manifest.validate(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::PatchId;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn id(name: &str) -> PatchId {
        PatchId::new(name).unwrap()
    }

    #[sealed_test]
    fn clean_store_reports_clean() {
        let store = PatchStore::init("store").unwrap();
        let mut manifest = SeriesManifest::new();
        manifest.insert_after(None, id("fix.patch")).unwrap();
        store.write_patch(&id("fix.patch"), b"content").unwrap();

        let report = check(&manifest, &store).unwrap();
        assert!(report.is_clean());
        assert!(!report.is_fatal());
    }

    #[sealed_test]
    fn missing_backing_file_is_fatal() {
        let store = PatchStore::init("store").unwrap();
        let mut manifest = SeriesManifest::new();
        manifest.insert_after(None, id("ghost.patch")).unwrap();

        let report = check(&manifest, &store).unwrap();
        assert_eq!(report.missing, vec![id("ghost.patch")]);
        assert!(report.is_fatal());
    }

    #[sealed_test]
    fn orphaned_file_is_advisory() {
        let store = PatchStore::init("store").unwrap();
        store.write_patch(&id("stray.patch"), b"stray").unwrap();

        let report = check(&SeriesManifest::new(), &store).unwrap();
        assert_eq!(report.orphaned, vec!["stray.patch".to_owned()]);
        assert!(!report.is_fatal());
        assert!(!report.is_clean());
    }

    #[sealed_test]
    fn check_is_idempotent() {
        let store = PatchStore::init("store").unwrap();
        store.write_patch(&id("stray.patch"), b"stray").unwrap();
        let manifest = SeriesManifest::new();

        let first = check(&manifest, &store).unwrap();
        let second = check(&manifest, &store).unwrap();
        assert_eq!(first, second);
    }
}
