// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch store management and manipulation.
//!
//! The __patch store__ is the directory that owns the series manifest and the
//! patch files it references. It outlives any single working checkout: a
//! checkout can be rolled back to upstream and thrown away without losing
//! patches, because the store is the durable artifact.
//!
//! # Store Layout
//!
//! The series file sits at the store root under the fixed name "series".
//! Patch files live at arbitrary relative paths below the root; by default a
//! patch lands at `<slug>.patch` at the top level, and the capture pipeline
//! can place a batch under a subdirectory prefix. The identifier recorded in
//! the series file _is_ the store-relative path of the patch file, so the
//! whole store state is re-derivable by eye: read the series file, look at
//! the files. No index, no cache.
//!
//! # Store History
//!
//! A store created by [`PatchStore::init`] is itself a git repository. Every
//! save and refresh lands as one commit annotated with a
//! `Patchstack-Based-On` trailer naming the upstream commit the working
//! checkout was sitting on, which makes it possible to answer "what upstream
//! was this patch set valid against?" long after the checkout is gone. A
//! plain directory also works; history recording is then skipped.

use crate::{
    checkout::BASED_ON_TRAILER,
    series::{PatchId, SeriesManifest},
};

use git2::{IndexAddOption, Repository, StatusOptions};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Fixed name of the series manifest file at the store root.
pub const SERIES_FILE: &str = "series";

/// Extension shared by every patch file in the store.
pub const PATCH_EXTENSION: &str = "patch";

/// Disposition of one patch write against the existing file set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteDisposition {
    /// No file existed; a new one was created.
    Added,

    /// A file existed with different bytes and was overwritten.
    Updated,

    /// A file existed with identical bytes; nothing was written.
    Unchanged,
}

/// Drift between the series manifest and the on-disk file set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreDiff {
    /// Entries referenced by the manifest with no backing file. Fatal.
    pub missing: Vec<PatchId>,

    /// Patch files present on disk that no manifest entry references. Warning.
    pub orphaned: Vec<String>,
}

/// Commit metadata recovered from a stored patch's mbox headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchMeta {
    pub summary: String,
    pub author: String,
    pub date: String,
}

/// Counts reported after folding captured patches into the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// A patch store rooted at one directory.
pub struct PatchStore {
    root: PathBuf,
    repo: Option<Repository>,
}

impl PatchStore {
    /// Initialize a new patch store.
    ///
    /// Creates the directory if needed, writes an empty series file, puts the
    /// store under git, and records the initial commit.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::CreateStore`] if the directory cannot be made.
    /// - Return [`StoreError::WriteSeries`] if the series file cannot be
    ///   written.
    /// - Return [`StoreError::Git2`] if repository setup fails.
    #[instrument(skip(path), level = "debug")]
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        info!("initialize patch store at {}", root.display());

        mkdirp::mkdirp(&root).map_err(|err| StoreError::CreateStore {
            source: err,
            path: root.clone(),
        })?;

        let repo = Repository::init(&root)?;

        let series_path = root.join(SERIES_FILE);
        if !series_path.exists() {
            fs::write(&series_path, "").map_err(|err| StoreError::WriteSeries {
                source: err,
                path: series_path.clone(),
            })?;
        }

        let store = Self {
            root,
            repo: Some(repo),
        };
        store.commit("patchstack init", None)?;

        Ok(store)
    }

    /// Open an existing patch store.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Unreadable`] if the root directory is absent.
    /// - Return [`StoreError::MissingSeriesFile`] if no series file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(StoreError::Unreadable { path: root });
        }

        if !root.join(SERIES_FILE).is_file() {
            return Err(StoreError::MissingSeriesFile { path: root });
        }

        let repo = Repository::open(&root).ok();
        if repo.is_none() {
            debug!(
                "patch store {} is not a git repository, history recording disabled",
                root.display()
            );
        }

        Ok(Self { root, repo })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the patch file backing an identifier.
    pub fn patch_path(&self, id: &PatchId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Parse the series file into a manifest.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadSeries`] if the series file is unreadable.
    /// - Return [`StoreError::Series`] if the series file is malformed; no
    ///   partial manifest is produced.
    pub fn load_series(&self) -> Result<SeriesManifest> {
        let path = self.root.join(SERIES_FILE);
        let text = fs::read_to_string(&path).map_err(|err| StoreError::ReadSeries {
            source: err,
            path,
        })?;

        Ok(text.parse()?)
    }

    /// Serialize a manifest back into the series file.
    ///
    /// Refuses to persist a manifest that fails validation, so a malformed
    /// in-memory structure can never clobber a good series file.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSeries`] if validation reports
    ///   violations.
    /// - Return [`StoreError::WriteSeries`] if the series file cannot be
    ///   written.
    pub fn store_series(&self, manifest: &SeriesManifest) -> Result<()> {
        let violations = manifest.validate();
        if !violations.is_empty() {
            return Err(StoreError::InvalidSeries {
                violations: violations.iter().map(ToString::to_string).collect(),
            });
        }

        let path = self.root.join(SERIES_FILE);
        fs::write(&path, manifest.to_string()).map_err(|err| StoreError::WriteSeries {
            source: err,
            path,
        })?;

        Ok(())
    }

    /// List every patch file in the store, recursively.
    ///
    /// Paths are store-relative, sorted, and therefore directly comparable
    /// against manifest identifiers.
    pub fn patch_files(&self) -> Result<Vec<String>> {
        let pattern = format!("{}/**/*.{}", self.root.display(), PATCH_EXTENSION);
        let mut files = Vec::new();

        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|err| StoreError::ListPatches {
                source: err.into(),
                path: self.root.clone(),
            })?;
            if let Ok(relative) = path.strip_prefix(&self.root) {
                files.push(relative.to_string_lossy().into_owned());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Read the raw bytes of a stored patch.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::MissingPatches`] if no file backs the
    ///   identifier.
    /// - Return [`StoreError::ReadPatch`] on any other read failure.
    pub fn read_patch(&self, id: &PatchId) -> Result<Vec<u8>> {
        let path = self.patch_path(id);
        fs::read(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::MissingPatches {
                    idents: vec![id.clone()],
                }
            } else {
                StoreError::ReadPatch { source: err, path }
            }
        })
    }

    /// Write patch bytes, creating parent directories as needed.
    ///
    /// Byte-identical content leaves the existing file untouched so refresh
    /// saves stay quiet in store history.
    pub fn write_patch(&self, id: &PatchId, bytes: &[u8]) -> Result<WriteDisposition> {
        let path = self.patch_path(id);

        let disposition = match fs::read(&path) {
            Ok(existing) if existing == bytes => return Ok(WriteDisposition::Unchanged),
            Ok(_) => WriteDisposition::Updated,
            Err(err) if err.kind() == ErrorKind::NotFound => WriteDisposition::Added,
            Err(err) => return Err(StoreError::ReadPatch { source: err, path }),
        };

        if let Some(parent) = path.parent() {
            mkdirp::mkdirp(parent).map_err(|err| StoreError::CreateStore {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        fs::write(&path, bytes).map_err(|err| StoreError::WritePatch { source: err, path })?;

        Ok(disposition)
    }

    /// Delete the file backing an identifier.
    ///
    /// An already-absent file is tolerated with a warning; the entry is being
    /// removed either way.
    pub fn remove_patch(&self, id: &PatchId) -> Result<()> {
        let path = self.patch_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("patch file {} already absent", path.display());
                Ok(())
            }
            Err(err) => Err(StoreError::RemovePatch { source: err, path }),
        }
    }

    /// Cross-check manifest entries against the on-disk file set.
    pub fn diff_against_manifest(&self, manifest: &SeriesManifest) -> Result<StoreDiff> {
        let files = self.patch_files()?;
        let mut diff = StoreDiff::default();

        for id in manifest.traversal() {
            if !self.patch_path(id).is_file() {
                diff.missing.push(id.clone());
            }
        }

        for file in files {
            let referenced = manifest
                .traversal()
                .into_iter()
                .any(|id| id.as_str() == file);
            if !referenced {
                diff.orphaned.push(file);
            }
        }

        Ok(diff)
    }

    /// Fold a batch of captured patches into the store and manifest.
    ///
    /// Files are compared byte-for-byte against what is already stored, so
    /// counts only reflect real changes. New entries are inserted into the
    /// manifest immediately after `anchor` (the last currently-applied
    /// entry), in batch order; entries that already exist keep their
    /// position. The series file is rewritten once, after every file write
    /// has succeeded.
    #[instrument(skip(self, manifest, patches), level = "debug")]
    pub fn add_patches(
        &self,
        manifest: &mut SeriesManifest,
        patches: &[(PatchId, Vec<u8>)],
        anchor: Option<&PatchId>,
    ) -> Result<SaveStats> {
        let mut stats = SaveStats::default();
        let mut previous = anchor.cloned();

        for (id, bytes) in patches {
            match self.write_patch(id, bytes)? {
                WriteDisposition::Added => stats.added += 1,
                WriteDisposition::Updated => stats.updated += 1,
                WriteDisposition::Unchanged => {}
            }

            if !manifest.contains(id) {
                manifest.insert_after(previous.as_ref(), id.clone())?;
            }
            previous = Some(id.clone());
        }

        self.store_series(manifest)?;
        Ok(stats)
    }

    /// Remove entries from both the manifest and the file set.
    ///
    /// Returns the number of entries actually removed. The series file is
    /// rewritten once at the end.
    #[instrument(skip(self, manifest), level = "debug")]
    pub fn remove_patches(
        &self,
        manifest: &mut SeriesManifest,
        ids: &[PatchId],
    ) -> Result<usize> {
        let mut removed = 0;

        for id in ids {
            if manifest.remove(id) {
                removed += 1;
            }
            self.remove_patch(id)?;
        }

        if removed > 0 {
            self.store_series(manifest)?;
        }

        Ok(removed)
    }

    /// Check for tracked, uncommitted changes in store history.
    ///
    /// Always clean for a store without history recording.
    pub fn uncommitted_changes(&self) -> Result<bool> {
        let Some(repo) = &self.repo else {
            return Ok(false);
        };

        let mut opts = StatusOptions::new();
        opts.include_untracked(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        Ok(!statuses.is_empty())
    }

    /// Record the current store state as one commit.
    ///
    /// Stages everything, compares the resulting tree against HEAD, and
    /// commits only when something changed. `based_on` names the upstream
    /// commit the working checkout was based on and lands as a
    /// `Patchstack-Based-On` trailer. Returns whether a commit was made.
    #[instrument(skip(self, message), level = "debug")]
    pub fn commit(&self, message: &str, based_on: Option<&str>) -> Result<bool> {
        let Some(repo) = &self.repo else {
            return Ok(false);
        };

        // A store works fine without a git identity; history recording just
        // stays off until one is configured. Resolved before staging so a
        // skipped commit leaves the on-disk index untouched.
        let signature = match repo.signature() {
            Ok(signature) => signature,
            Err(err) => {
                warn!("no git identity configured, skipping store commit: {err}");
                return Ok(false);
            }
        };

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let mut parents = Vec::new();
        if let Some(oid) = repo.head().ok().and_then(|head| head.target()) {
            parents.push(repo.find_commit(oid)?);
        }

        if let Some(parent) = parents.first() {
            if parent.tree_id() == tree_oid {
                debug!("store tree unchanged, skipping commit");
                return Ok(false);
            }
        }

        let message = match based_on {
            Some(hash) => format!("{message}\n\n{BASED_ON_TRAILER} {hash}"),
            None => message.to_owned(),
        };

        let parents = parents.iter().collect::<Vec<_>>();
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message,
            &tree,
            &parents,
        )?;
        index.write()?;
        info!("committed patch store: {}", message.lines().next().unwrap_or(""));

        Ok(true)
    }

    /// Recover commit metadata from a stored patch's mbox headers.
    pub fn metadata(&self, id: &PatchId) -> Result<PatchMeta> {
        let bytes = self.read_patch(id)?;
        let text = String::from_utf8_lossy(&bytes);
        let mut meta = PatchMeta::default();

        for line in text.lines() {
            if line.starts_with("diff --git") {
                break;
            }

            if let Some(author) = line.strip_prefix("From: ") {
                meta.author = author.trim().to_owned();
            } else if let Some(date) = line.strip_prefix("Date: ") {
                meta.date = date.trim().to_owned();
            } else if let Some(summary) = line.strip_prefix("Subject: ") {
                meta.summary = summary.trim().to_owned();
            }
        }

        Ok(meta)
    }
}

/// Patch store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store root directory does not exist or is not a directory.
    #[error("no patch store at {}", path.display())]
    Unreadable { path: PathBuf },

    /// Store root exists but holds no series file.
    #[error("no series file in patch store at {}", path.display())]
    MissingSeriesFile { path: PathBuf },

    /// Manifest references patches with no backing file.
    #[error("series entries missing from store: {}", idents.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", "))]
    MissingPatches { idents: Vec<PatchId> },

    /// Manifest failed validation and was not persisted.
    #[error("series manifest is invalid: {}", violations.join("; "))]
    InvalidSeries { violations: Vec<String> },

    /// Store directory cannot be created.
    #[error("failed to create store directory at {}", path.display())]
    CreateStore {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Series file cannot be read.
    #[error("failed to read series file at {}", path.display())]
    ReadSeries {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Series file cannot be written.
    #[error("failed to write series file at {}", path.display())]
    WriteSeries {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Patch file cannot be read.
    #[error("failed to read patch file at {}", path.display())]
    ReadPatch {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Patch file cannot be written.
    #[error("failed to write patch file at {}", path.display())]
    WritePatch {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Patch file cannot be removed.
    #[error("failed to remove patch file at {}", path.display())]
    RemovePatch {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Patch file listing cannot be walked.
    #[error("failed to list patch files under {}", path.display())]
    ListPatches {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Series file content is malformed.
    #[error(transparent)]
    Series(#[from] crate::series::SeriesError),

    /// Patch file glob pattern is malformed.
    #[error(transparent)]
    Glob(#[from] glob::PatternError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    fn id(name: &str) -> PatchId {
        PatchId::new(name).unwrap()
    }

    fn store() -> PatchStore {
        let store = PatchStore::init("store").unwrap();
        let mut config = git2::Config::open(&store.root().join(".git/config")).unwrap();
        config.set_str("user.name", "John Doe").unwrap();
        config.set_str("user.email", "john@doe.com").unwrap();
        store
    }

    #[sealed_test]
    fn init_then_open_round_trips() {
        store();
        let reopened = PatchStore::open("store").unwrap();
        assert!(reopened.load_series().unwrap().is_empty());
    }

    #[sealed_test]
    fn open_refuses_missing_store() {
        let result = PatchStore::open("nowhere");
        assert!(matches!(result, Err(StoreError::Unreadable { .. })));
    }

    #[sealed_test]
    fn open_refuses_store_without_series() {
        fs::create_dir("bare").unwrap();
        let result = PatchStore::open("bare");
        assert!(matches!(result, Err(StoreError::MissingSeriesFile { .. })));
    }

    #[sealed_test]
    fn write_patch_dispositions() {
        let store = store();
        let fix = id("fix.patch");

        assert_eq!(
            store.write_patch(&fix, b"one").unwrap(),
            WriteDisposition::Added
        );
        assert_eq!(
            store.write_patch(&fix, b"one").unwrap(),
            WriteDisposition::Unchanged
        );
        assert_eq!(
            store.write_patch(&fix, b"two").unwrap(),
            WriteDisposition::Updated
        );
        assert_eq!(store.read_patch(&fix).unwrap(), b"two");
    }

    #[sealed_test]
    fn write_patch_creates_subdirectories() {
        let store = store();
        let nested = id("vendor/fix.patch");

        store.write_patch(&nested, b"content").unwrap();
        assert_eq!(store.patch_files().unwrap(), vec!["vendor/fix.patch"]);
    }

    #[sealed_test]
    fn read_missing_patch_is_fatal() {
        let store = store();
        let result = store.read_patch(&id("ghost.patch"));
        assert!(matches!(result, Err(StoreError::MissingPatches { .. })));
    }

    #[sealed_test]
    fn diff_reports_missing_and_orphaned() {
        let store = store();
        let mut manifest = SeriesManifest::new();
        manifest.insert_after(None, id("tracked.patch")).unwrap();
        store.store_series(&manifest).unwrap();
        store.write_patch(&id("stray.patch"), b"stray").unwrap();

        let diff = store.diff_against_manifest(&manifest).unwrap();
        assert_eq!(diff.missing, vec![id("tracked.patch")]);
        assert_eq!(diff.orphaned, vec!["stray.patch".to_owned()]);
    }

    #[sealed_test]
    fn add_patches_inserts_after_anchor() {
        let store = store();
        let mut manifest: SeriesManifest = "a.patch\nb.patch\n".parse().unwrap();
        store.write_patch(&id("a.patch"), b"a").unwrap();
        store.write_patch(&id("b.patch"), b"b").unwrap();

        let batch = vec![
            (id("new-1.patch"), b"one".to_vec()),
            (id("new-2.patch"), b"two".to_vec()),
        ];
        let stats = store
            .add_patches(&mut manifest, &batch, Some(&id("a.patch")))
            .unwrap();

        assert_eq!(stats.added, 2);
        let order: Vec<&str> = manifest.traversal().iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["a.patch", "new-1.patch", "new-2.patch", "b.patch"]);
        // Persisted series file reflects the same order.
        assert_eq!(store.load_series().unwrap(), manifest);
    }

    #[sealed_test]
    fn add_patches_refresh_reuses_entry() {
        let store = store();
        let mut manifest: SeriesManifest = "fix.patch\n".parse().unwrap();
        store.write_patch(&id("fix.patch"), b"same").unwrap();

        let batch = vec![(id("fix.patch"), b"same".to_vec())];
        let stats = store.add_patches(&mut manifest, &batch, None).unwrap();

        assert_eq!(stats, SaveStats::default());
        assert_eq!(manifest.len(), 1);
    }

    #[sealed_test]
    fn remove_patches_prunes_both_sides() {
        let store = store();
        let mut manifest: SeriesManifest = "a.patch\nb.patch\n".parse().unwrap();
        store.write_patch(&id("a.patch"), b"a").unwrap();
        store.write_patch(&id("b.patch"), b"b").unwrap();

        let removed = store
            .remove_patches(&mut manifest, &[id("a.patch")])
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(manifest.len(), 1);
        assert_eq!(store.patch_files().unwrap(), vec!["b.patch"]);
    }

    #[sealed_test]
    fn init_without_identity_leaves_store_clean() {
        // Hide any global or system identity from libgit2.
        let cwd = std::env::current_dir().unwrap();
        std::env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
        std::env::set_var("GIT_CONFIG_SYSTEM", "/dev/null");
        std::env::set_var("HOME", &cwd);
        std::env::set_var("XDG_CONFIG_HOME", cwd.join("xdg"));

        let store = PatchStore::init("store").unwrap();
        assert!(!store.uncommitted_changes().unwrap());

        // History recording picks up once an identity appears.
        let mut config = git2::Config::open(&store.root().join(".git/config")).unwrap();
        config.set_str("user.name", "John Doe").unwrap();
        config.set_str("user.email", "john@doe.com").unwrap();
        store.write_patch(&id("fix.patch"), b"content").unwrap();
        assert!(store.commit("catch up", None).unwrap());
        assert!(!store.uncommitted_changes().unwrap());
    }

    #[sealed_test]
    fn commit_skips_unchanged_tree() {
        let store = store();
        assert!(store.commit("no-op", None).is_ok());

        store.write_patch(&id("fix.patch"), b"content").unwrap();
        assert!(store.commit("add fix", Some("abc123")).unwrap());
        // Nothing new staged, so no second commit.
        assert!(!store.commit("again", None).unwrap());
    }

    #[sealed_test]
    fn metadata_parses_mbox_headers() {
        let store = store();
        let patch = b"From patchstack Mon Sep 17 00:00:00 2001\n\
            From: John Doe <john@doe.com>\n\
            Date: Thu, 28 Aug 2025 10:00:00 +0000\n\
            Subject: fix typo\n\n\
            diff --git a/x b/x\n";
        store.write_patch(&id("fix-typo.patch"), patch).unwrap();

        let meta = store.metadata(&id("fix-typo.patch")).unwrap();
        assert_eq!(meta.summary, "fix typo");
        assert_eq!(meta.author, "John Doe <john@doe.com>");
        assert_eq!(meta.date, "Thu, 28 Aug 2025 10:00:00 +0000");
    }
}
