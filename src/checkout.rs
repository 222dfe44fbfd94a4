// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Working checkout management and manipulation.
//!
//! A __working checkout__ is the ordinary git repository whose history the
//! patch series is applied to. The checkout remembers which store it belongs
//! to through a single repository-local config entry, and which patches are
//! currently applied through sentinel trailers stamped onto the commits that
//! patch application creates. Both facts live inside the checkout itself, so
//! no state survives a hard reset of the checkout except the store, which is
//! the point: upstream history plus the store fully determine everything
//! patchstack needs.
//!
//! [`WorkingCheckout`] is the operation surface the command line maps onto.
//! It is generic over [`PatchEngine`] so the flow logic stays testable; the
//! default engine drives a real git repository.

pub mod apply;
pub mod save;
pub mod state;

use crate::{
    check::{self, Report},
    checkout::{
        apply::{annotate_head, apply_series, RestoreOutcome},
        save::capture,
        state::{ApplicationRecord, ApplyState, ApplyTracker},
    },
    engine::{AmContinue, GitEngine, PatchEngine},
    fixup::fixup,
    graph::dot_graph,
    series::{PatchId, SeriesManifest},
    store::{PatchStore, SaveStats},
};

use indicatif::ProgressBar;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::PathBuf,
};
use tracing::{debug, info, instrument, warn};

/// Commit message trailer naming the patch a commit was applied from.
pub const PATCH_TRAILER: &str = "Patchstack-Patch:";

/// Store history trailer naming the upstream commit a snapshot was based on.
pub const BASED_ON_TRAILER: &str = "Patchstack-Based-On:";

/// Repository-local config key linking a checkout to its store.
pub const CONFIG_STORE_KEY: &str = "patchstack.store";

/// Upper bound on unannotated commits scanned above the applied prefix.
///
/// Keeps the applied-patch scan from walking an entire unpatched history,
/// while still tolerating a healthy pile of new commits on top.
const NEW_COMMIT_SCAN_BOUND: usize = 50;

/// Scratch directory for regenerated patches, relative to the git directory.
const OUTGOING_DIR: &str = "patchstack/outgoing";

/// Snapshot of a checkout's relationship to its store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub store: PathBuf,
    pub state: ApplyState,
    pub conflict: Option<PatchId>,
    pub applied: Vec<PatchId>,
    pub unapplied: Vec<PatchId>,
}

impl Display for StatusReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "store: {}", self.store.display())?;
        match self.state {
            ApplyState::Clean => writeln!(fmt, "state: clean")?,
            ApplyState::Applying => writeln!(fmt, "state: applying")?,
            ApplyState::Conflicted => match &self.conflict {
                Some(id) => writeln!(fmt, "state: conflicted on {id}")?,
                None => writeln!(fmt, "state: conflicted")?,
            },
        }

        for id in &self.applied {
            writeln!(fmt, "  + {id}")?;
        }
        for id in &self.unapplied {
            writeln!(fmt, "  - {id}")?;
        }

        Ok(())
    }
}

/// A working checkout under patch management.
pub struct WorkingCheckout<E: PatchEngine = GitEngine> {
    engine: E,
    tracker: ApplyTracker,
}

impl WorkingCheckout<GitEngine> {
    /// Discover the checkout containing a path.
    pub fn discover(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::with_engine(GitEngine::discover(path)?))
    }
}

impl<E: PatchEngine> WorkingCheckout<E> {
    /// Wrap an already-constructed engine.
    pub fn with_engine(engine: E) -> Self {
        let tracker = ApplyTracker::new(engine.gitdir());
        Self { engine, tracker }
    }

    /// Underlying engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Link this checkout to a patch store.
    ///
    /// The path may contain `~` or environment variables. The target must be
    /// an existing store; linking never creates one.
    ///
    /// # Errors
    ///
    /// - Return [`CheckoutError::AlreadyLinked`] if linked to this store.
    /// - Return [`CheckoutError::LinkedElsewhere`] if linked to another.
    /// - Return [`CheckoutError::Store`] if the target is not a usable store.
    #[instrument(skip(self), level = "debug")]
    pub fn link(&self, store_path: &str) -> Result<()> {
        let expanded = shellexpand::full(store_path)?.into_owned();
        let target = fs::canonicalize(&expanded).unwrap_or_else(|_| PathBuf::from(&expanded));
        PatchStore::open(&target)?;

        if let Some(existing) = self.engine.config_get(CONFIG_STORE_KEY)? {
            if PathBuf::from(&existing) == target {
                return Err(CheckoutError::AlreadyLinked { path: existing.into() });
            }
            return Err(CheckoutError::LinkedElsewhere { path: existing.into() });
        }

        self.engine
            .config_set(CONFIG_STORE_KEY, &target.to_string_lossy())?;
        info!("linked checkout to patch store at {}", target.display());

        Ok(())
    }

    /// Remove the link to the patch store. The store itself is untouched.
    pub fn unlink(&self) -> Result<()> {
        if self.engine.config_get(CONFIG_STORE_KEY)?.is_none() {
            return Err(CheckoutError::NoLinkedStore);
        }

        self.engine.config_unset(CONFIG_STORE_KEY)?;
        Ok(())
    }

    /// Open the linked patch store.
    ///
    /// # Errors
    ///
    /// - Return [`CheckoutError::NoLinkedStore`] if no link exists.
    pub fn store(&self) -> Result<PatchStore> {
        let Some(path) = self.engine.config_get(CONFIG_STORE_KEY)? else {
            return Err(CheckoutError::NoLinkedStore);
        };

        Ok(PatchStore::open(path)?)
    }

    /// Identifiers of currently applied patches, in application order.
    ///
    /// Derived entirely from sentinel trailers on the commit history, never
    /// from stored state, so it stays correct across resets and rebases.
    pub fn applied_patches(&self) -> Result<Vec<PatchId>> {
        Ok(self
            .applied_with_hashes()?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Applied identifiers paired with the commits carrying them.
    fn applied_with_hashes(&self) -> Result<Vec<(PatchId, String)>> {
        let mut found: Vec<(PatchId, String)> = Vec::new();
        let mut skip = 0;

        loop {
            let Some((hash, message)) = self.engine.commit_at(skip)? else {
                break;
            };

            match trailer_of(&message) {
                Some(id) => found.push((id, hash)),
                // INVARIANT: Unannotated commits above the applied prefix are
                // new work; the first one below it is upstream.
                None if found.is_empty() => {
                    if skip >= NEW_COMMIT_SCAN_BOUND {
                        break;
                    }
                }
                None => break,
            }

            skip += 1;
        }

        found.reverse();
        Ok(found)
    }

    /// Hash of the newest upstream commit, the one just below the applied
    /// patch prefix. None when no patches are applied.
    pub fn last_upstream_commit(&self) -> Result<Option<String>> {
        let applied = self.applied_with_hashes()?;
        let Some((_, oldest)) = applied.first() else {
            return Ok(None);
        };

        Ok(self.engine.parent_of(oldest)?)
    }

    /// Summarize the checkout's relationship to its store.
    pub fn status(&self) -> Result<StatusReport> {
        let store = self.store()?;
        let manifest = store.load_series()?;
        let applied = self.applied_patches()?;

        let unapplied = manifest
            .traversal()
            .into_iter()
            .filter(|id| !applied.contains(*id))
            .cloned()
            .collect();

        let conflict = match self.tracker.load() {
            Ok(record) => record.conflict,
            Err(_) => None,
        };

        Ok(StatusReport {
            store: store.root().to_path_buf(),
            state: self.tracker.state(),
            conflict,
            applied,
            unapplied,
        })
    }

    /// Apply every unapplied patch in series order.
    ///
    /// Stops on the first conflict with the mailbox session left open for
    /// hand-resolution; [`Self::resolve`], [`Self::skip`], and
    /// [`Self::abort`] pick up from there.
    ///
    /// # Errors
    ///
    /// - Return [`CheckoutError::State`] if an application is in progress.
    /// - Return [`CheckoutError::UncommittedChanges`] if the checkout is
    ///   dirty.
    /// - Return [`CheckoutError::Store`] if any series entry lacks a backing
    ///   patch file; nothing is applied in that case.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn restore(&self, bar: ProgressBar) -> Result<RestoreOutcome> {
        self.ensure_idle()?;
        if self.engine.uncommitted_changes()? {
            return Err(CheckoutError::UncommittedChanges);
        }

        let store = self.store()?;
        let mut manifest = store.load_series()?;

        // INVARIANT: Refuse before touching HEAD if the walk could strand
        // partway through on a missing file.
        let diff = store.diff_against_manifest(&manifest)?;
        if !diff.missing.is_empty() {
            return Err(CheckoutError::Store(
                crate::store::StoreError::MissingPatches {
                    idents: diff.missing,
                },
            ));
        }

        let applied = self.applied_patches()?;
        let mut record = ApplicationRecord::new(applied.len(), self.engine.head_id()?);
        self.tracker.begin(&record)?;

        self.run_walk(&store, &mut manifest, &mut record, &applied, bar)
    }

    /// Resume the walk after the conflicted patch was hand-resolved.
    ///
    /// The resolved result is committed, the stored patch is regenerated from
    /// that commit so the store reflects what actually applies, and the walk
    /// continues.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn resolve(&self, bar: ProgressBar) -> Result<RestoreOutcome> {
        let record = self.tracker.load()?;
        let Some(id) = record.conflict.clone() else {
            return Err(CheckoutError::State(
                crate::checkout::state::StateError::NothingToResolve,
            ));
        };

        self.engine.continue_apply(AmContinue::Resolved)?;

        let store = self.store()?;
        let mut manifest = store.load_series()?;
        self.refresh_patch_from_head(&store, &id)?;
        annotate_head(&self.engine, &id).map_err(CheckoutError::Apply)?;

        let mut record = self.tracker.mark_resolved()?;
        let applied = self.applied_patches()?;
        self.run_walk(&store, &mut manifest, &mut record, &applied, bar)
    }

    /// Drop the conflicted patch and resume the walk.
    ///
    /// If the patch's changes turn out to already exist upstream the entry is
    /// pruned from the store entirely; otherwise the entry is retained so a
    /// future restore against different upstream can still try it, and the
    /// skip is recorded.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn skip(&self, bar: ProgressBar) -> Result<RestoreOutcome> {
        let record = self.tracker.load()?;
        let Some(id) = record.conflict.clone() else {
            return Err(CheckoutError::State(
                crate::checkout::state::StateError::NothingToResolve,
            ));
        };

        self.engine.continue_apply(AmContinue::Skip)?;

        let store = self.store()?;
        let mut manifest = store.load_series()?;

        let mut record = if self
            .engine
            .reverse_applies_cleanly(&store.patch_path(&id))?
        {
            info!("{id} is already present upstream, pruning it");
            let mut record = self.tracker.mark_resolved()?;
            store.remove_patches(&mut manifest, std::slice::from_ref(&id))?;
            record.removed += 1;
            self.tracker.save(&record)?;
            record
        } else {
            warn!("retaining {id} in the series; its changes are not upstream");
            self.tracker.mark_skipped()?
        };

        let applied = self.applied_patches()?;
        self.run_walk(&store, &mut manifest, &mut record, &applied, bar)
    }

    /// Abandon the in-progress application entirely.
    ///
    /// Tears down any open mailbox session and resets the checkout to
    /// exactly where it was before the walk began, undoing patches the walk
    /// already applied.
    #[instrument(skip(self), level = "debug")]
    pub fn abort(&self) -> Result<()> {
        let record = self.tracker.load()?;

        if self.engine.apply_in_progress() {
            self.engine.continue_apply(AmContinue::Abort)?;
        }

        self.engine.reset_hard(&record.pre_apply_head)?;
        self.tracker.clear();
        info!("aborted; checkout reset to {}", record.pre_apply_head);

        Ok(())
    }

    /// Reset the checkout to pure upstream, unapplying every patch.
    ///
    /// Works from any state: an open mailbox session is torn down and the
    /// application record cleared, so a conflicted restore does not need a
    /// separate abort first. Returns the hash the checkout now points at.
    ///
    /// # Errors
    ///
    /// - Return [`CheckoutError::NoPatchesApplied`] if there is nothing to
    ///   roll back.
    #[instrument(skip(self), level = "debug")]
    pub fn rollback(&self) -> Result<String> {
        if self.engine.apply_in_progress() {
            self.engine.continue_apply(AmContinue::Abort)?;
        }
        if self.engine.uncommitted_changes()? {
            return Err(CheckoutError::UncommittedChanges);
        }

        let upstream = match self.last_upstream_commit()? {
            Some(upstream) => upstream,
            // A walk that conflicted before applying anything leaves no
            // annotated commits; its record still knows where it started.
            None => match self.tracker.load() {
                Ok(record) => record.pre_apply_head,
                Err(_) => return Err(CheckoutError::NoPatchesApplied),
            },
        };

        self.engine.reset_hard(&upstream)?;
        self.tracker.clear();
        info!("rolled back to upstream {upstream}");

        Ok(upstream)
    }

    /// Capture commits into the store, then reapply the series.
    ///
    /// With no explicit `since` every commit above the last upstream point is
    /// captured, which refreshes applied patches and picks up new commits in
    /// one pass; applied patches whose commits have disappeared are pruned as
    /// vestigial. An explicit `since` captures only the commits above it.
    /// After the store is updated the checkout is reset to the capture point
    /// and the full series is reapplied so every patch commit ends up
    /// annotated.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn save(
        &self,
        since: Option<&str>,
        prefix: Option<&str>,
        bar: ProgressBar,
    ) -> Result<(SaveStats, RestoreOutcome)> {
        self.ensure_idle()?;
        if self.engine.uncommitted_changes()? {
            return Err(CheckoutError::UncommittedChanges);
        }

        let store = self.store()?;
        if store.uncommitted_changes()? {
            return Err(CheckoutError::UncommittedStore);
        }
        let mut manifest = store.load_series()?;

        let capture_from = match since {
            Some(rev) => self.engine.rev_id(rev)?,
            None => self
                .last_upstream_commit()?
                .ok_or(CheckoutError::NothingToSave)?,
        };

        let captured = capture(&self.engine, &store, &manifest, &capture_from, prefix)?;
        let anchor = trailer_of(&self.engine.message_of(&capture_from)?);

        let batch: Vec<(PatchId, Vec<u8>)> = captured
            .into_iter()
            .map(|patch| (patch.id, patch.content))
            .collect();
        let mut stats = store.add_patches(&mut manifest, &batch, anchor.as_ref())?;

        // Applied patches whose commits vanished from the stack are vestigial
        // when the capture covered the whole stack.
        if since.is_none() {
            let vestigial: Vec<PatchId> = self
                .applied_patches()?
                .into_iter()
                .filter(|id| !batch.iter().any(|(batch_id, _)| batch_id == id))
                .collect();
            stats.removed += store.remove_patches(&mut manifest, &vestigial)?;
        }

        store.commit(
            &format!(
                "Saving patches: {} added, {} updated, {} removed",
                stats.added, stats.updated, stats.removed
            ),
            Some(&capture_from),
        )?;

        // Reapply from the capture point so every patch commit is annotated.
        self.engine.reset_hard(&capture_from)?;
        let outcome = self.restore(bar)?;

        Ok((stats, outcome))
    }

    /// Cross-check the linked store's manifest against its file set.
    pub fn check(&self) -> Result<Report> {
        let store = self.store()?;
        let manifest = store.load_series()?;
        Ok(check::check(&manifest, &store)?)
    }

    /// Render the linked store's series as Graphviz DOT.
    pub fn graph(&self) -> Result<String> {
        let store = self.store()?;
        Ok(dot_graph(&store.load_series()?))
    }

    /// Walk the remaining series and close out the application on success.
    fn run_walk(
        &self,
        store: &PatchStore,
        manifest: &mut SeriesManifest,
        record: &mut ApplicationRecord,
        applied: &[PatchId],
        bar: ProgressBar,
    ) -> Result<RestoreOutcome> {
        let outcome = apply_series(
            &self.engine,
            store,
            manifest,
            &self.tracker,
            record,
            applied,
            bar,
        )?;

        if let RestoreOutcome::Completed { updated, removed } = outcome {
            let record = self.tracker.finish()?;
            if !record.skipped.is_empty() {
                warn!(
                    "skipped patches retained in the series: {}",
                    record
                        .skipped
                        .iter()
                        .map(|id| id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }

            if updated > 0 || removed > 0 {
                store.commit(
                    &format!("Refreshing patches: {updated} updated, {removed} removed"),
                    self.last_upstream_commit()?.as_deref(),
                )?;
            }
        }

        Ok(outcome)
    }

    /// Regenerate the stored patch for the HEAD commit.
    fn refresh_patch_from_head(&self, store: &PatchStore, id: &PatchId) -> Result<()> {
        let Some(parent) = self.engine.parent_of("HEAD")? else {
            return Ok(());
        };

        let outgoing = self.engine.gitdir().join(OUTGOING_DIR);
        mkdirp::mkdirp(&outgoing).map_err(|err| {
            CheckoutError::Store(crate::store::StoreError::CreateStore {
                source: err,
                path: outgoing.clone(),
            })
        })?;

        let files = self.engine.format_patches(&parent, &outgoing)?;
        for file in &files {
            let raw = fs::read_to_string(file).map_err(|err| {
                CheckoutError::Store(crate::store::StoreError::ReadPatch {
                    source: err,
                    path: file.clone(),
                })
            })?;
            let _ = fs::remove_file(file);

            let fixed = fixup(&raw)?;
            let disposition = store.write_patch(id, fixed.as_bytes())?;
            if disposition != crate::store::WriteDisposition::Unchanged {
                debug!("refreshed {id} from resolved commit");
                let mut record = self.tracker.load()?;
                record.updated += 1;
                self.tracker.save(&record)?;
            }
        }

        Ok(())
    }

    /// Refuse to start a new application while one is underway.
    fn ensure_idle(&self) -> Result<()> {
        if self.tracker.state() != ApplyState::Clean || self.engine.apply_in_progress() {
            return Err(CheckoutError::State(
                crate::checkout::state::StateError::InProgress,
            ));
        }

        Ok(())
    }
}

/// Extract the sentinel trailer from a commit message, if present.
fn trailer_of(message: &str) -> Option<PatchId> {
    message
        .lines()
        .find_map(|line| line.strip_prefix(PATCH_TRAILER))
        .and_then(|rest| PatchId::new(rest.trim()).ok())
}

/// Working checkout error types.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// Checkout has no linked patch store.
    #[error("checkout is not linked to a patch store; run `patchstack link` first")]
    NoLinkedStore,

    /// Checkout is already linked to this store.
    #[error("checkout is already linked to {}", path.display())]
    AlreadyLinked { path: PathBuf },

    /// Checkout is linked to a different store.
    #[error("checkout is linked to a different store at {}; unlink it first", path.display())]
    LinkedElsewhere { path: PathBuf },

    /// Checkout has uncommitted changes to tracked files.
    #[error("checkout has uncommitted changes; commit or stash them first")]
    UncommittedChanges,

    /// Patch store has uncommitted changes.
    #[error("patch store has uncommitted changes; commit them first")]
    UncommittedStore,

    /// No patches are applied to roll back.
    #[error("no patches are applied")]
    NoPatchesApplied,

    /// Nothing determines a capture point for saving.
    #[error("no patches applied and no --since given; nothing to save")]
    NothingToSave,

    /// Store path expansion fails.
    #[error(transparent)]
    Expand(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Application record access fails.
    #[error(transparent)]
    State(#[from] crate::checkout::state::StateError),

    /// Patch store access fails.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Git operations fail.
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    /// Series walk fails.
    #[error(transparent)]
    Apply(#[from] apply::ApplyError),

    /// Patch capture fails.
    #[error(transparent)]
    Save(#[from] save::SaveError),

    /// Patch normalization fails.
    #[error(transparent)]
    Fixup(#[from] crate::fixup::FixupError),
}

/// Friendly result alias :3
pub type Result<T, E = CheckoutError> = std::result::Result<T, E>;
