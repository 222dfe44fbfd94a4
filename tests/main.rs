// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! End-to-end flows against real git repositories.

use patchstack::{
    checkout::{state::ApplyState, CheckoutError},
    store::StoreError,
    PatchEngine, PatchStore, RestoreOutcome, WorkingCheckout,
};

use anyhow::Result;
use indicatif::ProgressBar;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{fs, path::Path};

pub(crate) struct CheckoutFixture {
    checkout: WorkingCheckout,
}

impl CheckoutFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = git2::Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self {
            checkout: WorkingCheckout::discover(path.as_ref())?,
        })
    }

    pub(crate) fn checkout(&self) -> &WorkingCheckout {
        &self.checkout
    }

    pub(crate) fn commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
        message: impl AsRef<str>,
    ) -> Result<String> {
        let workdir = self.checkout.engine().workdir();
        fs::write(workdir.join(filename.as_ref()), contents.as_ref())?;

        let repo = git2::Repository::open(workdir)?;
        let mut index = repo.index()?;
        index.add_path(filename.as_ref())?;
        let tree_oid = index.write_tree()?;
        index.write()?;
        let tree = repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = repo.signature()?;
        let mut parents = Vec::new();
        if let Some(oid) = repo.head().ok().and_then(|head| head.target()) {
            parents.push(repo.find_commit(oid)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message.as_ref(),
            &tree,
            &parents,
        )?;

        Ok(oid.to_string())
    }

    /// Write and stage a file without committing, the way a user hand-resolves
    /// a conflicted patch before continuing.
    pub(crate) fn stage(&self, filename: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
        let workdir = self.checkout.engine().workdir();
        fs::write(workdir.join(filename.as_ref()), contents.as_ref())?;

        let repo = git2::Repository::open(workdir)?;
        let mut index = repo.index()?;
        index.add_path(filename.as_ref())?;
        index.write()?;

        Ok(())
    }

    pub(crate) fn file_contents(&self, filename: impl AsRef<Path>) -> Result<String> {
        Ok(fs::read_to_string(
            self.checkout.engine().workdir().join(filename.as_ref()),
        )?)
    }
}

fn store_with_user(path: &str) -> Result<PatchStore> {
    let store = PatchStore::init(path)?;
    let mut config = git2::Config::open(&store.root().join(".git/config"))?;
    config.set_str("user.name", "John Doe")?;
    config.set_str("user.email", "john@doe.com")?;
    Ok(store)
}

#[sealed_test]
fn save_rollback_restore_round_trip() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    let (stats, outcome) = fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    assert_eq!(stats.added, 1);
    assert!(matches!(outcome, RestoreOutcome::Completed { .. }));
    assert_eq!(
        fixture
            .checkout()
            .applied_patches()?
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["fix-typo.patch"]
    );
    // The reapplied commit carries the sentinel trailer.
    assert!(fixture
        .checkout()
        .engine()
        .message_of("HEAD")?
        .contains("Patchstack-Patch: fix-typo.patch"));

    let rolled_to = fixture.checkout().rollback()?;
    assert_eq!(rolled_to, upstream);
    assert_eq!(fixture.file_contents("readme")?, "base\n");
    assert!(fixture.checkout().applied_patches()?.is_empty());

    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Completed { .. }));
    assert_eq!(fixture.file_contents("readme")?, "patched\n");
    assert_eq!(fixture.checkout().applied_patches()?.len(), 1);

    Ok(())
}

#[sealed_test]
fn save_records_store_history_with_based_on_trailer() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    let store = store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    let repo = git2::Repository::open(store.root())?;
    let head = repo.head()?.peel_to_commit()?;
    let message = String::from_utf8_lossy(head.message_bytes()).into_owned();
    assert!(message.starts_with("Saving patches: 1 added"));
    assert!(message.contains(&format!("Patchstack-Based-On: {upstream}")));

    Ok(())
}

#[sealed_test]
fn conflicted_restore_then_abort_recovers_head() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.checkout().rollback()?;
    let divergent = fixture.commit("readme", "divergent\n", "conflicting upstream work")?;

    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Conflicted { .. }));
    assert_eq!(
        fixture.checkout().status()?.state,
        ApplyState::Conflicted
    );

    fixture.checkout().abort()?;
    assert_eq!(fixture.checkout().engine().head_id()?, divergent);
    assert_eq!(fixture.file_contents("readme")?, "divergent\n");
    assert_eq!(fixture.checkout().status()?.state, ApplyState::Clean);

    Ok(())
}

#[sealed_test]
fn resolve_refreshes_patch_and_finishes_walk() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    let store = store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.checkout().rollback()?;
    fixture.commit("readme", "divergent\n", "conflicting upstream work")?;
    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Conflicted { .. }));

    fixture.stage("readme", "resolved\n")?;
    let outcome = fixture.checkout().resolve(ProgressBar::hidden())?;
    assert_eq!(
        outcome,
        RestoreOutcome::Completed {
            updated: 1,
            removed: 0
        }
    );

    assert_eq!(fixture.checkout().status()?.state, ApplyState::Clean);
    assert_eq!(fixture.file_contents("readme")?, "resolved\n");
    assert!(fixture
        .checkout()
        .engine()
        .message_of("HEAD")?
        .contains("Patchstack-Patch: fix-typo.patch"));
    // The stored patch now reflects what actually applied.
    let stored = fs::read_to_string(store.root().join("fix-typo.patch"))?;
    assert!(stored.contains("+resolved"));

    Ok(())
}

#[sealed_test]
fn restore_after_retained_skip_leaves_later_patches_alone() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    let store = store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture.commit("extra", "feature\n", "Add feature")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.checkout().rollback()?;
    fixture.commit("readme", "divergent\n", "conflicting upstream work")?;

    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Conflicted { .. }));
    let outcome = fixture.checkout().skip(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Completed { .. }));

    // The retained entry now sits ahead of an applied one in the series. A
    // fresh restore must reattempt it without re-feeding the applied patch
    // to the engine, where it would be misread as upstream and pruned.
    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    match outcome {
        RestoreOutcome::Conflicted { id, .. } => assert_eq!(id.as_str(), "fix-typo.patch"),
        other => panic!("expected a conflict, got {other:?}"),
    }
    fixture.checkout().abort()?;

    assert_eq!(
        store.patch_files()?,
        vec!["add-feature.patch", "fix-typo.patch"]
    );
    assert_eq!(
        fixture
            .checkout()
            .applied_patches()?
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["add-feature.patch"]
    );

    Ok(())
}

#[sealed_test]
fn rollback_recovers_from_conflicted_state() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.checkout().rollback()?;
    let divergent = fixture.commit("readme", "divergent\n", "conflicting upstream work")?;
    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Conflicted { .. }));

    // No separate abort needed; rollback tears the session down itself.
    let rolled_to = fixture.checkout().rollback()?;
    assert_eq!(rolled_to, divergent);
    assert_eq!(fixture.checkout().status()?.state, ApplyState::Clean);
    assert_eq!(fixture.file_contents("readme")?, "divergent\n");

    Ok(())
}

#[sealed_test]
fn skip_retains_patch_whose_changes_are_not_upstream() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.checkout().rollback()?;
    fixture.commit("readme", "divergent\n", "conflicting upstream work")?;

    let outcome = fixture.checkout().restore(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Conflicted { .. }));

    let outcome = fixture.checkout().skip(ProgressBar::hidden())?;
    assert!(matches!(outcome, RestoreOutcome::Completed { .. }));

    // The entry survives for a future restore against different upstream.
    let status = fixture.checkout().status()?;
    assert_eq!(status.state, ApplyState::Clean);
    assert_eq!(
        status
            .unapplied
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["fix-typo.patch"]
    );
    assert_eq!(fixture.file_contents("readme")?, "divergent\n");

    Ok(())
}

#[sealed_test]
fn check_reports_drift_and_restore_refuses_fatal_drift() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    let store = store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    // An unreferenced file is advisory only.
    fs::write(store.root().join("stray.patch"), "noise\n")?;
    let report = fixture.checkout().check()?;
    assert!(!report.is_fatal());
    assert_eq!(report.orphaned, vec!["stray.patch".to_owned()]);

    // A missing backing file is fatal and blocks restoring.
    fs::remove_file(store.root().join("fix-typo.patch"))?;
    let report = fixture.checkout().check()?;
    assert!(report.is_fatal());

    fixture.checkout().rollback()?;
    let result = fixture.checkout().restore(ProgressBar::hidden());
    assert!(matches!(
        result,
        Err(CheckoutError::Store(StoreError::MissingPatches { .. }))
    ));

    Ok(())
}

#[sealed_test]
fn second_save_refreshes_instead_of_duplicating() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    let store = store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    // Amend nothing; saving the whole stack again must be a no-op.
    let (stats, _) = fixture.checkout().save(None, None, ProgressBar::hidden())?;
    assert_eq!(stats.added, 0);
    assert_eq!(stats.updated, 0);
    assert_eq!(store.patch_files()?, vec!["fix-typo.patch"]);
    assert_eq!(fixture.checkout().applied_patches()?.len(), 1);

    Ok(())
}

#[sealed_test]
fn save_appends_new_commits_after_applied_patches() -> Result<()> {
    let fixture = CheckoutFixture::new("repo")?;
    let upstream = fixture.commit("readme", "base\n", "upstream work")?;
    store_with_user("store")?;
    fixture.checkout().link("store")?;

    fixture.commit("readme", "patched\n", "Fix typo")?;
    fixture
        .checkout()
        .save(Some(upstream.as_str()), None, ProgressBar::hidden())?;

    fixture.commit("extra", "feature\n", "Add feature")?;
    let (stats, outcome) = fixture.checkout().save(None, None, ProgressBar::hidden())?;

    assert_eq!(stats.added, 1);
    assert!(matches!(outcome, RestoreOutcome::Completed { .. }));
    assert_eq!(
        fixture
            .checkout()
            .applied_patches()?
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>(),
        vec!["fix-typo.patch", "add-feature.patch"]
    );

    Ok(())
}
