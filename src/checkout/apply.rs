// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Series application walk.
//!
//! Walks the series manifest in application order, feeding each patch to the
//! engine and reacting to the three possible outcomes. A clean application is
//! annotated with the sentinel trailer and the walk advances. A patch whose
//! changes turn out to already exist upstream is pruned from the store on the
//! spot. A conflict stops the walk with the mailbox session left open for the
//! user; the application record remembers which patch is pending so resolve,
//! skip, and abort know what they are acting on.
//!
//! # Ordering
//!
//! The walk never reorders: a patch is only ever attempted after every patch
//! before it in pre-order has been applied, pruned, or skipped. Resuming after
//! a conflict re-derives the position from what is already applied on HEAD
//! rather than from a stored index, so a record that has drifted from the
//! checkout cannot cause patches to be silently passed over.

use crate::{
    checkout::{
        state::{ApplicationRecord, ApplyTracker},
        PATCH_TRAILER,
    },
    engine::{ApplyOutcome, PatchEngine},
    series::{PatchId, SeriesManifest},
    store::PatchStore,
};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, instrument, warn};

/// Result of one series walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every remaining patch was applied, pruned, or skipped.
    Completed { updated: u32, removed: u32 },

    /// The walk stopped on a conflicted patch.
    Conflicted {
        id: PatchId,
        /// Whether conflict markers were left in the tree.
        three_way: bool,
    },
}

/// Apply every patch not yet on the checkout.
///
/// Membership, not position, decides what is pending: entries already applied
/// on HEAD and entries skipped earlier in this session are passed over
/// wherever they sit in the traversal. A retained skip ahead of applied
/// entries therefore never causes an applied patch to be re-fed to the
/// engine and pruned as already upstream. The record is re-saved after
/// every mutation so an interruption at any point leaves a resumable state.
#[instrument(skip_all, level = "debug")]
pub fn apply_series<E: PatchEngine>(
    engine: &E,
    store: &PatchStore,
    manifest: &mut SeriesManifest,
    tracker: &ApplyTracker,
    record: &mut ApplicationRecord,
    applied: &[PatchId],
    bar: ProgressBar,
) -> Result<RestoreOutcome> {
    let pending: Vec<PatchId> = manifest
        .traversal()
        .into_iter()
        .filter(|id| !applied.contains(*id) && !record.skipped.contains(*id))
        .cloned()
        .collect();

    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_length(pending.len() as u64);

    for id in pending {
        bar.set_message(id.to_string());
        let path = store.patch_path(&id);

        match engine.apply_patch(&path)? {
            ApplyOutcome::Applied => {
                debug!("applied {id}");
                annotate_head(engine, &id)?;
            }
            ApplyOutcome::AlreadyApplied => {
                warn!("{id} is already present upstream, pruning it from the series");
                store.remove_patches(manifest, std::slice::from_ref(&id))?;
                record.removed += 1;
                tracker.save(record)?;
            }
            ApplyOutcome::Conflict { three_way } => {
                info!("{id} did not apply cleanly");
                tracker.mark_conflicted(&id)?;
                bar.abandon();
                return Ok(RestoreOutcome::Conflicted { id, three_way });
            }
        }

        bar.inc(1);
    }

    bar.finish_and_clear();
    Ok(RestoreOutcome::Completed {
        updated: record.updated,
        removed: record.removed,
    })
}

/// Stamp the sentinel trailer onto the HEAD commit message.
///
/// Idempotent: a message already carrying the trailer is left alone, so
/// re-annotating after a resolve cannot stack duplicates.
pub fn annotate_head<E: PatchEngine>(engine: &E, id: &PatchId) -> Result<()> {
    let message = engine.message_of("HEAD")?;
    if message
        .lines()
        .any(|line| line.starts_with(PATCH_TRAILER))
    {
        return Ok(());
    }

    let annotated = format!("{}\n\n{PATCH_TRAILER} {id}", message.trim_end());
    engine.amend_head_message(&annotated)?;

    Ok(())
}

/// Series walk error types.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Patch store access fails.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Application record access fails.
    #[error(transparent)]
    State(#[from] crate::checkout::state::StateError),

    /// Git operations fail.
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
pub type Result<T, E = ApplyError> = std::result::Result<T, E>;
