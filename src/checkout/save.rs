// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch capture pipeline.
//!
//! Turns commits sitting on top of an upstream point into normalized patch
//! files ready to enter the store. Generation shells out to the mailbox
//! machinery, then every generated file is normalized and assigned a durable
//! identifier. A commit that already carries the sentinel trailer keeps the
//! identifier it names, so refreshing an applied patch can never fork it into
//! a second file. Everything else gets a fresh identifier derived from its
//! summary line, disambiguated against the manifest, the store, and the rest
//! of the batch.

use crate::{
    checkout::PATCH_TRAILER,
    engine::PatchEngine,
    fixup::fixup,
    ident::{resolve_collision, slugify},
    series::{PatchId, SeriesManifest},
    store::{PatchStore, PATCH_EXTENSION},
};

use std::fs;
use tracing::{debug, instrument};

/// Scratch directory for generated patch files, relative to the git
/// directory.
const OUTGOING_DIR: &str = "patchstack/outgoing";

/// One normalized patch ready to enter the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedPatch {
    pub id: PatchId,
    pub content: Vec<u8>,
}

/// Capture every commit after `since` as a normalized, identified patch.
///
/// Results come back oldest first, matching application order. Generated
/// scratch files are removed as they are consumed. `prefix` places fresh
/// identifiers under a store subdirectory; identifiers reused from
/// annotations keep their existing location regardless.
#[instrument(skip(engine, store, manifest), level = "debug")]
pub fn capture<E: PatchEngine>(
    engine: &E,
    store: &PatchStore,
    manifest: &SeriesManifest,
    since: &str,
    prefix: Option<&str>,
) -> Result<Vec<CapturedPatch>> {
    let outgoing = engine.gitdir().join(OUTGOING_DIR);
    mkdirp::mkdirp(&outgoing).map_err(|err| SaveError::Scratch {
        source: err,
        path: outgoing.clone(),
    })?;

    let files = engine.format_patches(since, &outgoing)?;
    let mut batch: Vec<CapturedPatch> = Vec::new();

    for file in files {
        let raw = fs::read_to_string(&file).map_err(|err| SaveError::Scratch {
            source: err,
            path: file.clone(),
        })?;
        fs::remove_file(&file).map_err(|err| SaveError::Scratch {
            source: err,
            path: file.clone(),
        })?;

        let annotation = annotation_of(&raw);
        let content = fixup(&raw)?.into_bytes();

        let id = match annotation {
            Some(id) => {
                debug!("refreshing {id}");
                id
            }
            None => assign_id(store, manifest, &batch, &raw, &content, prefix)?,
        };

        // INVARIANT: One batch never yields the same identifier twice.
        if batch.iter().any(|captured| captured.id == id) {
            continue;
        }

        batch.push(CapturedPatch { id, content });
    }

    Ok(batch)
}

/// Derive a fresh identifier for an unannotated commit.
fn assign_id(
    store: &PatchStore,
    manifest: &SeriesManifest,
    batch: &[CapturedPatch],
    raw: &str,
    content: &[u8],
    prefix: Option<&str>,
) -> Result<PatchId> {
    let subject = subject_of(raw).ok_or(SaveError::MissingSubject)?;
    let slug = slugify(&subject);

    let compose = |slug: &str| match prefix {
        Some(prefix) => format!("{prefix}/{slug}.{PATCH_EXTENSION}"),
        None => format!("{slug}.{PATCH_EXTENSION}"),
    };

    // An identical patch already captured in this batch or already stored
    // under the natural identifier is the same patch; reuse its identifier
    // instead of suffixing a duplicate.
    if let Ok(candidate) = PatchId::new(compose(&slug)) {
        if let Some(existing) = batch.iter().find(|captured| captured.id == candidate) {
            if existing.content == content {
                return Ok(candidate);
            }
        }
        if manifest.contains(&candidate) && store.read_patch(&candidate)? == content {
            return Ok(candidate);
        }
    }

    let taken = |slug: &str| {
        let candidate = compose(slug);
        manifest
            .traversal()
            .iter()
            .any(|id| id.as_str() == candidate)
            || batch.iter().any(|captured| captured.id.as_str() == candidate)
            || store.root().join(&candidate).is_file()
    };

    let slug = resolve_collision(&slug, taken);
    Ok(PatchId::new(compose(&slug))?)
}

/// Extract the identifier named by a sentinel trailer, if present.
fn annotation_of(content: &str) -> Option<PatchId> {
    content
        .lines()
        .take_while(|line| !line.starts_with("diff --git"))
        .find_map(|line| line.strip_prefix(PATCH_TRAILER))
        .and_then(|rest| PatchId::new(rest.trim()).ok())
}

/// Extract the summary line from a generated patch's mbox headers.
fn subject_of(content: &str) -> Option<String> {
    content
        .lines()
        .take_while(|line| !line.starts_with("diff --git"))
        .find_map(|line| line.strip_prefix("Subject: "))
        .map(|subject| subject.trim().to_owned())
}

/// Capture pipeline error types.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// Generated patch lacks a summary line to derive an identifier from.
    #[error("generated patch has no subject line")]
    MissingSubject,

    /// Scratch files for generated patches cannot be managed.
    #[error("failed to manage scratch patch file at {}", path.display())]
    Scratch {
        #[source]
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    /// Patch normalization fails.
    #[error(transparent)]
    Fixup(#[from] crate::fixup::FixupError),

    /// Identifier construction fails.
    #[error(transparent)]
    Series(#[from] crate::series::SeriesError),

    /// Patch store access fails.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Git operations fail.
    #[error(transparent)]
    Engine(#[from] crate::engine::EngineError),
}

/// Friendly result alias :3
pub type Result<T, E = SaveError> = std::result::Result<T, E>;
