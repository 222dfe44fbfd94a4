// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application state tracking.
//!
//! Restores and saves are multi-step git operations that can be interrupted
//! by a conflict or a crash at any point. The __application record__ is a
//! small TOML file inside the checkout's git directory that captures
//! everything needed to resume or abort: where HEAD was before the walk
//! started, how many patches were already applied, which patch is currently
//! conflicted, and the running refresh counters. Its existence is the lock;
//! while the file is present no second restore may begin.
//!
//! The record lives under the git directory rather than the working tree so
//! it can never be clobbered by patch application itself.

use crate::series::PatchId;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// File name of the application record inside the git directory.
const RECORD_FILE: &str = "patchstack/record.toml";

/// Phase of the patch application state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyState {
    /// No restore in progress.
    Clean,

    /// A series walk is underway with no outstanding conflict.
    Applying,

    /// The walk stopped on a conflicted patch awaiting resolve, skip, or
    /// abort.
    Conflicted,
}

/// Durable record of one in-progress series application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    /// Number of patches that were already applied when the walk began.
    pub start_prefix: usize,

    /// Hash HEAD pointed at before the walk began. Abort resets here.
    pub pre_apply_head: String,

    /// Patch the walk is currently stopped on, if any.
    pub conflict: Option<PatchId>,

    /// Patches skipped during this walk whose entries were retained.
    pub skipped: Vec<PatchId>,

    /// Patches whose stored content was refreshed during this walk.
    pub updated: u32,

    /// Patches pruned because their changes were already upstream.
    pub removed: u32,
}

impl ApplicationRecord {
    /// Construct a record for a walk starting at the given position.
    pub fn new(start_prefix: usize, pre_apply_head: impl Into<String>) -> Self {
        Self {
            start_prefix,
            pre_apply_head: pre_apply_head.into(),
            ..Default::default()
        }
    }
}

impl FromStr for ApplicationRecord {
    type Err = StateError;

    fn from_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

impl Display for ApplicationRecord {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match toml::to_string(self) {
            Ok(text) => fmt.write_str(&text),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

/// Manager of the on-disk application record.
pub struct ApplyTracker {
    record_path: PathBuf,
}

impl ApplyTracker {
    /// Construct a tracker rooted at a checkout's git directory.
    pub fn new(gitdir: impl AsRef<Path>) -> Self {
        Self {
            record_path: gitdir.as_ref().join(RECORD_FILE),
        }
    }

    /// Current phase of the state machine.
    pub fn state(&self) -> ApplyState {
        match self.load() {
            Ok(record) if record.conflict.is_some() => ApplyState::Conflicted,
            Ok(_) => ApplyState::Applying,
            Err(_) => ApplyState::Clean,
        }
    }

    /// Read the current record.
    ///
    /// # Errors
    ///
    /// - Return [`StateError::NotInProgress`] if no record exists.
    /// - Return [`StateError::Toml`] if the record file is mangled.
    pub fn load(&self) -> Result<ApplicationRecord> {
        let text = fs::read_to_string(&self.record_path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StateError::NotInProgress
            } else {
                StateError::Io {
                    source: err,
                    path: self.record_path.clone(),
                }
            }
        })?;

        text.parse()
    }

    /// Begin a new series application.
    ///
    /// # Errors
    ///
    /// - Return [`StateError::InProgress`] if a record already exists; the
    ///   previous application must be finished or aborted first.
    #[instrument(skip(self, record), level = "debug")]
    pub fn begin(&self, record: &ApplicationRecord) -> Result<()> {
        if self.record_path.exists() {
            return Err(StateError::InProgress);
        }

        self.save(record)
    }

    /// Persist the record, replacing any previous contents.
    pub fn save(&self, record: &ApplicationRecord) -> Result<()> {
        if let Some(parent) = self.record_path.parent() {
            mkdirp::mkdirp(parent).map_err(|err| StateError::Io {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        fs::write(&self.record_path, record.to_string()).map_err(|err| StateError::Io {
            source: err,
            path: self.record_path.clone(),
        })?;

        Ok(())
    }

    /// Mark the walk as stopped on a conflicted patch.
    pub fn mark_conflicted(&self, id: &PatchId) -> Result<()> {
        let mut record = self.load()?;
        record.conflict = Some(id.clone());
        self.save(&record)
    }

    /// Clear the outstanding conflict after resolution.
    ///
    /// # Errors
    ///
    /// - Return [`StateError::NothingToResolve`] if no conflict is recorded.
    pub fn mark_resolved(&self) -> Result<ApplicationRecord> {
        let mut record = self.load()?;
        if record.conflict.take().is_none() {
            return Err(StateError::NothingToResolve);
        }

        self.save(&record)?;
        Ok(record)
    }

    /// Record a skipped patch and clear the outstanding conflict.
    ///
    /// # Errors
    ///
    /// - Return [`StateError::NothingToResolve`] if no conflict is recorded.
    pub fn mark_skipped(&self) -> Result<ApplicationRecord> {
        let mut record = self.load()?;
        let Some(id) = record.conflict.take() else {
            return Err(StateError::NothingToResolve);
        };

        record.skipped.push(id);
        self.save(&record)?;
        Ok(record)
    }

    /// Complete the application and return the final record.
    pub fn finish(&self) -> Result<ApplicationRecord> {
        let record = self.load()?;
        self.clear();
        Ok(record)
    }

    /// Remove the record unconditionally. Absence is tolerated.
    pub fn clear(&self) {
        match fs::remove_file(&self.record_path) {
            Ok(()) => debug!("cleared application record"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove application record: {err}"),
        }
    }
}

/// Application state error types.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A series application is already underway.
    #[error("a patch application is already in progress; resolve, skip, or abort it first")]
    InProgress,

    /// No series application is underway.
    #[error("no patch application is in progress")]
    NotInProgress,

    /// No conflict is outstanding to resolve or skip.
    #[error("no conflicted patch to act on")]
    NothingToResolve,

    /// Record file cannot be read or written.
    #[error("failed to access application record at {}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Record file content is mangled.
    #[error("application record is mangled")]
    Toml(#[from] toml::de::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StateError> = std::result::Result<T, E>;
