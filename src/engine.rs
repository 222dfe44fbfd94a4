// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git operations backing patch application.
//!
//! Everything patchstack does to a working checkout funnels through the
//! [`PatchEngine`] trait, so the series walk and the command layer stay
//! testable against a scripted fake. The real implementation, [`GitEngine`],
//! mixes libgit2 for repository inspection with shell-outs to the git binary
//! for the mailbox machinery (`git am`, `git format-patch`), which libgit2
//! does not provide.
//!
//! # Outcome Detection
//!
//! `git am` reports its result through exit status and output text rather
//! than anything structured, so [`GitEngine::apply_patch`] classifies the
//! combination:
//!
//! - success, output mentions "atch already applied": the patch's changes are
//!   already in upstream, nothing was committed.
//! - success otherwise: one new commit.
//! - failure mentioning "atch already applied": same as the first case on
//!   older git, with a half-open mailbox session that gets closed via
//!   `git am --skip`.
//! - failure mentioning "sha1 information is lacking": conflict, and the
//!   blob prerequisites for a three-way merge are absent.
//! - any other failure: conflict with three-way markers left in the tree.

use git2::{Repository, ResetType, StatusOptions};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Output fragment git emits when a patch's changes are already upstream.
const ALREADY_APPLIED_FRAGMENT: &str = "atch already applied";

/// Output fragment git emits when three-way merge prerequisites are missing.
const NO_THREE_WAY_FRAGMENT: &str = "sha1 information is lacking";

/// Result of attempting to apply one patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Patch applied cleanly as one new commit.
    Applied,

    /// Patch's changes are already present upstream; no commit was made.
    AlreadyApplied,

    /// Patch did not apply; the mailbox session is left open.
    Conflict {
        /// Whether conflict markers were left in the tree for hand-merging.
        three_way: bool,
    },
}

/// How to continue an interrupted mailbox session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmContinue {
    /// Conflicts were hand-resolved and staged; commit the patch.
    Resolved,

    /// Drop the current patch and move on.
    Skip,

    /// Tear down the session without committing anything.
    Abort,
}

/// Git operations the series walk and command layer depend on.
pub trait PatchEngine {
    /// Working tree root of the checkout.
    fn workdir(&self) -> &Path;

    /// Git directory of the checkout.
    fn gitdir(&self) -> &Path;

    /// Apply one patch file via the mailbox machinery.
    fn apply_patch(&self, patch: &Path) -> Result<ApplyOutcome>;

    /// Continue or tear down an interrupted mailbox session.
    fn continue_apply(&self, how: AmContinue) -> Result<()>;

    /// Check whether a patch would reverse-apply cleanly, meaning its changes
    /// are already present in the tree.
    fn reverse_applies_cleanly(&self, patch: &Path) -> Result<bool>;

    /// Generate patch files for every commit after `since` up to HEAD,
    /// oldest first, into `output_dir`.
    fn format_patches(&self, since: &str, output_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Full hash of HEAD.
    fn head_id(&self) -> Result<String>;

    /// Full hash of an arbitrary revision.
    fn rev_id(&self, rev: &str) -> Result<String>;

    /// Hash and full message of the commit `skip` steps behind HEAD.
    fn commit_at(&self, skip: usize) -> Result<Option<(String, String)>>;

    /// Full message of an arbitrary revision.
    fn message_of(&self, rev: &str) -> Result<String>;

    /// Hash of a revision's first parent, if it has one.
    fn parent_of(&self, rev: &str) -> Result<Option<String>>;

    /// Rewrite the message of the HEAD commit in place.
    fn amend_head_message(&self, message: &str) -> Result<()>;

    /// Hard-reset the checkout to a revision.
    fn reset_hard(&self, rev: &str) -> Result<()>;

    /// Check for uncommitted changes to tracked files.
    fn uncommitted_changes(&self) -> Result<bool>;

    /// Check whether a mailbox session is currently open.
    fn apply_in_progress(&self) -> bool;

    /// Read a repository-local config value.
    fn config_get(&self, key: &str) -> Result<Option<String>>;

    /// Write a repository-local config value.
    fn config_set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a repository-local config value.
    fn config_unset(&self, key: &str) -> Result<()>;
}

/// [`PatchEngine`] over a real git repository.
pub struct GitEngine {
    repo: Repository,
    workdir: PathBuf,
    gitdir: PathBuf,
}

impl GitEngine {
    /// Discover the repository containing a path.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Git2`] if no repository contains the path.
    /// - Return [`EngineError::Bare`] if the repository has no working tree.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::discover(path.as_ref())?;
        let Some(workdir) = repo.workdir().map(Path::to_path_buf) else {
            return Err(EngineError::Bare {
                path: repo.path().to_path_buf(),
            });
        };
        let gitdir = repo.path().to_path_buf();

        Ok(Self {
            repo,
            workdir,
            gitdir,
        })
    }

    /// Run git non-interactively inside the working tree, capturing output.
    fn gitcall(&self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Result<String> {
        let args: Vec<std::ffi::OsString> =
            args.into_iter().map(|arg| arg.as_ref().to_owned()).collect();
        debug!("git {:?}", args);

        let output = Command::new("git")
            .current_dir(&self.workdir)
            .args(&args)
            .output()?;

        let combined = combine_output(&output.stdout, &output.stderr);
        if !output.status.success() {
            return Err(EngineError::Command {
                args: args
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" "),
                output: combined,
            });
        }

        Ok(combined)
    }

    /// Like [`Self::gitcall`], but a nonzero exit is data, not an error.
    fn gitcall_unchecked(
        &self,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ) -> Result<(bool, String)> {
        let output = Command::new("git")
            .current_dir(&self.workdir)
            .args(args)
            .output()?;

        Ok((
            output.status.success(),
            combine_output(&output.stdout, &output.stderr),
        ))
    }
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(&stdout);
    }

    if !stderr.is_empty() {
        if !message.is_empty() && !message.ends_with('\n') {
            message.push('\n');
        }
        message.push_str(&stderr);
    }

    // INVARIANT: Chomp trailing newlines.
    while message.ends_with('\n') {
        message.pop();
    }

    message
}

impl PatchEngine for GitEngine {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn gitdir(&self) -> &Path {
        &self.gitdir
    }

    #[instrument(skip(self), level = "debug")]
    fn apply_patch(&self, patch: &Path) -> Result<ApplyOutcome> {
        let (success, output) = self.gitcall_unchecked([
            OsStr::new("am"),
            OsStr::new("--3way"),
            patch.as_os_str(),
        ])?;

        if success {
            if output.contains(ALREADY_APPLIED_FRAGMENT) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            return Ok(ApplyOutcome::Applied);
        }

        if output.contains(ALREADY_APPLIED_FRAGMENT) {
            // Older git leaves the mailbox session open in this case.
            if self.apply_in_progress() {
                self.continue_apply(AmContinue::Skip)?;
            }
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        Ok(ApplyOutcome::Conflict {
            three_way: !output.contains(NO_THREE_WAY_FRAGMENT),
        })
    }

    fn continue_apply(&self, how: AmContinue) -> Result<()> {
        let flag = match how {
            AmContinue::Resolved => "--resolved",
            AmContinue::Skip => "--skip",
            AmContinue::Abort => "--abort",
        };
        self.gitcall(["am", flag])?;
        Ok(())
    }

    fn reverse_applies_cleanly(&self, patch: &Path) -> Result<bool> {
        let (success, _) = self.gitcall_unchecked([
            OsStr::new("apply"),
            OsStr::new("--reverse"),
            OsStr::new("--check"),
            patch.as_os_str(),
        ])?;
        Ok(success)
    }

    #[instrument(skip(self), level = "debug")]
    fn format_patches(&self, since: &str, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let range = format!("{since}..HEAD");
        let output = self.gitcall([
            OsStr::new("format-patch"),
            OsStr::new("--keep-subject"),
            OsStr::new("--no-numbered"),
            OsStr::new("--no-stat"),
            OsStr::new("-o"),
            output_dir.as_os_str(),
            OsStr::new(&range),
        ])?;

        // INVARIANT: format-patch prints one path per line, oldest first.
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    fn head_id(&self) -> Result<String> {
        let head = self.repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    fn rev_id(&self, rev: &str) -> Result<String> {
        let commit = self.repo.revparse_single(rev)?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn commit_at(&self, skip: usize) -> Result<Option<(String, String)>> {
        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;

        let Some(oid) = walk.nth(skip).transpose()? else {
            return Ok(None);
        };
        let commit = self.repo.find_commit(oid)?;

        Ok(Some((
            oid.to_string(),
            String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        )))
    }

    fn message_of(&self, rev: &str) -> Result<String> {
        let commit = self.repo.revparse_single(rev)?.peel_to_commit()?;
        Ok(String::from_utf8_lossy(commit.message_bytes()).into_owned())
    }

    fn parent_of(&self, rev: &str) -> Result<Option<String>> {
        let commit = self.repo.revparse_single(rev)?.peel_to_commit()?;
        Ok(commit.parent_id(0).ok().map(|oid| oid.to_string()))
    }

    fn amend_head_message(&self, message: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        head.amend(Some("HEAD"), None, None, None, Some(message), None)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn reset_hard(&self, rev: &str) -> Result<()> {
        let object = self.repo.revparse_single(rev)?;
        self.repo.reset(&object, ResetType::Hard, None)?;
        Ok(())
    }

    fn uncommitted_changes(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    fn apply_in_progress(&self) -> bool {
        self.gitdir.join("rebase-apply").is_dir()
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        let config = self.repo.config()?.snapshot()?;
        match config.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.repo.config()?.set_str(key, value)?;
        Ok(())
    }

    fn config_unset(&self, key: &str) -> Result<()> {
        let mut config = self.repo.config()?;
        match config.remove(key) {
            Ok(()) => Ok(()),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Git engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Repository has no working tree to apply patches into.
    #[error("repository at {} is bare", path.display())]
    Bare { path: PathBuf },

    /// Git binary invocation fails outright.
    #[error("failed to run git")]
    Syscall(#[from] std::io::Error),

    /// Git binary exits nonzero.
    #[error("git {args} failed:\n{output}")]
    Command { args: String, output: String },

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
