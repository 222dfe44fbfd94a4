// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch text normalization.
//!
//! Patch files are regenerated wholesale on every save, so any text that
//! varies between regenerations of an unchanged patch would churn the store's
//! history and provoke spurious conflicts. Three things vary: the commit hash
//! on the leading mbox "From" line, the git version trailer at the bottom,
//! and the amount of blank space different git versions leave before the
//! diff. All are rewritten to fixed forms before a patch enters the store.
//! Sentinel annotation lines are stripped as well; they belong to checkout
//! history, not to patch content.

use crate::checkout::PATCH_TRAILER;

/// Replacement for the commit hash on the mbox "From" line.
pub const FROM_HASH_TOKEN: &str = "patchstack";

/// Replacement for the git version trailer embedded in every patch.
pub const PATCH_GIT_VERSION: &str = "2.43.0";

/// Normalize generated patch text into its stored form.
///
/// # Errors
///
/// - Return [`FixupError::MissingFromLine`] if no mbox "From" line exists.
/// - Return [`FixupError::MissingGitVersion`] if no version trailer exists.
pub fn fixup(content: &str) -> Result<String> {
    let mut lines: Vec<String> = content.split('\n').map(str::to_owned).collect();

    replace_from_hash(&mut lines)?;
    replace_git_version(&mut lines)?;
    lines.retain(|line| !line.contains(PATCH_TRAILER));
    collapse_blanks_before_diff(&mut lines);

    Ok(lines.join("\n"))
}

/// The hash on the "From" line differs each time the patch is regenerated.
fn replace_from_hash(lines: &mut [String]) -> Result<()> {
    let line = lines
        .iter_mut()
        .find(|line| line.starts_with("From "))
        .ok_or(FixupError::MissingFromLine)?;

    let mut parts: Vec<&str> = line.split(' ').collect();
    if parts.len() > 1 {
        parts[1] = FROM_HASH_TOKEN;
    }
    *line = parts.join(" ");

    Ok(())
}

/// The git version is embedded at the bottom of the patch and differs across
/// machines, so it is pinned to one value.
fn replace_git_version(lines: &mut [String]) -> Result<()> {
    let line = lines
        .iter_mut()
        .rev()
        .filter(|line| !line.is_empty())
        .find(|line| {
            line.starts_with(|c: char| c.is_ascii_digit()) && line.contains('.')
        })
        .ok_or(FixupError::MissingGitVersion)?;

    *line = PATCH_GIT_VERSION.into();

    Ok(())
}

/// Different git versions emit different amounts of trailing blank space
/// between the subject block and the diff; keep exactly one blank line.
fn collapse_blanks_before_diff(lines: &mut Vec<String>) {
    let Some(diff_idx) = lines.iter().position(|line| line.starts_with("diff --git"))
    else {
        return;
    };

    let mut first_blank = diff_idx;
    while first_blank > 0 && lines[first_blank - 1].is_empty() {
        first_blank -= 1;
    }

    if diff_idx - first_blank > 1 {
        lines.drain(first_blank..diff_idx - 1);
    }
}

/// Patch normalization error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FixupError {
    /// Patch lacks the leading mbox "From" line.
    #[error("malformed patch: mbox 'From' line not found")]
    MissingFromLine,

    /// Patch lacks the trailing git version line.
    #[error("malformed patch: git version trailer not found")]
    MissingGitVersion,
}

/// Friendly result alias :3
pub type Result<T, E = FixupError> = std::result::Result<T, E>;
