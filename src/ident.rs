// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Patch identifier derivation.
//!
//! Patch identifiers are derived from the summary line of the commit a patch
//! was captured from. The derivation must be deterministic so that saving the
//! same commit twice yields the same identifier, and the result must be safe
//! to use as a file name inside the patch store. Both functions here are pure;
//! collision handling is driven entirely by the caller-provided occupancy
//! predicate.

/// Maximum length of a generated slug in characters.
pub const MAX_SLUG_LEN: usize = 64;

/// Fallback slug for names that reduce to nothing.
pub const EMPTY_SLUG: &str = "patch";

/// Derive a filesystem-safe slug from a human-readable patch name.
///
/// Lowercases, maps anything that is not an ASCII letter or digit to a single
/// '-', collapses runs of separators, trims separators from both ends, and
/// truncates to [`MAX_SLUG_LEN`]. Identical inputs always produce identical
/// slugs.
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut pending_sep = false;

    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }

        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        return EMPTY_SLUG.into();
    }

    slug
}

/// Disambiguate a candidate identifier against an existing set.
///
/// Appends a numeric suffix, incrementing until the occupancy predicate
/// reports the candidate free. Given the same candidate and the same occupied
/// set the result is always the same, which keeps saves reproducible.
pub fn resolve_collision(candidate: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(candidate) {
        return candidate.into();
    }

    let mut suffix = 2u64;
    loop {
        let attempt = format!("{candidate}-{suffix}");
        if !is_taken(&attempt) {
            return attempt;
        }
        suffix += 1;
    }
}
