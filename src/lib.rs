// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! # Patchstack
//!
//! Manage a series of patches applied on top of an upstream git history.
//!
//! Patches live in a __patch store__: a directory, itself under git, holding
//! one patch file per logical change plus a plain-text series manifest that
//! fixes application order. A __working checkout__ is any git repository
//! linked to a store; patchstack applies the series on top of its upstream
//! history, captures edits back into the store, and keeps track of which
//! patches are applied by stamping a sentinel trailer onto the commits it
//! creates.
//!
//! The flow is deliberately reversible end to end: the checkout can always be
//! rolled back to pristine upstream, because the store is the only durable
//! artifact. See [`checkout::WorkingCheckout`] for the operation surface the
//! command line maps onto.

pub mod check;
pub mod checkout;
pub mod engine;
pub mod fixup;
pub mod graph;
pub mod ident;
pub mod series;
pub mod store;

#[doc(inline)]
pub use crate::{
    check::Report,
    checkout::{apply::RestoreOutcome, CheckoutError, StatusReport, WorkingCheckout},
    engine::{ApplyOutcome, GitEngine, PatchEngine},
    graph::dot_graph,
    series::{PatchId, SeriesManifest},
    store::{PatchStore, SaveStats},
};
