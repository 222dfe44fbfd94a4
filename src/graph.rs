// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dependency graph rendering.
//!
//! Renders the series forest as Graphviz DOT so the nesting structure can be
//! inspected visually with standard tooling. Edges point from dependent to
//! dependency, matching the "depends on" reading.

use crate::series::{PatchEntry, SeriesManifest};

/// Render a manifest as a Graphviz DOT digraph.
///
/// Every entry with a parent becomes an edge `"child" -> "parent"`, emitted in
/// application order. Childless roots still appear as bare nodes so an
/// unstructured series renders as a visible node set rather than an empty
/// graph. Pure text generation; equal manifests yield equal output.
pub fn dot_graph(manifest: &SeriesManifest) -> String {
    fn walk(nodes: &[PatchEntry], parent: Option<&PatchEntry>, out: &mut String) {
        for node in nodes {
            match parent {
                Some(parent) => {
                    out.push_str(&format!("    \"{}\" -> \"{}\";\n", node.id, parent.id));
                }
                None if node.children.is_empty() => {
                    out.push_str(&format!("    \"{}\";\n", node.id));
                }
                None => {}
            }
            walk(&node.children, Some(node), out);
        }
    }

    let mut out = String::from("digraph patchdeps {\n");
    walk(manifest.roots(), None, &mut out);
    out.push_str("}\n");
    out
}
