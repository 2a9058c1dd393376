//! Terminal rendering of diff reports.
//!
//! One color class per partition: missing wanted files red, stale filtered
//! files yellow, user-added files green, expected-absent dim, in-sync
//! unstyled.

use std::collections::BTreeMap;
use std::path::Component;

use console::Style;

use super::{DiffEntry, DiffReport, DiffState};

/// Intermediate tree node keyed by component name.
#[derive(Default)]
struct Node {
    children: BTreeMap<String, Node>,
    state: Option<DiffState>,
}

impl Node {
    fn insert(&mut self, entry: &DiffEntry) {
        let mut node = self;
        for component in entry.path.components() {
            if let Component::Normal(name) = component {
                node = node
                    .children
                    .entry(name.to_string_lossy().into_owned())
                    .or_default();
            }
        }
        node.state = Some(entry.state);
    }
}

fn style_for(state: DiffState) -> Style {
    match state {
        DiffState::InSync => Style::new(),
        DiffState::FilteredPresent => Style::new().yellow(),
        DiffState::MissingWanted => Style::new().red(),
        DiffState::Added => Style::new().green(),
        DiffState::FilteredAbsent => Style::new().dim(),
    }
}

fn marker_for(state: DiffState) -> &'static str {
    match state {
        DiffState::InSync => "",
        DiffState::FilteredPresent => "  [filtered, present]",
        DiffState::MissingWanted => "  [missing]",
        DiffState::Added => "  [added]",
        DiffState::FilteredAbsent => "  [filtered]",
    }
}

/// Renders a diff report as an indented tree with one color per class.
#[must_use]
pub fn render_diff_tree(report: &DiffReport) -> String {
    let mut root = Node::default();
    for entry in &report.entries {
        root.insert(entry);
    }

    let mut out = String::new();
    out.push_str(&report.id.name());
    out.push('\n');
    render_children(&root, "", &mut out);
    out
}

fn render_children(node: &Node, prefix: &str, out: &mut String) {
    let count = node.children.len();
    for (index, (name, child)) in node.children.iter().enumerate() {
        let last = index + 1 == count;
        let branch = if last { "└── " } else { "├── " };

        let label = match child.state {
            Some(state) => format!(
                "{}{}",
                style_for(state).apply_to(name),
                style_for(state).apply_to(marker_for(state))
            ),
            None => name.clone(),
        };
        out.push_str(prefix);
        out.push_str(branch);
        out.push_str(&label);
        out.push('\n');

        let child_prefix = if last {
            format!("{prefix}    ")
        } else {
            format!("{prefix}│   ")
        };
        render_children(child, &child_prefix, out);
    }
}
