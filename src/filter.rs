//! Name-based download eligibility rules.
//!
//! This module provides the [`FilterEngine`], which evaluates an ordered list
//! of [`FilterRule`]s against file and directory names from a remote file
//! tree and decides whether each entry should be downloaded.
//!
//! # Overview
//!
//! Rules are declared in the configuration file and evaluated in declaration
//! order. Each rule either *includes* (the name must match to stay eligible)
//! or *excludes* (the name must not match). The first rule that vetoes an
//! entry wins; an entry no rule vetoes is eligible.
//!
//! Rules flagged `relaxable_on_empty` are skipped during a *relaxed* pass,
//! the fallback the orchestrator runs when strict filtering leaves an item
//! with no audio files at all.
//!
//! # Example
//!
//! ```
//! use workdl_core::filter::{EntryKind, FilterEngine, FilterMode, FilterRule, FilterScope};
//!
//! let rules = vec![FilterRule {
//!     pattern: r"\.wav$".to_string(),
//!     mode: FilterMode::Exclude,
//!     scope: FilterScope::File,
//!     exact_match: false,
//!     ignore_case: true,
//!     relaxable_on_empty: false,
//! }];
//! let engine = FilterEngine::new(&rules).unwrap();
//! assert!(!engine.decide("a.wav", EntryKind::File, false));
//! assert!(engine.decide("a.mp3", EntryKind::File, false));
//! ```

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

/// Whether a rule keeps matching names or drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// The name must match the pattern to stay eligible.
    Include,
    /// The name must not match the pattern to stay eligible.
    Exclude,
}

/// Which entry kinds a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    /// Leaf files only.
    File,
    /// Directories only.
    Directory,
    /// Both files and directories.
    All,
}

/// The kind of tree entry a decision is being made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A leaf file.
    File,
    /// A directory.
    Directory,
}

/// One user-declared eligibility rule.
///
/// Deserialized from the `[[filters]]` array of the config file; the boolean
/// knobs all default to `false` so a minimal rule is just a pattern and a
/// mode.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterRule {
    /// Regular expression matched against the entry name.
    pub pattern: String,
    /// Include or exclude semantics.
    pub mode: FilterMode,
    /// Entry kinds this rule applies to.
    #[serde(default = "default_scope")]
    pub scope: FilterScope,
    /// Whole-string match instead of substring search.
    #[serde(default)]
    pub exact_match: bool,
    /// Case-insensitive matching.
    #[serde(default)]
    pub ignore_case: bool,
    /// Skip this rule during the relaxed fallback pass.
    #[serde(default)]
    pub relaxable_on_empty: bool,
}

fn default_scope() -> FilterScope {
    FilterScope::All
}

/// Error compiling a rule list into an engine.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A rule's pattern is not a valid regular expression.
    #[error("invalid filter pattern `{pattern}`: {source}")]
    BadPattern {
        /// The offending pattern.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// A compiled rule, ready for repeated evaluation.
#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    mode: FilterMode,
    scope: FilterScope,
    exact_match: bool,
    relaxable_on_empty: bool,
}

impl CompiledRule {
    fn applies_to(&self, kind: EntryKind) -> bool {
        match (self.scope, kind) {
            (FilterScope::All, _)
            | (FilterScope::File, EntryKind::File)
            | (FilterScope::Directory, EntryKind::Directory) => true,
            _ => false,
        }
    }

    fn matches(&self, name: &str) -> bool {
        if self.exact_match {
            self.regex
                .find(name)
                .is_some_and(|m| m.start() == 0 && m.end() == name.len())
        } else {
            self.regex.is_match(name)
        }
    }
}

/// Ordered rule evaluator with first-veto-wins semantics.
#[derive(Debug)]
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
}

impl FilterEngine {
    /// Compiles a rule list into an engine.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::BadPattern`] for the first rule whose pattern
    /// fails to compile.
    pub fn new(rules: &[FilterRule]) -> Result<Self, FilterError> {
        let compiled = rules
            .iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(rule.ignore_case)
                    .build()
                    .map_err(|source| FilterError::BadPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    })?;
                Ok(CompiledRule {
                    regex,
                    mode: rule.mode,
                    scope: rule.scope,
                    exact_match: rule.exact_match,
                    relaxable_on_empty: rule.relaxable_on_empty,
                })
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        Ok(Self { rules: compiled })
    }

    /// Returns an engine with no rules; every entry is eligible.
    #[must_use]
    pub fn permissive() -> Self {
        Self { rules: Vec::new() }
    }

    /// Decides whether an entry named `name` is eligible for download.
    ///
    /// When `relaxed` is true, rules marked `relaxable_on_empty` are skipped.
    /// An include rule vetoes on non-match, an exclude rule vetoes on match;
    /// the first veto wins.
    #[must_use]
    pub fn decide(&self, name: &str, kind: EntryKind, relaxed: bool) -> bool {
        for rule in &self.rules {
            if !rule.applies_to(kind) {
                continue;
            }
            if relaxed && rule.relaxable_on_empty {
                continue;
            }
            if rule.matches(name) ^ (rule.mode == FilterMode::Include) {
                return false;
            }
        }
        true
    }
}
