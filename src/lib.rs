//! workdl core library
//!
//! Batch-downloads hierarchical voice-work items from a remote catalog,
//! filters their file trees through user-defined rules, and keeps a
//! per-item recovery manifest that drives later reconciliation
//! (diff/check/recover/verify).
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`api`] - Authenticated catalog client (metadata, file trees, hash checks)
//! - [`filter`] - Ordered eligibility rules with a relaxed fallback pass
//! - [`download`] - Governor, retry gate, fetch backends and the orchestrator
//! - [`manifest`] - The per-item `.recover` recovery manifest
//! - [`library`] - Two-location local layout (download + storage)
//! - [`reconcile`] - diff/check/recover/verify over manifests and local state

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod download;
pub mod filter;
pub mod ids;
pub mod library;
pub mod manifest;
pub mod reconcile;

// Re-export commonly used types
pub use api::{ApiError, CatalogClient, FileTreeEntry, ItemMetadata};
pub use config::{Config, ConfigError, FetchBackend};
pub use download::{
    Aria2Fetcher, BatchSummary, ConcurrencyGovernor, DownloadOrchestrator, FetchError, Fetcher,
    FileDecision, GateError, HttpFetcher, RetryGate, Retryable,
};
pub use filter::{EntryKind, FilterEngine, FilterMode, FilterRule, FilterScope};
pub use ids::SourceId;
pub use library::{DownloadLedger, Library, PermissiveLedger};
pub use manifest::{ManifestError, RecoveryRecord};
pub use reconcile::{DiffReport, DiffState, ReconcileError, Reconciler, render_diff_tree};
