//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use workdl_core::SourceId;

/// Batch download and reconcile voice-work libraries from a remote catalog.
#[derive(Parser, Debug)]
#[command(name = "workdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file path (defaults to the XDG location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download items by source id
    Get {
        /// Source ids (RJ123456 or bare digits)
        #[arg(required = true)]
        ids: Vec<SourceId>,

        /// Delete and refetch files that already exist in the download location
        #[arg(long)]
        replace: bool,
    },

    /// Regenerate metadata snapshots and recovery manifests without fetching
    Update {
        /// Source ids
        #[arg(required = true)]
        ids: Vec<SourceId>,
    },

    /// Show a colored tree of manifest state vs local files
    Diff {
        /// Source id
        id: SourceId,
    },

    /// Report items with missing wanted files (all items when none given)
    Check {
        /// Source ids to restrict the sweep to
        ids: Vec<SourceId>,

        /// Print only the failing ids, one per line
        #[arg(long)]
        ids_only: bool,
    },

    /// Re-fetch files the manifest wants but the library lacks
    Recover {
        /// Source id
        id: SourceId,

        /// Only recover paths matching this regex
        #[arg(short, long)]
        regex: Option<String>,

        /// Also recover files the filters excluded
        #[arg(short, long)]
        ignore_filter: bool,
    },

    /// Verify local file content against the catalog's hash records
    Verify {
        /// Source id
        id: SourceId,
    },
}
