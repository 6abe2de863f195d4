// src/cli/mod.rs
//! CLI definitions for conary-engine
//!
//! Command implementations live in the `commands` module.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conary-engine")]
#[command(author = "Conary Project")]
#[command(version)]
#[command(about = "Apply, verify and roll back Conary change sets on an install root", long_about = None)]
pub struct Cli {
    /// Installation root directory
    #[arg(short, long, global = true, default_value = "/")]
    pub root: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Switches shared by every command that changes the root
#[derive(Args, Debug, Clone, Default)]
pub struct UpdateArgs {
    /// Plan and report without changing anything
    #[arg(long)]
    pub test: bool,

    /// Do not run trove scripts or tag handlers
    #[arg(long)]
    pub no_scripts: bool,

    /// Update the database only
    #[arg(long)]
    pub just_db: bool,

    /// Replace files owned by other troves, unowned files and modified files
    #[arg(long)]
    pub replace_files: bool,

    /// Overwrite local changes instead of merging them
    #[arg(long)]
    pub no_merge: bool,

    /// Owner and group differences are not conflicts
    #[arg(long)]
    pub ignore_ugids: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply one or more change set files
    Apply {
        /// Change set files; merged before applying
        #[arg(required = true)]
        changesets: Vec<PathBuf>,

        #[command(flatten)]
        update: UpdateArgs,

        /// Do not record a rollback
        #[arg(long)]
        no_rollback: bool,

        /// Trove names to install first; the rest waits for `resume`
        #[arg(long, value_delimiter = ',')]
        critical: Vec<String>,
    },

    /// Erase installed troves (NAME or NAME=VERSION)
    Erase {
        #[arg(required = true)]
        troves: Vec<String>,

        #[command(flatten)]
        update: UpdateArgs,
    },

    /// Check a change set's dependencies against the installed troves
    Check { changeset: PathBuf },

    /// List installed troves
    List {
        /// Only troves with this name
        name: Option<String>,
    },

    /// Show files of an installed trove that differ from the database
    Verify {
        /// Trove name or NAME=VERSION
        trove: String,
    },

    /// Apply rollbacks, newest first
    Rollback {
        /// Rollback names (r.N); newest first
        #[arg(required = true)]
        names: Vec<String>,

        /// Do not run scripts
        #[arg(long)]
        no_scripts: bool,
    },

    /// List rollbacks
    Rollbacks,

    /// Pin a trove so updates install next to it
    Pin { trove: String },

    /// Unpin a trove
    Unpin { trove: String },

    /// Finish or revert an interrupted apply
    Recover,

    /// Finish jobs left behind by a critical update
    Resume,

    /// Record foreign packages as phantom troves
    SyncCapsules,
}
