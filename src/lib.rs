// src/lib.rs

//! Conary installation engine
//!
//! Applies change sets to an install root with journaled, revertible file
//! writes and a rollback stack.
//!
//! # Architecture
//!
//! - Database-first: installed troves, files, dependencies and pins live in
//!   SQLite ([`db`])
//! - Change sets: absolute or relative trove changes plus file streams and
//!   contents ([`changeset`])
//! - Dependency engine: checks a job set and orders it into install groups
//!   ([`resolver`])
//! - Filesystem merge: three-way merge of old, new and on-disk state into a
//!   plan ([`update`])
//! - Journal: every mutation is recorded first so a crash can be reverted
//!   ([`transaction`])
//! - Apply engine: drives the above, runs scripts and tag handlers, and
//!   keeps rollbacks ([`engine`])
//! - Capsules: packages owned by a foreign packager such as rpm
//!   ([`capsule`])

pub mod capsule;
pub mod changeset;
pub mod config;
pub mod db;
pub mod deps;
pub mod engine;
pub mod error;
pub mod files;
pub mod filesystem;
pub mod flavor;
pub mod hash;
pub mod label;
pub mod progress;
pub mod resolver;
pub mod scriptlet;
pub mod streams;
pub mod transaction;
pub mod trigger;
pub mod trove;
pub mod update;
pub mod version;

pub use changeset::{ChangeSet, ChangeSetBuilder, TroveBuilder};
pub use config::{EngineConfig, UpdateFlags};
pub use engine::{ApplyOptions, ApplyReport, Engine};
pub use error::{Error, Result};
pub use flavor::Flavor;
pub use label::{Label, LabelPath};
pub use progress::{Phase, UpdateCallback};
pub use resolver::Job;
pub use trove::{Trove, TroveTuple};
pub use version::Version;
