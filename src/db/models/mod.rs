// src/db/models/mod.rs

//! Row models for the installed-system database
//!
//! Each model maps one table (or a closely related pair) and provides the
//! inserts and lookups [`super::TroveStore`] composes into trove-level
//! operations.

pub mod dependency;
mod file_stream;
mod instance;
mod interned;
pub mod trove_info;
mod trove_file;
mod trove_troves;

pub use dependency::DependencyRow;
pub use file_stream::FileStream;
pub use instance::{Instance, Presence};
pub use interned::{InternTable, add_label_map, branches_for_item, intern_flavor};
pub use trove_file::TroveFileRow;
pub use trove_troves::TroveTroveRow;
