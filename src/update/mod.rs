// src/update/mod.rs

//! Filesystem merge
//!
//! Turns a change set plus the installed state into a [`FilesystemJob`]:
//! what to restore, rename and remove on disk, which paths are shared or
//! taken over, and which files each tag handler must hear about. The job
//! is then applied through the operation journal.

mod apply;
mod conflicts;
mod merge;
pub mod patch;

pub use apply::ApplyContext;
pub use conflicts::{Claim, MergeError, Resolution, SHARED_DOC_DIR, resolve_duplicate};
pub use merge::{FilesystemJob, MergeContext, Removal, Restore, RestoreSource, flavor_elf_class};
