// src/filesystem/mod.rs

//! Filesystem helpers shared by the merge and apply stages

pub mod path;

pub use path::{normalize, safe_join, sanitize_path};
