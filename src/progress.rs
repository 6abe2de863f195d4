// src/progress.rs

//! Progress reporting for applies
//!
//! The engine reports through the [`UpdateCallback`] trait. Every method has
//! a no-op default so implementations only override what they display.
//! Implementations:
//! - `SilentCallback`: no output, for scripted use and tests
//! - `LogCallback`: reports through tracing
//! - `CliCallback`: indicatif bars for the binary
//! - `RecordingCallback`: keeps events in memory for inspection

use crate::trove::{ScriptKind, TroveTuple};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Coarse stages of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    PreScripts,
    PreTagHandlers,
    RemovingFiles,
    RestoringFiles,
    Capsules,
    UpdatingDatabase,
    PostScripts,
    PostTagHandlers,
    CreatingRollback,
    Committing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Planning => "Planning file changes",
            Phase::PreScripts => "Running pre scripts",
            Phase::PreTagHandlers => "Running pre tag handlers",
            Phase::RemovingFiles => "Removing files",
            Phase::RestoringFiles => "Writing files",
            Phase::Capsules => "Running foreign package transaction",
            Phase::UpdatingDatabase => "Updating database",
            Phase::PostScripts => "Running post scripts",
            Phase::PostTagHandlers => "Running tag handlers",
            Phase::CreatingRollback => "Creating rollback",
            Phase::Committing => "Committing",
        };
        f.write_str(s)
    }
}

/// Events raised while applying change sets
pub trait UpdateCallback {
    /// A job of a multi-job update is starting (1-based)
    fn job_started(&self, _job: usize, _total: usize) {}

    fn phase(&self, _phase: Phase) {}

    fn removing_files(&self, _done: usize, _total: usize) {}

    fn restoring_files(&self, _bytes: u64, _total: u64) {}

    fn script_started(&self, _kind: ScriptKind, _trove: &TroveTuple) {}

    /// A trove script exited nonzero; the apply goes on
    fn script_failed(&self, kind: ScriptKind, trove: &TroveTuple, status: i32) {
        warn!("{} script of {} exited with status {}", kind, trove, status);
    }

    fn tag_handler_started(&self, _handler: &str, _action: &str) {}

    fn tag_handler_failed(&self, handler: &str, status: i32) {
        warn!("tag handler {} exited with status {}", handler, status);
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }

    /// A phantom trove is being recorded for a foreign package (1-based)
    fn creating_phantom(&self, _name: &str, _n: usize, _total: usize) {}

    fn done(&self) {}
}

/// Reports nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCallback;

impl UpdateCallback for SilentCallback {
    fn script_failed(&self, _kind: ScriptKind, _trove: &TroveTuple, _status: i32) {}

    fn tag_handler_failed(&self, _handler: &str, _status: i32) {}

    fn warning(&self, _message: &str) {}
}

/// Logs each phase at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCallback;

impl UpdateCallback for LogCallback {
    fn job_started(&self, job: usize, total: usize) {
        info!("Applying job {} of {}", job, total);
    }

    fn phase(&self, phase: Phase) {
        info!("{}", phase);
    }

    fn script_started(&self, kind: ScriptKind, trove: &TroveTuple) {
        info!("Running {} script of {}", kind, trove);
    }

    fn tag_handler_started(&self, handler: &str, action: &str) {
        info!("Running tag handler {} ({})", handler, action);
    }

    fn creating_phantom(&self, name: &str, n: usize, total: usize) {
        info!("Recording foreign package {} ({} of {})", name, n, total);
    }
}

/// Terminal progress: a spinner for phases and a byte bar while writing files
pub struct CliCallback {
    status: ProgressBar,
    bytes: Mutex<Option<ProgressBar>>,
}

impl CliCallback {
    pub fn new() -> Self {
        let status = ProgressBar::new_spinner();
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        status.enable_steady_tick(Duration::from_millis(100));
        Self {
            status,
            bytes: Mutex::new(None),
        }
    }

    fn byte_bar(total: u64) -> ProgressBar {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    }
}

impl Default for CliCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateCallback for CliCallback {
    fn job_started(&self, job: usize, total: usize) {
        self.status.set_message(format!("Applying job {}/{}", job, total));
    }

    fn phase(&self, phase: Phase) {
        self.status.set_message(phase.to_string());
        if phase != Phase::RestoringFiles
            && let Ok(mut bytes) = self.bytes.lock()
            && let Some(pb) = bytes.take()
        {
            pb.finish_and_clear();
        }
    }

    fn restoring_files(&self, bytes: u64, total: u64) {
        if let Ok(mut bar) = self.bytes.lock() {
            let pb = bar.get_or_insert_with(|| Self::byte_bar(total));
            pb.set_length(total);
            pb.set_position(bytes);
        }
    }

    fn script_started(&self, kind: ScriptKind, trove: &TroveTuple) {
        self.status.set_message(format!("Running {} script of {}", kind, trove.name));
    }

    fn warning(&self, message: &str) {
        self.status.println(format!("warning: {}", message));
    }

    fn done(&self) {
        self.status.finish_and_clear();
    }
}

/// Keeps every event as a line of text
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl UpdateCallback for RecordingCallback {
    fn job_started(&self, job: usize, total: usize) {
        self.push(format!("job {}/{}", job, total));
    }

    fn phase(&self, phase: Phase) {
        self.push(format!("phase {:?}", phase));
    }

    fn script_started(&self, kind: ScriptKind, trove: &TroveTuple) {
        self.push(format!("script {} {}", kind, trove));
    }

    fn script_failed(&self, kind: ScriptKind, trove: &TroveTuple, status: i32) {
        self.push(format!("script failed {} {} {}", kind, trove, status));
    }

    fn tag_handler_started(&self, handler: &str, action: &str) {
        self.push(format!("handler {} {}", handler, action));
    }

    fn tag_handler_failed(&self, handler: &str, status: i32) {
        self.push(format!("handler failed {} {}", handler, status));
    }

    fn warning(&self, message: &str) {
        self.push(format!("warning {}", message));
    }

    fn creating_phantom(&self, name: &str, n: usize, total: usize) {
        self.push(format!("phantom {} {}/{}", name, n, total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::version::Version;

    #[test]
    fn test_recording_callback() {
        let cb = RecordingCallback::new();
        let trove = TroveTuple::new(
            "group-foo",
            Version::parse("/conary.example.com@rpl:1/1.0-1-1").unwrap(),
            Flavor::empty(),
        );
        cb.phase(Phase::PreScripts);
        cb.script_started(ScriptKind::PreUpdate, &trove);
        cb.script_failed(ScriptKind::PreUpdate, &trove, 1);

        let events = cb.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], "phase PreScripts");
        assert!(events[1].starts_with("script preupdate group-foo"));
        assert!(events[2].ends_with(" 1"));
    }

    #[test]
    fn test_silent_defaults() {
        let cb = SilentCallback;
        cb.removing_files(1, 2);
        cb.restoring_files(10, 20);
        cb.warning("ignored");
        cb.done();
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::UpdatingDatabase.to_string(), "Updating database");
    }
}
