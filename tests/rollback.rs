// tests/rollback.rs

//! Rollback stack, failure recovery and critical-update restarts.

mod common;

use common::*;
use conary_engine::changeset::{ChangeSetBuilder, TroveBuilder};
use conary_engine::config::UpdateFlags;
use conary_engine::db::paths;
use conary_engine::deps::{Dependency, DependencyClass};
use conary_engine::engine::{ApplyOptions, RestartInfo};
use conary_engine::error::Error;
use conary_engine::progress::SilentCallback;
use conary_engine::transaction::{JobJournal, RecoveryOutcome};
use conary_engine::trove::{CapsuleInfo, ScriptKind, TroveScript};
use std::collections::BTreeSet;

#[test]
fn test_rollbacks_apply_newest_first() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    apply(&mut engine, &install_cs(vec![trove("a:runtime", "1.0", &[("/usr/a", "a")])]));
    apply(&mut engine, &install_cs(vec![trove("b:runtime", "1.0", &[("/usr/b", "b")])]));
    assert_eq!(engine.list_rollbacks().unwrap(), vec!["r.0", "r.1"]);

    let err = engine
        .rollback(&["r.0".to_string()], UpdateFlags::empty(), &SilentCallback)
        .unwrap_err();
    assert!(matches!(err, Error::RollbackOrder(_)));
    let err = engine
        .rollback(&["r.7".to_string()], UpdateFlags::empty(), &SilentCallback)
        .unwrap_err();
    assert!(matches!(err, Error::RollbackDoesNotExist(_)));
    assert!(t.exists("/usr/a") && t.exists("/usr/b"));

    engine
        .rollback(&["r.1".to_string(), "r.0".to_string()], UpdateFlags::empty(), &SilentCallback)
        .unwrap();
    assert!(!t.exists("/usr/a"));
    assert!(!t.exists("/usr/b"));
    assert!(engine.store().all_troves().unwrap().is_empty());
    assert!(engine.list_rollbacks().unwrap().is_empty());
}

#[test]
fn test_rollback_restores_erased_trove_and_local_edits() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    apply(
        &mut engine,
        &install_cs(vec![
            TroveBuilder::new("foo:runtime", v("1.0"))
                .file("/etc/foo.conf", config_file("a=1\n"), b"a=1\n")
                .file("/usr/bin/foo", regular("bin"), b"bin"),
        ]),
    );
    t.write("/etc/foo.conf", "a=2\n");

    let foo = engine.store().latest("foo:runtime").unwrap().unwrap();
    let report = engine.erase(&[foo.clone()], &merge_opts(), &SilentCallback).unwrap();
    assert!(!t.exists("/usr/bin/foo"));
    assert!(!t.exists("/etc/foo.conf"));

    engine
        .rollback(&[report.rollback.unwrap()], UpdateFlags::empty(), &SilentCallback)
        .unwrap();
    assert_eq!(engine.store().latest("foo:runtime").unwrap(), Some(foo.clone()));
    assert_eq!(t.read("/usr/bin/foo"), "bin");
    assert_eq!(t.read("/etc/foo.conf"), "a=2\n");

    // the edit shows up as a local change again
    let changes = engine.verify(&foo).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, "/etc/foo.conf");
}

#[test]
fn test_compat_class_change_drops_rollbacks() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    apply(&mut engine, &install_cs(vec![trove("foo:runtime", "1.0", &[("/usr/foo", "1")])]));
    assert_eq!(engine.list_rollbacks().unwrap().len(), 1);
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();

    // a postrollback script that does not declare 1 -> 0 is no help
    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        trove("foo:runtime", "1.1", &[("/usr/foo", "2")])
            .compat_class(1)
            .script(ScriptKind::PostRollback, TroveScript::new("true").with_conversion(2, 1)),
    );
    let report = apply(&mut engine, &builder.build());
    assert_eq!(report.invalidated_rollbacks, 1);
    assert!(report.rollback.is_none());
    assert!(engine.list_rollbacks().unwrap().is_empty());
    assert_eq!(t.read("/usr/foo"), "2");

    // later applies start a fresh stack after the dropped one
    let report = apply(&mut engine, &install_cs(vec![trove("bar:runtime", "1.0", &[("/usr/bar", "b")])]));
    assert_eq!(report.rollback.as_deref(), Some("r.1"));
    let err = engine
        .rollback(&["r.0".to_string()], UpdateFlags::empty(), &SilentCallback)
        .unwrap_err();
    assert!(matches!(err, Error::RollbackDoesNotExist(_)));
}

#[test]
fn test_failed_apply_reverts_filesystem() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    apply(&mut engine, &install_cs(vec![trove("foo:runtime", "1.0", &[("/usr/a", "one")])]));
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();
    let before = t.snapshot();

    // a capsule trove whose packager is unknown and whose payload is absent
    // fails after its plain files are written
    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        trove("foo:runtime", "2.0", &[("/usr/a", "two"), ("/usr/b", "new")]).capsule(CapsuleInfo {
            kind: "nosuch".to_string(),
            name: "foo".to_string(),
            version: "2.0".to_string(),
            release: "1".to_string(),
            arch: "noarch".to_string(),
            ..Default::default()
        }),
    );
    let err = engine.apply(&builder.build(), &merge_opts(), &SilentCallback).unwrap_err();
    assert!(matches!(err, Error::CapsuleError(_)), "{err}");

    assert_eq!(t.snapshot(), before);
    assert_eq!(engine.store().latest("foo:runtime").unwrap(), Some(old));
    assert!(!paths::journal_path(&db_dir(&t.root)).exists());
    assert_eq!(engine.list_rollbacks().unwrap(), vec!["r.0"]);
}

#[test]
fn test_recover_reverts_interrupted_journal() {
    let t = TestRoot::new();
    t.write("/etc/motd", "hello\n");
    let engine = t.engine();
    assert_eq!(engine.recover().unwrap(), RecoveryOutcome::Clean);

    let journal_path = paths::journal_path(&db_dir(&t.root));
    let mut journal = JobJournal::start(&t.root, &journal_path).unwrap();
    journal.backup(&t.path("/etc/motd")).unwrap();
    journal.backup(&t.path("/etc/new")).unwrap();
    t.write("/etc/motd", "clobbered\n");
    t.write("/etc/new", "stray\n");
    drop(journal);

    let outcome = engine.recover().unwrap();
    assert!(matches!(outcome, RecoveryOutcome::RolledBack { failures: 0, .. }), "{outcome:?}");
    assert_eq!(t.read("/etc/motd"), "hello\n");
    assert!(!t.exists("/etc/new"));
    assert!(!journal_path.exists());
}

#[test]
fn test_critical_update_stops_for_restart() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let dep = || Dependency::new("libc.so.6");
    let libc = trove("libc:lib", "2.0", &[("/lib/libc.so.6", "libc")]).provides(DependencyClass::Soname, dep());
    let app = trove("app:runtime", "1.0", &[("/usr/bin/app", "app")]).requires(DependencyClass::Soname, dep());
    let critical_tuple = libc.tuple();
    let cs = install_cs(vec![app, libc]);

    let opts = ApplyOptions {
        flags: UpdateFlags::MERGE,
        critical: BTreeSet::from([critical_tuple]),
        skip_rollback: false,
    };
    let err = engine.apply(&cs, &opts, &SilentCallback).unwrap_err();
    let marker = match err {
        Error::ReexecRequired(marker) => marker,
        other => panic!("expected a restart request, got {other}"),
    };
    assert!(marker.exists());
    assert!(is_installed(&engine, "libc:lib"));
    assert!(!is_installed(&engine, "app:runtime"));

    let pending = RestartInfo::load(&db_dir(&t.root)).unwrap().unwrap();
    assert_eq!(pending.jobs().unwrap().len(), 1);

    let report = engine.resume(&SilentCallback).unwrap().unwrap();
    assert_eq!(report.jobs.len(), 1);
    assert!(is_installed(&engine, "app:runtime"));
    assert_eq!(t.read("/usr/bin/app"), "app");
    assert!(RestartInfo::load(&db_dir(&t.root)).unwrap().is_none());
    assert!(engine.resume(&SilentCallback).unwrap().is_none());
}

#[test]
fn test_root_lock_is_exclusive() {
    let t = TestRoot::new();
    let mut config = t.config();
    config.lock_timeout_secs = 0;
    let mut engine = conary_engine::engine::Engine::open(config).unwrap();
    let _held = conary_engine::transaction::RootLock::acquire(
        &db_dir(&t.root),
        std::time::Duration::from_millis(10),
    )
    .unwrap();

    let err = engine
        .apply(&install_cs(vec![trove("foo:runtime", "1.0", &[("/usr/foo", "x")])]), &merge_opts(), &SilentCallback)
        .unwrap_err();
    assert!(matches!(err, Error::Locked(_)));
    assert!(!t.exists("/usr/foo"));
}
