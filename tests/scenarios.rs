// tests/scenarios.rs

//! End-to-end install, update, erase and rollback scenarios against a
//! temporary root.

mod common;

use common::*;
use conary_engine::changeset::{ChangeSetBuilder, TroveBuilder};
use conary_engine::config::UpdateFlags;
use conary_engine::deps::{Dependency, DependencyClass};
use conary_engine::engine::{ApplyOptions, changeset_jobs};
use conary_engine::error::Error;
use conary_engine::hash::{PathId, Sha1Digest};
use conary_engine::progress::{RecordingCallback, SilentCallback};
use conary_engine::trove::{ScriptKind, TroveScript};
use conary_engine::update::patch::make_diff;
use std::os::unix::fs::MetadataExt;

#[test]
fn test_config_merge_and_rollback() {
    let t = TestRoot::new();
    let mut engine = t.engine();

    let v1 = TroveBuilder::new("foo:runtime", v("1.0")).file("/etc/foo", config_file("first\n"), b"first\n");
    let report = apply(&mut engine, &install_cs(vec![v1]));
    assert_eq!(report.rollback.as_deref(), Some("r.0"));
    assert_eq!(t.read("/etc/foo"), "first\n");
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();

    t.write("/etc/foo", "first\nnew");

    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        TroveBuilder::new("foo:runtime", v("2.0")).file("/etc/foo", config_file("second\n"), b"second\n"),
    );
    let report = apply(&mut engine, &builder.build());
    assert_eq!(report.rollback.as_deref(), Some("r.1"));
    assert_eq!(t.read("/etc/foo"), "second\nnew");

    let applied = engine
        .rollback(&["r.1".to_string()], UpdateFlags::empty(), &SilentCallback)
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(t.read("/etc/foo"), "first\nnew");
    assert_eq!(engine.store().latest("foo:runtime").unwrap(), Some(old));
    assert_eq!(engine.list_rollbacks().unwrap(), vec!["r.0".to_string()]);
}

#[test]
fn test_shared_file_survives_first_erase() {
    let t = TestRoot::new();
    let mut engine = t.engine();

    let cs = install_cs(vec![
        trove("foo:runtime", "1.0", &[("/shared", "same\n")]),
        trove("bar:runtime", "1.0", &[("/shared", "same\n")]),
    ]);
    apply(&mut engine, &cs);
    let owners = engine.store().iter_find_path("/shared").unwrap();
    assert_eq!(owners.len(), 2);
    assert_eq!(owners[0].file_id, owners[1].file_id);

    let foo = engine.store().latest("foo:runtime").unwrap().unwrap();
    engine.erase(&[foo], &merge_opts(), &SilentCallback).unwrap();
    assert_eq!(t.read("/shared"), "same\n");
    let owners = engine.store().iter_find_path("/shared").unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].tuple.name, "bar:runtime");

    let bar = engine.store().latest("bar:runtime").unwrap().unwrap();
    engine.erase(&[bar], &merge_opts(), &SilentCallback).unwrap();
    assert!(!t.exists("/shared"));
}

#[test]
fn test_rename_follows_path_id() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let path_id = PathId::for_path("/usr/first");

    let v1 = TroveBuilder::new("foo:runtime", v("1.0")).file_with_id(path_id, "/usr/first", regular("X"), Some(b"X"));
    apply(&mut engine, &install_cs(vec![v1]));
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();

    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        TroveBuilder::new("foo:runtime", v("2.0")).file_with_id(path_id, "/usr/second", regular("X"), Some(b"X")),
    );
    apply(&mut engine, &builder.build());

    assert!(!t.exists("/usr/first"));
    assert_eq!(t.read("/usr/second"), "X");
}

#[test]
fn test_provider_is_ordered_first() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let dep = || Dependency::new("ELF64/libD.so.1");

    let a = trove("a:runtime", "2.0", &[("/usr/lib/a", "a")]).requires(DependencyClass::Soname, dep());
    let b = trove("b:runtime", "2.0", &[("/usr/lib/libD.so.1", "d")]).provides(DependencyClass::Soname, dep());
    let cs = install_cs(vec![a.clone(), b]);

    let jobs = changeset_jobs(&cs);
    let a_idx = jobs.iter().position(|j| j.name() == "a:runtime").unwrap();
    let b_idx = jobs.iter().position(|j| j.name() == "b:runtime").unwrap();
    let outcome = engine.check(&cs).unwrap();
    assert!(outcome.failure.is_empty());
    let order = outcome.order.unwrap();
    let group_of = |i: usize| order.iter().position(|g| g.contains(&i)).unwrap();
    assert!(group_of(b_idx) <= group_of(a_idx));

    // same input, same answer
    assert_eq!(engine.check(&cs).unwrap().order.unwrap(), order);

    // A alone leaves the soname unprovided
    let alone = install_cs(vec![a]);
    let outcome = engine.check(&alone).unwrap();
    assert_eq!(outcome.failure.unsatisfied.len(), 1);
    let (tuple, deps) = &outcome.failure.unsatisfied[0];
    assert_eq!(tuple.name, "a:runtime");
    assert!(deps.contains(DependencyClass::Soname, &dep()));

    let err = engine.apply(&alone, &merge_opts(), &SilentCallback).unwrap_err();
    assert!(matches!(err, Error::DependencyFailure(_)));
    assert!(!is_installed(&engine, "a:runtime"));
    assert!(!t.exists("/usr/lib/a"));

    apply(&mut engine, &cs);
    assert!(is_installed(&engine, "a:runtime"));
    assert!(is_installed(&engine, "b:runtime"));
}

#[test]
fn test_config_update_shipped_as_diff() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let v1 = TroveBuilder::new("foo:runtime", v("1.0")).file("/etc/foo.conf", config_file("a=1\nb=2\n"), b"a=1\nb=2\n");
    apply(&mut engine, &install_cs(vec![v1]));
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();

    // only the base-to-head diff travels; the base comes from the config cache
    let path_id = PathId::for_path("/etc/foo.conf");
    let head = config_file("a=1\nb=3\n");
    let file_id = head.file_id();
    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        TroveBuilder::new("foo:runtime", v("2.0")).file_with_id(path_id, "/etc/foo.conf", head, None),
    );
    builder.add_diff_contents(path_id, file_id, make_diff("a=1\nb=2\n", "a=1\nb=3\n").into_bytes());
    apply(&mut engine, &builder.build());

    assert_eq!(t.read("/etc/foo.conf"), "a=1\nb=3\n");
    assert!(engine.verify(&engine.store().latest("foo:runtime").unwrap().unwrap()).unwrap().is_empty());
}

#[test]
fn test_link_group_members_share_an_inode() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let group = Sha1Digest::of(b"foo links");
    let member = || regular("same\n").with_link_group(group);
    apply(
        &mut engine,
        &install_cs(vec![
            TroveBuilder::new("foo:runtime", v("1.0"))
                .file("/usr/bin/foo", member(), b"same\n")
                .file("/usr/bin/foo-alias", member(), b"same\n"),
        ]),
    );

    let first = std::fs::metadata(t.path("/usr/bin/foo")).unwrap();
    let second = std::fs::metadata(t.path("/usr/bin/foo-alias")).unwrap();
    assert_eq!(first.ino(), second.ino());
    assert_eq!(t.read("/usr/bin/foo-alias"), "same\n");
}

#[test]
fn test_relative_update_keeps_unchanged_files() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let binary = regular("#!/bin/sh\n").with_perms(0o755);
    apply(
        &mut engine,
        &install_cs(vec![
            TroveBuilder::new("foo:runtime", v("1.0"))
                .file("/etc/foo", config_file("first\n"), b"first\n")
                .file("/usr/bin/foo", binary.clone(), b"#!/bin/sh\n"),
        ]),
    );
    let old = engine.store().latest("foo:runtime").unwrap().unwrap();

    // only the changed config file ships a stream
    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(
        &old,
        TroveBuilder::new("foo:runtime", v("2.0"))
            .file("/etc/foo", config_file("second\n"), b"second\n")
            .unchanged("/usr/bin/foo", &binary),
    );
    apply(&mut engine, &builder.build());

    let new = engine.store().latest("foo:runtime").unwrap().unwrap();
    assert_eq!(new.version, v("2.0"));
    assert_eq!(t.read("/etc/foo"), "second\n");
    assert_eq!(t.read("/usr/bin/foo"), "#!/bin/sh\n");
    let owners = engine.store().iter_find_path("/usr/bin/foo").unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].file_id, binary.file_id());
    assert!(engine.verify(&new).unwrap().is_empty());
}

#[test]
fn test_erase_removes_emptied_directories() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let before = t.snapshot();
    apply(&mut engine, &install_cs(vec![trove("foo:runtime", "1.0", &[("/opt/foo/bin/x", "x\n")])]));
    assert!(t.exists("/opt/foo/bin/x"));

    let foo = engine.store().latest("foo:runtime").unwrap().unwrap();
    engine.erase(&[foo], &merge_opts(), &SilentCallback).unwrap();
    assert!(!t.exists("/opt/foo/bin"));
    assert!(!t.exists("/opt"));
    assert_eq!(t.snapshot(), before);
}

fn script_kinds(cb: &RecordingCallback) -> Vec<String> {
    cb.events()
        .iter()
        .filter_map(|e| e.strip_prefix("script "))
        .filter_map(|e| e.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[test]
fn test_script_trace_across_update_and_rollback() {
    let t = TestRoot::new();
    let mut engine = t.engine();

    let v1 = TroveBuilder::new("group-foo", v("1.0")).script(ScriptKind::PostInstall, TroveScript::new("echo installed"));
    let cb = RecordingCallback::new();
    engine.apply(&install_cs(vec![v1]), &merge_opts(), &cb).unwrap();
    assert_eq!(script_kinds(&cb), vec!["postinstall"]);
    let old = engine.store().latest("group-foo").unwrap().unwrap();

    let v11 = TroveBuilder::new("group-foo", v("1.1"))
        .compat_class(1)
        .script(ScriptKind::PreUpdate, TroveScript::new("echo preupdate"))
        .script(ScriptKind::PostUpdate, TroveScript::new("echo postupdate"))
        .script(ScriptKind::PreRollback, TroveScript::new("echo prerollback"))
        .script(ScriptKind::PostRollback, TroveScript::new("echo postrollback").with_conversion(1, 0));
    let mut builder = ChangeSetBuilder::new();
    builder.add_relative(&old, v11);
    let cb = RecordingCallback::new();
    let report = engine.apply(&builder.build(), &merge_opts(), &cb).unwrap();
    assert_eq!(script_kinds(&cb), vec!["preupdate", "postupdate"]);
    assert_eq!(report.invalidated_rollbacks, 0);
    let name = report.rollback.unwrap();

    let cb = RecordingCallback::new();
    engine.rollback(&[name], UpdateFlags::empty(), &cb).unwrap();
    assert_eq!(script_kinds(&cb), vec!["prerollback", "postrollback"]);
    assert!(
        cb.events()
            .iter()
            .any(|e| e.starts_with("script postrollback group-foo=") && e.contains("1.0"))
    );
    assert_eq!(engine.store().latest("group-foo").unwrap(), Some(old));
}

#[test]
fn test_install_erase_round_trip() {
    let t = TestRoot::new();
    t.write("/etc/keep", "mine\n");
    let mut engine = t.engine();
    let before = t.snapshot();

    apply(
        &mut engine,
        &install_cs(vec![trove(
            "foo:runtime",
            "1.0",
            &[("/usr/bin/foo", "#!/bin/sh\n"), ("/usr/share/foo/data", "data\n")],
        )]),
    );
    assert_eq!(t.read("/usr/share/foo/data"), "data\n");

    let foo = engine.store().latest("foo:runtime").unwrap().unwrap();
    engine.erase(&[foo], &merge_opts(), &SilentCallback).unwrap();
    assert_eq!(t.snapshot(), before);
    assert!(engine.store().all_troves().unwrap().is_empty());
}

#[test]
fn test_test_flag_changes_nothing() {
    let t = TestRoot::new();
    let mut engine = t.engine();
    let opts = ApplyOptions {
        flags: UpdateFlags::MERGE | UpdateFlags::TEST,
        ..Default::default()
    };
    let report = engine
        .apply(&install_cs(vec![trove("foo:runtime", "1.0", &[("/usr/foo", "x")])]), &opts, &SilentCallback)
        .unwrap();
    assert_eq!(report.jobs.len(), 1);
    assert!(report.rollback.is_none());
    assert!(!t.exists("/usr/foo"));
    assert!(!is_installed(&engine, "foo:runtime"));
}
