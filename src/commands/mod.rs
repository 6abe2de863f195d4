// src/commands/mod.rs
//! Command handlers for the conary-engine CLI

use crate::cli::{Cli, Commands, UpdateArgs};
use anyhow::{Context, Result, bail};
use conary_engine::changeset::ChangeSet;
use conary_engine::config::{EngineConfig, UpdateFlags};
use conary_engine::engine::{ApplyOptions, ApplyReport, Engine};
use conary_engine::error::Error;
use conary_engine::progress::CliCallback;
use conary_engine::trove::TroveTuple;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;

/// Flags selected by the shared update switches
pub fn update_flags(args: &UpdateArgs) -> UpdateFlags {
    let mut flags = UpdateFlags::empty();
    if !args.no_merge {
        flags.insert(UpdateFlags::MERGE);
    }
    if args.test {
        flags.insert(UpdateFlags::TEST);
    }
    if args.no_scripts {
        flags.insert(UpdateFlags::NO_SCRIPTS);
    }
    if args.just_db {
        flags.insert(UpdateFlags::JUST_DATABASE);
    }
    if args.replace_files {
        flags.insert(
            UpdateFlags::REPLACE_MANAGED_FILES
                | UpdateFlags::REPLACE_UNMANAGED_FILES
                | UpdateFlags::REPLACE_MODIFIED_FILES,
        );
    }
    if args.ignore_ugids {
        flags.insert(UpdateFlags::IGNORE_UGIDS);
    }
    flags
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = EngineConfig::load(path)?;
            if cli.root != PathBuf::from("/") {
                config.root = cli.root.clone();
            }
            Ok(config)
        }
        None => Ok(EngineConfig::for_root(&cli.root)),
    }
}

/// Installed troves matching `NAME` or `NAME=VERSION`
fn find_troves(engine: &Engine, spec: &str) -> Result<Vec<TroveTuple>> {
    let (name, version) = match spec.split_once('=') {
        Some((name, version)) => (name, Some(version)),
        None => (spec, None),
    };
    let found: Vec<TroveTuple> = engine
        .store()
        .find_by_name(name)?
        .into_iter()
        .filter(|t| match version {
            Some(v) => t.version.to_string() == v || t.version.trailing_revision().to_string() == v,
            None => true,
        })
        .collect();
    if found.is_empty() {
        bail!("{} is not installed", spec);
    }
    Ok(found)
}

fn find_one(engine: &Engine, spec: &str) -> Result<TroveTuple> {
    let mut found = find_troves(engine, spec)?;
    if found.len() > 1 {
        let names: Vec<String> = found.iter().map(ToString::to_string).collect();
        bail!("{} matches more than one trove:\n  {}", spec, names.join("\n  "));
    }
    Ok(found.remove(0))
}

fn print_report(report: &ApplyReport, test: bool) {
    for job in &report.jobs {
        println!("{}{}", if test { "would " } else { "" }, job);
    }
    if let Some(name) = &report.rollback {
        println!("rollback {} created", name);
    }
    if report.invalidated_rollbacks > 0 {
        println!("{} rollbacks invalidated", report.invalidated_rollbacks);
    }
    if report.failed_scripts > 0 {
        println!("warning: {} scripts failed", report.failed_scripts);
    }
}

/// Turn the restart request into an instruction for the user
fn finish_apply(result: conary_engine::Result<ApplyReport>, test: bool) -> Result<()> {
    match result {
        Ok(report) => {
            print_report(&report, test);
            Ok(())
        }
        Err(Error::ReexecRequired(marker)) => {
            println!(
                "critical troves installed; run `conary-engine resume` to finish ({})",
                marker.display()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let mut engine = Engine::open(config).context("cannot open the engine database")?;
    let callback = CliCallback::new();

    match cli.command {
        Commands::Apply {
            changesets,
            update,
            no_rollback,
            critical,
        } => {
            let mut cs = ChangeSet::new();
            for path in &changesets {
                let one = ChangeSet::read_file(path).with_context(|| format!("reading {}", path.display()))?;
                cs.merge(one);
            }
            let wanted: BTreeSet<&str> = critical.iter().map(String::as_str).collect();
            let critical = cs
                .trove_changes()
                .map(|c| c.new_tuple())
                .filter(|t| wanted.contains(t.name.as_str()))
                .collect();
            let opts = ApplyOptions {
                flags: update_flags(&update),
                critical,
                skip_rollback: no_rollback,
            };
            finish_apply(engine.apply(&cs, &opts, &callback), update.test)
        }
        Commands::Erase { troves, update } => {
            let mut tuples = Vec::new();
            for spec in &troves {
                tuples.extend(find_troves(&engine, spec)?);
            }
            let opts = ApplyOptions {
                flags: update_flags(&update),
                ..Default::default()
            };
            finish_apply(engine.erase(&tuples, &opts, &callback), update.test)
        }
        Commands::Check { changeset } => {
            let cs = ChangeSet::read_file(&changeset)?;
            let outcome = engine.check(&cs)?;
            if !outcome.failure.is_empty() {
                bail!("{}", outcome.failure);
            }
            for (n, group) in outcome.order.unwrap_or_default().iter().enumerate() {
                println!("job {}: {} troves", n + 1, group.len());
            }
            Ok(())
        }
        Commands::List { name } => {
            let store = engine.store();
            let tuples = match name {
                Some(name) => store.find_by_name(&name)?,
                None => store.all_troves()?,
            };
            for tuple in tuples {
                let pinned = if store.is_pinned(&tuple)? { " (pinned)" } else { "" };
                println!("{}{}", tuple, pinned);
            }
            Ok(())
        }
        Commands::Verify { trove } => {
            let tuple = find_one(&engine, &trove)?;
            let changes = engine.verify(&tuple)?;
            for change in &changes {
                let what = if change.is_removed() { "removed" } else { "modified" };
                println!("{} {}", what, change.path);
            }
            if changes.is_empty() {
                info!("{} matches the database", tuple);
            }
            Ok(())
        }
        Commands::Rollback { names, no_scripts } => {
            let mut flags = UpdateFlags::empty();
            if no_scripts {
                flags.insert(UpdateFlags::NO_SCRIPTS);
            }
            let applied = engine.rollback(&names, flags, &callback)?;
            println!("applied {} rollbacks", applied);
            Ok(())
        }
        Commands::Rollbacks => {
            for name in engine.list_rollbacks()? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Pin { trove } => {
            let tuple = find_one(&engine, &trove)?;
            engine.store().pin(&tuple)?;
            println!("pinned {}", tuple);
            Ok(())
        }
        Commands::Unpin { trove } => {
            let tuple = find_one(&engine, &trove)?;
            engine.store().unpin(&tuple)?;
            println!("unpinned {}", tuple);
            Ok(())
        }
        Commands::Recover => {
            println!("{:?}", engine.recover()?);
            Ok(())
        }
        Commands::Resume => {
            match engine.resume(&callback)? {
                Some(report) => print_report(&report, false),
                None => println!("nothing to resume"),
            }
            Ok(())
        }
        Commands::SyncCapsules => {
            let report = engine.sync_capsules(&callback)?;
            print_report(&report, false);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_flags() {
        let flags = update_flags(&UpdateArgs::default());
        assert!(flags.contains(UpdateFlags::MERGE));
        assert!(!flags.contains(UpdateFlags::TEST));

        let args = UpdateArgs {
            no_merge: true,
            replace_files: true,
            just_db: true,
            ..Default::default()
        };
        let flags = update_flags(&args);
        assert!(!flags.contains(UpdateFlags::MERGE));
        assert!(flags.contains(UpdateFlags::REPLACE_UNMANAGED_FILES | UpdateFlags::JUST_DATABASE));
    }
}
