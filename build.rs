// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Switches shared by the commands that change the root
fn update_args(cmd: Command) -> Command {
    cmd.arg(Arg::new("test").long("test").action(ArgAction::SetTrue).help("Plan and report without changing anything"))
        .arg(Arg::new("no_scripts").long("no-scripts").action(ArgAction::SetTrue).help("Do not run trove scripts or tag handlers"))
        .arg(Arg::new("just_db").long("just-db").action(ArgAction::SetTrue).help("Update the database only"))
        .arg(
            Arg::new("replace_files")
                .long("replace-files")
                .action(ArgAction::SetTrue)
                .help("Replace files owned by other troves, unowned files and modified files"),
        )
        .arg(Arg::new("no_merge").long("no-merge").action(ArgAction::SetTrue).help("Overwrite local changes instead of merging them"))
        .arg(Arg::new("ignore_ugids").long("ignore-ugids").action(ArgAction::SetTrue).help("Owner and group differences are not conflicts"))
}

fn build_cli() -> Command {
    Command::new("conary-engine")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Conary Project")
        .about("Apply, verify and roll back Conary change sets on an install root")
        .arg(Arg::new("root").short('r').long("root").global(true).default_value("/").help("Installation root directory"))
        .arg(Arg::new("config").short('c').long("config").global(true).help("Engine configuration file (TOML)"))
        .arg(Arg::new("verbose").short('v').long("verbose").global(true).action(ArgAction::SetTrue).help("Log at debug level"))
        .subcommand_required(true)
        .subcommand(
            update_args(Command::new("apply").about("Apply one or more change set files"))
                .arg(Arg::new("changesets").required(true).num_args(1..).help("Change set files; merged before applying"))
                .arg(Arg::new("no_rollback").long("no-rollback").action(ArgAction::SetTrue).help("Do not record a rollback"))
                .arg(
                    Arg::new("critical")
                        .long("critical")
                        .value_delimiter(',')
                        .help("Trove names to install first; the rest waits for `resume`"),
                ),
        )
        .subcommand(
            update_args(Command::new("erase").about("Erase installed troves (NAME or NAME=VERSION)"))
                .arg(Arg::new("troves").required(true).num_args(1..)),
        )
        .subcommand(
            Command::new("check")
                .about("Check a change set's dependencies against the installed troves")
                .arg(Arg::new("changeset").required(true)),
        )
        .subcommand(
            Command::new("list")
                .about("List installed troves")
                .arg(Arg::new("name").help("Only troves with this name")),
        )
        .subcommand(
            Command::new("verify")
                .about("Show files of an installed trove that differ from the database")
                .arg(Arg::new("trove").required(true).help("Trove name or NAME=VERSION")),
        )
        .subcommand(
            Command::new("rollback")
                .about("Apply rollbacks, newest first")
                .arg(Arg::new("names").required(true).num_args(1..).help("Rollback names (r.N); newest first"))
                .arg(Arg::new("no_scripts").long("no-scripts").action(ArgAction::SetTrue).help("Do not run scripts")),
        )
        .subcommand(Command::new("rollbacks").about("List rollbacks"))
        .subcommand(Command::new("pin").about("Pin a trove so updates install next to it").arg(Arg::new("trove").required(true)))
        .subcommand(Command::new("unpin").about("Unpin a trove").arg(Arg::new("trove").required(true)))
        .subcommand(Command::new("recover").about("Finish or revert an interrupted apply"))
        .subcommand(Command::new("resume").about("Finish jobs left behind by a critical update"))
        .subcommand(Command::new("sync-capsules").about("Record foreign packages as phantom troves"))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("conary-engine.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
