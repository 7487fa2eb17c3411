use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use skillweave::error::EngineError;
use skillweave::{InitOptions, Project, init_project};

mod telemetry;

/// Layer versioned skill packages onto an evolving core project.
///
/// Every command prints a JSON result on stdout and exits non-zero when the
/// operation failed. Failed mutations are rolled back before exit.
///
/// Logging goes to stderr: set SKILLWEAVE_LOG (e.g. `info`, `debug`) to
/// change verbosity and SKILLWEAVE_LOG_FORMAT=json for structured events.
#[derive(Parser)]
#[command(name = "skillweave")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'skillweave <command> --help' for more information on a specific command.")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true, env = "SKILLWEAVE_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the project: state directory, base snapshot and ledger
    ///
    /// With --pristine, the base comes from an unmodified core tree and any
    /// existing differences are recorded as a custom patch.
    Init {
        /// Core version to record (default: from core.toml, else 0.0.0)
        #[arg(long)]
        core_version: Option<String>,

        /// Unmodified core tree to snapshot as the base
        #[arg(long)]
        pristine: Option<PathBuf>,
    },

    /// Apply the skill package in <PACKAGE>
    Apply {
        /// Skill package directory (holds manifest.toml)
        package: PathBuf,
    },

    /// Remove an applied skill, replaying the others from the base
    Uninstall {
        /// Skill name as recorded in the ledger
        name: String,

        /// Package directory for a skill, checked before the search paths
        #[arg(long = "package", value_name = "NAME=DIR", value_parser = parse_override)]
        packages: Vec<(String, PathBuf)>,
    },

    /// Update onto the core tree in <CORE>
    Update {
        /// Candidate core directory (holds core.toml)
        core: PathBuf,

        /// Only report what would change
        #[arg(long)]
        preview: bool,
    },

    /// Rebuild the tree by replaying skills and custom patches
    ///
    /// Without <NEW_BASE> the current base snapshot is used.
    Rebase {
        /// New core tree to rebase onto
        new_base: Option<PathBuf>,

        /// Package directory for a skill, checked before the search paths
        #[arg(long = "package", value_name = "NAME=DIR", value_parser = parse_override)]
        packages: Vec<(String, PathBuf)>,
    },

    /// Record direct edits as a custom patch
    #[command(subcommand)]
    Customize(CustomizeCommands),

    /// Record conflict resolutions
    ///
    /// Without arguments, lists staged conflicts.
    Resolve {
        /// Fingerprint of the staged conflict to record
        fingerprint: Option<String>,

        /// Record every staged conflict that is free of markers
        #[arg(long, conflicts_with_all = ["fingerprint", "clear"])]
        all: bool,

        /// Forget every user-recorded resolution
        #[arg(long, conflicts_with = "fingerprint")]
        clear: bool,
    },

    /// Show ledger, lock and session state
    Status,
}

#[derive(Subcommand)]
enum CustomizeCommands {
    /// Checkpoint the tree and open a session
    Start {
        /// What the edits are for
        #[arg(required = true, num_args = 1..)]
        description: Vec<String>,
    },

    /// Record every file changed since `start`
    Commit,

    /// Close the session without recording
    Abort {
        /// Put changed files back to their checkpointed content
        #[arg(long)]
        restore: bool,
    },
}

fn parse_override(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, dir) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=DIR, got '{raw}'"))?;
    if name.is_empty() || dir.is_empty() {
        return Err(format!("expected NAME=DIR, got '{raw}'"));
    }
    Ok((name.to_owned(), PathBuf::from(dir)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serializing result")?;
    println!("{out}");
    Ok(())
}

#[derive(Serialize)]
struct Failure<'a> {
    success: bool,
    error: &'a EngineError,
}

/// Print an engine result; `Ok(false)` means the operation failed.
fn report<T: Serialize>(result: Result<T, EngineError>) -> Result<bool> {
    match result {
        Ok(value) => print_json(&value).map(|()| true),
        Err(error) => print_json(&Failure {
            success: false,
            error: &error,
        })
        .map(|()| false),
    }
}

fn open(root: &Path) -> Result<Project, EngineError> {
    Project::open(root)
}

fn run(cli: Cli) -> Result<bool> {
    let root = cli.root;
    tracing::debug!(root = %root.display(), "starting command");
    match cli.command {
        Commands::Init {
            core_version,
            pristine,
        } => {
            let options = InitOptions {
                core_version,
                pristine_core: pristine,
            };
            report(init_project(&root, &options))
        }
        Commands::Apply { package } => match open(&root) {
            Ok(project) => {
                let result = project.apply_skill(&package);
                print_json(&result)?;
                Ok(result.success)
            }
            Err(e) => report::<()>(Err(e)),
        },
        Commands::Uninstall { name, packages } => match open(&root) {
            Ok(project) => {
                let overrides: BTreeMap<String, PathBuf> = packages.into_iter().collect();
                let result = project.uninstall_skill_with_overrides(&name, &overrides);
                print_json(&result)?;
                Ok(result.success)
            }
            Err(e) => report::<()>(Err(e)),
        },
        Commands::Update { core, preview } => match open(&root) {
            Ok(project) if preview => report(project.preview_update(&core)),
            Ok(project) => {
                let result = project.apply_update(&core);
                print_json(&result)?;
                Ok(result.success)
            }
            Err(e) => report::<()>(Err(e)),
        },
        Commands::Rebase { new_base, packages } => match open(&root) {
            Ok(project) => {
                let overrides: BTreeMap<String, PathBuf> = packages.into_iter().collect();
                let result = project.rebase_with_overrides(new_base.as_deref(), &overrides);
                print_json(&result)?;
                Ok(result.success)
            }
            Err(e) => report::<()>(Err(e)),
        },
        Commands::Customize(cmd) => {
            let project = match open(&root) {
                Ok(p) => p,
                Err(e) => return report::<()>(Err(e)),
            };
            match cmd {
                CustomizeCommands::Start { description } => {
                    report(project.start_customize(&description.join(" ")))
                }
                CustomizeCommands::Commit => report(project.commit_customize()),
                CustomizeCommands::Abort { restore } => report(project.abort_customize(restore)),
            }
        }
        Commands::Resolve {
            fingerprint,
            all,
            clear,
        } => {
            let project = match open(&root) {
                Ok(p) => p,
                Err(e) => return report::<()>(Err(e)),
            };
            if clear {
                report(project.clear_user_resolutions())
            } else if all {
                report(project.record_all_resolutions())
            } else if let Some(fp) = fingerprint {
                report(project.record_resolution(&fp))
            } else {
                report(project.staged_conflicts())
            }
        }
        Commands::Status => report(open(&root).and_then(|p| p.status())),
    }
}

fn main() -> ExitCode {
    telemetry::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
