//! skillweave library crate.
//!
//! Layers independently versioned skill packages onto an evolving core
//! project. The entry point is [`Project`]: open a project directory (after
//! [`init_project`]) and call `apply_skill`, `uninstall_skill`,
//! `apply_update`, `rebase` or the customize operations on it. The
//! `skillweave` binary in `crates/skillweave-cli` is a thin wrapper around
//! this crate.

pub mod apply;
pub mod backup;
pub mod config;
pub mod customize;
pub mod error;
pub mod exec;
pub mod file_ops;
pub mod fs_util;
pub mod init;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod path_remap;
pub mod project;
pub mod rebase;
pub mod replay;
pub mod status;
pub mod structured;
pub mod uninstall;
pub mod update;

pub use apply::{ApplyPhase, ApplyResult};
pub use config::EngineConfig;
pub use customize::CustomizeSession;
pub use error::EngineError;
pub use exec::{CommandResult, CommandRunner, ShellRunner};
pub use init::{InitOptions, InitReport, init_project};
pub use ledger::Ledger;
pub use merge::{MergeLabels, MergeOutcome, ThreeWayMerge};
pub use project::Project;
pub use rebase::RebaseResult;
pub use status::ProjectStatus;
pub use uninstall::UninstallResult;
pub use update::{UpdatePreview, UpdateResult};
