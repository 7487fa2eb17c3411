//! External command execution (post-apply hooks, dependency install).

use std::path::Path;
use std::process::Command;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;

/// The result of a single command execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command string that was executed.
    pub command: String,
    /// Exit code (`None` if killed by a signal).
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Exit code 0?
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Turn a failed run into [`EngineError::PostApplyFailed`].
    ///
    /// # Errors
    /// Returns the error when the command did not pass.
    pub fn check(self) -> Result<Self, EngineError> {
        if self.passed() {
            Ok(self)
        } else {
            Err(EngineError::PostApplyFailed {
                command: self.command,
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_owned(),
            })
        }
    }
}

/// Runs shell commands on behalf of the engine.
pub trait CommandRunner {
    /// Run `command` with `cwd` as working directory, capturing output.
    ///
    /// A non-zero exit is reported in the result, not as an error.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the command could not be started.
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandResult, EngineError>;
}

/// Runs commands through `<shell> -c <command>`. No timeout.
#[derive(Clone, Debug)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellRunner {
    #[must_use]
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path) -> Result<CommandResult, EngineError> {
        let start = Instant::now();
        debug!(command, cwd = %cwd.display(), "running command");
        let output = Command::new(&self.shell)
            .args(["-c", command])
            .current_dir(cwd)
            .output()
            .map_err(|e| {
                EngineError::Io(std::io::Error::new(
                    e.kind(),
                    format!("{} -c {command:?}: {e}", self.shell),
                ))
            })?;

        let result = CommandResult {
            command: command.to_owned(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if !result.passed() {
            warn!(command, exit_code = ?result.exit_code, "command failed");
        }
        Ok(result)
    }
}

/// Run `commands` in order; stop at the first failure.
///
/// # Errors
/// Returns [`EngineError::PostApplyFailed`] for the first non-zero exit.
pub fn run_all(
    runner: &dyn CommandRunner,
    commands: &[String],
    cwd: &Path,
) -> Result<Vec<CommandResult>, EngineError> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        results.push(runner.run(command, cwd)?.check()?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellRunner::default()
            .run("echo hello; echo oops >&2", dir.path())
            .unwrap();
        assert!(result.passed());
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[test]
    fn shell_runner_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellRunner::default().run("exit 3", dir.path()).unwrap();
        assert_eq!(result.exit_code, Some(3));
        let err = result.check().unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }

    #[test]
    fn runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        ShellRunner::default().run("echo x > marker.txt", dir.path()).unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }

    #[test]
    fn run_all_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            "touch one".to_owned(),
            "false".to_owned(),
            "touch two".to_owned(),
        ];
        let err = run_all(&ShellRunner::default(), &commands, dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::PostApplyFailed { .. }));
        assert!(dir.path().join("one").exists());
        assert!(!dir.path().join("two").exists());
    }

    #[test]
    fn missing_shell_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellRunner::new("/nonexistent/shell")
            .run("true", dir.path())
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
