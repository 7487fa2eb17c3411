//! Shared test helpers for skillweave integration tests.
//!
//! All tests use temp directories. Each test builds its own core tree, skill
//! packages and project via [`TestProject`].

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use skillweave::error::EngineError;
use skillweave::{CommandResult, CommandRunner, InitOptions, Project, init_project};
use tempfile::TempDir;

/// Core files every test project starts from.
pub const CORE_FILES: &[(&str, &str)] = &[
    (
        "src/index.ts",
        "import { start } from './core';\n\nconst channels = [];\n\nstart(channels);\n",
    ),
    (
        "src/config.ts",
        "export const port = 3000;\nexport const debug = false;\nexport const host = 'localhost';\n",
    ),
    ("src/util.ts", "export function noop() {}\n"),
    ("README.md", "# nanobot\n"),
];

/// Write `files` under `dir`, creating parents.
pub fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().expect("file has a parent")).expect("failed to create dirs");
        std::fs::write(&path, content).expect("failed to write file");
    }
}

/// Write a candidate core tree (with `core.toml`) into `dir`.
pub fn write_core(dir: &Path, version: &str, files: &[(&str, &str)]) {
    write_files(dir, files);
    std::fs::write(dir.join("core.toml"), format!("name = \"nanobot\"\nversion = \"{version}\"\n"))
        .expect("failed to write core.toml");
}

/// [`CORE_FILES`] with some entries replaced (or added) and some removed.
pub fn core_with(replace: &[(&'static str, &'static str)], remove: &[&str]) -> Vec<(&'static str, &'static str)> {
    let mut files: Vec<(&str, &str)> = CORE_FILES
        .iter()
        .copied()
        .filter(|(rel, _)| !remove.contains(rel) && !replace.iter().any(|(r, _)| r == rel))
        .collect();
    files.extend_from_slice(replace);
    files
}

// ---------------------------------------------------------------------------
// Skill packages
// ---------------------------------------------------------------------------

/// Builder for a skill package directory.
pub struct PackageBuilder {
    name: String,
    version: String,
    core_version: String,
    extra: String,
    adds: Vec<(String, String)>,
    modifies: Vec<(String, String)>,
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: "1.0.0".to_owned(),
            core_version: "1.0.0".to_owned(),
            extra: String::new(),
            adds: Vec::new(),
            modifies: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn core_version(mut self, core_version: &str) -> Self {
        self.core_version = core_version.to_owned();
        self
    }

    pub fn add(mut self, rel: &str, content: &str) -> Self {
        self.adds.push((rel.to_owned(), content.to_owned()));
        self
    }

    pub fn modify(mut self, rel: &str, content: &str) -> Self {
        self.modifies.push((rel.to_owned(), content.to_owned()));
        self
    }

    /// Extra manifest TOML appended verbatim (top-level keys first, then
    /// tables).
    pub fn manifest(mut self, toml: &str) -> Self {
        self.extra.push_str(toml);
        self.extra.push('\n');
        self
    }

    /// Write the package into `dir` and return `dir`.
    pub fn write(self, dir: &Path) -> PathBuf {
        let quote = |items: &[(String, String)]| {
            items
                .iter()
                .map(|(rel, _)| format!("\"{rel}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let manifest = format!(
            "name = \"{}\"\nversion = \"{}\"\ncore_version = \"{}\"\nadds = [{}]\nmodifies = [{}]\n{}",
            self.name,
            self.version,
            self.core_version,
            quote(&self.adds),
            quote(&self.modifies),
            self.extra,
        );
        std::fs::create_dir_all(dir).expect("failed to create package dir");
        std::fs::write(dir.join("manifest.toml"), manifest).expect("failed to write manifest");
        for (rel, content) in &self.adds {
            write_files(&dir.join("add"), &[(rel.as_str(), content.as_str())]);
        }
        for (rel, content) in &self.modifies {
            write_files(&dir.join("modify"), &[(rel.as_str(), content.as_str())]);
        }
        dir.to_owned()
    }
}

// ---------------------------------------------------------------------------
// Command runner double
// ---------------------------------------------------------------------------

/// Records every command; commands starting with `fail` exit 1.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    pub commands: Rc<RefCell<Vec<String>>>,
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str, _cwd: &Path) -> Result<CommandResult, EngineError> {
        self.commands.borrow_mut().push(command.to_owned());
        let failed = command.starts_with("fail");
        Ok(CommandResult {
            command: command.to_owned(),
            exit_code: Some(i32::from(failed)),
            stdout: String::new(),
            stderr: if failed { "boom".to_owned() } else { String::new() },
            duration_ms: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// An initialized project in a temp directory, on core 1.0.0.
pub struct TestProject {
    dir: TempDir,
    pub runner: RecordingRunner,
}

impl TestProject {
    /// Project from [`CORE_FILES`].
    pub fn new() -> Self {
        Self::with_files(CORE_FILES)
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        write_files(dir.path(), files);
        init_project(
            dir.path(),
            &InitOptions {
                core_version: Some("1.0.0".to_owned()),
                pristine_core: None,
            },
        )
        .expect("init failed");
        Self {
            dir,
            runner: RecordingRunner::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Open the project with the recording runner.
    pub fn project(&self) -> Project {
        Project::open(self.root())
            .expect("open failed")
            .with_runner(Box::new(self.runner.clone()))
    }

    /// Directory for a package under `skills/`, where rebase looks by default.
    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root().join("skills").join(name)
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root().join(rel)).unwrap_or_else(|e| panic!("failed to read {rel}: {e}"))
    }

    pub fn write(&self, rel: &str, content: &str) {
        write_files(self.root(), &[(rel, content)]);
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }

    pub fn base(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(".skillweave/base").join(rel)).ok()
    }

    /// Every tracked file and its content.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.project()
            .tracked_files()
            .expect("tracked files")
            .into_iter()
            .map(|rel| {
                let content = std::fs::read_to_string(self.root().join(&rel)).unwrap_or_default();
                (rel, content)
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.runner.commands.borrow().clone()
    }
}

/// Run a customize session that writes `edits`, and commit it.
pub fn customize(tp: &TestProject, description: &str, edits: &[(&str, &str)]) -> skillweave::ledger::CustomPatch {
    let project = tp.project();
    project.start_customize(description).expect("start customize");
    write_files(tp.root(), edits);
    project
        .commit_customize()
        .expect("commit customize")
        .expect("edits produce a patch")
}
