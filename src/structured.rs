//! Field-level merges for machine-readable config files.
//!
//! Line merges are the wrong tool for files several skills extend at once.
//! These merges work on the parsed structure instead, and all of them only
//! ever add: an existing value is never replaced.
//!
//! - `package.json` dependencies: union by name, ranges must intersect.
//! - `docker-compose.yml` services: union by name, missing fields filled in.
//! - `.env.example`: missing keys appended.

use std::collections::BTreeMap;
use std::path::Path;

use semver::{Version, VersionReq};
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::exec::{CommandResult, CommandRunner};
use crate::fs_util;
use crate::manifest::StructuredSection;
use crate::path_remap::resolve_path_remap;

/// npm dependency manifest.
pub const PACKAGE_JSON_FILE: &str = "package.json";

/// Service composition file.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Environment template.
pub const ENV_EXAMPLE_FILE: &str = ".env.example";

/// A merged file: new content and whether anything changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merged {
    pub content: String,
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// npm dependencies
// ---------------------------------------------------------------------------

fn parse_range(raw: &str) -> Option<VersionReq> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "latest" || raw == "x" {
        return Some(VersionReq::STAR);
    }
    VersionReq::parse(raw)
        .ok()
        .or_else(|| VersionReq::parse(&raw.split_whitespace().collect::<Vec<_>>().join(", ")).ok())
}

/// Lowest version a range names; `*` anchors at 0.0.0.
fn anchor(req: &VersionReq) -> Version {
    req.comparators.first().map_or_else(
        || Version::new(0, 0, 0),
        |c| Version::new(c.major, c.minor.unwrap_or(0), c.patch.unwrap_or(0)),
    )
}

/// Can two dependency ranges be satisfied together?
///
/// Equal strings are always compatible. Otherwise each `||` alternative is
/// parsed as a semver range and two alternatives are compatible when one
/// contains the other's anchor version. Ranges that are not semver (git URLs,
/// tags) are only compatible with themselves.
#[must_use]
pub fn are_ranges_compatible(existing: &str, requested: &str) -> bool {
    if existing.trim() == requested.trim() {
        return true;
    }
    existing.split("||").any(|a| {
        requested.split("||").any(|b| match (parse_range(a), parse_range(b)) {
            (Some(ra), Some(rb)) => ra.matches(&anchor(&rb)) || rb.matches(&anchor(&ra)),
            _ => false,
        })
    })
}

/// Add `additions` to the `dependencies` object of a `package.json`.
///
/// # Errors
/// Returns a description of the first incompatible range, or of a parse
/// failure.
pub fn merge_npm_dependencies(
    current: Option<&str>,
    additions: &BTreeMap<String, String>,
) -> Result<Merged, String> {
    let mut doc: JsonValue = match current {
        Some(text) => serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?,
        None => JsonValue::Object(serde_json::Map::new()),
    };
    let root = doc
        .as_object_mut()
        .ok_or_else(|| "top level is not an object".to_owned())?;
    let deps = root
        .entry("dependencies")
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()))
        .as_object_mut()
        .ok_or_else(|| "`dependencies` is not an object".to_owned())?;

    let mut changed = current.is_none();
    for (name, range) in additions {
        match deps.get(name).and_then(JsonValue::as_str) {
            None if deps.contains_key(name) => {
                return Err(format!("dependency '{name}' has a non-string version"));
            }
            None => {
                deps.insert(name.clone(), JsonValue::String(range.clone()));
                changed = true;
            }
            Some(existing) if are_ranges_compatible(existing, range) => {
                if existing != range {
                    debug!(dependency = %name, existing, requested = %range, "keeping compatible existing range");
                }
            }
            Some(existing) => {
                return Err(format!(
                    "dependency '{name}': existing range {existing} is incompatible with {range}"
                ));
            }
        }
    }

    if !changed {
        return Ok(Merged {
            content: current.unwrap_or_default().to_owned(),
            changed,
        });
    }
    let mut content = serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())?;
    content.push('\n');
    Ok(Merged { content, changed })
}

// ---------------------------------------------------------------------------
// Compose services
// ---------------------------------------------------------------------------

/// Add `services` to a compose file, filling only absent fields of services
/// that already exist.
///
/// # Errors
/// Returns a description of a parse failure or a malformed `services` key.
pub fn merge_compose_services(
    current: Option<&str>,
    services: &BTreeMap<String, toml::Value>,
) -> Result<Merged, String> {
    let mut doc: YamlValue = match current {
        Some(text) if !text.trim().is_empty() => {
            serde_yaml::from_str(text).map_err(|e| format!("invalid YAML: {e}"))?
        }
        _ => YamlValue::Mapping(Mapping::new()),
    };
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| "top level is not a mapping".to_owned())?;
    let key = YamlValue::String("services".to_owned());
    if !root.contains_key(&key) {
        root.insert(key.clone(), YamlValue::Mapping(Mapping::new()));
    }
    let existing = root
        .get_mut(&key)
        .and_then(YamlValue::as_mapping_mut)
        .ok_or_else(|| "`services` is not a mapping".to_owned())?;

    let mut changed = false;
    for (name, def) in services {
        let def = serde_yaml::to_value(def).map_err(|e| format!("service '{name}': {e}"))?;
        let name_key = YamlValue::String(name.clone());
        match existing.get_mut(&name_key) {
            None => {
                existing.insert(name_key, def);
                changed = true;
            }
            Some(YamlValue::Mapping(have)) => {
                let Some(want) = def.as_mapping() else {
                    continue;
                };
                for (field, value) in want {
                    if !have.contains_key(field) {
                        have.insert(field.clone(), value.clone());
                        changed = true;
                    }
                }
            }
            Some(_) => warn!(service = %name, "existing service is not a mapping; left unchanged"),
        }
    }

    if !changed {
        return Ok(Merged {
            content: current.unwrap_or_default().to_owned(),
            changed,
        });
    }
    let content = serde_yaml::to_string(&doc).map_err(|e| e.to_string())?;
    Ok(Merged { content, changed })
}

// ---------------------------------------------------------------------------
// Env additions
// ---------------------------------------------------------------------------

/// Append missing `KEY=` lines to an env template.
#[must_use]
pub fn merge_env_additions(current: Option<&str>, keys: &[String]) -> Merged {
    let mut content = current.unwrap_or_default().to_owned();
    let present: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.strip_prefix("export ").unwrap_or(l).split_once('='))
        .map(|(k, _)| k.trim())
        .collect();
    let missing: Vec<&String> = keys
        .iter()
        .filter(|k| !present.contains(&k.as_str()))
        .collect();
    if missing.is_empty() {
        return Merged {
            content,
            changed: false,
        };
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    let mut seen = Vec::new();
    for key in missing {
        if seen.contains(&key) {
            continue;
        }
        content.push_str(key);
        content.push_str("=\n");
        seen.push(key);
    }
    Merged {
        content,
        changed: true,
    }
}

// ---------------------------------------------------------------------------
// Applying a manifest section
// ---------------------------------------------------------------------------

/// What [`apply_structured`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StructuredOutcome {
    /// Project-relative files written.
    pub written: Vec<String>,
    /// `package.json` dependencies changed (install must run).
    pub dependencies_changed: bool,
}

/// Apply a manifest's `[structured]` section to the project at `root`.
///
/// # Errors
/// Returns [`EngineError::StructuredConflict`] on incompatible values or
/// unparseable targets, [`EngineError::Io`] on write failure.
pub fn apply_structured(
    root: &Path,
    section: &StructuredSection,
    remap: &BTreeMap<String, String>,
) -> Result<StructuredOutcome, EngineError> {
    let mut outcome = StructuredOutcome::default();

    let mut write = |file: &str, merged: Result<Merged, String>| -> Result<bool, EngineError> {
        let rel = resolve_path_remap(file, remap);
        let merged = merged.map_err(|detail| EngineError::StructuredConflict {
            file: rel.clone().into(),
            detail,
        })?;
        if merged.changed {
            let path = root.join(&rel);
            fs_util::write_file(&path, merged.content.as_bytes()).map_err(|e| EngineError::io_at(e, &path))?;
            outcome.written.push(rel);
        }
        Ok(merged.changed)
    };
    let read = |file: &str| -> Result<Option<String>, EngineError> {
        let path = root.join(resolve_path_remap(file, remap));
        let bytes = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    };

    let mut dependencies_changed = false;
    if !section.dependencies.is_empty() {
        let current = read(PACKAGE_JSON_FILE)?;
        dependencies_changed = write(
            PACKAGE_JSON_FILE,
            merge_npm_dependencies(current.as_deref(), &section.dependencies),
        )?;
    }
    if !section.env_additions.is_empty() {
        let current = read(ENV_EXAMPLE_FILE)?;
        write(
            ENV_EXAMPLE_FILE,
            Ok(merge_env_additions(current.as_deref(), &section.env_additions)),
        )?;
    }
    if !section.compose_services.is_empty() {
        let current = read(COMPOSE_FILE)?;
        write(
            COMPOSE_FILE,
            merge_compose_services(current.as_deref(), &section.compose_services),
        )?;
    }
    outcome.dependencies_changed = dependencies_changed;
    if !outcome.written.is_empty() {
        info!(files = ?outcome.written, "structured merge applied");
    }
    Ok(outcome)
}

/// Run the dependency install command; a failure is a post-apply failure.
///
/// # Errors
/// Returns [`EngineError::PostApplyFailed`] on a non-zero exit.
pub fn run_install(
    runner: &dyn CommandRunner,
    command: &str,
    cwd: &Path,
) -> Result<CommandResult, EngineError> {
    info!(command, "installing dependencies");
    runner.run(command, cwd)?.check()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn range_compatibility() {
        assert!(are_ranges_compatible("^1.2.0", "^1.2.0"));
        assert!(are_ranges_compatible("^1.2.0", "^1.4.0"));
        assert!(are_ranges_compatible(">=1.0.0 <2.0.0", "^1.5.0"));
        assert!(are_ranges_compatible("*", "^3.0.0"));
        assert!(are_ranges_compatible("^1.0.0 || ^2.0.0", "~2.1.0"));
        assert!(!are_ranges_compatible("^1.0.0", "^2.0.0"));
        assert!(!are_ranges_compatible("github:a/b", "^1.0.0"));
        assert!(are_ranges_compatible("github:a/b", "github:a/b"));
    }

    #[test]
    fn npm_union_keeps_existing_values_and_order() {
        let current = "{\n  \"name\": \"app\",\n  \"dependencies\": {\n    \"zod\": \"^3.0.0\"\n  }\n}\n";
        let merged =
            merge_npm_dependencies(Some(current), &deps(&[("grammy", "^1.0.0"), ("zod", "^3.2.0")])).unwrap();
        assert!(merged.changed);
        let doc: JsonValue = serde_json::from_str(&merged.content).unwrap();
        assert_eq!(doc["dependencies"]["zod"], "^3.0.0");
        assert_eq!(doc["dependencies"]["grammy"], "^1.0.0");
        assert!(merged.content.find("\"name\"").unwrap() < merged.content.find("\"dependencies\"").unwrap());
    }

    #[test]
    fn npm_incompatible_range_is_conflict() {
        let current = r#"{"dependencies":{"zod":"^3.0.0"}}"#;
        let err = merge_npm_dependencies(Some(current), &deps(&[("zod", "^4.0.0")])).unwrap_err();
        assert!(err.contains("zod"));
    }

    #[test]
    fn npm_no_change_keeps_bytes() {
        let current = "{ \"dependencies\": { \"zod\": \"^3.0.0\" } }";
        let merged = merge_npm_dependencies(Some(current), &deps(&[("zod", "^3.0.0")])).unwrap();
        assert!(!merged.changed);
        assert_eq!(merged.content, current);
    }

    #[test]
    fn compose_adds_services_and_missing_fields_only() {
        let current = "services:\n  db:\n    image: postgres:15\n";
        let services: BTreeMap<String, toml::Value> = toml::from_str(
            r#"
[db]
image = "postgres:16"
restart = "always"

[bot]
image = "node:20"
"#,
        )
        .unwrap();
        let merged = merge_compose_services(Some(current), &services).unwrap();
        assert!(merged.changed);
        let doc: YamlValue = serde_yaml::from_str(&merged.content).unwrap();
        assert_eq!(doc["services"]["db"]["image"], YamlValue::from("postgres:15"));
        assert_eq!(doc["services"]["db"]["restart"], YamlValue::from("always"));
        assert_eq!(doc["services"]["bot"]["image"], YamlValue::from("node:20"));
    }

    #[test]
    fn env_appends_missing_keys() {
        let merged = merge_env_additions(
            Some("# comment\nAPI_KEY=abc\nexport PORT=3000"),
            &["API_KEY".to_owned(), "BOT_TOKEN".to_owned(), "PORT".to_owned()],
        );
        assert!(merged.changed);
        assert_eq!(merged.content, "# comment\nAPI_KEY=abc\nexport PORT=3000\nBOT_TOKEN=\n");

        let again = merge_env_additions(Some(&merged.content), &["BOT_TOKEN".to_owned()]);
        assert!(!again.changed);
    }

    #[test]
    fn apply_structured_writes_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), "{\"dependencies\":{}}").unwrap();
        let section: StructuredSection = toml::from_str(
            r#"
env_additions = ["TOKEN"]
[dependencies]
grammy = "^1.0.0"
"#,
        )
        .unwrap();

        let outcome = apply_structured(dir.path(), &section, &BTreeMap::new()).unwrap();
        assert!(outcome.dependencies_changed);
        assert_eq!(outcome.written, vec!["package.json", ".env.example"]);
        let env = std::fs::read_to_string(dir.path().join(".env.example")).unwrap();
        assert_eq!(env, "TOKEN=\n");
    }

    #[test]
    fn apply_structured_conflict_names_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"dependencies":{"zod":"^3.0.0"}}"#).unwrap();
        let section = StructuredSection {
            dependencies: deps(&[("zod", "^4.0.0")]),
            ..StructuredSection::default()
        };
        let err = apply_structured(dir.path(), &section, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::StructuredConflict { .. }));
        assert!(err.to_string().contains("package.json"));
    }
}
