//! Path remapping: historical relative paths → current relative paths.
//!
//! Skills and core updates may rename or move files. Every component looks a
//! path up here before reading or writing it, so a skill written against an
//! old layout still lands on the right file.

use std::collections::BTreeMap;

/// Resolve `rel` through `remap`.
///
/// Returns `rel` unchanged when there is no entry. Chains (`a → b`, `b → c`)
/// are followed; a cycle stops at the last distinct path seen.
#[must_use]
pub fn resolve_path_remap(rel: &str, remap: &BTreeMap<String, String>) -> String {
    let mut current = rel;
    for _ in 0..remap.len() {
        match remap.get(current) {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    current.to_owned()
}
