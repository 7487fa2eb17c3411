mod common;
use common::*;

use skillweave::error::EngineError;

const INDEX_WITH_TELEGRAM: &str =
    "import { start } from './core';\nimport { telegram } from './telegram';\n\nconst channels = [telegram];\n\nstart(channels);\n";
const CONFIG_DISCORD: &str = "export const port = 4000;\nexport const debug = false;\nexport const host = 'localhost';\n";

fn telegram(tp: &TestProject) -> std::path::PathBuf {
    PackageBuilder::new("telegram")
        .add("src/telegram.ts", "export const telegram = 'tg';\n")
        .modify("src/index.ts", INDEX_WITH_TELEGRAM)
        .manifest("[[file_ops]]\ntype = \"rename\"\nfrom = \"src/util.ts\"\nto = \"src/helpers.ts\"")
        .write(&tp.package_dir("telegram"))
}

fn discord(tp: &TestProject) -> std::path::PathBuf {
    PackageBuilder::new("discord")
        .add("src/discord.ts", "export const discord = 'dc';\n")
        .modify("src/config.ts", CONFIG_DISCORD)
        .write(&tp.package_dir("discord"))
}

/// Uninstalling rebuilds the tree without the skill: its adds are gone, its
/// edits and renames reverted, other skills and customizations kept.
#[test]
fn uninstall_removes_skill_and_keeps_the_rest() {
    let tp = TestProject::new();
    let project = tp.project();
    assert!(project.apply_skill(&telegram(&tp)).success);
    assert!(project.apply_skill(&discord(&tp)).success);
    let patch = customize(&tp, "fork readme", &[("README.md", "# nanobot\n\nOur fork.\n")]);

    let result = project.uninstall_skill("telegram");
    assert!(result.success, "uninstall failed: {:?}", result.error);
    assert_eq!(result.version, "1.0.0");
    assert_eq!(result.removed, vec!["src/helpers.ts", "src/telegram.ts"]);
    assert_eq!(result.restored, vec!["src/index.ts", "src/util.ts"]);
    assert_eq!(result.replayed_skills, vec!["discord"]);
    assert_eq!(result.replayed_patches, vec![patch.id]);

    assert!(!tp.exists("src/telegram.ts"));
    assert!(!tp.exists("src/helpers.ts"));
    assert_eq!(tp.read("src/index.ts"), CORE_FILES[0].1);
    assert_eq!(tp.read("src/util.ts"), "export function noop() {}\n");
    assert_eq!(tp.read("src/discord.ts"), "export const discord = 'dc';\n");
    assert_eq!(tp.read("src/config.ts"), CONFIG_DISCORD);
    assert_eq!(tp.read("README.md"), "# nanobot\n\nOur fork.\n");

    let ledger = project.read_ledger().expect("ledger");
    let names: Vec<&str> = ledger.applied_skills().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["discord"]);
    assert!(ledger.path_remap.is_empty());
    assert!(!project.is_locked());
    assert!(!tp.exists(".skillweave/backup"));
}

/// A skill other applied skills depend on stays put.
#[test]
fn uninstall_refuses_required_skill() {
    let tp = TestProject::new();
    let project = tp.project();
    assert!(project.apply_skill(&telegram(&tp)).success);
    let voice = PackageBuilder::new("telegram-voice")
        .manifest("depends = [\"telegram\"]")
        .add("src/voice.ts", "export const voice = true;\n")
        .write(&tp.package_dir("telegram-voice"));
    assert!(project.apply_skill(&voice).success);
    let before = tp.snapshot();

    let result = project.uninstall_skill("telegram");
    assert!(!result.success);
    assert!(!result.rolled_back);
    match result.error {
        Some(EngineError::SkillRequired { dependents, .. }) => assert_eq!(dependents, vec!["telegram-voice"]),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(tp.snapshot(), before);
    assert_eq!(project.read_ledger().expect("ledger").applied_skills().len(), 2);
    assert!(!project.is_locked());
}

/// Naming a skill that was never applied is an error.
#[test]
fn uninstall_of_unknown_skill_fails() {
    let tp = TestProject::new();
    let result = tp.project().uninstall_skill("telegram");
    assert!(!result.success);
    assert!(matches!(result.error, Some(EngineError::SkillNotApplied { .. })));
    assert!(result.version.is_empty());
}

/// A customization built on the skill's edits conflicts once the skill is
/// gone; the uninstall rolls back and the skill stays recorded.
#[test]
fn uninstall_conflict_rolls_back() {
    let tp = TestProject::new();
    let project = tp.project();
    assert!(project.apply_skill(&telegram(&tp)).success);
    customize(
        &tp,
        "add cli channel",
        &[(
            "src/index.ts",
            "import { start } from './core';\nimport { telegram } from './telegram';\n\nconst channels = [telegram, cli];\n\nstart(channels);\n",
        )],
    );
    let before = tp.snapshot();

    let result = project.uninstall_skill("telegram");
    assert!(!result.success);
    assert!(result.rolled_back);
    assert_eq!(result.merge_conflicts, vec!["src/index.ts"]);
    assert!(matches!(result.error, Some(EngineError::MergeConflict { .. })));

    assert_eq!(tp.snapshot(), before);
    let ledger = project.read_ledger().expect("ledger");
    assert!(ledger.find_applied("telegram").is_some());
    assert_eq!(ledger.path_remap.get("src/util.ts").map(String::as_str), Some("src/helpers.ts"));
    assert!(!project.is_locked());
}
