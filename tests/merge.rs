mod common;
use common::*;

use skillweave::merge::diff3::Diff3Merger;
use skillweave::merge::{MergeError, MergeLabels, MergeOutcome, ThreeWayMerge};

fn merge(base: &str, ours: &str, theirs: &str) -> MergeOutcome {
    Diff3Merger::default()
        .merge(
            base.as_bytes(),
            ours.as_bytes(),
            theirs.as_bytes(),
            &MergeLabels::new("current", "telegram"),
        )
        .expect("text merges never fail")
}

/// Edits to separate regions combine without markers.
#[test]
fn disjoint_edits_merge_cleanly() {
    let base = "a\nb\nc\nd\ne\n";
    let outcome = merge(base, "A\nb\nc\nd\ne\n", "a\nb\nc\nd\nE\n");
    assert_eq!(outcome, MergeOutcome::Clean(b"A\nb\nc\nd\nE\n".to_vec()));
}

/// The same change on both sides is taken once.
#[test]
fn identical_edits_merge_cleanly() {
    let outcome = merge("a\nb\n", "a\nB\n", "a\nB\n");
    assert_eq!(outcome, MergeOutcome::Clean(b"a\nB\n".to_vec()));
}

/// Overlapping edits produce one labelled conflict block.
#[test]
fn overlapping_edits_conflict() {
    let outcome = merge("a\nb\nc\n", "a\nours\nc\n", "a\ntheirs\nc\n");
    assert_eq!(
        outcome,
        MergeOutcome::Conflicted {
            content: b"a\n<<<<<<< current\nours\n=======\ntheirs\n>>>>>>> telegram\nc\n".to_vec(),
            conflicts: 1,
        }
    );
}

/// Always takes the incoming side.
struct TakeTheirs;

impl ThreeWayMerge for TakeTheirs {
    fn merge(
        &self,
        _base: &[u8],
        _ours: &[u8],
        theirs: &[u8],
        _labels: &MergeLabels,
    ) -> Result<MergeOutcome, MergeError> {
        Ok(MergeOutcome::Clean(theirs.to_vec()))
    }
}

/// The merge primitive is replaceable per project handle.
#[test]
fn custom_merge_primitive_is_used() {
    let tp = TestProject::new();
    tp.write("src/index.ts", "local\n");
    let pkg = PackageBuilder::new("telegram")
        .modify("src/index.ts", "skill\n")
        .write(&tp.package_dir("telegram"));

    let project = tp.project().with_merger(Box::new(TakeTheirs));
    let result = project.apply_skill(&pkg);
    assert!(result.success, "apply failed: {:?}", result.error);
    assert_eq!(tp.read("src/index.ts"), "skill\n");
}

/// Clearing user resolutions makes the same conflict stage again.
#[test]
fn cleared_resolutions_are_forgotten() {
    let tp = TestProject::new();
    tp.write("src/util.ts", "export function noop() { return 1; }\n");
    let pkg = PackageBuilder::new("logger")
        .modify("src/util.ts", "export function noop() { return 2; }\n")
        .write(&tp.package_dir("logger"));
    let project = tp.project();

    assert!(!project.apply_skill(&pkg).success);
    let staged = project.staged_conflicts().expect("staged");
    assert_eq!(staged.len(), 1);
    std::fs::write(
        project.conflict_stage().merged_path(&staged[0].fingerprint),
        "export function noop() { return 3; }\n",
    )
    .expect("write");
    project.record_resolution(&staged[0].fingerprint).expect("record");

    project.clear_user_resolutions().expect("clear");
    assert!(project.user_resolutions().expect("list").is_empty());

    let result = project.apply_skill(&pkg);
    assert!(!result.success);
    assert_eq!(result.merge_conflicts, vec!["src/util.ts"]);
    assert_eq!(project.staged_conflicts().expect("staged").len(), 1);
}

/// Resolutions shipped inside a package are used when the user has none.
#[test]
fn package_shipped_resolution_is_used() {
    let tp = TestProject::new();
    let local = "export function noop() { return 1; }\n";
    let skill = "export function noop() { return 2; }\n";
    tp.write("src/util.ts", local);
    let pkg = PackageBuilder::new("logger")
        .modify("src/util.ts", skill)
        .write(&tp.package_dir("logger"));

    let project = tp.project();
    assert!(!project.apply_skill(&pkg).success);
    let staged = project.staged_conflicts().expect("staged");
    let fp = staged[0].fingerprint.clone();
    std::fs::write(project.conflict_stage().merged_path(&fp), "export function noop() { return 3; }\n")
        .expect("write");
    project.record_resolution(&fp).expect("record");

    // Move the recorded resolution into the package and forget it locally.
    let user_dir = tp.root().join(".skillweave/resolutions/user");
    let shipped = pkg.join("resolutions");
    copy_dir(&user_dir, &shipped);
    project.clear_user_resolutions().expect("clear");

    let result = project.apply_skill(&pkg);
    assert!(result.success, "apply failed: {:?}", result.error);
    assert_eq!(result.resolved_from_cache, vec!["src/util.ts"]);
    assert_eq!(tp.read("src/util.ts"), "export function noop() { return 3; }\n");
}

fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.expect("walk");
        let rel = entry.path().strip_prefix(from).expect("prefix");
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).expect("mkdir");
        } else {
            std::fs::copy(entry.path(), &target).expect("copy");
        }
    }
}
