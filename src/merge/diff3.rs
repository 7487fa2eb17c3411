//! Bundled line-based three-way merge.
//!
//! Classic diff3: compute the longest-common-subsequence matches of base→ours
//! and base→theirs, intersect them into *sync regions* that are unchanged on
//! all three sides, then decide every gap between sync regions on its own:
//!
//! - only ours changed the gap → take ours
//! - only theirs changed it → take theirs
//! - both made the same change → take it once
//! - both changed it differently → conflict block
//!
//! Conflict blocks use the `git merge-file` layout. Lines common to the start
//! or end of both sides of a conflict are hoisted out of the block.

use similar::{Algorithm, DiffTag, capture_diff_slices};

use super::{MergeError, MergeLabels, MergeOutcome, ThreeWayMerge};

/// Default merge primitive.
#[derive(Clone, Debug)]
pub struct Diff3Merger {
    marker_size: usize,
}

impl Default for Diff3Merger {
    fn default() -> Self {
        Self { marker_size: 7 }
    }
}

impl Diff3Merger {
    #[must_use]
    pub fn new(marker_size: usize) -> Self {
        Self {
            marker_size: marker_size.max(1),
        }
    }
}

impl ThreeWayMerge for Diff3Merger {
    fn merge(
        &self,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
        labels: &MergeLabels,
    ) -> Result<MergeOutcome, MergeError> {
        let base = as_text(base, "base")?;
        let ours_text = as_text(ours, "ours")?;
        let theirs_text = as_text(theirs, "theirs")?;

        if ours_text == theirs_text || base == theirs_text {
            return Ok(MergeOutcome::Clean(ours.to_vec()));
        }
        if base == ours_text {
            return Ok(MergeOutcome::Clean(theirs.to_vec()));
        }

        let (content, conflicts) = merge_text(base, ours_text, theirs_text, labels, self.marker_size);
        if conflicts == 0 {
            Ok(MergeOutcome::Clean(content.into_bytes()))
        } else {
            Ok(MergeOutcome::Conflicted {
                content: content.into_bytes(),
                conflicts,
            })
        }
    }
}

fn as_text<'a>(bytes: &'a [u8], side: &str) -> Result<&'a str, MergeError> {
    std::str::from_utf8(bytes).map_err(|e| MergeError::new(format!("{side} is not UTF-8 text: {e}")))
}

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// A region unchanged on all three sides: `[base, a, b]` start offsets + length.
#[derive(Clone, Copy, Debug)]
struct Sync {
    base: usize,
    a: usize,
    b: usize,
    len: usize,
}

/// Equal runs of `old` vs `new` as `(old_start, new_start, len)`.
fn matching_blocks(old: &[&str], new: &[&str]) -> Vec<(usize, usize, usize)> {
    capture_diff_slices(Algorithm::Myers, old, new)
        .iter()
        .filter_map(|op| {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            (tag == DiffTag::Equal && !old_range.is_empty())
                .then_some((old_range.start, new_range.start, old_range.len()))
        })
        .collect()
}

fn sync_regions(base: &[&str], a: &[&str], b: &[&str]) -> Vec<Sync> {
    let a_matches = matching_blocks(base, a);
    let b_matches = matching_blocks(base, b);

    let mut regions = Vec::new();
    let (mut ia, mut ib) = (0, 0);
    while ia < a_matches.len() && ib < b_matches.len() {
        let (a_base, a_start, a_len) = a_matches[ia];
        let (b_base, b_start, b_len) = b_matches[ib];

        let start = a_base.max(b_base);
        let end = (a_base + a_len).min(b_base + b_len);
        if start < end {
            regions.push(Sync {
                base: start,
                a: a_start + (start - a_base),
                b: b_start + (start - b_base),
                len: end - start,
            });
        }
        if a_base + a_len < b_base + b_len {
            ia += 1;
        } else {
            ib += 1;
        }
    }
    regions.push(Sync {
        base: base.len(),
        a: a.len(),
        b: b.len(),
        len: 0,
    });
    regions
}

/// Merge three texts line by line. Returns the output and the number of
/// conflict blocks written.
pub(crate) fn merge_text(
    base: &str,
    ours: &str,
    theirs: &str,
    labels: &MergeLabels,
    marker_size: usize,
) -> (String, usize) {
    let base: Vec<&str> = base.split_inclusive('\n').collect();
    let a: Vec<&str> = ours.split_inclusive('\n').collect();
    let b: Vec<&str> = theirs.split_inclusive('\n').collect();

    let mut out = String::new();
    let mut conflicts = 0;
    let (mut iz, mut ia, mut ib) = (0, 0, 0);

    for sync in sync_regions(&base, &a, &b) {
        let a_gap = &a[ia..sync.a];
        let b_gap = &b[ib..sync.b];
        let z_gap = &base[iz..sync.base];

        if !a_gap.is_empty() || !b_gap.is_empty() {
            if a_gap == b_gap {
                push_lines(&mut out, a_gap);
            } else if a_gap == z_gap {
                push_lines(&mut out, b_gap);
            } else if b_gap == z_gap {
                push_lines(&mut out, a_gap);
            } else {
                write_conflict(&mut out, a_gap, b_gap, labels, marker_size);
                conflicts += 1;
            }
        }

        let end = sync.base + sync.len;
        push_lines(&mut out, &base[sync.base..end]);
        iz = end;
        ia = sync.a + sync.len;
        ib = sync.b + sync.len;
    }
    (out, conflicts)
}

fn push_lines(out: &mut String, lines: &[&str]) {
    for line in lines {
        out.push_str(line);
    }
}

fn push_side(out: &mut String, lines: &[&str]) {
    push_lines(out, lines);
    if !lines.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn marker(out: &mut String, ch: char, size: usize, label: &str) {
    out.extend(std::iter::repeat_n(ch, size));
    if !label.is_empty() {
        out.push(' ');
        out.push_str(label);
    }
    out.push('\n');
}

fn write_conflict(out: &mut String, a: &[&str], b: &[&str], labels: &MergeLabels, size: usize) {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    push_lines(out, &a[..prefix]);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    marker(out, '<', size, &labels.ours);
    push_side(out, &a[prefix..a.len() - suffix]);
    marker(out, '=', size, "");
    push_side(out, &b[prefix..b.len() - suffix]);
    marker(out, '>', size, &labels.theirs);
    push_lines(out, &a[a.len() - suffix..]);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels() -> MergeLabels {
        MergeLabels::new("current", "skill")
    }

    fn merge(base: &str, ours: &str, theirs: &str) -> MergeOutcome {
        Diff3Merger::default()
            .merge(base.as_bytes(), ours.as_bytes(), theirs.as_bytes(), &labels())
            .unwrap()
    }

    fn clean(outcome: MergeOutcome) -> String {
        match outcome {
            MergeOutcome::Clean(c) => String::from_utf8(c).unwrap(),
            MergeOutcome::Conflicted { content, .. } => {
                panic!("unexpected conflict:\n{}", String::from_utf8_lossy(&content))
            }
        }
    }

    #[test]
    fn disjoint_edits_merge_cleanly() {
        let base = "line1\nline2\nline3\nline4\nline5\n";
        let ours = "line1 changed\nline2\nline3\nline4\nline5\n";
        let theirs = "line1\nline2\nline3\nline4\nline5 changed\n";
        assert_eq!(
            clean(merge(base, ours, theirs)),
            "line1 changed\nline2\nline3\nline4\nline5 changed\n"
        );
    }

    #[test]
    fn overlapping_edits_conflict() {
        let base = "a\nshared\nz\n";
        let ours = "a\nours version\nz\n";
        let theirs = "a\ntheirs version\nz\n";
        match merge(base, ours, theirs) {
            MergeOutcome::Conflicted { content, conflicts } => {
                let text = String::from_utf8(content).unwrap();
                assert_eq!(conflicts, 1);
                assert_eq!(
                    text,
                    "a\n<<<<<<< current\nours version\n=======\ntheirs version\n>>>>>>> skill\nz\n"
                );
            }
            MergeOutcome::Clean(_) => panic!("expected conflict"),
        }
    }

    #[test]
    fn identical_edits_collapse() {
        let base = "a\nb\nc\n";
        let both = "a\nB\nc\n";
        assert_eq!(clean(merge(base, both, both)), both);

        let ours = "a\nB\nc\nd\n";
        let theirs = "a\nB\nc\n";
        assert_eq!(clean(merge(base, ours, theirs)), ours);
    }

    #[test]
    fn additions_at_different_places() {
        let base = "import a\n\nfn main\n";
        let ours = "import a\nimport b\n\nfn main\n";
        let theirs = "import a\n\nfn main\ncall c\n";
        assert_eq!(
            clean(merge(base, ours, theirs)),
            "import a\nimport b\n\nfn main\ncall c\n"
        );
    }

    #[test]
    fn common_lines_hoisted_out_of_conflict() {
        let base = "x\n";
        let ours = "keep\nmine\ntail\n";
        let theirs = "keep\nyours\ntail\n";
        match merge(base, ours, theirs) {
            MergeOutcome::Conflicted { content, conflicts } => {
                assert_eq!(conflicts, 1);
                assert_eq!(
                    String::from_utf8(content).unwrap(),
                    "keep\n<<<<<<< current\nmine\n=======\nyours\n>>>>>>> skill\ntail\n"
                );
            }
            MergeOutcome::Clean(_) => panic!("expected conflict"),
        }
    }

    #[test]
    fn missing_trailing_newline_inside_conflict() {
        match merge("v\n", "ours", "theirs") {
            MergeOutcome::Conflicted { content, .. } => {
                assert_eq!(
                    String::from_utf8(content).unwrap(),
                    "<<<<<<< current\nours\n=======\ntheirs\n>>>>>>> skill\n"
                );
            }
            MergeOutcome::Clean(_) => panic!("expected conflict"),
        }
    }

    #[test]
    fn marker_size_is_configurable() {
        let merger = Diff3Merger::new(3);
        let out = merger
            .merge(b"a\n", b"b\n", b"c\n", &labels())
            .unwrap();
        match out {
            MergeOutcome::Conflicted { content, .. } => {
                let text = String::from_utf8(content).unwrap();
                assert!(text.starts_with("<<< current\n"));
                assert!(text.contains("\n===\n"));
            }
            MergeOutcome::Clean(_) => panic!("expected conflict"),
        }
    }

    #[test]
    fn non_utf8_is_hard_error() {
        let err = Diff3Merger::default()
            .merge(b"a\n", &[0xff, 0xfe], b"c\n", &labels())
            .unwrap_err();
        assert!(err.to_string().contains("ours"));
    }

    fn text() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a\n", "b\n", "c\n", "d\n", "e"]), 0..12)
            .prop_map(|lines| lines.concat())
    }

    proptest! {
        #[test]
        fn only_ours_changed(base in text(), ours in text()) {
            let (out, conflicts) = merge_text(&base, &ours, &base, &labels(), 7);
            prop_assert_eq!(conflicts, 0);
            prop_assert_eq!(out, ours);
        }

        #[test]
        fn only_theirs_changed(base in text(), theirs in text()) {
            let (out, conflicts) = merge_text(&base, &base, &theirs, &labels(), 7);
            prop_assert_eq!(conflicts, 0);
            prop_assert_eq!(out, theirs);
        }

        #[test]
        fn same_change_both_sides(base in text(), side in text()) {
            let (out, conflicts) = merge_text(&base, &side, &side, &labels(), 7);
            prop_assert_eq!(conflicts, 0);
            prop_assert_eq!(out, side);
        }
    }
}
