//! Line-level unified diff over canonical JSON

use serde::{Deserialize, Serialize};

/// Unchanged lines kept around each hunk
pub const CONTEXT_LINES: usize = 3;

/// Difference between two ledger versions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub from_version: u64,
    pub to_version: u64,
    pub additions: usize,
    pub deletions: usize,
    pub total_changes: usize,
    /// Unified diff output, empty when the versions are identical
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

impl Op<'_> {
    fn consumes_old(&self) -> bool {
        matches!(self, Op::Equal(_) | Op::Delete(_))
    }

    fn consumes_new(&self) -> bool {
        matches!(self, Op::Equal(_) | Op::Insert(_))
    }

    fn render(&self) -> String {
        match self {
            Op::Equal(l) => format!(" {}", l),
            Op::Delete(l) => format!("-{}", l),
            Op::Insert(l) => format!("+{}", l),
        }
    }
}

/// Edit script from an LCS table; deletions before insertions within a change
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<Op<'a>> {
    let (n, m) = (old.len(), new.len());
    // lcs[i][j] = LCS of old[i..] and new[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(Op::Delete(old[i]));
            i += 1;
        } else {
            ops.push(Op::Insert(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|l| Op::Delete(*l)));
    ops.extend(new[j..].iter().map(|l| Op::Insert(*l)));
    ops
}

/// Hunk ranges (inclusive op indices) with `context` lines around changes
fn hunks(ops: &[Op<'_>], context: usize) -> Vec<(usize, usize)> {
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_)))
        .map(|(i, _)| i)
        .collect();
    let Some((&first, rest)) = changes.split_first() else {
        return Vec::new();
    };

    let mut groups = Vec::new();
    let (mut start, mut end) = (first, first);
    for &c in rest {
        if c - end > 2 * context {
            groups.push((start, end));
            start = c;
        }
        end = c;
    }
    groups.push((start, end));

    groups
        .into_iter()
        .map(|(s, e)| (s.saturating_sub(context), (e + context).min(ops.len() - 1)))
        .collect()
}

/// Unified diff of two texts
pub fn unified_diff(old: &str, new: &str, from_version: u64, to_version: u64) -> DiffResult {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    let additions = ops.iter().filter(|op| matches!(op, Op::Insert(_))).count();
    let deletions = ops.iter().filter(|op| matches!(op, Op::Delete(_))).count();

    let mut lines = Vec::new();
    let ranges = hunks(&ops, CONTEXT_LINES);
    if !ranges.is_empty() {
        lines.push(format!("--- version {}", from_version));
        lines.push(format!("+++ version {}", to_version));
    }
    for (lo, hi) in ranges {
        let old_before = ops[..lo].iter().filter(|op| op.consumes_old()).count();
        let new_before = ops[..lo].iter().filter(|op| op.consumes_new()).count();
        let hunk = &ops[lo..=hi];
        let old_len = hunk.iter().filter(|op| op.consumes_old()).count();
        let new_len = hunk.iter().filter(|op| op.consumes_new()).count();
        // Empty ranges point at the line before, as in GNU diff
        let old_start = if old_len == 0 { old_before } else { old_before + 1 };
        let new_start = if new_len == 0 { new_before } else { new_before + 1 };
        lines.push(format!(
            "@@ -{},{} +{},{} @@",
            old_start, old_len, new_start, new_len
        ));
        lines.extend(hunk.iter().map(Op::render));
    }

    DiffResult {
        from_version,
        to_version,
        additions,
        deletions,
        total_changes: additions + deletions,
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_texts() {
        let d = unified_diff("a\nb\n", "a\nb\n", 1, 2);
        assert_eq!(d.total_changes, 0);
        assert!(d.lines.is_empty());
    }

    #[test]
    fn test_single_change_with_context() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n";
        let new = "1\n2\n3\n4\nfive\n6\n7\n8\n9\n";
        let d = unified_diff(old, new, 3, 4);
        assert_eq!(d.additions, 1);
        assert_eq!(d.deletions, 1);
        assert_eq!(d.total_changes, 2);
        assert_eq!(
            d.lines,
            vec![
                "--- version 3",
                "+++ version 4",
                "@@ -2,7 +2,7 @@",
                " 2",
                " 3",
                " 4",
                "-5",
                "+five",
                " 6",
                " 7",
                " 8",
            ]
        );
    }

    #[test]
    fn test_distant_changes_split_hunks() {
        let old: String = (1..=20).map(|i| format!("{}\n", i)).collect();
        let new: String = (1..=20)
            .map(|i| match i {
                2 => "two\n".to_string(),
                19 => "nineteen\n".to_string(),
                _ => format!("{}\n", i),
            })
            .collect();
        let d = unified_diff(&old, &new, 1, 2);
        let hunk_headers = d.lines.iter().filter(|l| l.starts_with("@@")).count();
        assert_eq!(hunk_headers, 2);
        assert_eq!(d.total_changes, 4);
    }

    #[test]
    fn test_pure_insertion() {
        let d = unified_diff("", "a\nb\n", 0, 1);
        assert_eq!(d.additions, 2);
        assert_eq!(d.deletions, 0);
        assert_eq!(d.lines[2], "@@ -0,0 +1,2 @@");
    }
}
