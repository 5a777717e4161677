//! Action similarity and pattern signatures

use super::ObservedAction;

/// Messages are truncated to this many chars before comparison.
pub const MAX_COMPARE_CHARS: usize = 256;

/// Weight of the kind match in [`action_similarity`].
const KIND_WEIGHT: f64 = 0.6;
/// Weight of the message ratio in [`action_similarity`].
const TEXT_WEIGHT: f64 = 0.4;

/// Text similarity ratio: `2 * LCS(a, b) / (|a| + |b|)` over chars.
///
/// Two empty strings are identical (1.0).
pub fn text_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a: Vec<char> = a.chars().take(MAX_COMPARE_CHARS).collect();
    let b: Vec<char> = b.chars().take(MAX_COMPARE_CHARS).collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / total as f64
}

/// Longest common subsequence length, two-row DP
fn lcs_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `0.6 * (kind match) + 0.4 * text_ratio(messages)`
pub fn action_similarity(a: &ObservedAction, b: &ObservedAction) -> f64 {
    let kind = if a.kind == b.kind { 1.0 } else { 0.0 };
    KIND_WEIGHT * kind + TEXT_WEIGHT * text_ratio(&a.message, &b.message)
}

/// Whether the mean pairwise similarity of two equal-length windows reaches
/// `threshold`.
///
/// Kind matches are counted first; if even perfect text similarity could not
/// lift the mean to `threshold` the LCS work is skipped.
pub fn windows_match(a: &[ObservedAction], b: &[ObservedAction], threshold: f64) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    let n = a.len() as f64;
    let kind_matches = a.iter().zip(b).filter(|(x, y)| x.kind == y.kind).count() as f64;
    let upper_bound = (KIND_WEIGHT * kind_matches + TEXT_WEIGHT * n) / n;
    if upper_bound < threshold {
        return false;
    }
    let total: f64 = a.iter().zip(b).map(|(x, y)| action_similarity(x, y)).sum();
    total / n >= threshold
}

/// Stable signature of an action: kind plus the lowercased message with
/// digit runs collapsed, so counters and timestamps don't split patterns.
pub fn signature(action: &ObservedAction) -> String {
    let mut message = String::with_capacity(action.message.len().min(80));
    let mut last_was_digit = false;
    for c in action.message.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_digit() {
            if !last_was_digit {
                message.push('#');
            }
            last_was_digit = true;
        } else {
            message.push(c);
            last_was_digit = false;
        }
        if message.chars().count() >= 80 {
            break;
        }
    }
    format!("{}:{}", action.kind, message.trim())
}

/// Reduce a signature window to one canonical cycle.
///
/// The window is cut to its smallest period and rotated to the
/// lexicographically minimal phase, so the same repeating cycle observed at
/// any offset yields the same sequence.
pub fn canonical_cycle(window: &[String]) -> Vec<String> {
    if window.is_empty() {
        return Vec::new();
    }
    let period = (1..=window.len())
        .find(|&p| (p..window.len()).all(|i| window[i] == window[i - p]))
        .unwrap_or(window.len());
    let cycle = &window[..period];
    (0..period)
        .map(|shift| {
            cycle[shift..]
                .iter()
                .chain(&cycle[..shift])
                .cloned()
                .collect::<Vec<_>>()
        })
        .min()
        .unwrap_or_default()
}

/// BLAKE3 hash of the canonical cycle of `window`
pub fn pattern_hash(window: &[String]) -> String {
    let joined = canonical_cycle(window).join("\n");
    crate::canonical::checksum(joined.as_bytes())
}
