//! Run-length compaction of covered line numbers.

use std::collections::BTreeSet;

/// Compact an unordered set of line numbers into minimal inclusive
/// `[start, end]` ranges. Duplicates collapse before ranging; adjacent
/// singletons merge. O(n log n), dominated by the sort.
pub fn compact(lines: impl IntoIterator<Item = u32>) -> Vec<[u32; 2]> {
    let sorted: BTreeSet<u32> = lines.into_iter().collect();
    let mut ranges: Vec<[u32; 2]> = Vec::new();
    for line in sorted {
        match ranges.last_mut() {
            Some(range) if line == range[1] + 1 => range[1] = line,
            _ => ranges.push([line, line]),
        }
    }
    ranges
}

/// Total number of lines covered by a minimal range list.
pub fn line_count(ranges: &[[u32; 2]]) -> u32 {
    ranges.iter().map(|range| range[1] - range[0] + 1).sum()
}
