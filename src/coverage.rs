//! Coverage-to-fingerprint mapping: translate a test's executed-line set
//! into the block checksums it depends on.

use crate::blocks::Block;
use std::collections::HashSet;

/// For each block that intersects `executed_lines`, emit its checksum.
/// Order follows `blocks`; duplicates are not possible since blocks don't
/// overlap outside of parent/child nesting, and both parent and child are
/// emitted independently when both are hit.
pub fn checksum_coverage(blocks: &[Block], executed_lines: &HashSet<usize>) -> Vec<u32> {
    blocks
        .iter()
        .filter(|block| {
            (block.id.start_line..=block.id.end_line).any(|line| executed_lines.contains(&line))
        })
        .map(|block| block.checksum)
        .collect()
}
