//! Affected-set computation: which tests remain safe to skip given a set of
//! changed files and each test's recorded per-file checksum dependencies.

use std::collections::{HashMap, HashSet};

/// `test_id -> file_path -> checksums it depended on last time it ran`.
pub type NodeData = HashMap<String, HashMap<String, Vec<u32>>>;

/// `file_path -> block checksums currently present in that file`. A file
/// with an empty vec stands for a vanished file (§4.3/§4.4, §9's resolved
/// open question): every dependent test is affected.
pub type ChangedFiles = HashMap<String, Vec<u32>>;

/// Invert `node_data` into `file -> test -> checksums`. Computed on demand,
/// never persisted, to avoid the two views diverging.
fn flip_dictionary(node_data: &NodeData) -> HashMap<String, HashMap<String, Vec<u32>>> {
    let mut files: HashMap<String, HashMap<String, Vec<u32>>> = HashMap::new();
    for (test_id, deps) in node_data {
        for (file, checksums) in deps {
            files
                .entry(file.clone())
                .or_default()
                .insert(test_id.clone(), checksums.clone());
        }
    }
    files
}

pub struct UnaffectedResult {
    pub unaffected_nodes: NodeData,
    pub unaffected_files: HashSet<String>,
}

/// A test is affected iff, for some file it depends on that also appears in
/// `changed_files`, its recorded checksums are not a subset of that file's
/// current checksums. Comparison is set-containment, not equality: new
/// blocks added to a file don't affect tests that never touched them.
pub fn unaffected(node_data: &NodeData, changed_files: &ChangedFiles) -> UnaffectedResult {
    let file_data = flip_dictionary(node_data);
    let mut unaffected_nodes = node_data.clone();
    let mut unaffected_files: HashSet<String> = file_data.keys().cloned().collect();

    for file in changed_files.keys() {
        let Some(tests) = file_data.get(file) else {
            continue;
        };
        let current: HashSet<u32> = changed_files[file].iter().copied().collect();

        for (test_id, recorded) in tests {
            let recorded_set: HashSet<u32> = recorded.iter().copied().collect();
            if !recorded_set.is_subset(&current) {
                if let Some(affected_deps) = unaffected_nodes.remove(test_id) {
                    for affected_file in affected_deps.keys() {
                        unaffected_files.remove(affected_file);
                    }
                }
            }
        }
    }

    UnaffectedResult {
        unaffected_nodes,
        unaffected_files,
    }
}
