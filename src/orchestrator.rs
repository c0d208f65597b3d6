//! Drives one test run: decide which tests to skip, and for the rest, wrap
//! invocation in coverage capture and persist the resulting dependencies.
//!
//! The core only depends on the shapes named in the system overview's
//! out-of-scope list: a test identifier, a callable, a result exposing
//! `outcome`, and a capability yielding per-file executed line numbers.
//! `src/runner.rs` and `src/worker_pool.rs` are the concrete host that
//! satisfies these traits by shelling out to a Python interpreter.

use crate::coverage::checksum_coverage;
use crate::solver::{self, ChangedFiles, NodeData};
use crate::source_tree::SourceTree;
use crate::store::{DependencyStore, StoreError};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// What the orchestrator needs from a finished test invocation.
pub struct TestOutcome {
    pub failed: bool,
    /// Serialized failure report; empty when the test passed.
    pub result_blob: String,
}

/// The coverage recorder's contract: start/stop bracket one test, `stop`
/// returns the per-file executed-line sets (already combined with any
/// subprocess datasets by the caller's coverage backend).
pub trait Coverage {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<HashMap<String, HashSet<usize>>>;
}

pub enum RunDecision {
    Skipped,
    Ran(TestOutcome),
}

/// Precomputed once per run: which tests are safe to skip, and their last
/// recorded outcome (so a previously-failing-but-unaffected test still
/// reruns per §4.7 step 1).
pub struct Orchestrator {
    unaffected_nodeids: HashSet<String>,
    fail_reports: HashMap<String, crate::store::TestRecord>,
}

impl Orchestrator {
    /// Read the store, detect changed/vanished files, and compute the
    /// unaffected set for this run.
    pub fn prepare(store: &DependencyStore, source_tree: &mut SourceTree) -> Result<Self, StoreError> {
        let (node_data, fail_reports) = store.read_data()?;
        let mut changed_files: ChangedFiles = source_tree
            .get_changed_files()
            .into_iter()
            .map(|(path, module)| (path, module.checksums()))
            .collect();

        for vanished in source_tree.vanished_files() {
            changed_files.insert(vanished, Vec::new());
        }

        let result = solver::unaffected(&node_data, &changed_files);
        Ok(Self {
            unaffected_nodeids: result.unaffected_nodes.keys().cloned().collect(),
            fail_reports,
        })
    }

    /// §4.7 step 1: should `test_id` be skipped outright?
    pub fn should_skip(&self, test_id: &str) -> bool {
        if !self.unaffected_nodeids.contains(test_id) {
            return false;
        }
        !self
            .fail_reports
            .get(test_id)
            .map(|r| r.failed)
            .unwrap_or(false)
    }

    /// Run one test end to end: skip check, coverage bracket, mapping, and
    /// persistence. A store failure is logged and swallowed — the run
    /// continues, only this test's persistence step is lost (§7).
    pub fn run_test(
        &self,
        test_id: &str,
        defining_file: &str,
        invoke: impl FnOnce() -> TestOutcome,
        coverage: &mut dyn Coverage,
        source_tree: &mut SourceTree,
        store: &mut DependencyStore,
        force: bool,
    ) -> Result<RunDecision> {
        if !force && self.should_skip(test_id) {
            return Ok(RunDecision::Skipped);
        }

        coverage.start()?;
        let outcome = invoke();
        let executed = coverage.stop()?;

        self.persist_result(test_id, defining_file, &executed, outcome.failed, &outcome.result_blob, source_tree, store);

        Ok(RunDecision::Ran(outcome))
    }

    /// For hosts (like `src/runner.rs`) whose coverage capability doesn't
    /// decompose into separate start/stop calls — it runs the test and
    /// collects coverage in one subprocess round trip. Maps and persists
    /// exactly as `run_test` does, given the already-collected result.
    pub fn record_result(
        &self,
        test_id: &str,
        defining_file: &str,
        executed: &HashMap<String, HashSet<usize>>,
        failed: bool,
        result_blob: &str,
        source_tree: &mut SourceTree,
        store: &mut DependencyStore,
    ) {
        self.persist_result(test_id, defining_file, executed, failed, result_blob, source_tree, store);
    }

    fn persist_result(
        &self,
        test_id: &str,
        defining_file: &str,
        executed: &HashMap<String, HashSet<usize>>,
        failed: bool,
        result_blob: &str,
        source_tree: &mut SourceTree,
        store: &mut DependencyStore,
    ) {
        let mut dependency_map = HashMap::new();

        if executed.is_empty() {
            let module = source_tree.get_file(defining_file);
            let checksums = checksum_coverage(&module.blocks, &HashSet::from([1]));
            dependency_map.insert(defining_file.to_string(), checksums);
        } else {
            for (file, lines) in executed {
                let module = source_tree.get_file(file);
                let checksums = checksum_coverage(&module.blocks, lines);
                dependency_map.insert(file.clone(), checksums);
            }
        }

        if let Err(e) = store.set_dependencies(test_id, &dependency_map, failed, result_blob) {
            warn!(test_id, error = %e, "failed to persist test dependencies, continuing run");
        }
    }

    pub fn unaffected_count(&self) -> usize {
        self.unaffected_nodeids.len()
    }
}

/// Node ids discovered this run but no longer present: callers pass these
/// to `DependencyStore::collect_garbage` after the run completes.
pub fn stale_test_ids(node_data: &NodeData, discovered: &HashSet<String>) -> Vec<String> {
    node_data
        .keys()
        .filter(|id| !discovered.contains(*id))
        .cloned()
        .collect()
}
