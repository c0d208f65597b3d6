pub mod blocks;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod discovery;
pub mod markers;
pub mod orchestrator;
pub mod output;
pub mod runner;
pub mod solver;
pub mod source_tree;
pub mod store;
pub mod variant;
pub mod worker_pool;

#[cfg(feature = "extension-module")]
use pyo3::prelude::*;

/// CLI entry point for the `testmon` command.
/// Called from Python via console_scripts entrypoint.
#[cfg(feature = "extension-module")]
#[pyfunction]
fn main() {
    let code = cli::run();
    std::process::exit(code);
}

/// PyO3 module definition
#[cfg(feature = "extension-module")]
#[pymodule]
fn _testmon(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(main, m)?)?;
    Ok(())
}
