//! Streaming console output: one line per test as it finishes, plus a
//! grouped end-of-run summary. Kept free of any dependency-tracking
//! knowledge — it only ever sees a `TestResult`.

use crate::runner::{TestResult, TestResults};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Prints each result as it streams in and remembers failures for the
/// end-of-run detail dump.
pub struct ProgressPrinter {
    verbose: bool,
    failed: Mutex<Vec<TestResult>>,
}

impl ProgressPrinter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            failed: Mutex::new(Vec::new()),
        }
    }

    pub fn print_result(&self, result: &TestResult) {
        let symbol = if result.skipped {
            "○".dimmed()
        } else if result.passed {
            "✓".green()
        } else {
            "✗".red()
        };

        let name = test_label(result);
        let duration_ms = result.duration.as_millis();

        if result.skipped {
            let reason = result.skip_reason.as_deref().unwrap_or("skipped");
            println!("  {} {} ({})", symbol, name, reason.dimmed());
        } else {
            println!("  {} {} ({}ms)", symbol, name, duration_ms);
        }

        if !result.passed && !result.skipped {
            if let Some(ref error) = result.error {
                println!("    {}", error.message.red());
                println!("    {}:{}", result.item.file.display(), result.item.line);
                if self.verbose {
                    if let Some(ref tb) = error.traceback {
                        for line in tb.lines().take(10) {
                            println!("    {}", line.dimmed());
                        }
                    }
                }
            }
            self.failed.lock().unwrap().push(result.clone());
        }
    }

    pub fn get_failed_tests(&self) -> Vec<TestResult> {
        self.failed.lock().unwrap().clone()
    }
}

fn test_label(result: &TestResult) -> String {
    if let Some(ref class) = result.item.class {
        format!("{}::{}", class, result.item.function)
    } else {
        result.item.function.clone()
    }
}

pub fn print_summary(results: &TestResults, failed: &[TestResult]) {
    let mut by_file: BTreeMap<PathBuf, Vec<&TestResult>> = BTreeMap::new();
    for result in &results.results {
        by_file.entry(result.item.file.clone()).or_default().push(result);
    }

    println!();
    for (file, file_results) in &by_file {
        println!("{}", file.display().to_string().bold());
        for result in file_results {
            let status = if result.skipped {
                "skipped".dimmed()
            } else if result.passed {
                "passed".green()
            } else {
                "failed".red()
            };
            println!("  {} {}", status, test_label(result));
        }
    }
    println!();

    if !failed.is_empty() {
        println!("{}", "failures:".bold());
        for result in failed {
            println!("  {} — {}", test_label(result).red(), result.item.id());
        }
        println!();
    }

    let passed = results.passed_count();
    let failed_count = results.failed_count();
    let skipped = results.skipped_count();
    let duration = results.total_duration.as_secs_f64();

    let summary = if failed_count == 0 {
        format!(
            "{} passed, {} skipped in {:.2}s",
            passed, skipped, duration
        )
        .green()
    } else {
        format!(
            "{} passed, {} failed, {} skipped in {:.2}s",
            passed, failed_count, skipped, duration
        )
        .red()
    };

    println!("{}", summary);
}

pub fn print_no_tests_found() {
    println!("{}", "No tests found.".yellow());
}
