//! CLI argument parsing and execution.
//!
//! This is the host the core subsystems are built to be driven by: it
//! discovers tests, invokes them through `runner`/`worker_pool`, and wires
//! their results into the dependency store via `orchestrator`. None of the
//! core modules (`blocks`, `coverage`, `source_tree`, `solver`, `store`,
//! `variant`, `orchestrator`) know this file exists.

use crate::orchestrator::Orchestrator;
use crate::source_tree::{FileFingerprint, SourceTree};
use crate::store::DependencyStore;
use crate::{cache, config, discovery, output, runner, variant};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "testmon", version, about = "Test-impact analysis: select only the tests affected by a change.")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path(s) to test files or directories
    #[arg(default_value = ".")]
    pub paths: Vec<PathBuf>,

    /// Filter tests by name substring
    #[arg(short = 'k', long)]
    pub filter: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Disable parallel execution
    #[arg(long)]
    pub no_parallel: bool,

    /// Number of parallel jobs (default: CPU count)
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Activate the dependency-tracking engine: skip tests provably unaffected
    /// by the current change.
    #[arg(long)]
    pub testmon: bool,

    /// Ignore stored dependencies; record fresh data for every discovered test.
    #[arg(long)]
    pub recollect: bool,

    /// Execution isolation mode
    #[arg(long, default_value = "process-per-test")]
    pub isolation: String,

    /// Generate markdown documentation for CLI
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List discovered tests without running them
    List {
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        #[arg(short = 'k', long)]
        filter: Option<String>,
    },
    /// Watch for changes and re-run affected tests
    Watch {
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        #[arg(short = 'k', long)]
        filter: Option<String>,

        #[arg(short, long)]
        verbose: bool,

        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        #[arg(long, default_value = "process-per-test")]
        isolation: String,

        #[arg(long)]
        testmon: bool,

        #[arg(long)]
        recollect: bool,
    },
    /// Dependency store management
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum StoreAction {
    /// Show store and scratch-directory statistics
    Info,
    /// Delete `.testmondata` and the per-run scratch directory
    Clear,
}

/// Run the CLI with command line arguments from the environment.
pub fn run() -> i32 {
    let args = Args::parse();
    run_with_parsed_args(args)
}

/// Run the CLI with the given string arguments.
pub fn run_with_args(args: Vec<String>) -> i32 {
    match Args::try_parse_from(args) {
        Ok(args) => run_with_parsed_args(args),
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

fn run_with_parsed_args(args: Args) -> i32 {
    if args.markdown_help {
        print!("{}", clap_markdown::help_markdown::<Args>());
        return 0;
    }

    init_tracing(args.verbose);

    let result = match args.command {
        Some(Commands::List { paths, filter }) => list_tests(&paths, filter.as_deref()),
        Some(Commands::Watch {
            paths,
            filter,
            verbose,
            jobs,
            isolation,
            testmon,
            recollect,
        }) => watch_tests(&paths, filter.as_deref(), verbose, jobs, &isolation, testmon, recollect),
        Some(Commands::Store { action }) => handle_store_command(action),
        None => run_once(&args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

pub fn generate_markdown_help() -> String {
    clap_markdown::help_markdown::<Args>()
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .try_init();
}

fn list_tests(paths: &[PathBuf], filter: Option<&str>) -> Result<i32> {
    let test_files = discovery::find_test_files(paths)?;
    if test_files.is_empty() {
        output::print_no_tests_found();
        return Ok(0);
    }

    let all_tests = discovery::extract_tests(&test_files, filter)?;
    if all_tests.is_empty() {
        output::print_no_tests_found();
        return Ok(0);
    }

    for test in &all_tests {
        println!("{}", test.id());
    }
    println!("\n{} tests", all_tests.len());
    Ok(0)
}

fn handle_store_command(action: StoreAction) -> Result<i32> {
    let root = PathBuf::from(".");
    match action {
        StoreAction::Info => {
            let scratch = cache::scratch_stats(&root);
            println!("Scratch directory: {}", scratch.dir.display());
            println!("Scratch exists: {}", scratch.exists);
            if scratch.exists {
                let size_kb = scratch.size_bytes as f64 / 1024.0;
                println!("Scratch size: {:.1} KB ({} files)", size_kb, scratch.file_count);
            }

            let data_path = root.join(crate::store::DATA_FILE_NAME);
            if data_path.exists() {
                let store = DependencyStore::open(&root, "default")?;
                let stats = store.stats()?;
                println!();
                println!("Dependency store: {}", data_path.display());
                println!("  {} tests tracked", stats.total_tests);
                println!("  {} passed, {} failed", stats.passed_tests, stats.failed_tests);
                println!("  {} file-dependency rows", stats.total_file_rows);
            } else {
                println!();
                println!("No dependency store yet at {}", data_path.display());
            }
        }
        StoreAction::Clear => {
            let data_path = root.join(crate::store::DATA_FILE_NAME);
            let mut cleared = false;
            if data_path.exists() {
                std::fs::remove_file(&data_path).context("failed to remove dependency store")?;
                cleared = true;
            }
            cache::clear_scratch_dir(&root)?;
            if cleared {
                println!("Dependency store and scratch directory cleared.");
            } else {
                println!("Scratch directory cleared. No dependency store was present.");
            }
        }
    }
    Ok(0)
}

fn watch_tests(
    paths: &[PathBuf],
    filter: Option<&str>,
    verbose: bool,
    jobs: Option<usize>,
    isolation: &str,
    testmon: bool,
    recollect: bool,
) -> Result<i32> {
    let config = config::Config::load(&paths[0]);
    let jobs = jobs.or(config.max_workers);

    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                let _ = tx.send(event);
            }
        }
    })?;

    for path in paths {
        let watch_path = if path.is_file() {
            path.parent().unwrap_or(path)
        } else {
            path.as_path()
        };
        watcher.watch(watch_path, RecursiveMode::Recursive)?;
    }

    println!("Watching for changes... (Ctrl+C to stop)\n");
    run_pipeline(paths, filter, verbose, jobs, isolation, testmon, recollect).ok();

    loop {
        match rx.recv() {
            Ok(event) => {
                let changed: Vec<_> = event
                    .paths
                    .iter()
                    .filter(|p| p.extension().map(|e| e == "py").unwrap_or(false))
                    .collect();

                if !changed.is_empty() {
                    std::thread::sleep(Duration::from_millis(100));
                    while rx.try_recv().is_ok() {}

                    for path in &changed {
                        println!("changed: {}", path.display());
                    }
                    println!();

                    run_pipeline(paths, filter, verbose, jobs, isolation, testmon, recollect).ok();
                }
            }
            Err(_) => break,
        }
    }

    Ok(0)
}

fn run_once(args: &Args) -> Result<i32> {
    run_pipeline(
        &args.paths,
        args.filter.as_deref(),
        args.verbose,
        args.jobs,
        &args.isolation,
        args.testmon,
        args.recollect,
    )
}

/// Discover, select, run, and persist. Shared by the default command and the
/// watch loop's per-iteration body.
fn run_pipeline(
    paths: &[PathBuf],
    filter: Option<&str>,
    verbose: bool,
    jobs: Option<usize>,
    isolation: &str,
    testmon: bool,
    recollect: bool,
) -> Result<i32> {
    let root = paths.first().cloned().unwrap_or_else(|| PathBuf::from("."));
    let config = config::Config::load(&root);
    let jobs = jobs.or(config.max_workers);

    let test_files = discovery::find_test_files(paths)?;
    if test_files.is_empty() {
        output::print_no_tests_found();
        return Ok(0);
    }

    let all_tests = discovery::extract_tests(&test_files, filter)?;
    if all_tests.is_empty() {
        output::print_no_tests_found();
        return Ok(0);
    }

    let (marker_skipped, discovered): (Vec<_>, Vec<_>) =
        all_tests.into_iter().partition(|item| item.is_skipped());

    let mut skipped_results: Vec<_> = marker_skipped
        .iter()
        .map(|item| {
            let reason = item.skip_reason().unwrap_or_else(|| "marked with @skip".to_string());
            runner::skipped_result(item, &reason)
        })
        .collect();

    let printer = output::ProgressPrinter::new(verbose);

    if !testmon {
        for result in &skipped_results {
            printer.print_result(result);
        }
        let run_results = runner::run_tests(
            &discovered,
            true,
            jobs,
            false,
            &root,
            runner::IsolationMode::parse(isolation),
            |result| printer.print_result(result),
        )?;

        let mut all_results = skipped_results;
        all_results.extend(run_results.results);
        let combined = runner::TestResults {
            results: all_results,
            total_duration: run_results.total_duration,
        };
        let failed = printer.get_failed_tests();
        output::print_summary(&combined, &failed);
        return Ok(if combined.all_passed() { 0 } else { 1 });
    }

    let variant_expression = config.run_variant_expression.clone().unwrap_or_default();
    let variant = {
        let v = variant::eval_variant_with_os_env(&variant_expression);
        if v.is_empty() { "default".to_string() } else { v }
    };

    let mut store = DependencyStore::open(&root, variant).context("failed to open dependency store")?;
    let (node_data, _) = store.read_data()?;
    let mut source_tree = load_source_tree(&root, &store)?;

    let orchestrator = Orchestrator::prepare(&store, &mut source_tree)?;
    tracing::debug!(unaffected = orchestrator.unaffected_count(), "computed unaffected set");

    let (to_skip, to_run): (Vec<_>, Vec<_>) = discovered.into_iter().partition(|item| {
        !recollect && orchestrator.should_skip(&item.id())
    });

    for item in &to_skip {
        skipped_results.push(runner::skipped_result(item, "unaffected by current change"));
    }
    for result in &skipped_results {
        printer.print_result(result);
    }

    let run_results = runner::run_tests(
        &to_run,
        true,
        jobs,
        true,
        &root,
        runner::IsolationMode::parse(isolation),
        |result| printer.print_result(result),
    )?;

    for result in &run_results.results {
        if result.skipped {
            continue;
        }
        let test_id = result.item.id();
        let defining_file = relative_path(&root, &result.item.file);
        let result_blob = result
            .error
            .as_ref()
            .map(|e| serde_json::json!({"message": e.message, "traceback": e.traceback}).to_string())
            .unwrap_or_default();

        let executed: HashMap<String, std::collections::HashSet<usize>> = result
            .coverage
            .as_ref()
            .map(|cov| {
                cov.files
                    .iter()
                    .map(|(path, lines)| (relative_path(&root, path), lines.iter().copied().collect()))
                    .collect()
            })
            .unwrap_or_default();

        orchestrator.record_result(
            &test_id,
            &defining_file,
            &executed,
            !result.passed,
            &result_blob,
            &mut source_tree,
            &mut store,
        );
    }

    if let Err(e) = store.write_data(&source_tree.mtimes(), &source_tree.content_hashes()) {
        tracing::warn!(error = %e, "failed to persist source-tree fingerprints");
    }

    let mut discovered_ids: std::collections::HashSet<String> =
        to_run.iter().map(|item| item.id()).collect();
    discovered_ids.extend(to_skip.iter().map(|item| item.id()));
    discovered_ids.extend(marker_skipped.iter().map(|item| item.id()));
    let stale = crate::orchestrator::stale_test_ids(&node_data, &discovered_ids);
    if let Err(e) = store.collect_garbage(&stale) {
        tracing::warn!(error = %e, "failed to garbage-collect stale test records");
    }
    if let Err(e) = store.checkpoint() {
        tracing::warn!(error = %e, "failed to checkpoint dependency store");
    }

    let mut all_results = skipped_results;
    all_results.extend(run_results.results);
    let combined = runner::TestResults {
        results: all_results,
        total_duration: run_results.total_duration,
    };
    let failed = printer.get_failed_tests();
    output::print_summary(&combined, &failed);

    Ok(if combined.all_passed() { 0 } else { 1 })
}

fn load_source_tree(root: &Path, store: &DependencyStore) -> Result<SourceTree> {
    let mtimes = store.read_mtimes()?;
    let checksums = store.read_checksums()?;
    let fingerprints: HashMap<String, FileFingerprint> = mtimes
        .into_iter()
        .map(|(path, mtime)| {
            let content_sha1 = checksums.get(&path).cloned().unwrap_or_default();
            (path, FileFingerprint { mtime, content_sha1 })
        })
        .collect();
    Ok(SourceTree::new(root, fingerprints))
}

fn relative_path(root: &Path, path: &Path) -> String {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    path.strip_prefix(&root)
        .unwrap_or(&path)
        .to_string_lossy()
        .into_owned()
}
