//! Per-run scratch directory: `<rootdir>/.tmontmp/`, home to the coverage
//! subprocess data files and `_rc` configuration files that let child
//! processes auto-instrument via `COVERAGE_PROCESS_START` (§5, §6).

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};

const SCRATCH_DIR_NAME: &str = ".tmontmp";

/// Environment variable that `coverage`'s own site-customize hook watches for
/// to auto-start itself in a freshly spawned child process.
pub const COVERAGE_PROCESS_START: &str = "COVERAGE_PROCESS_START";

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Glob patterns to exclude from subprocess coverage, mirroring the original
/// `_get_python_lib_paths()` without needing to query the interpreter.
pub fn default_omit_patterns() -> Vec<String> {
    vec![
        "*/site-packages/*".to_string(),
        "*/lib/python*".to_string(),
        "/usr/lib/*".to_string(),
    ]
}

pub fn scratch_dir(rootdir: &Path) -> PathBuf {
    rootdir.join(SCRATCH_DIR_NAME)
}

pub fn ensure_scratch_dir(rootdir: &Path) -> io::Result<PathBuf> {
    let dir = scratch_dir(rootdir);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn clear_scratch_dir(rootdir: &Path) -> io::Result<()> {
    let dir = scratch_dir(rootdir);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

pub struct ScratchStats {
    pub dir: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub file_count: usize,
}

pub fn scratch_stats(rootdir: &Path) -> ScratchStats {
    let dir = scratch_dir(rootdir);
    let exists = dir.exists();
    let (size_bytes, file_count) = if exists {
        walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .fold((0u64, 0usize), |(size, count), entry| {
                let file_size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                (size + file_size, count + 1)
            })
    } else {
        (0, 0)
    };
    ScratchStats {
        dir,
        exists,
        size_bytes,
        file_count,
    }
}

/// A live subprocess-coverage configuration: its data file and the `_rc`
/// file pointing at it. The caller publishes `COVERAGE_PROCESS_START` on the
/// *child's* `Command`, not the process environment, so concurrently running
/// tests never race over a shared global var.
pub struct SubprocessCoverage {
    pub data_file: PathBuf,
    pub rc_file: PathBuf,
}

impl SubprocessCoverage {
    /// Write a per-test coverage config. Mirrors the original
    /// `setup_subprocess`, but scoped to one test instead of one session:
    /// each call gets its own `_rc`/data file pair (`pid` + an atomic
    /// counter keeps names unique across parallel workers), so `parallel=True`
    /// datasets never collide between concurrently running tests.
    pub fn setup(rootdir: &Path, includes: &[String], omits: &[String]) -> io::Result<Self> {
        let dir = ensure_scratch_dir(rootdir)?;
        let suffix = format!(
            "{}{}",
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let data_file = dir.join(format!(".testmoncoverage{suffix}"));
        let rc_file = dir.join(format!(".testmoncoverage{suffix}_rc"));

        let rc_content = format!(
            "[run]\ndata_file = {}\ninclude = {}\nomit = {}\nparallel=True\n",
            data_file.display(),
            includes.join("\n "),
            omits.join("\n "),
        );
        fs::write(&rc_file, rc_content)?;

        Ok(Self { data_file, rc_file })
    }

    /// Combine whatever parallel-suffixed datasets the child process(es)
    /// wrote and return the executed-line sets they recorded, keyed by
    /// absolute file path. Best-effort: if the `coverage` package isn't
    /// installed, or no child ever started, this returns an empty map
    /// rather than failing the test that triggered it (per the store's own
    /// degrade-gracefully-and-warn policy).
    pub fn combine(&self) -> HashMap<String, HashSet<usize>> {
        let rc_file = self.rc_file.to_string_lossy().into_owned();

        let combined = Command::new("python3")
            .args(["-m", "coverage", "combine", "--rcfile", &rc_file])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !matches!(combined, Ok(status) if status.success()) {
            return HashMap::new();
        }

        let report = Command::new("python3")
            .args(["-m", "coverage", "json", "--rcfile", &rc_file, "-o", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        let Ok(report) = report else {
            return HashMap::new();
        };
        if !report.status.success() {
            return HashMap::new();
        }

        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&report.stdout) else {
            return HashMap::new();
        };
        let Some(files) = value.get("files").and_then(|f| f.as_object()) else {
            return HashMap::new();
        };

        files
            .iter()
            .filter_map(|(path, data)| {
                let lines = data.get("executed_lines")?.as_array()?;
                let lines: HashSet<usize> = lines
                    .iter()
                    .filter_map(|n| n.as_u64().map(|n| n as usize))
                    .collect();
                Some((path.clone(), lines))
            })
            .collect()
    }

    /// Remove the `_rc` and data files so a later, unrelated test in the
    /// same scratch dir can't accidentally combine this test's leftovers.
    pub fn teardown(&self) -> io::Result<()> {
        if self.rc_file.exists() {
            fs::remove_file(&self.rc_file)?;
        }
        if self.data_file.exists() {
            fs::remove_file(&self.data_file)?;
        }
        Ok(())
    }
}
