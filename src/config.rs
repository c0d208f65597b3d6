//! Configuration loading.
//!
//! Two independent sources are read, closest to the teacher's own
//! `pyproject.toml`-walk: `[tool.testmon]` in `pyproject.toml` for
//! engine-level settings (`max_workers`), and the ini-style `[pytest]`
//! section of `pytest.ini` / `setup.cfg` / `tox.ini` for
//! `run_variant_expression`, matching the original `get_variant_inifile`.

use std::path::Path;

const INI_CANDIDATES: [&str; 3] = ["pytest.ini", "setup.cfg", "tox.ini"];

/// testmon configuration options.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of worker processes.
    pub max_workers: Option<usize>,
    /// The `run_variant_expression` read from an ini-style config file, if any.
    pub run_variant_expression: Option<String>,
}

impl Config {
    /// Load configuration starting at `start_dir`, walking up parent
    /// directories until a `pyproject.toml` and/or ini file is found.
    /// Missing files simply leave the corresponding fields unset.
    pub fn load(start_dir: &Path) -> Self {
        let mut dir = if start_dir.is_file() {
            start_dir.parent().map(Path::to_path_buf)
        } else {
            Some(start_dir.to_path_buf())
        };

        let mut config = Self::default();
        let mut found_toml = false;
        let mut found_ini = false;

        while let Some(d) = dir {
            if !found_toml {
                let pyproject = d.join("pyproject.toml");
                if pyproject.exists() {
                    if let Ok(content) = std::fs::read_to_string(&pyproject) {
                        if let Some(max_workers) = Self::parse_toml_max_workers(&content) {
                            config.max_workers = Some(max_workers);
                        }
                    }
                    found_toml = true;
                }
            }

            if !found_ini {
                for candidate in INI_CANDIDATES {
                    let path = d.join(candidate);
                    if path.exists() {
                        if let Ok(content) = std::fs::read_to_string(&path) {
                            if let Some(expr) = parse_ini_run_variant_expression(&content) {
                                config.run_variant_expression = Some(expr);
                            }
                        }
                        found_ini = true;
                        break;
                    }
                }
            }

            if found_toml && found_ini {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        config
    }

    fn parse_toml_max_workers(content: &str) -> Option<usize> {
        let doc: toml::Value = content.parse().ok()?;
        doc.get("tool")?
            .get("testmon")?
            .get("max_workers")?
            .as_integer()
            .map(|n| n as usize)
    }
}

/// Minimal ini-file reader for one key in one section — no general-purpose
/// ini crate is in the corpus, and this engine only ever reads `[pytest]
/// run_variant_expression`, so a hand-rolled scan is proportionate.
fn parse_ini_run_variant_expression(content: &str) -> Option<String> {
    let mut in_pytest_section = false;
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_pytest_section = line.trim_matches(['[', ']']).eq_ignore_ascii_case("pytest");
            continue;
        }
        if !in_pytest_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim().eq_ignore_ascii_case("run_variant_expression") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}
