//! Block extraction and fingerprinting.
//!
//! Parses a source file into an ordered list of syntactic blocks — the
//! module as a whole, plus every function, method and class definition —
//! each carrying a 32-bit checksum over its *normalized* body. The
//! normalization (indent-strip, comment-strip, docstring-strip, blank-line
//! collapse) is the contract every other subsystem in this crate relies on:
//! changing it invalidates every previously stored checksum.

use rustpython_parser::Parse;
use rustpython_parser::ast::{self, Ranged};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh32::xxh32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Module,
    Function,
    Method,
    Class,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub file: PathBuf,
    pub kind: BlockKind,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub checksum: u32,
}

/// The parsed form of one source file: an ordered list of blocks plus a
/// line -> block index map for coverage lookups.
#[derive(Debug, Default, Clone)]
pub struct Module {
    pub file: PathBuf,
    pub blocks: Vec<Block>,
    line_to_block: HashMap<usize, usize>,
}

impl Module {
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::from_source(&source, path))
    }

    /// Parse `source` as if it were `file`. Never fails: a syntactically
    /// invalid file degrades to a single whole-file block.
    pub fn from_source(source: &str, file: impl AsRef<Path>) -> Self {
        let file = file.as_ref().to_path_buf();

        let blocks = match ast::Suite::parse(source, "<module>") {
            Ok(suite) => extract_blocks(&suite, source, &file),
            Err(_) => vec![Block {
                id: BlockId {
                    file: file.clone(),
                    kind: BlockKind::Module,
                    name: String::new(),
                    start_line: 1,
                    end_line: line_count(source),
                },
                checksum: checksum_bytes(source.as_bytes()),
            }],
        };

        // Nested defs can share lines with their enclosing class/function
        // (the class header line, decorator lines, etc). Vector order isn't
        // outer-to-inner or inner-to-outer consistently, so pick whichever
        // block has the narrower range for each shared line rather than
        // relying on write order — the innermost block always wins.
        let mut line_to_block = HashMap::new();
        for (idx, block) in blocks.iter().enumerate() {
            let width = block.id.end_line - block.id.start_line;
            for line in block.id.start_line..=block.id.end_line {
                match line_to_block.get(&line) {
                    Some(&current_idx) => {
                        let current_width =
                            blocks[current_idx].id.end_line - blocks[current_idx].id.start_line;
                        if width < current_width {
                            line_to_block.insert(line, idx);
                        }
                    }
                    None => {
                        line_to_block.insert(line, idx);
                    }
                }
            }
        }

        Self {
            file,
            blocks,
            line_to_block,
        }
    }

    pub fn get_block_for_line(&self, line: usize) -> Option<&Block> {
        self.line_to_block.get(&line).map(|&idx| &self.blocks[idx])
    }

    /// All checksums this module currently has, in block order.
    pub fn checksums(&self) -> Vec<u32> {
        self.blocks.iter().map(|b| b.checksum).collect()
    }
}

fn extract_blocks(suite: &[ast::Stmt], source: &str, file: &Path) -> Vec<Block> {
    let mut blocks = Vec::new();
    let nested = walk(suite, source, file, &mut blocks, None);

    let end_line = line_count(source);
    let module_body = normalized_body(source, 1, end_line, 0, &nested);

    blocks.insert(
        0,
        Block {
            id: BlockId {
                file: file.to_path_buf(),
                kind: BlockKind::Module,
                name: String::new(),
                start_line: 1,
                end_line,
            },
            checksum: checksum_str(&module_body),
        },
    );

    blocks
}

/// Walk one body (module suite, class body, or function body), emitting a
/// `Block` for every function/method/class definition found directly or
/// transitively, and returning the line ranges of the *direct* children of
/// this body (so the caller can exclude them from its own normalized body).
fn walk(
    stmts: &[ast::Stmt],
    source: &str,
    file: &Path,
    blocks: &mut Vec<Block>,
    parent_class: Option<&str>,
) -> Vec<(usize, usize)> {
    let mut direct_children = Vec::new();

    if let Some(first) = stmts.first() {
        if let Some(range) = docstring_range(first, source) {
            direct_children.push(range);
        }
    }

    for stmt in stmts {
        match stmt {
            ast::Stmt::FunctionDef(func) => {
                let (start, end) = def_range(&func.decorator_list, func.range, source);
                direct_children.push((start, end));
                let (kind, name) = func_name(&func.name, parent_class);
                emit_def_block(&func.body, source, file, blocks, kind, name, start, end);
            }
            ast::Stmt::AsyncFunctionDef(func) => {
                let (start, end) = def_range(&func.decorator_list, func.range, source);
                direct_children.push((start, end));
                let (kind, name) = func_name(&func.name, parent_class);
                emit_def_block(&func.body, source, file, blocks, kind, name, start, end);
            }
            ast::Stmt::ClassDef(class) => {
                let start = offset_to_line(source, class.range.start().into());
                let end = offset_to_line(source, class.range.end().into());
                direct_children.push((start, end));

                let nested = walk(&class.body, source, file, blocks, Some(&class.name));
                let body = normalized_body(source, start, end, indent_of(source, start), &nested);

                blocks.push(Block {
                    id: BlockId {
                        file: file.to_path_buf(),
                        kind: BlockKind::Class,
                        name: class.name.to_string(),
                        start_line: start,
                        end_line: end,
                    },
                    checksum: checksum_str(&body),
                });
            }
            _ => {}
        }
    }

    direct_children
}

#[allow(clippy::too_many_arguments)]
fn emit_def_block(
    body_stmts: &[ast::Stmt],
    source: &str,
    file: &Path,
    blocks: &mut Vec<Block>,
    kind: BlockKind,
    name: String,
    start: usize,
    end: usize,
) {
    let nested = walk(body_stmts, source, file, blocks, None);
    let normalized = normalized_body(source, start, end, indent_of(source, start), &nested);

    blocks.push(Block {
        id: BlockId {
            file: file.to_path_buf(),
            kind,
            name,
            start_line: start,
            end_line: end,
        },
        checksum: checksum_str(&normalized),
    });
}

fn func_name(name: &str, parent_class: Option<&str>) -> (BlockKind, String) {
    match parent_class {
        Some(cls) => (BlockKind::Method, format!("{cls}.{name}")),
        None => (BlockKind::Function, name.to_string()),
    }
}

fn def_range(decorators: &[ast::Expr], body_range: ast::TextRange, source: &str) -> (usize, usize) {
    let start = if let Some(first) = decorators.first() {
        offset_to_line(source, first.range().start().into())
    } else {
        offset_to_line(source, body_range.start().into())
    };
    let end = offset_to_line(source, body_range.end().into());
    (start, end)
}

/// If `stmt` is a bare string-literal expression statement (a docstring),
/// return its line range so callers can exclude it from the parent's body.
fn docstring_range(stmt: &ast::Stmt, source: &str) -> Option<(usize, usize)> {
    let ast::Stmt::Expr(expr_stmt) = stmt else {
        return None;
    };
    let ast::Expr::Constant(constant) = expr_stmt.value.as_ref() else {
        return None;
    };
    if !matches!(constant.value, ast::Constant::Str(_)) {
        return None;
    }
    Some((
        offset_to_line(source, expr_stmt.range().start().into()),
        offset_to_line(source, expr_stmt.range().end().into()),
    ))
}

fn indent_of(source: &str, line: usize) -> usize {
    source
        .lines()
        .nth(line.saturating_sub(1))
        .map(|l| l.len() - l.trim_start().len())
        .unwrap_or(0)
}

/// Build the normalized body for a block spanning `[start, end]`, excluding
/// any line that falls inside `excluded` (nested def/class bodies and
/// leading docstrings), then stripping indent, comments, and blank lines.
fn normalized_body(source: &str, start: usize, end: usize, indent: usize, excluded: &[(usize, usize)]) -> String {
    source
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let lineno = idx + 1;
            if lineno < start || lineno > end {
                return None;
            }
            if excluded.iter().any(|(s, e)| lineno >= *s && lineno <= *e) {
                return None;
            }
            Some(line)
        })
        .map(|line| {
            if line.len() >= indent {
                &line[indent..]
            } else {
                line.trim_start()
            }
        })
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum_str(body: &str) -> u32 {
    checksum_bytes(body.as_bytes())
}

fn checksum_bytes(bytes: &[u8]) -> u32 {
    xxh32(bytes, 0)
}

fn line_count(source: &str) -> usize {
    if source.is_empty() {
        1
    } else {
        source.lines().count().max(1)
    }
}

fn offset_to_line(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())]
        .chars()
        .filter(|&c| c == '\n')
        .count()
        + 1
}
