use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::LoopError;

/// File names probed, in order, when no explicit tasks file is given.
pub const WELL_KNOWN_NAMES: [&str; 5] = ["TASKS.md", "tasks.md", "TODO.md", "todo.md", "PLAN.md"];

static UNCHECKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s*\[ \]").expect("static regex"));
static CHECKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]\s*\[[xX]\]").expect("static regex"));

/// Resolve the tasks file: the explicit path if given, else the first
/// well-known name in `cwd`. Always returns an absolute path.
pub fn find_tasks_file(explicit: Option<&Path>, cwd: &Path) -> Result<PathBuf, LoopError> {
    let candidate = match explicit {
        Some(path) => {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            }
        }
        None => WELL_KNOWN_NAMES
            .iter()
            .map(|name| cwd.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                LoopError::Config(format!(
                    "no tasks file found in {} (looked for {})",
                    cwd.display(),
                    WELL_KNOWN_NAMES.join(", ")
                ))
            })?,
    };
    if !candidate.is_file() {
        return Err(LoopError::Config(format!(
            "tasks file {} does not exist",
            candidate.display()
        )));
    }
    Ok(candidate)
}

/// SHA-256 of the file content, lowercase hex. Deterministic across runs;
/// this is the resume-guard hash stored in the session.
pub fn hash_file(path: &Path) -> Result<String, LoopError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn count_unchecked(content: &str) -> usize {
    UNCHECKED.find_iter(content).count()
}

pub fn count_checked(content: &str) -> usize {
    CHECKED.find_iter(content).count()
}

/// Re-read the tasks file and count unchecked items. The impl subprocess
/// edits this file between reads, so the count is always taken fresh.
pub fn unchecked_in_file(path: &Path) -> Result<usize, LoopError> {
    Ok(count_unchecked(&std::fs::read_to_string(path)?))
}

/// Basic compliance lint. Warnings only; the loop proceeds regardless.
pub fn lint(content: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if count_unchecked(content) == 0 && count_checked(content) == 0 {
        warnings.push("no markdown checkboxes found; nothing to drive".to_string());
    }
    if content.contains('\r') {
        warnings.push("CRLF line endings found; checkbox matching expects LF".to_string());
    }
    if content.lines().any(|l| l.starts_with("\t-") || l.starts_with("\t*")) {
        warnings.push("tab-indented checkboxes found; use spaces".to_string());
    }
    warnings
}

/// Extract the `## Learnings` section from an implementation run's output:
/// the lines between the header and the next `##` header, blanks skipped,
/// internal whitespace preserved.
pub fn extract_learnings(output: &str) -> Option<String> {
    let mut lines = output.lines();
    lines.by_ref().find(|line| {
        let t = line.trim();
        t.strip_prefix("##")
            .is_some_and(|rest| rest.trim().eq_ignore_ascii_case("learnings"))
    })?;

    let mut collected = Vec::new();
    for line in lines {
        if line.trim_start().starts_with("##") {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        collected.push(line);
    }
    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}

/// Append a learnings block tagged with the iteration that produced it.
/// Creates the file with a header when missing.
pub fn append_learnings(path: &Path, iteration: u32, text: &str) -> Result<(), LoopError> {
    init_learnings_file(path)?;
    let mut content = std::fs::read_to_string(path)?;
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("\n## Iteration {iteration}\n\n{text}\n"));
    std::fs::write(path, content)?;
    Ok(())
}

/// Create the learnings file with its header if it does not exist yet.
pub fn init_learnings_file(path: &Path) -> Result<(), LoopError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, "# Learnings\n\nAccumulated notes from implementation runs.\n")?;
    Ok(())
}
