//! Architectural Enforcement Integration Tests
//!
//! Source-level checks for the bridge crates:
//! - No sleeping in production code, apart from the direct-write retry
//! - OS threads only in the spooler
//! - `connection_lost` only ever delivered from a deferred callback
//!
//! Helpers here walk the production sources; the rules live in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["bridge/core/src", "bridge/daemon/src"];

/// One production source file, with its `#[cfg(test)]` tail removed.
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Code part of line `idx`, without any trailing `//` comment.
    pub fn code(&self, idx: usize) -> &str {
        let line = self.lines[idx].as_str();
        line.split("//").next().unwrap_or(line)
    }

    /// Path relative to the workspace root, for reports.
    pub fn display(&self) -> String {
        self.path
            .strip_prefix(workspace_root())
            .unwrap_or(&self.path)
            .display()
            .to_string()
    }

    pub fn ends_with(&self, name: &str) -> bool {
        self.path.ends_with(name)
    }
}

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Every `.rs` file under the production trees.
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        for entry in walkdir::WalkDir::new(root.join(dir))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            files.push(SourceFile {
                path: entry.path().to_path_buf(),
                lines: strip_test_module(&content),
            });
        }
    }
    files
}

/// Lines before the first `#[cfg(test)]`. Test modules sit at the end of
/// each file.
pub fn strip_test_module(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .map(str::to_string)
        .collect()
}

/// Report violations and fail.
pub fn fail_on(rule: &str, violations: &[String]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s): {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_test_module() {
        let lines = strip_test_module("fn a() {}\n\n#[cfg(test)]\nmod tests {\n}\n");
        assert_eq!(lines, vec!["fn a() {}", ""]);
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "{dir} not found under {root:?}");
        }
        assert!(!production_sources().is_empty());
    }
}
