//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No blocking sleeps, and async sleeps only for reconnect backoff
//! - No panicking shortcuts (`unwrap`, `expect`) in production code
//! - No process-wide mutable state
//!
//! The helpers here walk the production sources of the workspace crates.
//! Everything from a file's first `#[cfg(test)]` onwards is test code and is
//! not scanned.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["envivo/core/src", "envivo/cli/src"];

/// A line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Full line text
    pub text: String,
}

impl SourceLine {
    /// The line with any trailing `//` comment removed
    #[must_use]
    pub fn code(&self) -> &str {
        self.text.split("//").next().unwrap_or(&self.text)
    }

    /// `path:line - text`, for violation reports
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{}:{} - {}",
            self.path.display(),
            self.number,
            self.text.trim()
        )
    }
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Production lines of every `.rs` file under [`PRODUCTION_DIRS`]
#[must_use]
pub fn production_lines() -> Vec<SourceLine> {
    let root = workspace_root();
    let mut lines = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                lines.extend(production_lines_of(entry.path()));
            }
        }
    }

    lines
}

/// Production lines of a single file
#[must_use]
pub fn production_lines_of(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    split_production(path, &content)
}

/// Lines before the first `#[cfg(test)]`, doc comments excluded
#[must_use]
pub fn split_production(path: &Path, content: &str) -> Vec<SourceLine> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("///") || trimmed.starts_with("//!"))
        })
        .map(|(idx, line)| SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            text: line.to_string(),
        })
        .collect()
}

/// Whether any of the lines within `before` lines above `line` (same file)
/// mention one of `words`, case-insensitively
#[must_use]
pub fn has_context(lines: &[SourceLine], line: &SourceLine, before: usize, words: &[&str]) -> bool {
    let first = line.number.saturating_sub(before);
    lines
        .iter()
        .filter(|l| l.path == line.path && l.number >= first && l.number <= line.number)
        .any(|l| {
            let lower = l.text.to_lowercase();
            words.iter().any(|w| lower.contains(w))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_module_is_excluded() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = split_production(Path::new("a.rs"), content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "fn a() {}");
    }

    #[test]
    fn test_doc_comments_are_excluded() {
        let content = "/// let x = y.unwrap();\nfn a() {}\n";
        let lines = split_production(Path::new("a.rs"), content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 2);
    }

    #[test]
    fn test_trailing_comment_is_not_code() {
        let line = SourceLine {
            path: PathBuf::from("a.rs"),
            number: 1,
            text: "let a = 1; // b.unwrap()".to_string(),
        };
        assert!(!line.code().contains("unwrap"));
    }

    #[test]
    fn test_workspace_root_holds_sources() {
        assert!(workspace_root().join("envivo/core/src/lib.rs").exists());
    }
}
