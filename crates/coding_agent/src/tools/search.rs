use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use regex::Regex;

use super::{BuiltinToolExecutor, ToolOutput};

const BINARY_SNIFF_BYTES: usize = 8 * 1024;
const MAX_MATCH_LINE_CHARS: usize = 300;

impl BuiltinToolExecutor {
    pub(super) fn glob_files(&self, pattern: &str) -> ToolOutput {
        let glob_pattern = match Pattern::new(pattern.trim_start_matches("./")) {
            Ok(pattern) => pattern,
            Err(error) => return ToolOutput::fail(format!("Invalid glob pattern: {error}")),
        };
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let limit = self.limits.max_results;
        let mut matches = Vec::new();
        let mut truncated = false;
        for entry in walk(&self.workspace_root).flatten() {
            if entry.file_type().is_some_and(|kind| kind.is_dir()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.workspace_root) else {
                continue;
            };
            if glob_pattern.matches_path_with(relative, options) {
                if matches.len() >= limit {
                    truncated = true;
                    break;
                }
                matches.push(relative.to_path_buf());
            }
        }

        matches.sort();
        if matches.is_empty() {
            return ToolOutput::ok(format!("No files match {pattern}"));
        }
        let mut content = join_paths(&matches);
        if truncated {
            content.push_str(&format!("\n[truncated at {limit} results]"));
        }
        ToolOutput::ok(content)
    }

    pub(super) fn grep_files(&self, pattern: &str, path_scope: Option<&str>, cwd: &Path) -> ToolOutput {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(error) => return ToolOutput::fail(format!("Invalid regex: {error}")),
        };
        let scope = match path_scope {
            Some(scope) => match self.resolve(scope, cwd) {
                Ok(path) => path,
                Err(error) => return ToolOutput::fail(error),
            },
            None => self.workspace_root.clone(),
        };
        if !scope.exists() {
            return ToolOutput::fail(format!(
                "Search scope {} does not exist",
                self.relative_display(&scope)
            ));
        }

        let limit = self.limits.max_results;
        let mut files = walk(&scope)
            .flatten()
            .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
            .map(ignore::DirEntry::into_path)
            .collect::<Vec<_>>();
        files.sort();

        let mut lines = Vec::new();
        let mut truncated = false;
        'files: for file in files {
            let Some(text) = read_text(&file) else {
                continue;
            };
            for (index, line) in text.lines().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                if lines.len() >= limit {
                    truncated = true;
                    break 'files;
                }
                lines.push(format!(
                    "{}:{}: {}",
                    self.relative_display(&file),
                    index + 1,
                    clip_line(line)
                ));
            }
        }

        if lines.is_empty() {
            return ToolOutput::ok(format!("No matches for {pattern}"));
        }
        let mut content = lines.join("\n");
        if truncated {
            content.push_str(&format!("\n[truncated at {limit} results]"));
        }
        ToolOutput::ok(content)
    }
}

fn walk(root: &Path) -> ignore::Walk {
    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build()
}

/// UTF-8 content of `path`, or `None` for binary and unreadable files.
fn read_text(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn clip_line(line: &str) -> String {
    if line.chars().count() <= MAX_MATCH_LINE_CHARS {
        return line.to_string();
    }
    let mut clipped = line.chars().take(MAX_MATCH_LINE_CHARS).collect::<String>();
    clipped.push_str("...");
    clipped
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
