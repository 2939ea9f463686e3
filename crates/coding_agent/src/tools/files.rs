use std::fs;
use std::path::Path;

use super::{BuiltinToolExecutor, Edit, ToolOutput};

impl BuiltinToolExecutor {
    pub(super) fn read_file(
        &self,
        path: &str,
        line_start: Option<usize>,
        line_end: Option<usize>,
        cwd: &Path,
    ) -> ToolOutput {
        let resolved = match self.resolve(path, cwd) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };

        let bytes = match fs::read(&resolved) {
            Ok(bytes) => bytes,
            Err(error) => {
                return ToolOutput::fail(format!(
                    "Failed to read file {}: {error}",
                    self.relative_display(&resolved)
                ));
            }
        };

        let ranged = line_start.is_some() || line_end.is_some();
        if !ranged && bytes.len() > self.limits.read_max_bytes {
            return ToolOutput::fail(format!(
                "File exceeds max read size ({} bytes > {} bytes); read a line range instead",
                bytes.len(),
                self.limits.read_max_bytes
            ));
        }

        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => return ToolOutput::fail("File is not valid UTF-8 text".to_string()),
        };
        if !ranged {
            return ToolOutput::ok(content);
        }

        let lines = content.split_inclusive('\n').collect::<Vec<_>>();
        let start = line_start.unwrap_or(1).max(1);
        let end = line_end.unwrap_or(lines.len()).min(lines.len());
        if start > lines.len() {
            return ToolOutput::fail(format!(
                "line_start {start} is past the end of the file ({} lines)",
                lines.len()
            ));
        }
        if end < start {
            return ToolOutput::fail(format!("line_end {end} is before line_start {start}"));
        }
        let selected = lines[start - 1..end].concat();
        if selected.len() > self.limits.read_max_bytes {
            return ToolOutput::fail(format!(
                "Selected lines exceed max read size ({} bytes > {} bytes)",
                selected.len(),
                self.limits.read_max_bytes
            ));
        }
        ToolOutput::ok(selected)
    }

    pub(super) fn write_file(&self, path: &str, content: &str, cwd: &Path) -> ToolOutput {
        let resolved = match self.resolve(path, cwd) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };
        if resolved.is_dir() {
            return ToolOutput::fail(format!(
                "{} is a directory",
                self.relative_display(&resolved)
            ));
        }

        if let Some(parent) = resolved.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                return ToolOutput::fail(format!(
                    "Failed to create parent directories {}: {error}",
                    parent.display()
                ));
            }
        }

        if let Err(error) = fs::write(&resolved, content) {
            return ToolOutput::fail(format!(
                "Failed to write file {}: {error}",
                self.relative_display(&resolved)
            ));
        }

        ToolOutput::ok(format!(
            "Wrote {} bytes to {}",
            content.len(),
            self.relative_display(&resolved)
        ))
        .touching(resolved)
    }

    pub(super) fn edit_file(&self, path: &str, edits: &[Edit], cwd: &Path) -> ToolOutput {
        let resolved = match self.resolve(path, cwd) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };

        let mut content = match fs::read_to_string(&resolved) {
            Ok(content) => content,
            Err(error) => {
                return ToolOutput::fail(format!(
                    "Failed to read file {}: {error}",
                    self.relative_display(&resolved)
                ));
            }
        };

        for (index, edit) in edits.iter().enumerate() {
            content = match apply_edit(&content, edit) {
                Ok(updated) => updated,
                Err(error) => {
                    return ToolOutput::fail(format!(
                        "edit {} failed, file left unchanged: {error}",
                        index + 1
                    ));
                }
            };
        }

        if let Err(error) = fs::write(&resolved, content) {
            return ToolOutput::fail(format!(
                "Failed to write file {}: {error}",
                self.relative_display(&resolved)
            ));
        }

        ToolOutput::ok(format!(
            "Applied {} edit(s) to {}",
            edits.len(),
            self.relative_display(&resolved)
        ))
        .touching(resolved)
    }
}

fn apply_edit(content: &str, edit: &Edit) -> Result<String, String> {
    match edit {
        Edit::Replace {
            old_text,
            new_text,
            replace_all,
        } => {
            let occurrences = content.match_indices(old_text.as_str()).count();
            match (occurrences, replace_all) {
                (0, _) => Err("old_text not found".to_string()),
                (_, true) => Ok(content.replace(old_text.as_str(), new_text)),
                (1, false) => Ok(content.replacen(old_text.as_str(), new_text, 1)),
                (count, false) => Err(format!(
                    "old_text matches {count} times; add context or set replace_all"
                )),
            }
        }
        Edit::Lines {
            line_start,
            line_end,
            new_text,
        } => {
            let lines = content.split_inclusive('\n').collect::<Vec<_>>();
            if *line_start == 0 || line_end < line_start {
                return Err(format!("invalid line range {line_start}..={line_end}"));
            }
            if *line_end > lines.len() {
                return Err(format!(
                    "line range {line_start}..={line_end} exceeds file length ({} lines)",
                    lines.len()
                ));
            }

            let mut replacement = new_text.clone();
            let replaced_had_newline = lines[line_end - 1].ends_with('\n');
            if !replacement.is_empty() && replaced_had_newline && !replacement.ends_with('\n') {
                replacement.push('\n');
            }

            let mut updated = lines[..line_start - 1].concat();
            updated.push_str(&replacement);
            updated.push_str(&lines[*line_end..].concat());
            Ok(updated)
        }
    }
}
