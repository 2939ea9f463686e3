use std::fs;
use std::path::Path;

use similar::TextDiff;

const CONTEXT_LINES: usize = 3;

/// Unified diff of two files. Identical files produce an empty string.
pub fn diff_files(left: &Path, right: &Path) -> Result<String, String> {
    let read = |path: &Path| {
        fs::read_to_string(path).map_err(|error| format!("cannot read {}: {error}", path.display()))
    };
    let old_text = read(left)?;
    let new_text = read(right)?;
    Ok(unified_diff(
        &left.display().to_string(),
        &right.display().to_string(),
        &old_text,
        &new_text,
    ))
}

#[must_use]
pub fn unified_diff(left_name: &str, right_name: &str, old_text: &str, new_text: &str) -> String {
    if old_text == new_text {
        return String::new();
    }
    TextDiff::from_lines(old_text, new_text)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(left_name, right_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::unified_diff;

    #[test]
    fn changed_lines_are_marked() {
        let diff = unified_diff("a.txt", "b.txt", "one\ntwo\n", "one\nthree\n");
        assert!(diff.starts_with("--- a.txt\n+++ b.txt\n"), "{diff}");
        assert!(diff.contains("-two\n"));
        assert!(diff.contains("+three\n"));
    }

    #[test]
    fn identical_inputs_have_no_diff() {
        assert_eq!(unified_diff("a", "b", "same\n", "same\n"), "");
    }
}
