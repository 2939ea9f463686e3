//! System instructions sent with every provider turn.

use std::path::Path;

use crate::tools::ToolKind;

pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str =
    "You are a careful coding agent. Follow user requests exactly, keep output deterministic, and fail explicitly when constraints cannot be satisfied.";

const TOOL_USE_POLICY: &str = "Tool use policy:
- Read a file before editing it; prefer edit_file over rewriting whole files.
- Paths are relative to the working directory and must stay inside the project root.
- Every mutating call is checkpointed first; the user can rewind it.
- A tool result starting with ValidationDenied was blocked by policy. Do not retry it verbatim; choose a safer approach or ask the user.
- Answer in plain text once the task is complete.";

const PLAN_MODE_NOTE: &str = "Plan mode is active: the workspace is read-only. Investigate with read-only tools and reply with a step-by-step plan instead of making changes.";

/// Trimmed override, or the default when unset or blank.
#[must_use]
pub fn base_instructions(configured: Option<&str>) -> String {
    match configured.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => DEFAULT_SYSTEM_INSTRUCTIONS.to_string(),
    }
}

/// Base block, tool-use policy, tool inventory, working directory and the
/// plan-mode note when active.
#[must_use]
pub fn compose_instructions(base: &str, cwd: &Path, read_only: bool) -> String {
    let inventory = ToolKind::ALL
        .into_iter()
        .filter(|kind| !(read_only && kind.is_mutating()))
        .map(|kind| {
            let marker = if kind.is_mutating() { " (mutating)" } else { "" };
            format!("- {}{marker}", kind.name())
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut instructions = format!(
        "{base}\n\n{TOOL_USE_POLICY}\n\nAvailable tools:\n{inventory}\n\nWorking directory: {}",
        cwd.display()
    );
    if read_only {
        instructions.push_str("\n\n");
        instructions.push_str(PLAN_MODE_NOTE);
    }
    instructions
}

/// Fill-in-the-middle prompt for editor inline completion.
#[must_use]
pub fn inline_completion_prompt(
    code_before: &str,
    code_after: &str,
    instruction: Option<&str>,
    file_path: Option<&str>,
    language: Option<&str>,
) -> String {
    let mut prompt = String::from(
        "Complete the code at <CURSOR>. Reply with only the code to insert, without markdown fences or explanation.\n",
    );
    if let Some(path) = file_path {
        prompt.push_str(&format!("File: {path}\n"));
    }
    if let Some(language) = language {
        prompt.push_str(&format!("Language: {language}\n"));
    }
    if let Some(instruction) = instruction.map(str::trim).filter(|value| !value.is_empty()) {
        prompt.push_str(&format!("Instruction: {instruction}\n"));
    }
    prompt.push_str(&format!("\n{code_before}<CURSOR>{code_after}"));
    prompt
}
