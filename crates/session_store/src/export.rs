use std::fmt::Write as _;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::error::SessionStoreError;
use crate::schema::SessionEntryKind;
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
    Text,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
            Self::Text => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = SessionStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            "text" | "txt" => Ok(Self::Text),
            other => Err(SessionStoreError::UnsupportedExportFormat {
                format: other.to_string(),
            }),
        }
    }
}

impl SessionStore {
    /// Renders the current branch of this session in `format`.
    pub fn export(&self, format: ExportFormat) -> Result<String, SessionStoreError> {
        let entries = self.branch_entries(None)?;
        let header = &self.header;

        let rendered = match format {
            ExportFormat::Json => {
                let messages = entries
                    .iter()
                    .map(|entry| {
                        let mut value = serde_json::to_value(&entry.kind).map_err(|source| {
                            SessionStoreError::json_serialize(&self.path, source)
                        })?;
                        if let Value::Object(map) = &mut value {
                            map.insert("ts".to_string(), Value::String(entry.ts.clone()));
                            if let Some(role) = entry.kind.role() {
                                map.insert("role".to_string(), Value::String(role.into()));
                            }
                        }
                        Ok(value)
                    })
                    .collect::<Result<Vec<_>, SessionStoreError>>()?;
                let document = json!({
                    "session_id": header.session_id,
                    "created_at": header.created_at,
                    "cwd": header.cwd,
                    "messages": messages,
                });
                serde_json::to_string_pretty(&document)
                    .map_err(|source| SessionStoreError::json_serialize(&self.path, source))?
            }
            ExportFormat::Markdown => {
                let mut out = format!(
                    "# Session {}\n\n- created: {}\n- cwd: `{}`\n",
                    header.session_id, header.created_at, header.cwd
                );
                for entry in entries {
                    let Some(role) = entry.kind.role() else {
                        let _ = write!(out, "\n---\n\n_Context cleared ({})_\n", entry.ts);
                        continue;
                    };
                    let _ = write!(out, "\n## {role} ({})\n\n", entry.ts);
                    match &entry.kind {
                        SessionEntryKind::UserText { text }
                        | SessionEntryKind::AssistantText { text } => {
                            out.push_str(text);
                            out.push('\n');
                        }
                        SessionEntryKind::ToolCall {
                            tool_name,
                            arguments,
                            ..
                        } => {
                            let _ = write!(
                                out,
                                "Tool call `{tool_name}`\n\n```json\n{arguments}\n```\n"
                            );
                        }
                        SessionEntryKind::ToolResult {
                            tool_name,
                            content,
                            is_error,
                            ..
                        } => {
                            let status = if *is_error { "failed" } else { "ok" };
                            let _ = write!(
                                out,
                                "Tool result `{tool_name}` ({status})\n\n```\n{}\n```\n",
                                content_text(content)
                            );
                        }
                        SessionEntryKind::ContextCleared => {}
                    }
                }
                out
            }
            ExportFormat::Text => {
                let mut out = format!("Session {} ({})\n", header.session_id, header.created_at);
                for entry in entries {
                    let Some(role) = entry.kind.role() else {
                        let _ = write!(out, "\n[{}] context cleared\n", entry.ts);
                        continue;
                    };
                    let body = match &entry.kind {
                        SessionEntryKind::UserText { text }
                        | SessionEntryKind::AssistantText { text } => text.clone(),
                        SessionEntryKind::ToolCall {
                            tool_name,
                            arguments,
                            ..
                        } => format!("{tool_name} {arguments}"),
                        SessionEntryKind::ToolResult { content, .. } => content_text(content),
                        SessionEntryKind::ContextCleared => String::new(),
                    };
                    let _ = write!(out, "\n[{}] {role}:\n{body}\n", entry.ts);
                }
                out
            }
        };

        Ok(rendered)
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("output") {
            Some(Value::String(output)) => output.clone(),
            _ => content.to_string(),
        },
        other => other.to_string(),
    }
}
