use std::collections::HashSet;

use agent_provider::RunMessage;

use crate::error::SessionStoreError;
use crate::schema::{SessionEntry, SessionEntryKind};
use crate::store::SessionStore;

impl SessionStore {
    /// Rebuilds the provider-facing message history along the parent chain
    /// ending at `target_leaf` (the current leaf when `None`).
    pub fn replay_leaf(
        &self,
        target_leaf: Option<&str>,
    ) -> Result<Vec<RunMessage>, SessionStoreError> {
        Ok(self
            .branch_entries(target_leaf)?
            .into_iter()
            .filter_map(|entry| run_message_for(&entry.kind))
            .collect())
    }

    /// Replays the current branch.
    pub fn replay(&self) -> Result<Vec<RunMessage>, SessionStoreError> {
        self.replay_leaf(None)
    }

    /// Replays the current branch from just after its newest
    /// [`SessionEntryKind::ContextCleared`] marker.
    pub fn replay_context(&self) -> Result<Vec<RunMessage>, SessionStoreError> {
        let branch = self.branch_entries(None)?;
        let start = branch
            .iter()
            .rposition(|entry| entry.kind == SessionEntryKind::ContextCleared)
            .map_or(0, |index| index + 1);
        Ok(branch[start..]
            .iter()
            .filter_map(|entry| run_message_for(&entry.kind))
            .collect())
    }

    /// Entries on the branch ending at `target_leaf`, root first.
    pub fn branch_entries(
        &self,
        target_leaf: Option<&str>,
    ) -> Result<Vec<&SessionEntry>, SessionStoreError> {
        let leaf_id = match target_leaf.or(self.current_leaf_id.as_deref()) {
            Some(leaf_id) => leaf_id,
            None => return Ok(Vec::new()),
        };

        if !self.index_by_id.contains_key(leaf_id) {
            return Err(SessionStoreError::UnknownLeafId {
                path: self.path.clone(),
                leaf_id: leaf_id.to_string(),
            });
        }

        let mut visited = HashSet::new();
        let mut branch = Vec::new();
        let mut cursor = Some(leaf_id);

        while let Some(entry_id) = cursor {
            if !visited.insert(entry_id) {
                return Err(SessionStoreError::ReplayCycle {
                    path: self.path.clone(),
                    leaf_id: leaf_id.to_string(),
                });
            }

            let Some(&index) = self.index_by_id.get(entry_id) else {
                return Err(SessionStoreError::UnknownLeafId {
                    path: self.path.clone(),
                    leaf_id: entry_id.to_string(),
                });
            };
            let entry = &self.entries[index];
            branch.push(entry);
            cursor = entry.parent_id.as_deref();
        }

        branch.reverse();
        Ok(branch)
    }
}

/// Provider-facing message for `kind`; markers have none.
fn run_message_for(kind: &SessionEntryKind) -> Option<RunMessage> {
    let message = match kind {
        SessionEntryKind::UserText { text } => RunMessage::UserText { text: text.clone() },
        SessionEntryKind::AssistantText { text } => {
            RunMessage::AssistantText { text: text.clone() }
        }
        SessionEntryKind::ToolCall {
            call_id,
            tool_name,
            arguments,
        } => RunMessage::ToolCall {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        },
        SessionEntryKind::ToolResult {
            call_id,
            tool_name,
            content,
            is_error,
        } => RunMessage::ToolResult {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            content: content.clone(),
            is_error: *is_error,
        },
        SessionEntryKind::ContextCleared => return None,
    };
    Some(message)
}

impl From<&RunMessage> for SessionEntryKind {
    fn from(message: &RunMessage) -> Self {
        match message {
            RunMessage::UserText { text } => Self::UserText { text: text.clone() },
            RunMessage::AssistantText { text } => Self::AssistantText { text: text.clone() },
            RunMessage::ToolCall {
                call_id,
                tool_name,
                arguments,
            } => Self::ToolCall {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                arguments: arguments.clone(),
            },
            RunMessage::ToolResult {
                call_id,
                tool_name,
                content,
                is_error,
            } => Self::ToolResult {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                content: content.clone(),
                is_error: *is_error,
            },
        }
    }
}
