use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Validator decision as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Allow,
    AllowWithWarning,
    Deny,
    /// The call never reached the validator (unknown tool, unparsable args).
    NotEvaluated,
}

impl VerdictKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowWithWarning => "allow_with_warning",
            Self::Deny => "deny",
            Self::NotEvaluated => "not_evaluated",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerdictKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "allow" => Ok(Self::Allow),
            "allow_with_warning" | "warn" | "warning" => Ok(Self::AllowWithWarning),
            "deny" | "denied" => Ok(Self::Deny),
            "not_evaluated" => Ok(Self::NotEvaluated),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    ExecutedOk,
    ExecutedFailed,
    NotExecuted,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutedOk => "executed_ok",
            Self::ExecutedFailed => "executed_failed",
            Self::NotExecuted => "not_executed",
        }
    }
}

/// What the caller knows about one tool-call resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub verdict: VerdictKind,
    pub reason: Option<String>,
    pub outcome: Outcome,
    pub checkpoint_id: Option<String>,
    pub summary: Option<String>,
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        verdict: VerdictKind,
        outcome: Outcome,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            verdict,
            reason: None,
            outcome,
            checkpoint_id: None,
            summary: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint_id: Option<String>) -> Self {
        self.checkpoint_id = checkpoint_id;
        self
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// One persisted JSONL line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts: String,
    pub session_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub verdict: VerdictKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
