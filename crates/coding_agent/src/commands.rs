#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Quit,
    Clear,
    History { limit: Option<usize> },
    Sessions,
    DeleteSession { id: String },
    NewSession,
    Resume { id: String },
    Checkpoints,
    Checkpoint { label: Option<String> },
    Rewind { target: String },
    Diff { left: String, right: String },
    Provider,
    Switch { provider: String, model: Option<String> },
    Config,
    Verbose,
    PlanMode,
    Export { format: Option<String> },
    /// Recognized command with unusable arguments; carries the usage line.
    Usage(&'static str),
    Unknown(String),
}

pub const HELP_TEXT: &str = "Commands:
  /help                        show this help
  /quit, /exit                 leave the session
  /clear                       start a fresh provider context (transcript is kept)
  /history [N]                 show the last N messages (default 20)
  /sessions                    list stored sessions
  /sessions delete <id>        delete a session with its checkpoints and audit log
  /new-session                 start a new session
  /resume <id>                 switch to a stored session
  /checkpoints                 list checkpoints, newest first
  /checkpoint [label]          snapshot the project tree
  /rewind [id|last]            restore a checkpoint (default: last)
  /diff <file1> <file2>        unified diff of two files
  /provider                    show the active provider and model
  /switch <provider> [model]   change provider
  /config                      print the effective configuration
  /verbose                     toggle tool progress output
  /plan-mode                   toggle read-only plan mode
  /export [json|markdown|text] write the transcript to the data directory";

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut words = trimmed.split_whitespace();
    let command = words.next().unwrap_or(trimmed).to_string();
    let args = words.collect::<Vec<_>>();
    let rest = trimmed[command.len()..].trim();

    let parsed = match (command.as_str(), args.as_slice()) {
        ("/help", _) => SlashCommand::Help,
        ("/quit" | "/exit", _) => SlashCommand::Quit,
        ("/clear", _) => SlashCommand::Clear,
        ("/history", []) => SlashCommand::History { limit: None },
        ("/history", [count]) => match count.parse::<usize>() {
            Ok(limit) if limit > 0 => SlashCommand::History { limit: Some(limit) },
            _ => SlashCommand::Usage("/history [N]"),
        },
        ("/history", _) => SlashCommand::Usage("/history [N]"),
        ("/sessions", []) => SlashCommand::Sessions,
        ("/sessions", ["delete", id]) => SlashCommand::DeleteSession { id: (*id).to_string() },
        ("/sessions", _) => SlashCommand::Usage("/sessions [delete <id>]"),
        ("/new-session", _) => SlashCommand::NewSession,
        ("/resume", [id]) => SlashCommand::Resume { id: (*id).to_string() },
        ("/resume", _) => SlashCommand::Usage("/resume <id>"),
        ("/checkpoints", _) => SlashCommand::Checkpoints,
        ("/checkpoint", []) => SlashCommand::Checkpoint { label: None },
        ("/checkpoint", _) => SlashCommand::Checkpoint {
            label: Some(rest.to_string()),
        },
        ("/rewind", []) => SlashCommand::Rewind {
            target: "last".to_string(),
        },
        ("/rewind", [target]) => SlashCommand::Rewind {
            target: (*target).to_string(),
        },
        ("/rewind", _) => SlashCommand::Usage("/rewind [id|last]"),
        ("/diff", [left, right]) => SlashCommand::Diff {
            left: (*left).to_string(),
            right: (*right).to_string(),
        },
        ("/diff", _) => SlashCommand::Usage("/diff <file1> <file2>"),
        ("/provider", _) => SlashCommand::Provider,
        ("/switch", [provider]) => SlashCommand::Switch {
            provider: (*provider).to_string(),
            model: None,
        },
        ("/switch", [provider, model]) => SlashCommand::Switch {
            provider: (*provider).to_string(),
            model: Some((*model).to_string()),
        },
        ("/switch", _) => SlashCommand::Usage("/switch <provider> [model]"),
        ("/config", _) => SlashCommand::Config,
        ("/verbose", _) => SlashCommand::Verbose,
        ("/plan-mode" | "/plan", _) => SlashCommand::PlanMode,
        ("/export", []) => SlashCommand::Export { format: None },
        ("/export", [format]) => SlashCommand::Export {
            format: Some((*format).to_string()),
        },
        ("/export", _) => SlashCommand::Usage("/export [json|markdown|text]"),
        _ => SlashCommand::Unknown(command),
    };

    Some(parsed)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{parse_slash_command, SlashCommand};

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_slash_command("fix the build"), None);
        assert_eq!(parse_slash_command("  "), None);
    }

    #[test]
    fn commands_with_arguments_parse() {
        assert_eq!(
            parse_slash_command("/history 5"),
            Some(SlashCommand::History { limit: Some(5) })
        );
        assert_eq!(
            parse_slash_command(" /rewind "),
            Some(SlashCommand::Rewind {
                target: "last".to_string()
            })
        );
        assert_eq!(
            parse_slash_command("/rewind cp-000002"),
            Some(SlashCommand::Rewind {
                target: "cp-000002".to_string()
            })
        );
        assert_eq!(
            parse_slash_command("/checkpoint before refactor"),
            Some(SlashCommand::Checkpoint {
                label: Some("before refactor".to_string())
            })
        );
        assert_eq!(
            parse_slash_command("/switch anthropic claude-test"),
            Some(SlashCommand::Switch {
                provider: "anthropic".to_string(),
                model: Some("claude-test".to_string()),
            })
        );
        assert_eq!(
            parse_slash_command("/sessions delete 0190abcd"),
            Some(SlashCommand::DeleteSession {
                id: "0190abcd".to_string()
            })
        );
        assert_eq!(parse_slash_command("/exit"), Some(SlashCommand::Quit));
    }

    #[test]
    fn bad_arguments_yield_usage() {
        assert_eq!(
            parse_slash_command("/history many"),
            Some(SlashCommand::Usage("/history [N]"))
        );
        assert_eq!(
            parse_slash_command("/diff only-one"),
            Some(SlashCommand::Usage("/diff <file1> <file2>"))
        );
        assert_eq!(
            parse_slash_command("/resume"),
            Some(SlashCommand::Usage("/resume <id>"))
        );
    }

    #[test]
    fn unknown_commands_keep_their_name() {
        assert_eq!(
            parse_slash_command("/frobnicate now"),
            Some(SlashCommand::Unknown("/frobnicate".to_string()))
        );
    }
}
