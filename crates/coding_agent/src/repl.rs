//! Interactive line-oriented front end.
//!
//! [`Repl::handle_line`] does all the work and writes to any [`Write`], so the
//! command surface is exercised in tests without a terminal. [`Repl::run`]
//! only adds the line editor around it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_provider::RunMessage;
use anyhow::Context as _;
use checkpoint_store::{CheckpointOrigin, CheckpointSummary, RestoreOutcome, RestoreReport};
use rustyline::error::ReadlineError;
use rustyline::{Config, DefaultEditor};
use session_store::{ExportFormat, SessionListing};
use tracing::{debug, warn};

use crate::agent::AgentEvent;
use crate::commands::{parse_slash_command, SlashCommand, HELP_TEXT};
use crate::config::AppConfig;
use crate::diff::diff_files;
use crate::providers::provider_for;
use crate::runtime::RuntimeController;
use crate::session::{Session, SessionSelector};

const PROMPT: &str = "> ";
const HISTORY_FILE_NAME: &str = "repl_history.txt";
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Continue,
    Exit,
}

pub struct Repl {
    runtime: RuntimeController,
    config: AppConfig,
    verbose: bool,
    interrupted: Arc<AtomicBool>,
    trap_interrupts: bool,
}

impl Repl {
    pub fn new(session: Session, config: AppConfig) -> Self {
        Self {
            runtime: RuntimeController::new(session),
            config,
            verbose: false,
            interrupted: Arc::new(AtomicBool::new(false)),
            trap_interrupts: false,
        }
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeController {
        &self.runtime
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Handles one input line: a slash command or a chat turn.
    pub fn handle_line(&mut self, line: &str, out: &mut dyn Write) -> io::Result<LineOutcome> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(LineOutcome::Continue);
        }

        let Some(command) = parse_slash_command(line) else {
            self.run_turn(line, out)?;
            return Ok(LineOutcome::Continue);
        };

        if command == SlashCommand::Quit {
            return Ok(LineOutcome::Exit);
        }
        match self.execute(command) {
            Ok(text) => {
                if !text.is_empty() {
                    writeln!(out, "{text}")?;
                }
            }
            Err(error) => writeln!(out, "error: {error:#}")?,
        }
        Ok(LineOutcome::Continue)
    }

    /// Reads lines until `/quit` or end of input.
    pub fn run(mut self) -> Result<(), ReadlineError> {
        let config = Config::builder().auto_add_history(false).build();
        let mut editor = DefaultEditor::with_config(config)?;
        let history_path = self.history_path();
        if let Err(error) = editor.load_history(&history_path) {
            debug!(%error, path = %history_path.display(), "no REPL history loaded");
        }

        self.trap_interrupts = true;
        let mut stdout = io::stdout();
        {
            let session = self.runtime.session();
            let profile = session.provider_profile();
            writeln!(
                stdout,
                "session {} · {} ({}) · /help for commands",
                session.session_id(),
                profile.provider_id,
                profile.model_id
            )?;
        }

        loop {
            match editor.readline(PROMPT) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        let _ = editor.add_history_entry(trimmed);
                    }
                    if self.handle_line(trimmed, &mut stdout)? == LineOutcome::Exit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    writeln!(stdout, "(press Ctrl-D or type /quit to exit)")?;
                }
                Err(ReadlineError::Eof) => break,
                Err(error) => return Err(error),
            }
        }

        if let Err(error) = editor.save_history(&history_path) {
            warn!(%error, path = %history_path.display(), "failed to save REPL history");
        }
        Ok(())
    }

    fn history_path(&self) -> PathBuf {
        self.runtime.session().data_dir().join(HISTORY_FILE_NAME)
    }

    fn run_turn(&mut self, input: &str, out: &mut dyn Write) -> io::Result<()> {
        let handle = match self.runtime.start_turn(input) {
            Ok(handle) => handle,
            Err(error) => {
                writeln!(out, "error: {error}")?;
                return Ok(());
            }
        };

        let interrupt_hook = if self.trap_interrupts {
            self.interrupted.store(false, Ordering::SeqCst);
            match signal_hook::flag::register(
                signal_hook::consts::SIGINT,
                Arc::clone(&self.interrupted),
            ) {
                Ok(id) => Some(id),
                Err(error) => {
                    warn!(%error, "Ctrl-C will not cancel this turn");
                    None
                }
            }
        } else {
            None
        };

        let verbose = self.verbose;
        let interrupted = Arc::clone(&self.interrupted);
        let mut streamed = false;
        let mut write_error = None;
        let result = handle.wait_with(
            |event| {
                if write_error.is_some() {
                    return;
                }
                if let Err(error) = render_event(&event, verbose, &mut streamed, &mut *out) {
                    write_error = Some(error);
                }
            },
            || interrupted.swap(false, Ordering::SeqCst),
        );
        if let Some(id) = interrupt_hook {
            signal_hook::low_level::unregister(id);
        }
        if let Some(error) = write_error {
            return Err(error);
        }

        match result {
            Ok(answer) => {
                if streamed {
                    writeln!(out)?;
                } else {
                    writeln!(out, "{answer}")?;
                }
            }
            Err(error) => {
                if streamed {
                    writeln!(out)?;
                }
                writeln!(out, "error: {error}")?;
            }
        }
        Ok(())
    }

    fn execute(&mut self, command: SlashCommand) -> anyhow::Result<String> {
        match command {
            SlashCommand::Help => Ok(HELP_TEXT.to_string()),
            SlashCommand::Quit => Ok(String::new()),
            SlashCommand::Usage(usage) => Ok(format!("usage: {usage}")),
            SlashCommand::Unknown(name) => Ok(format!("Unknown command {name}. Try /help.")),
            SlashCommand::Clear => {
                self.runtime.session().clear_context()?;
                Ok("Context cleared. The transcript on disk is kept.".to_string())
            }
            SlashCommand::History { limit } => {
                let history = self.runtime.session().history()?;
                Ok(format_history(
                    &history,
                    limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
                ))
            }
            SlashCommand::Sessions => {
                let session = self.runtime.session();
                let listings = session.list_sessions()?;
                Ok(format_sessions(&listings, session.session_id()))
            }
            SlashCommand::DeleteSession { id } => {
                let deleted = self.runtime.session().delete_session(&id)?;
                Ok(format!("Deleted session {deleted}."))
            }
            SlashCommand::NewSession => {
                let mut session = self.runtime.session();
                session.switch_to(SessionSelector::New)?;
                Ok(format!("Started session {}.", session.session_id()))
            }
            SlashCommand::Resume { id } => {
                let mut session = self.runtime.session();
                session.switch_to(SessionSelector::Resume(id))?;
                let summary = session.summary();
                Ok(format!(
                    "Resumed session {} ({} entries).",
                    summary.session_id, summary.message_count
                ))
            }
            SlashCommand::Checkpoints => {
                let checkpoints = self.runtime.session().list_checkpoints()?;
                Ok(format_checkpoints(&checkpoints))
            }
            SlashCommand::Checkpoint { label } => {
                let checkpoint = self
                    .runtime
                    .session()
                    .checkpoint_workspace(label.as_deref(), CheckpointOrigin::Manual)?;
                Ok(format!(
                    "Created checkpoint {} ({} files).",
                    checkpoint.id,
                    checkpoint.entries.len()
                ))
            }
            SlashCommand::Rewind { target } => {
                let report = self.runtime.session().rewind(&target)?;
                Ok(format_restore_report(&report))
            }
            SlashCommand::Diff { left, right } => {
                let root = self.runtime.session().project_root().to_path_buf();
                let diff = diff_files(
                    &resolve_user_path(&root, &left),
                    &resolve_user_path(&root, &right),
                )
                .map_err(anyhow::Error::msg)?;
                if diff.is_empty() {
                    Ok("Files are identical.".to_string())
                } else {
                    Ok(diff.trim_end().to_string())
                }
            }
            SlashCommand::Provider => {
                let session = self.runtime.session();
                let profile = session.provider_profile();
                Ok(format!(
                    "provider: {}\nmodel: {}\nplan mode: {}",
                    profile.provider_id,
                    profile.model_id,
                    on_off(session.plan_mode())
                ))
            }
            SlashCommand::Switch { provider, model } => {
                let next = provider_for(&provider, model.as_deref(), &self.config.provider)?;
                let profile = next.profile();
                self.runtime.session().set_provider(next);
                self.config.provider.id = provider;
                if model.is_some() {
                    self.config.provider.model = model;
                }
                Ok(format!(
                    "Switched to {} ({}).",
                    profile.provider_id, profile.model_id
                ))
            }
            SlashCommand::Config => Ok(self.config.to_toml()?.trim_end().to_string()),
            SlashCommand::Verbose => {
                self.verbose = !self.verbose;
                Ok(format!("Verbose output {}.", on_off(self.verbose)))
            }
            SlashCommand::PlanMode => {
                let mut session = self.runtime.session();
                let enabled = !session.plan_mode();
                session.set_plan_mode(enabled);
                if enabled {
                    Ok("Plan mode on: mutating tools are hidden and refused.".to_string())
                } else {
                    Ok("Plan mode off.".to_string())
                }
            }
            SlashCommand::Export { format } => {
                let format = match format.as_deref() {
                    Some(raw) => raw.parse::<ExportFormat>()?,
                    None => ExportFormat::Markdown,
                };
                let path = self.export(format)?;
                Ok(format!("Exported transcript to {}.", path.display()))
            }
        }
    }

    fn export(&self, format: ExportFormat) -> anyhow::Result<PathBuf> {
        let session = self.runtime.session();
        let rendered = session.store().export(format)?;
        let dir = session.data_dir().join("exports");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.{}", session.session_id(), format.extension()));
        fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn render_event(
    event: &AgentEvent,
    verbose: bool,
    streamed: &mut bool,
    out: &mut dyn Write,
) -> io::Result<()> {
    match event {
        AgentEvent::Chunk(chunk) => {
            write!(out, "{chunk}")?;
            out.flush()?;
            *streamed = true;
        }
        AgentEvent::ToolStarted { call_id, tool_name } => {
            if *streamed {
                writeln!(out)?;
                *streamed = false;
            }
            if verbose {
                writeln!(out, "[tool] {tool_name} ({call_id})")?;
            }
        }
        AgentEvent::ToolFinished {
            tool_name,
            ok,
            checkpoint_id,
            ..
        } => {
            if verbose {
                let status = if *ok { "ok" } else { "failed" };
                match checkpoint_id {
                    Some(id) => writeln!(out, "[tool] {tool_name} {status} (checkpoint {id})")?,
                    None => writeln!(out, "[tool] {tool_name} {status}")?,
                }
            }
        }
        AgentEvent::Warning(message) => writeln!(out, "warning: {message}")?,
        AgentEvent::Retrying {
            attempt,
            delay,
            error,
        } => writeln!(
            out,
            "provider error (attempt {attempt}): {}; retrying in {}ms",
            error.message,
            delay.as_millis()
        )?,
    }
    Ok(())
}

fn resolve_user_path(root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn clip(text: &str) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= MAX_PREVIEW_CHARS {
        return single_line;
    }
    let mut clipped = single_line.chars().take(MAX_PREVIEW_CHARS).collect::<String>();
    clipped.push('…');
    clipped
}

fn format_history(history: &[RunMessage], limit: usize) -> String {
    if history.is_empty() {
        return "No messages yet.".to_string();
    }
    let start = history.len().saturating_sub(limit);
    history[start..]
        .iter()
        .map(|message| match message {
            RunMessage::UserText { text } => format!("you: {}", clip(text)),
            RunMessage::AssistantText { text } => format!("assistant: {}", clip(text)),
            RunMessage::ToolCall {
                call_id,
                tool_name,
                arguments,
            } => format!("tool call {tool_name} [{call_id}]: {}", clip(&arguments.to_string())),
            RunMessage::ToolResult {
                call_id,
                tool_name,
                is_error,
                ..
            } => {
                let status = if *is_error { "error" } else { "ok" };
                format!("tool result {tool_name} [{call_id}]: {status}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_sessions(listings: &[SessionListing], active_id: &str) -> String {
    if listings.is_empty() {
        return "No stored sessions.".to_string();
    }
    listings
        .iter()
        .map(|listing| match listing {
            SessionListing::Valid(summary) => {
                let marker = if summary.session_id == active_id { "*" } else { " " };
                let preview = summary.preview.as_deref().map(clip).unwrap_or_default();
                format!(
                    "{marker} {}  {}  {} entries  {preview}",
                    summary.session_id, summary.last_active, summary.message_count
                )
                .trim_end()
                .to_string()
            }
            SessionListing::Corrupt { path, reason } => {
                format!("! {} (unreadable: {reason})", path.display())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_checkpoints(checkpoints: &[CheckpointSummary]) -> String {
    if checkpoints.is_empty() {
        return "No checkpoints yet.".to_string();
    }
    checkpoints
        .iter()
        .map(|checkpoint| {
            let label = checkpoint
                .label
                .as_deref()
                .map(|label| format!("  \"{label}\""))
                .unwrap_or_default();
            format!(
                "{}  {}  {:<11}  {} files  {} bytes{label}",
                checkpoint.id,
                checkpoint.created_at,
                checkpoint.origin.as_str(),
                checkpoint.file_count,
                checkpoint.total_bytes
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_restore_report(report: &RestoreReport) -> String {
    let mut lines = vec![format!(
        "Restored {} ({} paths). Previous state saved as {}.",
        report.checkpoint_id,
        report.paths.len(),
        report.pre_restore_id
    )];
    for (path, outcome) in &report.paths {
        if let RestoreOutcome::Failed(reason) = outcome {
            lines.push(format!("  failed: {}: {reason}", path.display()));
        }
    }
    if !report.is_complete() {
        lines.push(format!(
            "{} path(s) could not be restored; /rewind {} returns to the previous state.",
            report.failures(),
            report.pre_restore_id
        ));
    }
    lines.join("\n")
}
