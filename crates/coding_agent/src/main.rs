use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use agent_provider::CancelSignal;
use anyhow::{Context, Result};
use clap::Parser;
use coding_agent::agent::{run_turn, AgentEvent};
use coding_agent::config::{config_path, load_config, AppConfig};
use coding_agent::logging;
use coding_agent::providers::provider_for;
use coding_agent::repl::Repl;
use coding_agent::rpc::RpcServer;
use coding_agent::session::{prune_expired_sessions, Session, SessionSelector};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "coding-agent",
    version,
    about = "Agentic coding assistant with checkpointed, audited tool use"
)]
struct Cli {
    /// Provider id (mock, openai, anthropic, gemini, ollama).
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Config file; defaults to `$CODING_AGENT_CONFIG_PATH` or the user config dir.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Resume a stored session by id or unambiguous prefix.
    #[arg(long, value_name = "ID", conflicts_with = "continue_latest")]
    resume: Option<String>,

    /// Resume the most recently active session.
    #[arg(long = "continue")]
    continue_latest: bool,

    /// Serve the editor JSON-RPC protocol on stdio.
    #[arg(long, conflicts_with = "prompt")]
    rpc: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Directory tools are confined to. Defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    project_root: Option<PathBuf>,

    /// Run one turn non-interactively and print the answer.
    #[arg(short, long)]
    prompt: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    logging::init(Some(&config.logging.level), cli.verbose);

    let project_root = match cli
        .project_root
        .clone()
        .or_else(|| config.policy.project_root.clone())
    {
        Some(root) => root,
        None => std::env::current_dir().context("read current directory")?,
    };

    let data_dir = config.data_dir(&project_root);
    if let Some(days) = config.storage.retention_days {
        match prune_expired_sessions(&data_dir, days) {
            Ok(removed) if !removed.is_empty() => {
                info!(count = removed.len(), "pruned expired sessions");
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "session pruning failed"),
        }
    }

    let provider =
        provider_for(&config.provider.id, None, &config.provider).context("initialize provider")?;

    let selector = match (&cli.resume, cli.continue_latest) {
        (Some(id), _) => SessionSelector::Resume(id.clone()),
        (None, true) => SessionSelector::Latest,
        (None, false) => SessionSelector::New,
    };
    let session = Session::open(&config, &project_root, provider, selector)
        .context("open session")?;

    if let Some(prompt) = cli.prompt.as_deref() {
        return run_once(session, prompt);
    }
    if cli.rpc {
        let mut server = RpcServer::new(session, config, io::stdin().lock(), io::stdout());
        return server.serve().context("rpc server");
    }
    Repl::new(session, config)
        .with_verbose(cli.verbose)
        .run()
        .context("repl")
}

/// File, then environment, then command line; validated last.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let lookup = |name: &str| std::env::var(name).ok();
    let path = cli.config.clone().or_else(|| config_path(lookup));
    let mut config = match &path {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    config.apply_env_overrides(lookup);

    if let Some(provider) = &cli.provider {
        config.provider.id = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.provider.model = Some(model.clone());
    }
    config.validate()?;
    Ok(config)
}

fn run_once(mut session: Session, prompt: &str) -> Result<()> {
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
    let mut stdout = io::stdout();
    let mut streamed = false;
    let answer = run_turn(&mut session, prompt, &cancel, &mut |event| match event {
        AgentEvent::Chunk(chunk) => {
            let _ = write!(stdout, "{chunk}");
            let _ = stdout.flush();
            streamed = true;
        }
        AgentEvent::ToolStarted { .. } => {
            if streamed {
                let _ = writeln!(stdout);
                streamed = false;
            }
        }
        AgentEvent::Warning(message) => eprintln!("warning: {message}"),
        _ => {}
    })?;

    if streamed {
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "{answer}")?;
    }
    Ok(())
}
