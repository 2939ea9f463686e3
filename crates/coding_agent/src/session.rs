//! The explicit per-conversation state the agent loop runs against.
//!
//! A [`Session`] owns the transcript, the checkpoint and audit partitions for
//! the same session id, the compiled policy, the tool executor and the active
//! provider. Nothing here is process-global; the REPL and the RPC server each
//! hold one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_provider::{ChatProvider, ProviderProfile, RunMessage};
use audit_log::{audit_root, AuditError, AuditLog};
use checkpoint_store::{
    checkpoint_root, collect_tree, Checkpoint, CheckpointError, CheckpointOrigin,
    CheckpointStore, CheckpointSummary, RestoreReport, TreeLimits,
};
use session_store::{
    session_id_from_file_name, session_root, SessionEntryKind, SessionListing, SessionStore,
    SessionStoreError, SessionSummary,
};
use thiserror::Error;
use time::OffsetDateTime;
use tool_policy::{CommandPolicy, PolicyError};
use tracing::{info, warn};

use crate::config::{AgentSection, AppConfig};
use crate::prompt::base_instructions;
use crate::tools::{BuiltinToolExecutor, ToolExecutor};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tool executor unavailable: {0}")]
    Tools(String),

    #[error("session {session_id} is active; switch sessions before deleting it")]
    ActiveSession { session_id: String },
}

/// Which transcript to attach to when opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSelector {
    New,
    /// Full id or unambiguous prefix.
    Resume(String),
    Latest,
}

/// Agent-loop knobs resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub provider_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub history_window: Option<usize>,
    /// Base block of the system instructions.
    pub system_instructions: String,
}

impl AgentSettings {
    #[must_use]
    pub fn from_config(agent: &AgentSection) -> Self {
        Self {
            max_iterations: agent.max_iterations,
            provider_max_attempts: agent.provider_max_attempts,
            retry_base_delay: Duration::from_millis(agent.retry_base_delay_ms),
            history_window: agent.history_window,
            system_instructions: base_instructions(agent.system_instructions.as_deref()),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AgentSection::default())
    }
}

pub struct Session {
    pub(crate) store: SessionStore,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) audit: AuditLog,
    pub(crate) policy: CommandPolicy,
    pub(crate) executor: Box<dyn ToolExecutor>,
    pub(crate) provider: Arc<dyn ChatProvider>,
    pub(crate) settings: AgentSettings,
    data_dir: PathBuf,
    max_checkpoints: Option<usize>,
}

impl Session {
    /// Opens the stores for `selector` under the configured data directory.
    pub fn open(
        config: &AppConfig,
        project_root: &Path,
        provider: Arc<dyn ChatProvider>,
        selector: SessionSelector,
    ) -> Result<Self, SessionError> {
        let mut policy = CommandPolicy::new(&config.policy, project_root)?;
        let root = policy.root().to_path_buf();
        let data_dir = config.data_dir(&root);
        fs::create_dir_all(&data_dir).map_err(|source| SessionError::DataDir {
            path: data_dir.clone(),
            source,
        })?;
        policy.protect(&data_dir);

        let executor = BuiltinToolExecutor::new(&root, config.tools.clone())
            .map_err(SessionError::Tools)?;
        let store = open_store(&data_dir, &root, &selector)?;
        let checkpoints = CheckpointStore::open(&checkpoint_root(&data_dir), store.session_id())?
            .with_retention(config.storage.max_checkpoints);
        let audit = AuditLog::open(&audit_root(&data_dir), store.session_id())?;

        info!(
            session_id = store.session_id(),
            root = %root.display(),
            data_dir = %data_dir.display(),
            "session opened"
        );
        Ok(Self {
            store,
            checkpoints,
            audit,
            policy,
            executor: Box::new(executor),
            provider,
            settings: AgentSettings::from_config(&config.agent),
            data_dir,
            max_checkpoints: config.storage.max_checkpoints,
        })
    }

    /// Replaces the tool executor, e.g. with an instrumented one in tests.
    #[must_use]
    pub fn with_executor(mut self, executor: Box<dyn ToolExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        self.store.session_id()
    }

    #[must_use]
    pub fn project_root(&self) -> &Path {
        self.policy.root()
    }

    /// Working directory for tools. Always the project root.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        self.policy.root()
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    #[must_use]
    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    #[must_use]
    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    #[must_use]
    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        Arc::clone(&self.provider)
    }

    #[must_use]
    pub fn provider_profile(&self) -> ProviderProfile {
        self.provider.profile()
    }

    pub fn set_provider(&mut self, provider: Arc<dyn ChatProvider>) {
        let profile = provider.profile();
        info!(provider = %profile.provider_id, model = %profile.model_id, "provider switched");
        self.provider = provider;
    }

    #[must_use]
    pub fn plan_mode(&self) -> bool {
        self.policy.is_read_only()
    }

    pub fn set_plan_mode(&mut self, enabled: bool) {
        self.policy.set_read_only(enabled);
        info!(enabled, "plan mode toggled");
    }

    /// Full persisted history of the current branch.
    pub fn history(&self) -> Result<Vec<RunMessage>, SessionStoreError> {
        self.store.replay()
    }

    /// History visible to the provider: everything after the last `/clear`.
    pub fn context(&self) -> Result<Vec<RunMessage>, SessionStoreError> {
        self.store.replay_context()
    }

    /// Hides the current history from future provider requests by appending a
    /// marker. Earlier entries stay in the transcript and survive `/resume`.
    pub fn clear_context(&mut self) -> Result<(), SessionStoreError> {
        self.store.append_kind(SessionEntryKind::ContextCleared)?;
        info!(session_id = self.store.session_id(), "context cleared");
        Ok(())
    }

    /// Attaches to another transcript together with its checkpoint and audit
    /// partitions.
    pub fn switch_to(&mut self, selector: SessionSelector) -> Result<(), SessionError> {
        let store = open_store(&self.data_dir, self.policy.root(), &selector)?;
        let checkpoints =
            CheckpointStore::open(&checkpoint_root(&self.data_dir), store.session_id())?
                .with_retention(self.max_checkpoints);
        let audit = AuditLog::open(&audit_root(&self.data_dir), store.session_id())?;

        info!(from = self.store.session_id(), to = store.session_id(), "session switched");
        self.store = store;
        self.checkpoints = checkpoints;
        self.audit = audit;
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionListing>, SessionStoreError> {
        SessionStore::list_sessions(&session_root(&self.data_dir))
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        self.store.summary()
    }

    /// Deletes another session's transcript, checkpoints and audit log.
    pub fn delete_session(&self, id_or_prefix: &str) -> Result<String, SessionError> {
        let root = session_root(&self.data_dir);
        let path = SessionStore::find_session_path(&root, id_or_prefix)?;
        if path == self.store.path() {
            return Err(SessionError::ActiveSession {
                session_id: self.store.session_id().to_string(),
            });
        }
        let session_id = session_id_from_file_name(&path)
            .unwrap_or(id_or_prefix)
            .to_string();

        SessionStore::delete(&root, &session_id)?;
        remove_partitions(&self.data_dir, &session_id)?;
        Ok(session_id)
    }

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        self.checkpoints.list()
    }

    /// Newest checkpoint id, used to point users at a rewind target.
    #[must_use]
    pub fn latest_checkpoint_id(&self) -> Option<String> {
        match self.checkpoints.latest() {
            Ok(latest) => latest.map(|checkpoint| checkpoint.id),
            Err(error) => {
                warn!(%error, "failed to read latest checkpoint");
                None
            }
        }
    }

    /// Snapshots the project tree, skipping the data directory.
    pub fn checkpoint_workspace(
        &mut self,
        label: Option<&str>,
        origin: CheckpointOrigin,
    ) -> Result<Checkpoint, CheckpointError> {
        let selection = collect_tree(self.policy.root(), &self.tree_limits());
        if selection.truncated {
            warn!(
                files = selection.files.len(),
                "workspace snapshot hit its size limits; some files are not covered"
            );
        }
        self.checkpoints.snapshot(&selection.files, label, origin)
    }

    pub(crate) fn tree_limits(&self) -> TreeLimits {
        TreeLimits::default().excluding(self.data_dir.clone())
    }

    /// Restores `selector` (`last` or an id). A `pre_restore` checkpoint is taken first.
    pub fn rewind(&mut self, selector: &str) -> Result<RestoreReport, CheckpointError> {
        let report = self.checkpoints.restore(selector)?;
        info!(
            checkpoint_id = %report.checkpoint_id,
            pre_restore_id = %report.pre_restore_id,
            failures = report.failures(),
            "workspace rewound"
        );
        Ok(report)
    }
}

fn open_store(
    data_dir: &Path,
    cwd: &Path,
    selector: &SessionSelector,
) -> Result<SessionStore, SessionStoreError> {
    let root = session_root(data_dir);
    match selector {
        SessionSelector::New => SessionStore::create_new(&root, cwd),
        SessionSelector::Resume(id) => SessionStore::open_by_id(&root, id),
        SessionSelector::Latest => SessionStore::open_latest(&root),
    }
}

fn remove_partitions(data_dir: &Path, session_id: &str) -> Result<(), SessionError> {
    CheckpointStore::remove_partition(&checkpoint_root(data_dir), session_id)?;
    AuditLog::remove(&audit_root(data_dir), session_id)?;
    Ok(())
}

/// Deletes sessions idle for longer than `retention_days`, with their
/// checkpoint and audit partitions. Returns the removed session ids.
pub fn prune_expired_sessions(
    data_dir: &Path,
    retention_days: u32,
) -> Result<Vec<String>, SessionError> {
    let removed = SessionStore::prune_older_than(
        &session_root(data_dir),
        time::Duration::days(i64::from(retention_days)),
        OffsetDateTime::now_utc(),
    )?;

    let mut ids = Vec::with_capacity(removed.len());
    for path in removed {
        if let Some(session_id) = session_id_from_file_name(&path) {
            remove_partitions(data_dir, session_id)?;
            ids.push(session_id.to_string());
        }
    }
    Ok(ids)
}
