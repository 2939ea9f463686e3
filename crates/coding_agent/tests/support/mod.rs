#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use agent_provider::{CancelSignal, ChatProvider};
use agent_provider_mock::MockProvider;
use audit_log::{AuditFilter, AuditRecord};
use coding_agent::agent::{run_turn, AgentEvent, TurnError};
use coding_agent::config::AppConfig;
use coding_agent::session::{Session, SessionSelector};
use tempfile::TempDir;

/// A throwaway project directory plus a separate data directory.
pub struct Fixture {
    pub project: TempDir,
    pub data: TempDir,
    pub provider: Arc<MockProvider>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_provider(MockProvider::new())
    }

    pub fn with_provider(provider: MockProvider) -> Self {
        Self {
            project: TempDir::new().expect("project tempdir"),
            data: TempDir::new().expect("data tempdir"),
            provider: Arc::new(provider),
        }
    }

    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.data_dir = Some(self.data.path().to_path_buf());
        config.agent.retry_base_delay_ms = 1;
        config
    }

    pub fn root(&self) -> PathBuf {
        self.project
            .path()
            .canonicalize()
            .expect("canonical project root")
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write fixture file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("read fixture file")
    }

    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        Arc::clone(&self.provider) as Arc<dyn ChatProvider>
    }

    pub fn session(&self) -> Session {
        self.session_with(&self.config(), SessionSelector::New)
    }

    pub fn session_with(&self, config: &AppConfig, selector: SessionSelector) -> Session {
        Session::open(config, self.project.path(), self.provider(), selector).expect("open session")
    }
}

pub fn idle_cancel() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

/// Runs one turn, collecting every emitted event.
pub fn turn(session: &mut Session, input: &str) -> (Result<String, TurnError>, Vec<AgentEvent>) {
    let mut events = Vec::new();
    let result = run_turn(session, input, &idle_cancel(), &mut |event| events.push(event));
    (result, events)
}

pub fn audit_records(session: &Session) -> Vec<AuditRecord> {
    session
        .audit()
        .query(AuditFilter::default())
        .expect("query audit log")
        .collect::<Result<Vec<_>, _>>()
        .expect("read audit records")
}

pub fn checkpoint_count(session: &Session) -> usize {
    session.list_checkpoints().expect("list checkpoints").len()
}
