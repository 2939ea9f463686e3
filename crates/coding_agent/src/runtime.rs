//! One in-flight turn per session, run on a worker thread.
//!
//! [`RuntimeController::start_turn`] hands back a [`TurnHandle`] whose bounded
//! channel carries agent events and exactly one terminal [`TurnEvent::Done`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use agent_provider::CancelSignal;
use thiserror::Error;
use tracing::{debug, error};

use crate::agent::{panic_message, run_turn, AgentEvent, TurnError};
use crate::session::Session;

/// Capacity of the per-turn event channel.
pub const TURN_EVENT_CAPACITY: usize = 64;
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum TurnEvent {
    Agent(AgentEvent),
    Done(Result<String, TurnError>),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("a turn is already running for this session")]
    TurnInFlight,

    #[error("failed to spawn turn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

pub struct TurnHandle {
    pub turn_id: u64,
    pub events: Receiver<TurnEvent>,
    cancel: CancelSignal,
    join_handle: Option<JoinHandle<()>>,
}

impl TurnHandle {
    /// Requests cancellation; honored at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        Arc::clone(&self.cancel)
    }

    /// Drains events into `on_event` and returns the turn result.
    pub fn wait(self, on_event: impl FnMut(AgentEvent)) -> Result<String, TurnError> {
        self.wait_with(on_event, || false)
    }

    /// Like [`TurnHandle::wait`], but polls `interrupted` while idle and
    /// cancels the turn once it reports true.
    pub fn wait_with(
        mut self,
        mut on_event: impl FnMut(AgentEvent),
        mut interrupted: impl FnMut() -> bool,
    ) -> Result<String, TurnError> {
        let outcome = loop {
            match self.events.recv_timeout(INTERRUPT_POLL_INTERVAL) {
                Ok(TurnEvent::Agent(event)) => on_event(event),
                Ok(TurnEvent::Done(result)) => break Some(result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break None,
            }
            if interrupted() {
                debug!(turn_id = self.turn_id, "turn interrupted");
                self.cancel();
            }
        };
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
        outcome.unwrap_or_else(|| {
            Err(TurnError::Internal(
                "turn worker exited without a result".to_string(),
            ))
        })
    }
}

pub struct RuntimeController {
    session: Arc<Mutex<Session>>,
    busy: Arc<AtomicBool>,
    next_turn_id: AtomicU64,
}

impl RuntimeController {
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            busy: Arc::new(AtomicBool::new(false)),
            next_turn_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Locks the session for commands that run between turns. Blocks while a
    /// turn holds it.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        lock_unpoisoned(&self.session)
    }

    pub fn start_turn(&self, input: impl Into<String>) -> Result<TurnHandle, RuntimeError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RuntimeError::TurnInFlight);
        }

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        let (sender, events) = mpsc::sync_channel(TURN_EVENT_CAPACITY);
        let worker = TurnWorker {
            session: Arc::clone(&self.session),
            busy: Arc::clone(&self.busy),
            cancel: Arc::clone(&cancel),
            sender,
            input: input.into(),
        };

        let spawned = thread::Builder::new()
            .name(format!("coding-agent-turn-{turn_id}"))
            .spawn(move || worker.run());
        let join_handle = match spawned {
            Ok(join_handle) => join_handle,
            Err(error) => {
                self.busy.store(false, Ordering::SeqCst);
                return Err(RuntimeError::Spawn(error));
            }
        };

        debug!(turn_id, "turn worker spawned");
        Ok(TurnHandle {
            turn_id,
            events,
            cancel,
            join_handle: Some(join_handle),
        })
    }
}

struct TurnWorker {
    session: Arc<Mutex<Session>>,
    busy: Arc<AtomicBool>,
    cancel: CancelSignal,
    sender: SyncSender<TurnEvent>,
    input: String,
}

impl TurnWorker {
    fn run(self) {
        let sender = self.sender.clone();
        let cancel = Arc::clone(&self.cancel);
        let mut emit = move |event: AgentEvent| {
            // A dropped receiver means nobody is listening anymore.
            if sender.send(TurnEvent::Agent(event)).is_err() {
                cancel.store(true, Ordering::SeqCst);
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut session = lock_unpoisoned(&self.session);
            run_turn(&mut session, &self.input, &self.cancel, &mut emit)
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%message, "agent loop panicked");
                Err(TurnError::Internal(format!("agent loop panicked: {message}")))
            }
        };

        self.busy.store(false, Ordering::SeqCst);
        let _ = self.sender.send(TurnEvent::Done(result));
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
