//! Transaction execution for the memory engine.
//!
//! Every transaction owns a FIFO of jobs executed by one tokio task once the
//! scheduler lets it start. Writes go to per-transaction copies of the touched
//! stores, swapped into the committed state on commit and dropped on abort.
//! Completions and listeners are always invoked with no engine lock held.
//!
//! A transaction commits when its queue is empty, no cursor is open, and a
//! full pass of the runtime issued nothing new; an explicit `commit()` or the
//! last handle going away commits as soon as the queue drains.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use streamkv::events::{Event, EventSource, EventTarget, EventType, Listener, ListenerOptions};
use streamkv::host::{Completion, HostObjectStore, HostTransaction, TransactionMode, TransactionState};
use streamkv::{StoreError, StoreResult};
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::engine::Shared;
use crate::state::{DatabaseState, StoreState};
use crate::store::MemoryObjectStore;

/// Store data as seen by one running job.
pub(crate) struct Workspace<'a> {
    committed: Option<&'a DatabaseState>,
    working: &'a mut BTreeMap<String, StoreState>,
}

impl Workspace<'_> {
    fn committed(&self, name: &str) -> StoreResult<&StoreState> {
        self.committed
            .ok_or_else(|| StoreError::state("database was deleted"))?
            .store(name)
    }

    pub fn store(&self, name: &str) -> StoreResult<&StoreState> {
        match self.working.get(name) {
            Some(store) => Ok(store),
            None => self.committed(name),
        }
    }

    /// Copies the committed store on first write.
    pub fn store_mut(&mut self, name: &str) -> StoreResult<&mut StoreState> {
        if !self.working.contains_key(name) {
            let copy = self.committed(name)?.clone();
            self.working.insert(name.to_string(), copy);
        }
        self.working
            .get_mut(name)
            .ok_or_else(|| StoreError::not_found(format!("object store '{name}' does not exist")))
    }
}

/// Result of running a job: what to tell the caller, and whether it failed.
pub(crate) struct Executed {
    deliver: Box<dyn FnOnce() + Send>,
    failure: Option<StoreError>,
}

impl Executed {
    pub fn new(deliver: impl FnOnce() + Send + 'static, failure: Option<StoreError>) -> Self {
        Self {
            deliver: Box::new(deliver),
            failure,
        }
    }
}

pub(crate) trait Job: Send {
    fn run(self: Box<Self>, workspace: &mut Workspace<'_>) -> Executed;

    fn cancel(self: Box<Self>, error: StoreError);

    /// Whether this job continues a cursor that already delivered a position.
    fn resumes_cursor(&self) -> bool {
        false
    }
}

struct Operation<T, F> {
    body: F,
    done: Completion<T>,
}

impl<T, F> Job for Operation<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut Workspace<'_>) -> StoreResult<T> + Send,
{
    fn run(self: Box<Self>, workspace: &mut Workspace<'_>) -> Executed {
        let Operation { body, done } = *self;
        let result = body(workspace);
        let failure = result.as_ref().err().cloned();
        Executed::new(move || done(result), failure)
    }

    fn cancel(self: Box<Self>, error: StoreError) {
        (self.done)(Err(error));
    }
}

/// A job that settles `done` with the value computed by `body`.
pub(crate) fn operation<T, F>(body: F, done: Completion<T>) -> Box<dyn Job>
where
    T: Send + 'static,
    F: FnOnce(&mut Workspace<'_>) -> StoreResult<T> + Send + 'static,
{
    Box::new(Operation { body, done })
}

struct Control {
    state: TransactionState,
    error: Option<StoreError>,
    queue: VecDeque<Box<dyn Job>>,
    working: BTreeMap<String, StoreState>,
    commit_requested: bool,
    released: bool,
    open_cursors: usize,
    /// Jobs ever queued; compared against `settled_at` to detect an idle pass.
    issued: u64,
    settled_at: Option<u64>,
}

enum Step {
    Run(Executed),
    Commit(BTreeMap<String, StoreState>),
    Settle,
    Wait,
    Stop,
}

pub(crate) struct TxInner {
    pub id: u64,
    pub database: String,
    pub mode: TransactionMode,
    pub scope: Vec<String>,
    pub shared: Arc<Shared>,
    pub events: EventTarget,
    control: Mutex<Control>,
    wake: Notify,
}

impl TxInner {
    /// Registers the transaction with the scheduler and spawns its driver.
    pub fn start(
        shared: Arc<Shared>,
        database: &str,
        scope: Vec<String>,
        mode: TransactionMode,
    ) -> StoreResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::state("memory engine transactions need a running tokio runtime")
        })?;
        let tx = Arc::new(Self {
            id: shared.next_id(),
            database: database.to_string(),
            mode,
            scope,
            shared,
            events: EventTarget::new(),
            control: Mutex::new(Control {
                state: TransactionState::Active,
                error: None,
                queue: VecDeque::new(),
                working: BTreeMap::new(),
                commit_requested: false,
                released: false,
                open_cursors: 0,
                issued: 0,
                settled_at: None,
            }),
            wake: Notify::new(),
        });
        tx.shared
            .scheduler
            .register(tx.id, database, Some(tx.scope.clone()), mode.is_writable());
        tracing::debug!(
            id = tx.id,
            db = %tx.database,
            scope = ?tx.scope,
            ?mode,
            "transaction created"
        );
        runtime.spawn(Arc::clone(&tx).drive());
        Ok(tx)
    }

    pub fn state(&self) -> TransactionState {
        self.control.lock().state
    }

    pub fn error(&self) -> Option<StoreError> {
        self.control.lock().error.clone()
    }

    /// Queues `job`, or fails it at once when the transaction no longer accepts requests.
    pub fn enqueue(&self, job: Box<dyn Job>) {
        let rejected = {
            let mut control = self.control.lock();
            match control.state {
                TransactionState::Active if !control.commit_requested => {
                    control.queue.push_back(job);
                    control.issued += 1;
                    None
                }
                TransactionState::Aborted if job.resumes_cursor() => {
                    Some((job, StoreError::abort("transaction was aborted")))
                }
                TransactionState::Active | TransactionState::Committing => {
                    Some((job, StoreError::state("transaction is committing")))
                }
                TransactionState::Aborted => Some((job, StoreError::state("transaction was aborted"))),
                TransactionState::Finished => Some((job, StoreError::state("transaction has finished"))),
            }
        };
        match rejected {
            Some((job, error)) => job.cancel(error),
            None => self.wake.notify_one(),
        }
    }

    pub fn cursor_opened(&self) {
        self.control.lock().open_cursors += 1;
    }

    pub fn cursor_closed(&self) {
        {
            let mut control = self.control.lock();
            control.open_cursors = control.open_cursors.saturating_sub(1);
        }
        self.wake.notify_one();
    }

    pub fn request_commit(&self) -> StoreResult<()> {
        {
            let mut control = self.control.lock();
            if control.state != TransactionState::Active {
                return Err(StoreError::state("transaction is not active"));
            }
            control.commit_requested = true;
        }
        self.wake.notify_one();
        Ok(())
    }

    fn release(&self) {
        self.control.lock().released = true;
        self.wake.notify_one();
    }

    /// Aborts an active transaction, failing every queued job with an abort error.
    pub fn abort_with(&self, error: Option<StoreError>) -> StoreResult<()> {
        let queued = {
            let mut control = self.control.lock();
            if control.state != TransactionState::Active {
                return Err(StoreError::state(format!(
                    "cannot abort a transaction that is {:?}",
                    control.state
                )));
            }
            control.state = TransactionState::Aborted;
            control.error = error.clone();
            control.working.clear();
            std::mem::take(&mut control.queue)
        };
        tracing::debug!(id = self.id, error = ?error, "transaction aborted");
        self.wake.notify_one();
        self.shared.scheduler.finish(self.id);

        for job in queued {
            job.cancel(StoreError::abort("transaction was aborted"));
        }
        if let Some(error) = &error {
            self.events
                .dispatch(&Event::with_error(EventType::Error, Some(error.clone())));
        }
        self.events.dispatch(&Event::with_error(EventType::Abort, error));
        Ok(())
    }

    fn next_step(&self) -> Step {
        let mut guard = self.control.lock();
        let control = &mut *guard;
        if control.state != TransactionState::Active {
            return Step::Stop;
        }
        if let Some(job) = control.queue.pop_front() {
            let engine = self.shared.state.lock();
            let mut workspace = Workspace {
                committed: engine.databases.get(&self.database),
                working: &mut control.working,
            };
            return Step::Run(job.run(&mut workspace));
        }
        let idle = control.open_cursors == 0;
        let settled = idle && control.settled_at == Some(control.issued);
        if control.commit_requested || control.released || settled {
            control.state = TransactionState::Committing;
            return Step::Commit(std::mem::take(&mut control.working));
        }
        if idle {
            control.settled_at = Some(control.issued);
            return Step::Settle;
        }
        Step::Wait
    }

    async fn drive(self: Arc<Self>) {
        self.shared.scheduler.wait_turn(self.id).await;
        tracing::trace!(id = self.id, "transaction started");
        loop {
            match self.next_step() {
                Step::Run(executed) => {
                    (executed.deliver)();
                    match executed.failure {
                        Some(failure) if self.shared.config.abort_on_request_error => {
                            let _ = self.abort_with(Some(failure));
                        }
                        _ => {}
                    }
                    if self.shared.config.yield_between_requests {
                        tokio::task::yield_now().await;
                    }
                }
                Step::Commit(working) => {
                    self.commit(working);
                    break;
                }
                Step::Settle => tokio::task::yield_now().await,
                Step::Wait => self.wake.notified().await,
                Step::Stop => break,
            }
        }
        self.shared.scheduler.finish(self.id);
    }

    fn commit(&self, working: BTreeMap<String, StoreState>) {
        let touched = working.len();
        let outcome = self.shared.install(&self.database, working);
        {
            let mut control = self.control.lock();
            match &outcome {
                Ok(()) => control.state = TransactionState::Finished,
                Err(error) => {
                    control.state = TransactionState::Aborted;
                    control.error = Some(error.clone());
                }
            }
        }
        match outcome {
            Ok(()) => {
                tracing::debug!(id = self.id, stores = touched, "transaction committed");
                self.events.dispatch(&Event::new(EventType::Complete));
            }
            Err(error) => {
                tracing::warn!(id = self.id, %error, "transaction commit failed");
                self.events
                    .dispatch(&Event::with_error(EventType::Error, Some(error.clone())));
                self.events
                    .dispatch(&Event::with_error(EventType::Abort, Some(error)));
            }
        }
    }
}

/// Shared by every handle of one transaction; the last drop releases it for commit.
pub(crate) struct HandleGuard {
    pub tx: Arc<TxInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.tx.release();
    }
}

pub(crate) struct MemoryTransaction {
    guard: Arc<HandleGuard>,
}

impl MemoryTransaction {
    pub fn new(tx: Arc<TxInner>) -> Self {
        Self {
            guard: Arc::new(HandleGuard { tx }),
        }
    }

    fn tx(&self) -> &TxInner {
        &self.guard.tx
    }
}

impl EventSource for MemoryTransaction {
    fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        self.tx().events.add_event_listener(event_type, listener, options);
    }

    fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.tx().events.remove_event_listener(event_type, listener);
    }
}

impl HostTransaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.tx().mode
    }

    fn object_store_names(&self) -> Vec<String> {
        self.tx().scope.clone()
    }

    fn state(&self) -> TransactionState {
        self.tx().state()
    }

    fn error(&self) -> Option<StoreError> {
        self.tx().error()
    }

    fn abort(&self) -> StoreResult<()> {
        self.tx().abort_with(None)
    }

    fn commit(&self) -> StoreResult<()> {
        self.tx().request_commit()
    }

    fn object_store(&self, name: &str) -> StoreResult<Arc<dyn HostObjectStore>> {
        let tx = self.tx();
        if !tx.scope.iter().any(|scoped| scoped == name) {
            return Err(StoreError::not_found(format!(
                "object store '{name}' is not in the transaction scope"
            )));
        }
        let store = MemoryObjectStore::open(Arc::clone(&self.guard), name)?;
        Ok(Arc::new(store))
    }
}
