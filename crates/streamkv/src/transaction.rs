use std::sync::Arc;

use parking_lot::Mutex;

use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::events::{EventStream, EventType, Listener, ListenerOptions, SourceRef, listener};
use crate::host::{Completion, HostTransaction, TransactionMode, TransactionState};
use crate::object_store::ObjectStore;
use crate::request::Request;
use crate::transformer::{Identity, Transformer};

/// One host transaction: a fixed scope of stores and a mode.
///
/// The host drives the lifecycle; this wrapper only projects state and hands
/// out object-store facades. Clones share the same host transaction.
#[derive(Clone)]
pub struct Transaction {
    host: Arc<dyn HostTransaction>,
    db: Database,
}

impl Transaction {
    pub(crate) fn new(host: Arc<dyn HostTransaction>, db: Database) -> Self {
        Self { host, db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn mode(&self) -> TransactionMode {
        self.host.mode()
    }

    pub fn object_store_names(&self) -> Vec<String> {
        self.host.object_store_names()
    }

    pub fn state(&self) -> TransactionState {
        self.host.state()
    }

    /// Failure that aborted the transaction, if any.
    pub fn error(&self) -> Option<StoreError> {
        self.host.error()
    }

    /// Only legal while active; afterwards the host's state error is returned.
    pub fn abort(&self) -> StoreResult<()> {
        self.host.abort()
    }

    /// Asks the host to commit once the already issued requests have run.
    pub fn commit(&self) -> StoreResult<()> {
        self.host.commit()
    }

    pub fn object_store(&self, name: &str) -> StoreResult<ObjectStore> {
        self.object_store_with(name, Identity)
    }

    pub fn object_store_with<T: Send + 'static>(
        &self,
        name: &str,
        transformer: impl Transformer<T> + 'static,
    ) -> StoreResult<ObjectStore<T>> {
        self.scoped_store(name, Arc::new(transformer))
    }

    pub fn object_store_deferred(&self, name: &str) -> Request<ObjectStore> {
        self.object_store_deferred_with(name, Identity)
    }

    /// Lookup performed per subscription; an unknown name fails the stream.
    pub fn object_store_deferred_with<T: Send + 'static>(
        &self,
        name: &str,
        transformer: impl Transformer<T> + 'static,
    ) -> Request<ObjectStore<T>> {
        let transaction = self.clone();
        let name = name.to_string();
        let transformer: Arc<dyn Transformer<T>> = Arc::new(transformer);
        Request::deferred(move || transaction.scoped_store(&name, Arc::clone(&transformer)))
    }

    fn scoped_store<T: Send + 'static>(
        &self,
        name: &str,
        transformer: Arc<dyn Transformer<T>>,
    ) -> StoreResult<ObjectStore<T>> {
        if !self.host.object_store_names().iter().any(|scoped| scoped == name) {
            return Err(StoreError::not_found(format!(
                "no object store named '{name}' in transaction scope"
            )));
        }
        let host = self.host.object_store(name)?;
        Ok(ObjectStore::new(host, self.clone(), transformer))
    }

    pub fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        self.host.add_event_listener(event_type, listener, options);
    }

    pub fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.host.remove_event_listener(event_type, listener);
    }

    /// Stream of `abort`, `complete` or `error` events. Holds the transaction open while alive.
    pub fn events(&self, event_type: EventType) -> EventStream {
        EventStream::new(Arc::new(SourceRef(Arc::clone(&self.host))), event_type)
    }

    /// Settles with `Ok` on `complete` and with the abort cause on `abort`.
    ///
    /// The request keeps the transaction open until it is subscribed.
    pub fn completion(&self) -> Request<()> {
        let host = Arc::clone(&self.host);
        Request::new(move |done: Completion<()>| watch_completion(&host, done))
    }
}

fn finished_outcome(host: &dyn HostTransaction) -> Option<StoreResult<()>> {
    match host.state() {
        TransactionState::Finished => Some(Ok(())),
        TransactionState::Aborted => Some(Err(host
            .error()
            .unwrap_or_else(|| StoreError::abort("transaction aborted")))),
        TransactionState::Active | TransactionState::Committing => None,
    }
}

fn watch_completion(host: &Arc<dyn HostTransaction>, done: Completion<()>) {
    if let Some(outcome) = finished_outcome(host.as_ref()) {
        done(outcome);
        return;
    }

    // Both listeners are `once`; whichever fires second finds the slot empty.
    let pending = Arc::new(Mutex::new(Some(done)));
    let settle = move |outcome: StoreResult<()>| {
        let Some(done) = pending.lock().take() else {
            return;
        };
        done(outcome);
    };
    let settle = Arc::new(settle);

    let on_complete: Listener = {
        let settle = Arc::clone(&settle);
        listener(move |_| settle(Ok(())))
    };
    let on_abort: Listener = {
        let settle = Arc::clone(&settle);
        listener(move |event| {
            let error = event
                .error
                .clone()
                .unwrap_or_else(|| StoreError::abort("transaction aborted"));
            settle(Err(error))
        })
    };
    host.add_event_listener(EventType::Complete, &on_complete, ListenerOptions::once());
    host.add_event_listener(EventType::Abort, &on_abort, ListenerOptions::once());

    // The host may have finished between the first check and registration.
    if let Some(outcome) = finished_outcome(host.as_ref()) {
        settle(outcome);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("mode", &self.host.mode())
            .field("state", &self.host.state())
            .field("scope", &self.host.object_store_names())
            .finish()
    }
}
