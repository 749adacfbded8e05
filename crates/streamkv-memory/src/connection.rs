use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streamkv::events::{Event, EventSource, EventTarget, EventType, Listener, ListenerOptions};
use streamkv::host::{HostConnection, HostTransaction, TransactionMode};
use streamkv::{StoreError, StoreResult};

use crate::engine::Shared;
use crate::transaction::{MemoryTransaction, TxInner};

pub(crate) struct ConnectionInner {
    pub name: String,
    pub version: u64,
    shared: Arc<Shared>,
    pub events: EventTarget,
    closed: AtomicBool,
    transactions: Mutex<Vec<Weak<TxInner>>>,
}

impl ConnectionInner {
    pub fn new(shared: Arc<Shared>, name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            shared,
            events: EventTarget::new(),
            closed: AtomicBool::new(false),
            transactions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes on behalf of the engine: active transactions abort and `close` fires.
    pub fn force_close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let live: Vec<Arc<TxInner>> = self
            .transactions
            .lock()
            .drain(..)
            .filter_map(|tx| tx.upgrade())
            .collect();
        for tx in live {
            // Already finished transactions refuse the abort; nothing to undo.
            let _ = tx.abort_with(Some(StoreError::abort(reason)));
        }
        tracing::debug!(db = %self.name, reason, "connection closed by engine");
        self.events.dispatch(&Event::new(EventType::Close));
    }
}

pub(crate) struct MemoryConnection {
    pub inner: Arc<ConnectionInner>,
}

impl EventSource for MemoryConnection {
    fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        self.inner.events.add_event_listener(event_type, listener, options);
    }

    fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.inner.events.remove_event_listener(event_type, listener);
    }
}

impl HostConnection for MemoryConnection {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn version(&self) -> u64 {
        self.inner.version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.inner
            .shared
            .state
            .lock()
            .databases
            .get(&self.inner.name)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn transaction(&self, scope: &[String], mode: TransactionMode) -> StoreResult<Arc<dyn HostTransaction>> {
        if self.inner.is_closed() {
            return Err(StoreError::state("connection is closed"));
        }
        if mode == TransactionMode::VersionChange {
            return Err(StoreError::state(
                "version-change transactions are only created while opening a database",
            ));
        }
        if scope.is_empty() {
            return Err(StoreError::data("transaction scope must name at least one object store"));
        }
        let existing = self.object_store_names();
        if let Some(missing) = scope.iter().find(|name| !existing.contains(name)) {
            return Err(StoreError::not_found(format!("no object store named '{missing}'")));
        }
        let mut scope = scope.to_vec();
        scope.sort();
        scope.dedup();

        let tx = TxInner::start(Arc::clone(&self.inner.shared), &self.inner.name, scope, mode)?;
        let mut transactions = self.inner.transactions.lock();
        transactions.retain(|tx| tx.strong_count() > 0);
        transactions.push(Arc::downgrade(&tx));
        drop(transactions);
        Ok(Arc::new(MemoryTransaction::new(tx)))
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(db = %self.inner.name, "connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
