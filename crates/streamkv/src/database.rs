use std::sync::Arc;

use crate::error::StoreResult;
use crate::events::{EventStream, EventType, Listener, ListenerOptions, SourceRef};
use crate::host::{HostConnection, TransactionMode};
use crate::object_store::ObjectStore;
use crate::transaction::Transaction;

/// An open connection to one named, versioned database.
#[derive(Clone)]
pub struct Database {
    host: Arc<dyn HostConnection>,
}

impl Database {
    /// Wraps a connection obtained from a host directly.
    pub fn from_host(host: Arc<dyn HostConnection>) -> Self {
        Self { host }
    }

    pub fn name(&self) -> String {
        self.host.name()
    }

    pub fn version(&self) -> u64 {
        self.host.version()
    }

    pub fn object_store_names(&self) -> Vec<String> {
        self.host.object_store_names()
    }

    pub fn close(&self) {
        self.host.close();
    }

    pub fn is_closed(&self) -> bool {
        self.host.is_closed()
    }

    pub fn transaction<I, S>(&self, scope: I, mode: TransactionMode) -> StoreResult<Transaction>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scope: Vec<String> = scope.into_iter().map(Into::into).collect();
        let host = self.host.transaction(&scope, mode)?;
        tracing::debug!(db = %self.host.name(), ?scope, ?mode, "transaction started");
        Ok(Transaction::new(host, self.clone()))
    }

    /// Single-store transaction, returning the store facade directly.
    pub fn object_store(&self, name: &str, mode: TransactionMode) -> StoreResult<ObjectStore> {
        self.transaction([name], mode)?.object_store(name)
    }

    pub fn add_event_listener(&self, event_type: EventType, listener: &Listener, options: ListenerOptions) {
        self.host.add_event_listener(event_type, listener, options);
    }

    pub fn remove_event_listener(&self, event_type: EventType, listener: &Listener) {
        self.host.remove_event_listener(event_type, listener);
    }

    /// Stream of `close`, `versionchange` or `error` events.
    pub fn events(&self, event_type: EventType) -> EventStream {
        EventStream::new(Arc::new(SourceRef(Arc::clone(&self.host))), event_type)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.host.name())
            .field("version", &self.host.version())
            .finish()
    }
}
