use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use streamkv::events::Event;
use streamkv::host::{
    Completion, DatabaseInfo, HostConnection, HostFactory, HostUpgrade, IndexParameters,
    ObjectStoreParameters, UpgradeCallback,
};
use streamkv::{KeyPath, StoreError, StoreResult};
use tokio::runtime::Handle;

use crate::config::MemoryEngineConfig;
use crate::connection::{ConnectionInner, MemoryConnection};
use crate::scheduler::Scheduler;
use crate::state::{DatabaseState, EngineState, IndexState, StoreState};

/// Where committed state goes after every change.
pub(crate) trait Persist: Send + Sync {
    fn persist(&self, state: &EngineState) -> StoreResult<()>;
}

pub(crate) struct Shared {
    pub config: MemoryEngineConfig,
    pub state: Mutex<EngineState>,
    pub scheduler: Scheduler,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    persistence: Option<Box<dyn Persist>>,
    next_id: AtomicU64,
}

impl Shared {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn persist(&self, state: &EngineState) -> StoreResult<()> {
        match &self.persistence {
            Some(persistence) => persistence.persist(state),
            None => Ok(()),
        }
    }

    /// Swaps a committed transaction's store copies into the database, rolling
    /// back if the result cannot be persisted.
    pub fn install(&self, database: &str, working: BTreeMap<String, StoreState>) -> StoreResult<()> {
        if working.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let db = state
            .databases
            .get_mut(database)
            .ok_or_else(|| StoreError::abort("database was deleted before commit"))?;
        let mut replaced = Vec::with_capacity(working.len());
        for (name, store) in working {
            if let Some(slot) = db.stores.get_mut(&name) {
                replaced.push((name, std::mem::replace(slot, store)));
            }
        }
        if let Err(error) = self.persist(&state) {
            if let Some(db) = state.databases.get_mut(database) {
                for (name, previous) in replaced {
                    db.stores.insert(name, previous);
                }
            }
            return Err(error);
        }
        Ok(())
    }

    fn connect(self: &Arc<Self>, name: &str, version: u64) -> Arc<dyn HostConnection> {
        let inner = Arc::new(ConnectionInner::new(Arc::clone(self), name, version));
        let mut connections = self.connections.lock();
        connections.retain(|connection| connection.strong_count() > 0);
        connections.push(Arc::downgrade(&inner));
        drop(connections);
        tracing::debug!(db = name, version, "connection opened");
        Arc::new(MemoryConnection { inner })
    }

    /// Tells open connections to `name` about a version change, then closes
    /// the ones that did not close themselves.
    fn close_connections(&self, name: &str, old_version: u64, new_version: Option<u64>) {
        let open: Vec<Arc<ConnectionInner>> = self
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| connection.name == name && !connection.is_closed())
            .collect();
        let event = Event::version_change(old_version, new_version);
        for connection in &open {
            connection.events.dispatch(&event);
        }
        let reason = match new_version {
            Some(version) => format!("database '{name}' is upgrading to version {version}"),
            None => format!("database '{name}' is being deleted"),
        };
        for connection in open {
            connection.force_close(&reason);
        }
    }

    /// Waits for exclusive access to `name`, announcing the change to other connections first.
    async fn exclusive<T>(&self, name: &str, new_version: Option<u64>, work: impl FnOnce() -> T) -> T {
        let id = self.next_id();
        self.scheduler.register(id, name, None, true);
        let old_version = self
            .state
            .lock()
            .databases
            .get(name)
            .map_or(0, |db| db.version);
        self.close_connections(name, old_version, new_version);
        self.scheduler.wait_turn(id).await;
        let result = work();
        self.scheduler.finish(id);
        result
    }

    fn upgrade(&self, name: &str, requested: u64, upgrade: UpgradeCallback) -> StoreResult<u64> {
        let current = self
            .state
            .lock()
            .databases
            .get(name)
            .cloned()
            .unwrap_or_default();
        if requested < current.version {
            return Err(StoreError::version(format!(
                "requested version {requested} is lower than stored version {}",
                current.version
            )));
        }
        if requested == current.version {
            return Ok(requested);
        }

        tracing::debug!(db = name, from = current.version, to = requested, "upgrading database");
        let session = UpgradeSession {
            old_version: current.version,
            new_version: requested,
            db: Mutex::new(DatabaseState {
                version: requested,
                stores: current.stores,
            }),
        };
        upgrade(&session)?;
        let upgraded = session.db.into_inner();

        let mut state = self.state.lock();
        let previous = state.databases.insert(name.to_string(), upgraded);
        if let Err(error) = self.persist(&state) {
            match previous {
                Some(previous) => state.databases.insert(name.to_string(), previous),
                None => state.databases.remove(name),
            };
            return Err(error);
        }
        Ok(requested)
    }

    fn delete(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let Some(previous) = state.databases.remove(name) else {
            return Ok(());
        };
        if let Err(error) = self.persist(&state) {
            state.databases.insert(name.to_string(), previous);
            return Err(error);
        }
        tracing::debug!(db = name, "database deleted");
        Ok(())
    }
}

/// In-process host engine. Clones share the same databases.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_config(MemoryEngineConfig::default())
    }

    pub fn with_config(config: MemoryEngineConfig) -> Self {
        Self::from_parts(config, EngineState::default(), None)
    }

    pub(crate) fn from_parts(
        config: MemoryEngineConfig,
        state: EngineState,
        persistence: Option<Box<dyn Persist>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                scheduler: Scheduler::default(),
                connections: Mutex::new(Vec::new()),
                persistence,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &MemoryEngineConfig {
        &self.shared.config
    }

    /// The engine as the factory handed to `streamkv::open_database`.
    pub fn factory(&self) -> Arc<dyn HostFactory> {
        Arc::new(self.clone())
    }
}

impl HostFactory for MemoryEngine {
    fn open(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: UpgradeCallback,
        done: Completion<Arc<dyn HostConnection>>,
    ) {
        if version == Some(0) {
            return done(Err(StoreError::version("database versions start at 1")));
        }
        let current = self
            .shared
            .state
            .lock()
            .databases
            .get(name)
            .map(|db| db.version);
        let requested = match (version, current) {
            (Some(version), _) => version,
            (None, Some(current)) => current,
            (None, None) => 1,
        };
        let stored = current.unwrap_or(0);
        if requested < stored {
            return done(Err(StoreError::version(format!(
                "requested version {requested} is lower than stored version {stored}"
            ))));
        }
        if requested == stored {
            return done(Ok(self.shared.connect(name, stored)));
        }

        let Ok(runtime) = Handle::try_current() else {
            return done(Err(StoreError::state(
                "upgrading a memory engine database needs a running tokio runtime",
            )));
        };
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        runtime.spawn(async move {
            let result = shared
                .exclusive(&name, Some(requested), || shared.upgrade(&name, requested, upgrade))
                .await;
            done(result.map(|version| shared.connect(&name, version)));
        });
    }

    fn delete_database(&self, name: &str, done: Completion<()>) {
        let Ok(runtime) = Handle::try_current() else {
            return done(Err(StoreError::state(
                "deleting a memory engine database needs a running tokio runtime",
            )));
        };
        let shared = Arc::clone(&self.shared);
        let name = name.to_string();
        runtime.spawn(async move {
            let result = shared.exclusive(&name, None, || shared.delete(&name)).await;
            done(result);
        });
    }

    fn databases(&self, done: Completion<Vec<DatabaseInfo>>) {
        let databases = self
            .shared
            .state
            .lock()
            .databases
            .iter()
            .map(|(name, db)| DatabaseInfo {
                name: name.clone(),
                version: db.version,
            })
            .collect();
        done(Ok(databases));
    }
}

struct UpgradeSession {
    old_version: u64,
    new_version: u64,
    db: Mutex<DatabaseState>,
}

impl HostUpgrade for UpgradeSession {
    fn old_version(&self) -> u64 {
        self.old_version
    }

    fn new_version(&self) -> u64 {
        self.new_version
    }

    fn object_store_names(&self) -> Vec<String> {
        self.db.lock().stores.keys().cloned().collect()
    }

    fn create_object_store(&self, name: &str, parameters: ObjectStoreParameters) -> StoreResult<()> {
        if parameters.auto_increment {
            match &parameters.key_path {
                Some(KeyPath::Multiple(_)) => {
                    return Err(StoreError::data("a key generator cannot use a compound key path"));
                }
                Some(KeyPath::Single(path)) if path.is_empty() => {
                    return Err(StoreError::data("a key generator cannot use an empty key path"));
                }
                _ => {}
            }
        }
        let mut db = self.db.lock();
        if db.stores.contains_key(name) {
            return Err(StoreError::constraint(format!("object store '{name}' already exists")));
        }
        db.stores.insert(name.to_string(), StoreState::new(parameters));
        tracing::debug!(store = name, "object store created");
        Ok(())
    }

    fn delete_object_store(&self, name: &str) -> StoreResult<()> {
        self.db
            .lock()
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("object store '{name}' does not exist")))
    }

    fn index_names(&self, store: &str) -> StoreResult<Vec<String>> {
        Ok(self.db.lock().store(store)?.indexes.keys().cloned().collect())
    }

    fn create_index(
        &self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        parameters: IndexParameters,
    ) -> StoreResult<()> {
        if parameters.multi_entry && matches!(key_path, KeyPath::Multiple(_)) {
            return Err(StoreError::data("a multi-entry index cannot use a compound key path"));
        }
        let mut db = self.db.lock();
        let target = db.store_mut(store)?;
        if target.indexes.contains_key(name) {
            return Err(StoreError::constraint(format!(
                "index '{name}' already exists on '{store}'"
            )));
        }
        let index = IndexState::new(key_path, parameters);
        target.check_index_buildable(name, &index)?;
        target.indexes.insert(name.to_string(), index);
        Ok(())
    }

    fn delete_index(&self, store: &str, name: &str) -> StoreResult<()> {
        self.db
            .lock()
            .store_mut(store)?
            .indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("index '{name}' does not exist on '{store}'")))
    }
}
