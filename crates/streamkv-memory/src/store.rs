use std::sync::Arc;

use parking_lot::Mutex;
use streamkv::host::{
    Completion, CursorListener, CursorRecord, CursorRequest, HostCursor, HostIndex,
    HostObjectStore, HostSource, HostValue,
};
use streamkv::{Key, KeyPath, KeyRange, StoreError, StoreResult};

use crate::state::{Position, SourceKind, StoreState, step};
use crate::transaction::{Executed, HandleGuard, Job, Workspace, operation};

/// Read side shared by store and index handles.
#[derive(Clone)]
struct Source {
    guard: Arc<HandleGuard>,
    store: String,
    kind: SourceKind,
}

impl Source {
    fn read<T, F>(&self, done: Completion<T>, body: F)
    where
        T: Send + 'static,
        F: FnOnce(&StoreState) -> StoreResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        self.guard.tx.enqueue(operation(
            move |workspace: &mut Workspace<'_>| body(workspace.store(&store)?),
            done,
        ));
    }

    fn get(&self, query: KeyRange, done: Completion<Option<HostValue>>) {
        if let Err(error) = query.validate() {
            return done(Err(error));
        }
        let kind = self.kind.clone();
        self.read(done, move |store| {
            let first = store.next_position(&kind, Some(&query), None, Default::default())?;
            Ok(first.and_then(|(_, primary)| store.value(&primary).cloned()))
        });
    }

    fn get_all(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<HostValue>>) {
        if let Some(Err(error)) = query.as_ref().map(KeyRange::validate) {
            return done(Err(error));
        }
        let kind = self.kind.clone();
        self.read(done, move |store| {
            let positions = limited(store.positions(&kind, query.as_ref())?, count);
            Ok(positions
                .iter()
                .filter_map(|(_, primary)| store.value(primary).cloned())
                .collect())
        });
    }

    fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<Key>>) {
        if let Some(Err(error)) = query.as_ref().map(KeyRange::validate) {
            return done(Err(error));
        }
        let kind = self.kind.clone();
        self.read(done, move |store| {
            let positions = limited(store.positions(&kind, query.as_ref())?, count);
            Ok(positions.into_iter().map(|(_, primary)| primary).collect())
        });
    }

    fn get_key(&self, query: KeyRange, done: Completion<Option<Key>>) {
        if let Err(error) = query.validate() {
            return done(Err(error));
        }
        let kind = self.kind.clone();
        self.read(done, move |store| {
            let first = store.next_position(&kind, Some(&query), None, Default::default())?;
            Ok(first.map(|(_, primary)| primary))
        });
    }

    fn count(&self, query: Option<KeyRange>, done: Completion<u64>) {
        if let Some(Err(error)) = query.as_ref().map(KeyRange::validate) {
            return done(Err(error));
        }
        let kind = self.kind.clone();
        self.read(done, move |store| {
            Ok(store.positions(&kind, query.as_ref())?.len() as u64)
        });
    }

    fn open_cursor(&self, request: CursorRequest, listener: CursorListener) -> Arc<dyn HostCursor> {
        let cursor = Arc::new(MemoryCursor {
            source: self.clone(),
            core: Arc::new(CursorCore {
                store: self.store.clone(),
                kind: self.kind.clone(),
                request,
                listener,
                walk: Mutex::new(Walk::default()),
            }),
        });
        self.guard.tx.cursor_opened();
        cursor.advance();
        cursor
    }
}

/// A zero count means no limit.
fn limited(mut positions: Vec<Position>, count: Option<u32>) -> Vec<Position> {
    if let Some(count) = count.filter(|count| *count > 0) {
        positions.truncate(count as usize);
    }
    positions
}

pub(crate) struct MemoryObjectStore {
    source: Source,
    key_path: Option<KeyPath>,
    auto_increment: bool,
    index_names: Vec<String>,
}

impl MemoryObjectStore {
    /// Snapshots the store's metadata from the committed state.
    pub fn open(guard: Arc<HandleGuard>, name: &str) -> StoreResult<Self> {
        let (key_path, auto_increment, index_names) = {
            let engine = guard.tx.shared.state.lock();
            let store = engine
                .databases
                .get(&guard.tx.database)
                .ok_or_else(|| StoreError::state("database was deleted"))?
                .store(name)?;
            (
                store.key_path.clone(),
                store.auto_increment,
                store.indexes.keys().cloned().collect(),
            )
        };
        Ok(Self {
            source: Source {
                guard,
                store: name.to_string(),
                kind: SourceKind::Store,
            },
            key_path,
            auto_increment,
            index_names,
        })
    }

    fn write<T, F>(&self, done: Completion<T>, body: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreState) -> StoreResult<T> + Send + 'static,
    {
        let tx = &self.source.guard.tx;
        if !tx.mode.is_writable() {
            return done(Err(StoreError::read_only(format!(
                "cannot write to '{}' in a read-only transaction",
                self.source.store
            ))));
        }
        let store = self.source.store.clone();
        tx.enqueue(operation(
            move |workspace: &mut Workspace<'_>| body(workspace.store_mut(&store)?),
            done,
        ));
    }
}

impl HostSource for MemoryObjectStore {
    fn name(&self) -> String {
        self.source.store.clone()
    }

    fn key_path(&self) -> Option<KeyPath> {
        self.key_path.clone()
    }

    fn get(&self, query: KeyRange, done: Completion<Option<HostValue>>) {
        self.source.get(query, done);
    }

    fn get_all(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<HostValue>>) {
        self.source.get_all(query, count, done);
    }

    fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<Key>>) {
        self.source.get_all_keys(query, count, done);
    }

    fn get_key(&self, query: KeyRange, done: Completion<Option<Key>>) {
        self.source.get_key(query, done);
    }

    fn count(&self, query: Option<KeyRange>, done: Completion<u64>) {
        self.source.count(query, done);
    }

    fn open_cursor(&self, request: CursorRequest, listener: CursorListener) -> Arc<dyn HostCursor> {
        self.source.open_cursor(request, listener)
    }
}

impl HostObjectStore for MemoryObjectStore {
    fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    fn index_names(&self) -> Vec<String> {
        self.index_names.clone()
    }

    fn index(&self, name: &str) -> StoreResult<Arc<dyn HostIndex>> {
        let (key_path, unique, multi_entry) = {
            let engine = self.source.guard.tx.shared.state.lock();
            let index = engine
                .databases
                .get(&self.source.guard.tx.database)
                .ok_or_else(|| StoreError::state("database was deleted"))?
                .store(&self.source.store)?
                .index(name)?;
            (index.key_path.clone(), index.unique, index.multi_entry)
        };
        Ok(Arc::new(MemoryIndex {
            source: Source {
                guard: Arc::clone(&self.source.guard),
                store: self.source.store.clone(),
                kind: SourceKind::Index(name.to_string()),
            },
            name: name.to_string(),
            key_path,
            unique,
            multi_entry,
        }))
    }

    fn add(&self, value: HostValue, key: Option<Key>, done: Completion<Key>) {
        self.write(done, move |store| store.write(value, key, false));
    }

    fn put(&self, value: HostValue, key: Option<Key>, done: Completion<Key>) {
        self.write(done, move |store| store.write(value, key, true));
    }

    fn delete(&self, query: KeyRange, done: Completion<()>) {
        if let Err(error) = query.validate() {
            return done(Err(error));
        }
        self.write(done, move |store| {
            store.delete(&query);
            Ok(())
        });
    }

    fn clear(&self, done: Completion<()>) {
        self.write(done, |store| {
            store.clear();
            Ok(())
        });
    }
}

pub(crate) struct MemoryIndex {
    source: Source,
    name: String,
    key_path: KeyPath,
    unique: bool,
    multi_entry: bool,
}

impl HostSource for MemoryIndex {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn key_path(&self) -> Option<KeyPath> {
        Some(self.key_path.clone())
    }

    fn get(&self, query: KeyRange, done: Completion<Option<HostValue>>) {
        self.source.get(query, done);
    }

    fn get_all(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<HostValue>>) {
        self.source.get_all(query, count, done);
    }

    fn get_all_keys(&self, query: Option<KeyRange>, count: Option<u32>, done: Completion<Vec<Key>>) {
        self.source.get_all_keys(query, count, done);
    }

    fn get_key(&self, query: KeyRange, done: Completion<Option<Key>>) {
        self.source.get_key(query, done);
    }

    fn count(&self, query: Option<KeyRange>, done: Completion<u64>) {
        self.source.count(query, done);
    }

    fn open_cursor(&self, request: CursorRequest, listener: CursorListener) -> Arc<dyn HostCursor> {
        self.source.open_cursor(request, listener)
    }
}

impl HostIndex for MemoryIndex {
    fn unique(&self) -> bool {
        self.unique
    }

    fn multi_entry(&self) -> bool {
        self.multi_entry
    }
}

/// Cursor state reachable from queued steps without keeping the transaction open.
struct CursorCore {
    store: String,
    kind: SourceKind,
    request: CursorRequest,
    listener: CursorListener,
    walk: Mutex<Walk>,
}

#[derive(Default)]
struct Walk {
    last: Option<Position>,
    /// Sorted index positions and the store revision they were built from.
    positions: Option<(u64, Vec<Position>)>,
}

impl CursorCore {
    fn next(&self, store: &StoreState) -> StoreResult<Option<CursorRecord>> {
        let mut walk = self.walk.lock();
        let range = self.request.range.as_ref();
        let next = match &self.kind {
            SourceKind::Store => {
                store.next_position(&self.kind, range, walk.last.as_ref(), self.request.direction)?
            }
            SourceKind::Index(_) => {
                let fresh = matches!(&walk.positions, Some((revision, _)) if *revision == store.revision());
                if !fresh {
                    walk.positions = Some((store.revision(), store.positions(&self.kind, range)?));
                }
                let positions = walk
                    .positions
                    .as_ref()
                    .map_or(&[][..], |(_, positions)| positions.as_slice());
                step(positions, walk.last.as_ref(), self.request.direction)
            }
        };
        walk.last = next.clone();
        Ok(next.map(|(key, primary_key)| CursorRecord {
            value: if self.request.keys_only {
                None
            } else {
                store.value(&primary_key).cloned()
            },
            key,
            primary_key,
        }))
    }
}

struct CursorStep(Arc<CursorCore>);

impl Job for CursorStep {
    fn run(self: Box<Self>, workspace: &mut Workspace<'_>) -> Executed {
        let core = self.0;
        let result = workspace.store(&core.store).and_then(|store| core.next(store));
        let failure = result.as_ref().err().cloned();
        let listener = Arc::clone(&core.listener);
        Executed::new(move || listener(result), failure)
    }

    fn cancel(self: Box<Self>, error: StoreError) {
        (self.0.listener)(Err(error));
    }

    fn resumes_cursor(&self) -> bool {
        self.0.walk.lock().last.is_some()
    }
}

/// Counts as an unfinished request of its transaction until dropped.
pub(crate) struct MemoryCursor {
    source: Source,
    core: Arc<CursorCore>,
}

impl HostCursor for MemoryCursor {
    fn advance(&self) {
        self.source
            .guard
            .tx
            .enqueue(Box::new(CursorStep(Arc::clone(&self.core))));
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.source.guard.tx.cursor_closed();
    }
}
